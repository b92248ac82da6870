use crate::error::{RedisError, RedisResult};

/// One positional argument consumed by a `%s`/`%b`/numeric conversion in a
/// [`format_command`] template, in order. This is the Rust translation of
/// the original's C varargs: instead of an untyped `...` list walked with
/// `va_arg`, callers build an explicit, typed slice up front.
#[derive(Debug, Clone, Copy)]
pub enum FormatArg<'a> {
    /// `%s` — appended as-is.
    Str(&'a str),
    /// `%b` — a binary-safe blob, appended as-is. Collapses the original's
    /// `(pointer, size_t length)` pair into one slice, since Rust slices
    /// already carry their length.
    Bytes(&'a [u8]),
    /// Consumed by a `diouxX` printf conversion.
    Int(i64),
    /// Consumed by an `eEfFgGaA` printf conversion.
    Float(f64),
}

/// Format a command from a printf-like space-separated template. Tokens are
/// arguments; spaces separate them. See SPEC_FULL.md §4.2 for the escape
/// grammar (`%s`, `%b`, `%%`, and printf numeric conversions).
pub fn format_command(fmt: &str, args: &[FormatArg]) -> RedisResult<Vec<u8>> {
    let bytes = fmt.as_bytes();
    let mut argv: Vec<Vec<u8>> = Vec::new();
    let mut current = Vec::new();
    let mut touched = false;
    let mut next_arg = args.iter();

    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c != b'%' || i + 1 == bytes.len() {
            if c == b' ' {
                if touched {
                    argv.push(std::mem::take(&mut current));
                    touched = false;
                }
            } else {
                current.push(c);
                touched = true;
            }
            i += 1;
            continue;
        }

        // c == '%' and there's at least one more byte.
        let conv = bytes[i + 1];
        match conv {
            b's' => {
                match next_arg.next() {
                    Some(FormatArg::Str(s)) => current.extend_from_slice(s.as_bytes()),
                    _ => return Err(RedisError::other("invalid format string: expected %s argument")),
                }
                i += 2;
            }
            b'b' => {
                match next_arg.next() {
                    Some(FormatArg::Bytes(b)) => current.extend_from_slice(b),
                    _ => return Err(RedisError::other("invalid format string: expected %b argument")),
                }
                i += 2;
            }
            b'%' => {
                current.push(b'%');
                i += 2;
            }
            _ => {
                let (rendered, consumed) = render_numeric_conversion(&bytes[i..], &mut next_arg)?;
                current.extend_from_slice(&rendered);
                i += consumed;
            }
        }
        touched = true;
    }

    if touched {
        argv.push(current);
    }

    encode_argv(&argv)
}

/// Format a command from an explicit argument vector. Each entry becomes
/// one RESP bulk-string argument; since `&[u8]` always carries its own
/// length, there is no separate `argvlen` parameter to thread through (the
/// original's `NULL argvlen` / `strlen` fallback has no Rust analogue to
/// preserve).
pub fn format_command_argv(argv: &[&[u8]]) -> RedisResult<Vec<u8>> {
    let owned: Vec<Vec<u8>> = argv.iter().map(|a| a.to_vec()).collect();
    encode_argv(&owned)
}

fn encode_argv(argv: &[Vec<u8>]) -> RedisResult<Vec<u8>> {
    let argc = argv.len();
    let mut total = header_len(argc)?;
    for arg in argv {
        total = total
            .checked_add(bulk_len(arg.len()))
            .ok_or(RedisError::Oom)?;
    }

    let mut out = Vec::with_capacity(total);
    out.push(b'*');
    out.extend_from_slice(argc.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    for arg in argv {
        out.push(b'$');
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    Ok(out)
}

fn header_len(argc: usize) -> RedisResult<usize> {
    // '*' + digits(argc) + "\r\n"
    1usize
        .checked_add(digit_count(argc as u64))
        .and_then(|v| v.checked_add(2))
        .ok_or(RedisError::Oom)
}

fn bulk_len(len: usize) -> usize {
    // '$' + digits(len) + "\r\n" + len + "\r\n"
    1 + digit_count(len as u64) + 2 + len + 2
}

fn digit_count(mut v: u64) -> usize {
    let mut n = 1;
    v /= 10;
    while v > 0 {
        n += 1;
        v /= 10;
    }
    n
}

/// Parse and render one printf-style numeric conversion starting at `s[0] ==
/// '%'`. Returns the rendered bytes and the number of bytes of `s` consumed
/// (including the leading `%`).
fn render_numeric_conversion<'a, 'b, I>(
    s: &[u8],
    args: &mut I,
) -> RedisResult<(Vec<u8>, usize)>
where
    I: Iterator<Item = &'b FormatArg<'a>>,
    'a: 'b,
{
    let mut p = 1; // skip '%'
    let mut flag_alt = false;
    let mut flag_zero = false;
    let mut flag_left = false;
    let mut flag_space = false;
    let mut flag_plus = false;

    loop {
        match s.get(p) {
            Some(b'#') => flag_alt = true,
            Some(b'0') => flag_zero = true,
            Some(b'-') => flag_left = true,
            Some(b' ') => flag_space = true,
            Some(b'+') => flag_plus = true,
            _ => break,
        }
        p += 1;
    }

    let width_start = p;
    while matches!(s.get(p), Some(b) if b.is_ascii_digit()) {
        p += 1;
    }
    let width: Option<usize> = if p > width_start {
        std::str::from_utf8(&s[width_start..p]).ok().and_then(|d| d.parse().ok())
    } else {
        None
    };

    let mut precision: Option<usize> = None;
    if s.get(p) == Some(&b'.') {
        p += 1;
        let prec_start = p;
        while matches!(s.get(p), Some(b) if b.is_ascii_digit()) {
            p += 1;
        }
        precision = std::str::from_utf8(&s[prec_start..p]).ok().and_then(|d| d.parse().ok());
        if precision.is_none() {
            precision = Some(0);
        }
    }

    // Length modifiers: hh | h | ll | l. None of them change how this
    // crate renders the value (Rust integers/floats aren't re-sized by a
    // modifier the way C's va_arg promotion rules are), they're only
    // accepted so the format string is recognised as valid.
    if s.get(p) == Some(&b'h') && s.get(p + 1) == Some(&b'h') {
        p += 2;
    } else if s.get(p) == Some(&b'h') {
        p += 1;
    } else if s.get(p) == Some(&b'l') && s.get(p + 1) == Some(&b'l') {
        p += 2;
    } else if s.get(p) == Some(&b'l') {
        p += 1;
    }

    let conv = match s.get(p) {
        Some(c) => *c,
        None => return Err(RedisError::other("invalid format string: truncated conversion")),
    };
    p += 1;

    const INT_CONVS: &[u8] = b"diouxX";
    const FLOAT_CONVS: &[u8] = b"eEfFgGaA";

    let rendered = if INT_CONVS.contains(&conv) {
        let value = match args.next() {
            Some(FormatArg::Int(v)) => *v,
            _ => return Err(RedisError::other("invalid format string: expected integer argument")),
        };
        render_integer(conv, value, width, precision, flag_alt, flag_zero, flag_left, flag_space, flag_plus)
    } else if FLOAT_CONVS.contains(&conv) {
        let value = match args.next() {
            Some(FormatArg::Float(v)) => *v,
            _ => return Err(RedisError::other("invalid format string: expected float argument")),
        };
        render_float(conv, value, width, precision, flag_left, flag_plus, flag_space)
    } else {
        return Err(RedisError::other("invalid format string: unrecognised conversion"));
    };

    Ok((rendered, p))
}

#[allow(clippy::too_many_arguments)]
fn render_integer(
    conv: u8,
    value: i64,
    width: Option<usize>,
    precision: Option<usize>,
    flag_alt: bool,
    flag_zero: bool,
    flag_left: bool,
    flag_space: bool,
    flag_plus: bool,
) -> Vec<u8> {
    let negative = value < 0 && matches!(conv, b'd' | b'i');
    let magnitude: u64 = if matches!(conv, b'd' | b'i') {
        value.unsigned_abs()
    } else {
        value as u64
    };

    let mut digits = match conv {
        b'o' => format!("{:o}", magnitude),
        b'x' => format!("{:x}", magnitude),
        b'X' => format!("{:X}", magnitude),
        _ => format!("{}", magnitude),
    };

    if let Some(prec) = precision {
        if digits.len() < prec {
            digits = "0".repeat(prec - digits.len()) + &digits;
        }
        if prec == 0 && magnitude == 0 {
            digits.clear();
        }
    }

    let mut prefix = String::new();
    if negative {
        prefix.push('-');
    } else if flag_plus && matches!(conv, b'd' | b'i') {
        prefix.push('+');
    } else if flag_space && matches!(conv, b'd' | b'i') {
        prefix.push(' ');
    }
    if flag_alt && conv == b'x' && magnitude != 0 {
        prefix.push_str("0x");
    } else if flag_alt && conv == b'X' && magnitude != 0 {
        prefix.push_str("0X");
    } else if flag_alt && conv == b'o' && !digits.starts_with('0') {
        prefix.insert(0, '0');
    }

    let body = prefix + &digits;
    pad(body, width, flag_zero && precision.is_none(), flag_left)
        .into_bytes()
}

fn render_float(
    conv: u8,
    value: f64,
    width: Option<usize>,
    precision: Option<usize>,
    flag_left: bool,
    flag_plus: bool,
    flag_space: bool,
) -> Vec<u8> {
    let prec = precision.unwrap_or(6);
    let mut body = match conv {
        b'e' => format!("{:.*e}", prec, value),
        b'E' => format!("{:.*E}", prec, value),
        b'f' | b'F' => format!("{:.*}", prec, value),
        b'a' | b'A' => format!("{:.*e}", prec, value), // hex-float not reproduced, see SPEC_FULL.md §9.
        _ => format!("{:.*}", prec, value), // g/G: shortest faithful representation.
    };

    if value >= 0.0 {
        if flag_plus {
            body = format!("+{}", body);
        } else if flag_space {
            body = format!(" {}", body);
        }
    }

    pad(body, width, false, flag_left).into_bytes()
}

fn pad(body: String, width: Option<usize>, zero: bool, left: bool) -> String {
    let width = match width {
        Some(w) if w > body.len() => w,
        _ => return body,
    };
    let fill = width - body.len();
    if left {
        body + &" ".repeat(fill)
    } else if zero {
        let (sign, rest) = if body.starts_with('-') || body.starts_with('+') {
            body.split_at(1)
        } else {
            ("", body.as_str())
        };
        format!("{}{}{}", sign, "0".repeat(fill), rest)
    } else {
        " ".repeat(fill) + &body
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reader::Reader;

    #[test]
    fn plain_get() {
        let cmd = format_command("GET %s", &[FormatArg::Str("mykey")]).unwrap();
        assert_eq!(cmd, b"*2\r\n$3\r\nGET\r\n$5\r\nmykey\r\n".to_vec());
    }

    #[test]
    fn binary_safe_set() {
        let cmd = format_command(
            "SET %s %b",
            &[FormatArg::Str("k"), FormatArg::Bytes(b"v\x00w")],
        )
        .unwrap();
        assert_eq!(
            cmd,
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$3\r\nv\x00w\r\n".to_vec()
        );
    }

    #[test]
    fn literal_percent() {
        let cmd = format_command("ECHO 100%%", &[]).unwrap();
        assert_eq!(cmd, b"*1\r\n$6\r\n100%\r\n".to_vec());
    }

    #[test]
    fn runs_of_spaces_do_not_emit_empty_args() {
        let cmd = format_command("GET   %s", &[FormatArg::Str("k")]).unwrap();
        assert_eq!(cmd, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n".to_vec());
    }

    #[test]
    fn numeric_conversion() {
        let cmd = format_command("INCRBY %s %d", &[FormatArg::Str("k"), FormatArg::Int(-7)]).unwrap();
        assert_eq!(cmd, b"*3\r\n$7\r\nINCRBY\r\n$1\r\nk\r\n$2\r\n-7\r\n".to_vec());
    }

    #[test]
    fn argv_matches_equivalent_template() {
        let argv: [&[u8]; 3] = [b"SET", b"k", b"v\x00w"];
        let via_argv = format_command_argv(&argv).unwrap();
        let via_template = format_command(
            "%b %b %b",
            &[
                FormatArg::Bytes(argv[0]),
                FormatArg::Bytes(argv[1]),
                FormatArg::Bytes(argv[2]),
            ],
        )
        .unwrap();
        assert_eq!(via_argv, via_template);
    }

    #[test]
    fn round_trips_through_the_reader() {
        let argv: [&[u8]; 2] = [b"GET", b"mykey"];
        let encoded = format_command_argv(&argv).unwrap();

        let mut reader = Reader::new();
        reader.feed(&encoded);
        let reply = reader.get_reply().unwrap().unwrap();
        let items = reply.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_bulk_string().unwrap(), b"GET");
        assert_eq!(items[1].as_bulk_string().unwrap(), b"mykey");
    }

    #[test]
    fn invalid_conversion_is_an_error() {
        assert!(format_command("FOO %q", &[]).is_err());
    }
}
