use bytes::{Buf, BytesMut};
use log::trace;

use crate::error::{RedisError, RedisResult};
use crate::reply::Reply;

/// Root plus up to 7 nested arrays, matching the original's
/// "No support for nested multi bulk replies with depth > 7".
const MAX_STACK_DEPTH: usize = 8;

/// Deferred compaction threshold, in bytes, matching the original.
const COMPACT_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemType {
    Status,
    Error,
    Integer,
    BulkString,
    Array,
}

impl ItemType {
    fn from_byte(b: u8) -> Option<ItemType> {
        match b {
            b'+' => Some(ItemType::Status),
            b'-' => Some(ItemType::Error),
            b':' => Some(ItemType::Integer),
            b'$' => Some(ItemType::BulkString),
            b'*' => Some(ItemType::Array),
            _ => None,
        }
    }
}

/// One in-progress array. Unlike the original's `RedisReadTask`, this holds
/// no back-reference to its parent: completed children accumulate here by
/// value, and the frame itself is turned into a `Reply::Array` and moved
/// upward once full (see `Reader::attach`).
struct PendingArray {
    remaining: usize,
    items: Vec<Reply>,
}

/// An incremental, resumable RESP reply parser over a growable byte buffer.
///
/// Feed it bytes as they arrive (`feed`) and call `get_reply` after each
/// feed; it returns `Ok(Some(reply))` as soon as one complete reply has
/// accumulated, `Ok(None)` if more bytes are needed, and `Err` (sticky,
/// until `reset`) on a protocol violation.
pub struct Reader {
    buf: BytesMut,
    pos: usize,
    stack: Vec<PendingArray>,
    current_type: Option<ItemType>,
    root: Option<Reply>,
    err: Option<RedisError>,
}

impl Default for Reader {
    fn default() -> Self {
        Self::new()
    }
}

impl Reader {
    pub fn new() -> Reader {
        Reader {
            buf: BytesMut::with_capacity(4096),
            pos: 0,
            stack: Vec::new(),
            current_type: None,
            root: None,
            err: None,
        }
    }

    /// Append newly-read bytes to the reader's buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of unread bytes currently buffered.
    pub fn readable_len(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Reset the reader to a fresh, error-free state, discarding any
    /// in-progress parse and buffered bytes.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pos = 0;
        self.stack.clear();
        self.current_type = None;
        self.root = None;
        self.err = None;
    }

    /// Advance parsing as far as the buffered bytes allow and return at
    /// most one complete reply.
    pub fn get_reply(&mut self) -> RedisResult<Option<Reply>> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }

        loop {
            if self.readable_len() == 0 {
                self.maybe_compact();
                return Ok(None);
            }

            match self.process_item() {
                Ok(true) => {
                    if let Some(reply) = self.root.take() {
                        self.maybe_compact();
                        return Ok(Some(reply));
                    }
                    // Progress was made (a leaf attached, or a nested array
                    // was opened) but the root isn't complete yet; loop.
                }
                Ok(false) => {
                    self.maybe_compact();
                    return Ok(None);
                }
                Err(e) => {
                    self.set_error(e.clone());
                    return Err(e);
                }
            }
        }
    }

    fn set_error(&mut self, err: RedisError) {
        trace!("resp reader entering sticky error state: {err}");
        self.buf.clear();
        self.pos = 0;
        self.stack.clear();
        self.current_type = None;
        self.root = None;
        self.err = Some(err);
    }

    fn maybe_compact(&mut self) {
        if self.pos >= COMPACT_THRESHOLD {
            self.buf.advance(self.pos);
            self.pos = 0;
        }
    }

    /// Perform one unit of work. Returns `Ok(true)` if it made progress
    /// (caller should loop again), `Ok(false)` if more bytes are needed.
    fn process_item(&mut self) -> RedisResult<bool> {
        if self.current_type.is_none() {
            let byte = match self.buf.get(self.pos) {
                Some(b) => *b,
                None => return Ok(false),
            };
            let ty = ItemType::from_byte(byte).ok_or_else(|| {
                RedisError::protocol(format!(
                    "Protocol error, got {:?} as reply type byte",
                    byte as char
                ))
            })?;
            self.pos += 1;
            self.current_type = Some(ty);
        }

        match self.current_type.unwrap() {
            ItemType::Status => self.process_line_item(ItemType::Status),
            ItemType::Error => self.process_line_item(ItemType::Error),
            ItemType::Integer => self.process_line_item(ItemType::Integer),
            ItemType::BulkString => self.process_bulk_item(),
            ItemType::Array => self.process_array_item(),
        }
    }

    fn process_line_item(&mut self, ty: ItemType) -> RedisResult<bool> {
        let line = match self.read_line_committing() {
            Some(line) => line,
            None => return Ok(false),
        };

        let leaf = match ty {
            ItemType::Integer => Reply::Integer(read_long_long(&line)?),
            ItemType::Status => Reply::Status(line),
            ItemType::Error => Reply::Error(line),
            ItemType::BulkString | ItemType::Array => unreachable!(),
        };

        self.current_type = None;
        self.attach(leaf);
        Ok(true)
    }

    fn process_bulk_item(&mut self) -> RedisResult<bool> {
        let (line_start, line_len) = match self.peek_line() {
            Some(v) => v,
            None => return Ok(false),
        };
        let len = read_long_long(&self.buf[line_start..line_start + line_len])?;

        if len < 0 {
            // Nil can be produced as soon as the length line is known; no
            // payload follows.
            self.pos = line_start + line_len + 2;
            self.current_type = None;
            self.attach(Reply::Nil);
            return Ok(true);
        }

        let len = len as usize;
        let payload_start = line_start + line_len + 2;
        let payload_end = payload_start
            .checked_add(len)
            .and_then(|v| v.checked_add(2))
            .ok_or(RedisError::Oom)?;

        if self.buf.len() < payload_end {
            // Not enough data yet; don't commit the length line so the next
            // call simply re-scans it (matches the original's strategy of
            // never resuming mid-bulk-payload).
            return Ok(false);
        }

        let payload = self.buf[payload_start..payload_start + len].to_vec();
        self.pos = payload_start + len + 2;
        self.current_type = None;
        self.attach(Reply::BulkString(payload));
        Ok(true)
    }

    fn process_array_item(&mut self) -> RedisResult<bool> {
        let line = match self.read_line_committing() {
            Some(line) => line,
            None => return Ok(false),
        };
        let count = read_long_long(&line)?;

        if count < 0 {
            self.current_type = None;
            self.attach(Reply::Nil);
            return Ok(true);
        }

        if count == 0 {
            self.current_type = None;
            self.attach(Reply::Array(Vec::new()));
            return Ok(true);
        }

        if self.stack.len() >= MAX_STACK_DEPTH {
            return Err(RedisError::protocol(
                "No support for nested multi bulk replies with depth > 7",
            ));
        }

        let count = count as usize;
        self.stack.push(PendingArray {
            remaining: count,
            items: Vec::with_capacity(count),
        });
        self.current_type = None;
        Ok(true)
    }

    /// Attach a completed leaf or array to whichever frame is on top of the
    /// stack, popping and moving completed arrays further up as needed. This
    /// is the bottom-up, move-based translation of the original's
    /// parent/child back-reference (see DESIGN.md / SPEC_FULL.md §9).
    fn attach(&mut self, mut reply: Reply) {
        loop {
            match self.stack.last_mut() {
                None => {
                    self.root = Some(reply);
                    return;
                }
                Some(frame) => {
                    frame.items.push(reply);
                    frame.remaining -= 1;
                    if frame.remaining == 0 {
                        let frame = self.stack.pop().unwrap();
                        reply = Reply::Array(frame.items);
                        continue;
                    }
                    return;
                }
            }
        }
    }

    /// Find `\r\n` within `buf[pos..]` and, if found, commit `pos` past it,
    /// returning the line content (without the terminator).
    fn read_line_committing(&mut self) -> Option<Vec<u8>> {
        let (start, len) = self.peek_line()?;
        let line = self.buf[start..start + len].to_vec();
        self.pos = start + len + 2;
        Some(line)
    }

    /// Find `\r\n` within `buf[pos..]` without committing `pos`. Returns the
    /// absolute start index and length of the line content.
    fn peek_line(&self) -> Option<(usize, usize)> {
        let region = &self.buf[self.pos..];
        seek_newline(region).map(|offset| (self.pos, offset))
    }
}

/// Locate the first `\r\n` in `s`. Cannot rely on NUL-terminated string
/// search, since RESP payloads are binary-safe.
fn seek_newline(s: &[u8]) -> Option<usize> {
    if s.len() < 2 {
        return None;
    }
    let mut pos = 0;
    let limit = s.len() - 1;
    while pos < limit {
        if s[pos] == b'\r' {
            if s[pos + 1] == b'\n' {
                return Some(pos);
            }
        }
        pos += 1;
    }
    None
}

/// Parse a CRLF-delimited line (without the terminator) as a signed base-10
/// integer. Unlike the original's `readLongLong`, a malformed line is a
/// protocol error rather than silently returning `-1` (see SPEC_FULL.md §9).
fn read_long_long(line: &[u8]) -> RedisResult<i64> {
    let (sign, digits) = match line.split_first() {
        Some((b'-', rest)) => (-1i64, rest),
        Some((b'+', rest)) => (1i64, rest),
        _ => (1i64, line),
    };

    if digits.is_empty() {
        return Err(RedisError::protocol("Protocol error, invalid integer"));
    }

    let mut v: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(RedisError::protocol("Protocol error, invalid integer"));
        }
        v = v
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as i64))
            .ok_or_else(|| RedisError::protocol("Protocol error, integer overflow"))?;
    }
    Ok(sign * v)
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse_all(bytes: &[u8]) -> Vec<Reply> {
        let mut reader = Reader::new();
        reader.feed(bytes);
        let mut out = Vec::new();
        while let Some(reply) = reader.get_reply().unwrap() {
            out.push(reply);
        }
        out
    }

    #[test]
    fn simple_string() {
        let replies = parse_all(b"+OK\r\n");
        assert_eq!(replies, vec![Reply::Status(b"OK".to_vec())]);
    }

    #[test]
    fn error_reply() {
        let replies = parse_all(b"-ERR unknown command\r\n");
        assert_eq!(replies, vec![Reply::Error(b"ERR unknown command".to_vec())]);
    }

    #[test]
    fn integer_reply() {
        assert_eq!(parse_all(b":1000\r\n"), vec![Reply::Integer(1000)]);
        assert_eq!(parse_all(b":-1\r\n"), vec![Reply::Integer(-1)]);
    }

    #[test]
    fn bulk_string() {
        assert_eq!(
            parse_all(b"$5\r\nhello\r\n"),
            vec![Reply::BulkString(b"hello".to_vec())]
        );
    }

    #[test]
    fn null_bulk_string() {
        assert_eq!(parse_all(b"$-1\r\n"), vec![Reply::Nil]);
    }

    #[test]
    fn null_array() {
        assert_eq!(parse_all(b"*-1\r\n"), vec![Reply::Nil]);
    }

    #[test]
    fn empty_array() {
        assert_eq!(parse_all(b"*0\r\n"), vec![Reply::Array(vec![])]);
    }

    #[test]
    fn nested_array_with_nil_and_integer() {
        let replies = parse_all(b"*3\r\n$3\r\nfoo\r\n$-1\r\n:42\r\n");
        assert_eq!(
            replies,
            vec![Reply::Array(vec![
                Reply::BulkString(b"foo".to_vec()),
                Reply::Nil,
                Reply::Integer(42),
            ])]
        );
    }

    #[test]
    fn binary_safe_bulk_string() {
        let replies = parse_all(b"$3\r\nv\x00w\r\n");
        assert_eq!(replies, vec![Reply::BulkString(b"v\x00w".to_vec())]);
    }

    #[test]
    fn incremental_feed_equals_one_shot() {
        let whole = b"*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n";
        let one_shot = parse_all(whole);

        let mut reader = Reader::new();
        let mut out = Vec::new();
        for byte in whole {
            reader.feed(&[*byte]);
            while let Some(reply) = reader.get_reply().unwrap() {
                out.push(reply);
            }
        }
        assert_eq!(one_shot, out);
    }

    #[test]
    fn prefix_never_emits_a_reply() {
        let whole = b"$5\r\nhello\r\n";
        let mut reader = Reader::new();
        for n in 0..whole.len() {
            reader.reset();
            reader.feed(&whole[..n]);
            assert_eq!(reader.get_reply().unwrap(), None);
        }
    }

    #[test]
    fn split_bulk_payload_across_chunks() {
        let mut reader = Reader::new();
        reader.feed(b"$5\r\nhel");
        assert_eq!(reader.get_reply().unwrap(), None);
        reader.feed(b"lo\r\n");
        assert_eq!(
            reader.get_reply().unwrap(),
            Some(Reply::BulkString(b"hello".to_vec()))
        );
    }

    #[test]
    fn double_reply_stream_yields_two_in_order() {
        let mut reader = Reader::new();
        reader.feed(b"+OK\r\n+OK\r\n");
        assert_eq!(
            reader.get_reply().unwrap(),
            Some(Reply::Status(b"OK".to_vec()))
        );
        assert_eq!(
            reader.get_reply().unwrap(),
            Some(Reply::Status(b"OK".to_vec()))
        );
        assert_eq!(reader.get_reply().unwrap(), None);
    }

    #[test]
    fn invalid_type_byte_is_a_protocol_error() {
        let mut reader = Reader::new();
        reader.feed(b"c299\r\n");
        assert!(reader.get_reply().is_err());
    }

    #[test]
    fn depth_nine_array_is_rejected() {
        let mut reader = Reader::new();
        reader.feed(&b"*1\r\n".repeat(9));
        reader.feed(b":1\r\n");
        let err = reader.get_reply().unwrap_err();
        match err {
            RedisError::Protocol(msg) => {
                assert!(msg.contains("depth > 7"), "unexpected message: {msg}")
            }
            other => panic!("expected Protocol error, got {other:?}"),
        }
    }

    #[test]
    fn depth_eight_array_is_accepted() {
        let mut reader = Reader::new();
        reader.feed(&b"*1\r\n".repeat(8));
        reader.feed(b":7\r\n");
        let reply = reader.get_reply().unwrap().expect("reply");
        // 8 nested arrays of one element each, bottoming out at Integer(7).
        let mut cur = &reply;
        for _ in 0..7 {
            let arr = cur.as_array().expect("array");
            assert_eq!(arr.len(), 1);
            cur = &arr[0];
        }
        let arr = cur.as_array().expect("array");
        assert_eq!(arr, &[Reply::Integer(7)]);
    }

    #[test]
    fn error_state_is_sticky_and_drains_buffer() {
        let mut reader = Reader::new();
        reader.feed(b"c299\r\n");
        assert!(reader.get_reply().is_err());
        assert_eq!(reader.readable_len(), 0);
        // Sticky: further feeds still return the same error.
        reader.feed(b"+OK\r\n");
        assert!(reader.get_reply().is_err());
    }
}
