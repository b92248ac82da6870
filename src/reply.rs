/// A fully parsed RESP reply.
///
/// Every non-root `Reply` is owned by exactly one `Array` parent: children
/// live directly in the parent's `Vec`, so a reply can never be aliased by
/// two arrays at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+<text>\r\n`
    Status(Vec<u8>),
    /// `-<text>\r\n`
    Error(Vec<u8>),
    /// `:<int>\r\n`
    Integer(i64),
    /// `$<len>\r\n<bytes>\r\n`
    BulkString(Vec<u8>),
    /// `*<count>\r\n<element>...`. A declared length of `-1` is represented
    /// as `Nil`, never as `Array`.
    Array(Vec<Reply>),
    /// `$-1\r\n` or `*-1\r\n`.
    Nil,
}

impl Reply {
    pub fn as_status(&self) -> Option<&[u8]> {
        match self {
            Reply::Status(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&[u8]> {
        match self {
            Reply::Error(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bulk_string(&self) -> Option<&[u8]> {
        match self {
            Reply::BulkString(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    /// `true` for an `Error` reply whose payload begins with `MOVED` or
    /// `ASK` (cluster redirection hints).
    pub fn is_redirect(&self) -> bool {
        self.as_error()
            .map(|e| e.starts_with(b"MOVED ") || e.starts_with(b"ASK "))
            .unwrap_or(false)
    }
}
