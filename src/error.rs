use std::io;

use thiserror::Error;

/// Error taxonomy for the client.
#[derive(Debug, Error)]
pub enum RedisError {
    /// Socket/syscall failure, or the peer was not ready for a non-blocking
    /// operation that the caller should retry.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection cleanly.
    #[error("server closed the connection")]
    Eof,

    /// An illegal type byte, an over-deep task stack, or a malformed line.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A length computation overflowed before any allocation was attempted.
    #[error("out of memory")]
    Oom,

    /// Invalid format string, or a blocking-only API used on a non-blocking
    /// context.
    #[error("{0}")]
    Other(String),
}

impl RedisError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        RedisError::Protocol(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        RedisError::Other(msg.into())
    }

    /// `true` for the two error kinds the reader marks as "sticky": once
    /// raised they stay set until the reader/context is reset.
    pub fn is_sticky(&self) -> bool {
        matches!(self, RedisError::Protocol(_) | RedisError::Oom)
    }
}

impl Clone for RedisError {
    fn clone(&self) -> Self {
        match self {
            RedisError::Io(e) => RedisError::Io(io::Error::new(e.kind(), e.to_string())),
            RedisError::Eof => RedisError::Eof,
            RedisError::Protocol(s) => RedisError::Protocol(s.clone()),
            RedisError::Oom => RedisError::Oom,
            RedisError::Other(s) => RedisError::Other(s.clone()),
        }
    }
}

pub type RedisResult<T> = Result<T, RedisError>;
