//! A pure-Rust RESP (REdis Serialization Protocol) client: an incremental
//! reply parser, a printf-style command formatter, a blocking context, a
//! pipelined async context, and a cluster redirection coordinator.
//!
//! This crate does not implement TLS, `AUTH`, RESP3, full cluster slot-map
//! discovery, or pub/sub beyond generic reply parsing.

pub mod async_context;
pub mod coordinator;
pub mod error;
pub mod format;
pub mod reader;
pub mod reply;
pub mod sync_context;

pub use async_context::{AsyncContext, ReplyCallback};
pub use coordinator::{ConnId, Coordinator};
pub use error::{RedisError, RedisResult};
pub use format::{format_command, format_command_argv, FormatArg};
pub use reader::Reader;
pub use reply::Reply;
pub use sync_context::{ConnectOptions, SyncContext};
