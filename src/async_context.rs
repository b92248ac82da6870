use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::warn;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument};

use crate::error::{RedisError, RedisResult};
use crate::format::{format_command, format_command_argv, FormatArg};
use crate::reader::Reader;
use crate::reply::Reply;

const READ_CHUNK: usize = 16 * 1024;

/// Invoked exactly once per queued command, in the order the commands were
/// sent. Delivered `Err` either because the reply itself was a RESP error,
/// or because the connection failed before (or while) the reply arrived.
pub type ReplyCallback = Box<dyn FnOnce(RedisResult<Reply>) + Send + 'static>;

struct Shared {
    pending: Mutex<VecDeque<ReplyCallback>>,
    err: Mutex<Option<RedisError>>,
}

impl Shared {
    fn current_error(&self) -> Option<RedisError> {
        self.err.lock().unwrap().clone()
    }

    /// Record a connection-level failure and deliver it to every callback
    /// still waiting, in FIFO order. The original silently drops these
    /// callbacks on disconnect; here every one still gets a call.
    fn fail_all(&self, err: RedisError) {
        let mut slot = self.err.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err.clone());
        }
        drop(slot);

        let mut pending = self.pending.lock().unwrap();
        let drained: Vec<_> = pending.drain(..).collect();
        drop(pending);
        for cb in drained {
            cb(Err(err.clone()));
        }
    }

    fn deliver(&self, result: RedisResult<Reply>) {
        let callback = self.pending.lock().unwrap().pop_front();
        match callback {
            Some(cb) => cb(result),
            None => warn!("reply arrived with no pending callback queued; dropping it"),
        }
    }
}

/// An asynchronous, pipelined connection. Every `async_command*` call
/// appends its callback to a FIFO and writes the formatted command
/// immediately; a background task reads replies and pops callbacks off the
/// same FIFO in order, so replies are always matched to the command that
/// produced them without any request ID on the wire.
pub struct AsyncContext {
    write_half: AsyncMutex<OwnedWriteHalf>,
    shared: Arc<Shared>,
}

impl AsyncContext {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> RedisResult<Arc<AsyncContext>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(Shared {
            pending: Mutex::new(VecDeque::new()),
            err: Mutex::new(None),
        });

        tokio::spawn(read_loop(read_half, shared.clone()));

        Ok(Arc::new(AsyncContext {
            write_half: AsyncMutex::new(write_half),
            shared,
        }))
    }

    pub fn is_failed(&self) -> bool {
        self.shared.current_error().is_some()
    }

    pub fn last_error(&self) -> Option<RedisError> {
        self.shared.current_error()
    }

    /// Queue a templated command; `callback` fires once its reply (or a
    /// connection failure) arrives.
    pub async fn async_command<F>(&self, fmt: &str, args: &[FormatArg<'_>], callback: F) -> RedisResult<()>
    where
        F: FnOnce(RedisResult<Reply>) + Send + 'static,
    {
        let cmd = format_command(fmt, args)?;
        self.enqueue(cmd, Box::new(callback)).await
    }

    /// Queue an argv command; `callback` fires once its reply (or a
    /// connection failure) arrives.
    pub async fn async_command_argv<F>(&self, argv: &[&[u8]], callback: F) -> RedisResult<()>
    where
        F: FnOnce(RedisResult<Reply>) + Send + 'static,
    {
        let cmd = format_command_argv(argv)?;
        self.enqueue(cmd, Box::new(callback)).await
    }

    async fn enqueue(&self, cmd: Vec<u8>, callback: ReplyCallback) -> RedisResult<()> {
        if let Some(e) = self.shared.current_error() {
            callback(Err(e.clone()));
            return Err(e);
        }

        // Hold the write lock across both the FIFO push and the write
        // itself, so two racing callers can never push in one order and
        // write in the other: whichever task wins `write_half` is the one
        // that pushes first and writes first.
        let mut w = self.write_half.lock().await;
        self.shared.pending.lock().unwrap().push_back(callback);
        let result = w.write_all(&cmd).await;
        drop(w);

        if let Err(e) = result {
            let err = RedisError::Io(e);
            self.shared.fail_all(err.clone());
            return Err(err);
        }
        Ok(())
    }
}

#[instrument(level = "debug", skip_all)]
async fn read_loop(mut read_half: OwnedReadHalf, shared: Arc<Shared>) {
    info!("reply stream started");

    let mut reader = Reader::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match read_half.read(&mut chunk).await {
            Ok(0) => {
                shared.fail_all(RedisError::Eof);
                return;
            }
            Ok(n) => {
                reader.feed(&chunk[..n]);
                loop {
                    match reader.get_reply() {
                        Ok(Some(reply)) => shared.deliver(Ok(reply)),
                        Ok(None) => break,
                        Err(e) => {
                            shared.fail_all(e);
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                shared.fail_all(RedisError::Io(e));
                return;
            }
        }
    }
}
