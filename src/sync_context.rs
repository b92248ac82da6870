use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(unix)]
use std::path::Path;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use log::{debug, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{RedisError, RedisResult};
use crate::format::{format_command, FormatArg};
use crate::reader::Reader;
use crate::reply::Reply;

const READ_CHUNK: usize = 16 * 1024;

/// Connection parameters, replacing the original's bitmask-plus-`timeval`
/// pair with an explicit, ordinary Rust struct.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// `None` waits indefinitely, matching the original's NULL timeout.
    pub timeout: Option<Duration>,
    /// Sets `SO_REUSEADDR` before connecting.
    pub reuse_addr: bool,
}

enum Endpoint {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Endpoint {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Endpoint::Tcp(s) => s.set_nonblocking(nonblocking),
            #[cfg(unix)]
            Endpoint::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Endpoint::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Endpoint::Unix(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Endpoint::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Endpoint::Unix(s) => s.write(buf),
        }
    }
}

/// A blocking (or, once switched with [`SyncContext::set_nonblocking`],
/// non-blocking) request/reply connection: a socket, a send buffer, and a
/// [`Reader`].
pub struct SyncContext {
    endpoint: Endpoint,
    blocking: bool,
    connected: bool,
    peer: String,
    err: Option<RedisError>,
    send_buf: BytesMut,
    reader: Reader,
}

impl SyncContext {
    fn from_endpoint(endpoint: Endpoint, peer: String) -> SyncContext {
        SyncContext {
            endpoint,
            blocking: true,
            connected: true,
            peer,
            err: None,
            send_buf: BytesMut::with_capacity(4096),
            reader: Reader::new(),
        }
    }

    /// Connect to a TCP endpoint. Sets `TCP_NODELAY` once connected, as the
    /// original always does regardless of `opts`.
    pub fn connect_tcp<A: ToSocketAddrs>(addr: A, opts: ConnectOptions) -> RedisResult<SyncContext> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RedisError::other("no address resolved"))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if opts.reuse_addr {
            socket.set_reuse_address(true)?;
        }
        let sock_addr = SockAddr::from(addr);
        match opts.timeout {
            Some(t) => socket.connect_timeout(&sock_addr, t)?,
            None => socket.connect(&sock_addr)?,
        }
        socket.set_nodelay(true)?;
        socket.set_nonblocking(false)?;

        debug!("connected to {}", addr);
        Ok(SyncContext::from_endpoint(Endpoint::Tcp(socket.into()), addr.to_string()))
    }

    /// Connect to a Unix domain socket.
    #[cfg(unix)]
    pub fn connect_unix<P: AsRef<Path>>(path: P, opts: ConnectOptions) -> RedisResult<SyncContext> {
        let path = path.as_ref();
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        let sock_addr = SockAddr::unix(path)
            .map_err(|e| RedisError::other(format!("invalid unix socket path: {e}")))?;
        match opts.timeout {
            Some(t) => socket.connect_timeout(&sock_addr, t)?,
            None => socket.connect(&sock_addr)?,
        }
        socket.set_nonblocking(false)?;

        debug!("connected to {}", path.display());
        Ok(SyncContext::from_endpoint(
            Endpoint::Unix(socket.into()),
            path.display().to_string(),
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Switch between blocking and non-blocking I/O. The original tracks
    /// this as one bit (`REDIS_BLOCK`) in a flags field; this crate keeps it
    /// as its own field so it can never be clobbered by a connect/disconnect
    /// transition (see SPEC_FULL.md §9 on the original's flag bugs).
    pub fn set_nonblocking(&mut self, nonblocking: bool) -> RedisResult<()> {
        self.endpoint.set_nonblocking(nonblocking)?;
        self.blocking = !nonblocking;
        Ok(())
    }

    /// Reset a failed context so its socket slot can be reused by a fresh
    /// connect call. The underlying socket is not reused; this only clears
    /// sticky error state and buffered data.
    pub fn reset(&mut self) {
        self.err = None;
        self.send_buf.clear();
        self.reader.reset();
    }

    pub fn last_error(&self) -> Option<&RedisError> {
        self.err.as_ref()
    }

    fn fail(&mut self, err: RedisError) -> RedisError {
        self.err = Some(err.clone());
        err
    }

    /// Format a command from a template and append it to the send buffer.
    pub fn append_command(&mut self, fmt: &str, args: &[FormatArg]) -> RedisResult<()> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        let cmd = format_command(fmt, args)?;
        self.send_buf.extend_from_slice(&cmd);
        Ok(())
    }

    /// Format a command from an argument vector and append it to the send
    /// buffer.
    pub fn append_command_argv(&mut self, argv: &[&[u8]]) -> RedisResult<()> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        let cmd = crate::format::format_command_argv(argv)?;
        self.send_buf.extend_from_slice(&cmd);
        Ok(())
    }

    /// Write some (or all) of the send buffer to the socket. Returns
    /// whether the send buffer is now empty.
    pub fn buffer_write(&mut self) -> RedisResult<bool> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        if self.send_buf.is_empty() {
            return Ok(true);
        }

        match self.endpoint.write(&self.send_buf) {
            Ok(n) => {
                self.send_buf.advance(n);
                Ok(self.send_buf.is_empty())
            }
            Err(e) if is_retriable(&e, self.blocking) => {
                warn!("retriable write error on {}: {e}", self.peer);
                Ok(false)
            }
            Err(e) => Err(self.fail(RedisError::Io(e))),
        }
    }

    /// Read whatever is available from the socket into the reader's buffer.
    pub fn buffer_read(&mut self) -> RedisResult<()> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        let mut chunk = [0u8; READ_CHUNK];
        match self.endpoint.read(&mut chunk) {
            Ok(0) => Err(self.fail(RedisError::Eof)),
            Ok(n) => {
                self.reader.feed(&chunk[..n]);
                Ok(())
            }
            Err(e) if is_retriable(&e, self.blocking) => Ok(()),
            Err(e) => Err(self.fail(RedisError::Io(e))),
        }
    }

    /// Drain any already-buffered reply. If none is available and the
    /// context is blocking, flush the send buffer and read until one
    /// arrives.
    pub fn get_reply(&mut self) -> RedisResult<Option<Reply>> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        if let Some(reply) = self.reader.get_reply()? {
            return Ok(Some(reply));
        }
        if !self.blocking {
            return Ok(None);
        }

        while !self.buffer_write()? {}
        loop {
            self.buffer_read()?;
            if let Some(reply) = self.reader.get_reply()? {
                return Ok(Some(reply));
            }
        }
    }

    /// Append a templated command and block for its reply. Only valid on a
    /// blocking context.
    pub fn command(&mut self, fmt: &str, args: &[FormatArg]) -> RedisResult<Reply> {
        if !self.blocking {
            return Err(RedisError::other("command() requires a blocking context"));
        }
        self.append_command(fmt, args)?;
        match self.get_reply()? {
            Some(reply) => Ok(reply),
            None => Err(RedisError::other("no reply received in blocking mode")),
        }
    }

    /// Append an argv command and block for its reply. Only valid on a
    /// blocking context.
    pub fn command_argv(&mut self, argv: &[&[u8]]) -> RedisResult<Reply> {
        if !self.blocking {
            return Err(RedisError::other("command_argv() requires a blocking context"));
        }
        self.append_command_argv(argv)?;
        match self.get_reply()? {
            Some(reply) => Ok(reply),
            None => Err(RedisError::other("no reply received in blocking mode")),
        }
    }
}

fn is_retriable(e: &io::Error, blocking: bool) -> bool {
    e.kind() == io::ErrorKind::Interrupted || (e.kind() == io::ErrorKind::WouldBlock && !blocking)
}
