use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{oneshot, Mutex};

use crate::async_context::AsyncContext;
use crate::error::{RedisError, RedisResult};
use crate::format::FormatArg;
use crate::reply::Reply;

pub type ConnId = u64;

struct Node {
    addr: SocketAddr,
    ctx: Arc<AsyncContext>,
}

struct Inner {
    next_id: ConnId,
    nodes: HashMap<ConnId, Node>,
    by_addr: HashMap<SocketAddr, ConnId>,
    order: Vec<ConnId>,
    cursor: usize,
}

/// Routes commands across a cluster by `ConnId` rather than raw socket fd,
/// so a reconnect never risks aliasing onto a fd the OS already reused for
/// something else. Holds one [`AsyncContext`] per known node and follows
/// `MOVED`/`ASK` redirects by connecting to (or reusing) the node named in
/// the redirect, never by keeping a separate, unbounded list of throwaway
/// connections: a redirect target becomes an ordinary tracked node and is
/// reclaimed the same way any other dead node is.
pub struct Coordinator {
    inner: Mutex<Inner>,
}

impl Coordinator {
    pub fn new() -> Coordinator {
        Coordinator {
            inner: Mutex::new(Inner {
                next_id: 0,
                nodes: HashMap::new(),
                by_addr: HashMap::new(),
                order: Vec::new(),
                cursor: 0,
            }),
        }
    }

    /// Register a node, connecting to it if it isn't already known.
    pub async fn add_node(&self, addr: SocketAddr) -> RedisResult<ConnId> {
        {
            let inner = self.inner.lock().await;
            if let Some(&id) = inner.by_addr.get(&addr) {
                return Ok(id);
            }
        }

        let ctx = AsyncContext::connect(addr).await?;

        let mut inner = self.inner.lock().await;
        // Lost a race with another caller connecting to the same address;
        // keep the one already registered and let this one drop.
        if let Some(&id) = inner.by_addr.get(&addr) {
            return Ok(id);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.nodes.insert(id, Node { addr, ctx });
        inner.by_addr.insert(addr, id);
        inner.order.push(id);
        Ok(id)
    }

    pub async fn node_count(&self) -> usize {
        self.inner.lock().await.nodes.len()
    }

    async fn connection_for(&self, addr: SocketAddr) -> RedisResult<Arc<AsyncContext>> {
        let id = self.add_node(addr).await?;
        let inner = self.inner.lock().await;
        Ok(inner
            .nodes
            .get(&id)
            .expect("connection_for: node vanished right after insertion")
            .ctx
            .clone())
    }

    /// Round-robin over live nodes, lazily evicting any whose connection has
    /// failed.
    async fn pick(&self) -> Option<Arc<AsyncContext>> {
        loop {
            let (id, ctx, failed_addr) = {
                let mut inner = self.inner.lock().await;
                if inner.order.is_empty() {
                    return None;
                }
                let idx = inner.cursor % inner.order.len();
                let id = inner.order[idx];
                inner.cursor = (inner.cursor + 1) % inner.order.len();
                let node = inner.nodes.get(&id).expect("order/nodes out of sync");
                if node.ctx.is_failed() {
                    (id, None, Some(node.addr))
                } else {
                    (id, Some(node.ctx.clone()), None)
                }
            };

            if let Some(ctx) = ctx {
                return Some(ctx);
            }

            let mut inner = self.inner.lock().await;
            inner.nodes.remove(&id);
            inner.order.retain(|&x| x != id);
            if let Some(addr) = failed_addr {
                inner.by_addr.remove(&addr);
                warn!("dropped failed cluster node {addr}");
            }
        }
    }

    /// Maximum number of `MOVED`/`ASK` hops followed for a single command,
    /// guarding against a misbehaving or flapping cluster bouncing a
    /// request between nodes forever.
    const MAX_REDIRECTS: u32 = 16;

    /// Send a templated command to a live node, following `MOVED`/`ASK`
    /// redirections (up to [`Coordinator::MAX_REDIRECTS`] hops).
    pub async fn command(&self, fmt: &str, args: &[FormatArg<'_>]) -> RedisResult<Reply> {
        let ctx = self
            .pick()
            .await
            .ok_or_else(|| RedisError::other("no live cluster nodes"))?;
        let mut reply = send(&ctx, fmt, args).await?;

        for _ in 0..Self::MAX_REDIRECTS {
            match self.follow_redirect(&reply, fmt, args).await? {
                Some(next) => reply = next,
                None => return Ok(reply),
            }
        }
        Err(RedisError::other("too many cluster redirects"))
    }

    /// If `reply` is a `MOVED`/`ASK` redirect, resend on the target node and
    /// return its reply; otherwise return `None` so the caller keeps
    /// `reply` unchanged. The caller re-examines the returned reply for a
    /// further redirect, since a just-moved node can itself answer with
    /// another `MOVED`/`ASK`.
    async fn follow_redirect(
        &self,
        reply: &Reply,
        fmt: &str,
        args: &[FormatArg<'_>],
    ) -> RedisResult<Option<Reply>> {
        if !reply.is_redirect() {
            return Ok(None);
        }
        let err = reply.as_error().expect("is_redirect implies as_error");
        let text = String::from_utf8_lossy(err);

        if let Some(rest) = text.strip_prefix("MOVED ") {
            let addr = parse_redirect_target(rest)?;
            debug!("MOVED -> {addr}");
            let ctx = self.connection_for(addr).await?;
            return Ok(Some(send(&ctx, fmt, args).await?));
        }

        if let Some(rest) = text.strip_prefix("ASK ") {
            let addr = parse_redirect_target(rest)?;
            debug!("ASK -> {addr}");
            let ctx = self.connection_for(addr).await?;
            send_asking(&ctx).await?;
            return Ok(Some(send(&ctx, fmt, args).await?));
        }

        Ok(None)
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Coordinator::new()
    }
}

async fn send(ctx: &Arc<AsyncContext>, fmt: &str, args: &[FormatArg<'_>]) -> RedisResult<Reply> {
    let (tx, rx) = oneshot::channel();
    ctx.async_command(fmt, args, move |r| {
        let _ = tx.send(r);
    })
    .await?;
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(RedisError::other("connection closed before a reply arrived")),
    }
}

async fn send_asking(ctx: &Arc<AsyncContext>) -> RedisResult<()> {
    let (tx, rx) = oneshot::channel();
    ctx.async_command_argv(&[b"ASKING"], move |r| {
        let _ = tx.send(r);
    })
    .await?;
    match rx.await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(RedisError::other("connection closed before ASKING was acknowledged")),
    }
}

/// Parses the `"<slot> <ip>:<port>"` tail of a `MOVED`/`ASK` error line.
fn parse_redirect_target(rest: &str) -> RedisResult<SocketAddr> {
    let addr_part = rest
        .split_whitespace()
        .last()
        .ok_or_else(|| RedisError::protocol("malformed redirect: missing target address"))?;
    addr_part
        .parse::<SocketAddr>()
        .map_err(|e| RedisError::protocol(format!("malformed redirect target {addr_part}: {e}")))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::{sleep, Duration};

    async fn respond_once(listener: TcpListener, reply: &'static [u8]) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];
        let _ = stream.read(&mut buf).await.unwrap();
        stream.write_all(reply).await.unwrap();
        sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn round_robin_visits_every_live_node() {
        let hits = Arc::new(AtomicUsize::new(0));

        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = listener_a.local_addr().unwrap();
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_b = listener_b.local_addr().unwrap();

        let hits_a = hits.clone();
        tokio::spawn(async move {
            let (mut stream, _) = listener_a.accept().await.unwrap();
            let mut buf = [0u8; 256];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                hits_a.fetch_add(1, Ordering::SeqCst);
                stream.write_all(b"+PONG\r\n").await.unwrap();
            }
        });
        let hits_b = hits.clone();
        tokio::spawn(async move {
            let (mut stream, _) = listener_b.accept().await.unwrap();
            let mut buf = [0u8; 256];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                hits_b.fetch_add(1, Ordering::SeqCst);
                stream.write_all(b"+PONG\r\n").await.unwrap();
            }
        });

        let coordinator = Coordinator::new();
        coordinator.add_node(addr_a).await.unwrap();
        coordinator.add_node(addr_b).await.unwrap();

        for _ in 0..4 {
            let reply = coordinator.command("PING", &[]).await.unwrap();
            assert_eq!(reply.as_status(), Some(&b"PONG"[..]));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn moved_redirect_is_followed_to_the_target_node() {
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_b = listener_b.local_addr().unwrap();

        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = listener_a.local_addr().unwrap();

        let moved = format!("-MOVED 0 {addr_b}\r\n").into_bytes().leak();
        tokio::spawn(respond_once(listener_a, moved));
        tokio::spawn(respond_once(listener_b, b"$5\r\nhello\r\n"));

        let coordinator = Coordinator::new();
        coordinator.add_node(addr_a).await.unwrap();

        let reply = coordinator.command("GET %s", &[FormatArg::Str("key")]).await.unwrap();
        assert_eq!(reply.as_bulk_string(), Some(&b"hello"[..]));
        assert_eq!(coordinator.node_count().await, 2);
    }

    #[tokio::test]
    async fn a_second_moved_from_the_redirect_target_is_also_followed() {
        let listener_c = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_c = listener_c.local_addr().unwrap();

        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_b = listener_b.local_addr().unwrap();

        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_a = listener_a.local_addr().unwrap();

        let moved_to_b = format!("-MOVED 0 {addr_b}\r\n").into_bytes().leak();
        let moved_to_c = format!("-MOVED 0 {addr_c}\r\n").into_bytes().leak();
        tokio::spawn(respond_once(listener_a, moved_to_b));
        tokio::spawn(respond_once(listener_b, moved_to_c));
        tokio::spawn(respond_once(listener_c, b"$5\r\nhello\r\n"));

        let coordinator = Coordinator::new();
        coordinator.add_node(addr_a).await.unwrap();

        let reply = coordinator.command("GET %s", &[FormatArg::Str("key")]).await.unwrap();
        assert_eq!(reply.as_bulk_string(), Some(&b"hello"[..]));
        assert_eq!(coordinator.node_count().await, 3);
    }

    #[tokio::test]
    async fn a_closed_node_is_evicted_from_rotation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let coordinator = Coordinator::new();
        coordinator.add_node(addr).await.unwrap();

        // Give the async context's read loop a chance to observe the close.
        for _ in 0..20 {
            if coordinator.command("PING", &[]).await.is_err() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(coordinator.node_count().await, 0);
    }
}
