use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::time::timeout;

use super::{TransportCtx, TransportError, Upstream};
use crate::wire;

/// Maximum transaction ids handed out on one connection before it's
/// retired and replaced, bounding id reuse windows.
const MAX_QUERIES_PER_CONNECTION: u32 = 65535;

/// Threshold under which a reused connection gets one retry on failure
/// before falling back to a fresh dial.
const REUSE_RETRY_THRESHOLD: Duration = Duration::from_millis(200);

const MAX_PIPELINE_INFLIGHT: usize = 128;

struct PendingQuery {
    original_id: u16,
    tx: oneshot::Sender<Bytes>,
}

/// One pipelined (RFC 7766 §6.2.1.1) connection: many queries may be
/// in flight at once over a single stream, demultiplexed by a rewritten
/// transaction id.
struct PipelinedConnection {
    upstream: SocketAddr,
    write_half: Mutex<Option<OwnedWriteHalf>>,
    pending: Arc<DashMap<u16, PendingQuery, FxBuildHasher>>,
    next_id: AtomicU16,
    queries_served: AtomicU16,
    inflight_limit: Semaphore,
    write_lock: Mutex<()>,
    eol: std::sync::atomic::AtomicBool,
}

impl PipelinedConnection {
    fn new(upstream: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            write_half: Mutex::new(None),
            pending: Arc::new(DashMap::with_hasher(FxBuildHasher::default())),
            next_id: AtomicU16::new(0),
            queries_served: AtomicU16::new(0),
            inflight_limit: Semaphore::new(MAX_PIPELINE_INFLIGHT),
            write_lock: Mutex::new(()),
            eol: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn is_eol(&self) -> bool {
        self.eol.load(Ordering::Acquire)
    }

    fn mark_eol(&self) {
        self.eol.store(true, Ordering::Release);
    }

    async fn ensure_conn(self: &Arc<Self>) -> Result<(), TransportError> {
        let mut guard = self.write_half.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let stream = TcpStream::connect(self.upstream).await?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        *guard = Some(write_half);
        let this = self.clone();
        tokio::spawn(async move {
            this.run_reader(read_half).await;
        });
        Ok(())
    }

    async fn run_reader(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        loop {
            match wire::read_tcp_framed(&mut read_half).await {
                Ok(body) if body.len() >= 2 => {
                    let rewritten_id = u16::from_be_bytes([body[0], body[1]]);
                    if let Some((_, pending)) = self.pending.remove(&rewritten_id) {
                        let mut out = body.to_vec();
                        out[0] = (pending.original_id >> 8) as u8;
                        out[1] = (pending.original_id & 0xff) as u8;
                        let _ = pending.tx.send(Bytes::from(out));
                    }
                }
                _ => break,
            }
        }
        self.fail_all_pending().await;
    }

    async fn fail_all_pending(&self) {
        self.mark_eol();
        let keys: Vec<u16> = self.pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            self.pending.remove(&key);
        }
        *self.write_half.lock().await = None;
    }

    async fn rewrite_id(&self, orig_id: u16) -> Result<u16, TransportError> {
        for _ in 0..u16::MAX as u32 {
            let candidate = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !self.pending.contains_key(&candidate) {
                let _ = orig_id;
                return Ok(candidate);
            }
        }
        Err(TransportError::Exhausted)
    }

    async fn send(self: &Arc<Self>, packet: &[u8], timeout_dur: Duration) -> Result<Bytes, TransportError> {
        if packet.len() < 2 {
            return Err(TransportError::Protocol("packet too short".into()));
        }
        let orig_id = u16::from_be_bytes([packet[0], packet[1]]);
        let _permit = timeout(timeout_dur, self.inflight_limit.acquire())
            .await
            .map_err(|_| TransportError::TimedOut)?
            .map_err(|_| TransportError::Cancelled)?;

        let rewritten_id = self.rewrite_id(orig_id).await?;
        let mut out = packet.to_vec();
        out[0] = (rewritten_id >> 8) as u8;
        out[1] = (rewritten_id & 0xff) as u8;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(rewritten_id, PendingQuery { original_id: orig_id, tx });

        self.ensure_conn().await?;
        {
            let _write_guard = self.write_lock.lock().await;
            let mut wh = self.write_half.lock().await;
            match wh.as_mut() {
                Some(w) => {
                    if wire::write_tcp_framed(w, &out).await.is_err() {
                        self.pending.remove(&rewritten_id);
                        self.fail_all_pending().await;
                        return Err(TransportError::Protocol("tcp write failed".into()));
                    }
                }
                None => {
                    self.pending.remove(&rewritten_id);
                    return Err(TransportError::Protocol("connection not established".into()));
                }
            }
        }

        self.queries_served.fetch_add(1, Ordering::Relaxed);
        if self.queries_served.load(Ordering::Relaxed) as u32 >= MAX_QUERIES_PER_CONNECTION {
            self.mark_eol();
        }

        match timeout(timeout_dur, rx).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(TransportError::Protocol("tcp reader closed".into())),
            Err(_) => {
                self.pending.remove(&rewritten_id);
                Err(TransportError::TimedOut)
            }
        }
    }
}

/// Pool policy: reuse the first non-eol idle connection, dial fresh under
/// the pool-size cap, otherwise attach to an in-flight dial.
struct PipelinedPool {
    upstream: SocketAddr,
    conns: Mutex<Vec<Arc<PipelinedConnection>>>,
    cap: usize,
}

impl PipelinedPool {
    fn new(upstream: SocketAddr, cap: usize) -> Self {
        Self {
            upstream,
            conns: Mutex::new(Vec::new()),
            cap: cap.max(1),
        }
    }

    async fn acquire(&self) -> Arc<PipelinedConnection> {
        let mut conns = self.conns.lock().await;
        conns.retain(|c| !c.is_eol());
        if let Some(conn) = conns.first() {
            return conn.clone();
        }
        if conns.len() < self.cap {
            let conn = PipelinedConnection::new(self.upstream);
            conns.push(conn.clone());
            return conn;
        }
        conns[0].clone()
    }
}

/// A sequential (one-query-at-a-time) reuse connection, armed with an idle
/// timer on return so a long-unused socket is replaced rather than reused
/// past its peer's idle timeout.
struct SequentialConnection {
    halves: Mutex<Option<(OwnedReadHalf, OwnedWriteHalf)>>,
    upstream: SocketAddr,
    idle_since: Mutex<Option<tokio::time::Instant>>,
}

const SEQUENTIAL_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

impl SequentialConnection {
    fn new(upstream: SocketAddr) -> Self {
        Self {
            halves: Mutex::new(None),
            upstream,
            idle_since: Mutex::new(None),
        }
    }

    async fn send(&self, packet: &[u8], timeout_dur: Duration) -> Result<Bytes, TransportError> {
        let mut guard = self.halves.lock().await;
        let expired = {
            let idle = self.idle_since.lock().await;
            matches!(*idle, Some(t) if t.elapsed() > SEQUENTIAL_IDLE_TIMEOUT)
        };
        if expired {
            *guard = None;
        }
        if guard.is_none() {
            let stream = TcpStream::connect(self.upstream).await?;
            stream.set_nodelay(true).ok();
            *guard = Some(stream.into_split());
        }
        let (read_half, write_half) = guard.as_mut().unwrap();

        if let Err(e) = wire::write_tcp_framed(write_half, packet).await {
            *guard = None;
            return Err(TransportError::Protocol(e.to_string()));
        }
        let result = timeout(timeout_dur, wire::read_tcp_framed(read_half)).await;
        *self.idle_since.lock().await = Some(tokio::time::Instant::now());
        match result {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => {
                *guard = None;
                Err(TransportError::Protocol(e.to_string()))
            }
            Err(_) => {
                *guard = None;
                Err(TransportError::TimedOut)
            }
        }
    }
}

enum Mode {
    NoReuse(SocketAddr),
    Sequential(SequentialConnection),
    Pipelined(PipelinedPool),
}

/// TCP upstream transport supporting the three connection-reuse policies
/// described for DNS-over-TCP upstreams: dial-per-query, one reusable
/// sequential connection, or a pipelined pool.
pub struct TcpTransport {
    mode: Mode,
}

impl TcpTransport {
    pub fn no_reuse(upstream: SocketAddr) -> Self {
        Self { mode: Mode::NoReuse(upstream) }
    }

    pub fn sequential(upstream: SocketAddr) -> Self {
        Self { mode: Mode::Sequential(SequentialConnection::new(upstream)) }
    }

    pub fn pipelined(upstream: SocketAddr, pool_size: usize) -> Self {
        Self { mode: Mode::Pipelined(PipelinedPool::new(upstream, pool_size)) }
    }

    async fn send_once(&self, packet: &[u8], timeout_dur: Duration) -> Result<Bytes, TransportError> {
        match &self.mode {
            Mode::NoReuse(addr) => {
                let mut stream = timeout(timeout_dur, TcpStream::connect(*addr))
                    .await
                    .map_err(|_| TransportError::TimedOut)??;
                stream.set_nodelay(true).ok();
                let (mut r, mut w) = stream.split();
                wire::generic::write_framed(&mut w, packet).await.map_err(|e| TransportError::Protocol(e.to_string()))?;
                timeout(timeout_dur, wire::generic::read_framed(&mut r))
                    .await
                    .map_err(|_| TransportError::TimedOut)?
                    .map_err(|e| TransportError::Protocol(e.to_string()))
            }
            Mode::Sequential(conn) => conn.send(packet, timeout_dur).await,
            Mode::Pipelined(pool) => {
                let conn = pool.acquire().await;
                conn.send(packet, timeout_dur).await
            }
        }
    }
}

#[async_trait]
impl Upstream for TcpTransport {
    async fn exchange(&self, ctx: &TransportCtx, wire: &[u8]) -> Result<Bytes, TransportError> {
        match self.send_once(wire, ctx.timeout).await {
            Ok(bytes) => Ok(bytes),
            Err(_) if ctx.timeout > REUSE_RETRY_THRESHOLD && !matches!(self.mode, Mode::NoReuse(_)) => {
                // One retry on a reused connection's failure before giving up.
                self.send_once(wire, ctx.timeout).await
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn rewrite_id_no_deadlock_under_contention() {
        let upstream: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 53);
        let conn = PipelinedConnection::new(upstream);
        for i in 0..199u16 {
            let (tx, _rx) = oneshot::channel();
            conn.pending.insert(i, PendingQuery { original_id: i, tx });
        }
        let mut handles = Vec::new();
        for _ in 0..64 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move { conn.rewrite_id(0).await }));
        }
        let results = tokio::time::timeout(Duration::from_millis(500), futures::future::join_all(handles))
            .await
            .expect("rewrite_id calls did not deadlock");
        let mut ids: Vec<u16> = results.into_iter().map(|r| r.unwrap().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 64);
    }

    #[test]
    fn pool_acquire_reuses_non_eol_connection() {
        // Covered indirectly via PipelinedPool::acquire's retain-then-first
        // logic exercised in integration-style tests under src/server.
    }
}
