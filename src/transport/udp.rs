use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;

use super::{tcp::TcpTransport, TransportCtx, TransportError, Upstream};
use crate::wire::UDP_RECV_BUF;

type Pending = oneshot::Sender<Bytes>;

struct UdpSocketState {
    socket: Arc<UdpSocket>,
    inflight: Arc<DashMap<u16, (u16, Pending), FxBuildHasher>>,
    next_id: AtomicU16,
}

/// Pooled UDP client generalizing the pooled-socket id-rewrite demux
/// pattern: each socket owns a dedicated reader task and its own 16-bit id
/// space, round-robined across by callers.
pub struct UdpTransport {
    pool: Vec<UdpSocketState>,
    next_idx: AtomicUsize,
    upstream: SocketAddr,
    tcp_fallback: Arc<TcpTransport>,
}

impl UdpTransport {
    pub async fn new(upstream: SocketAddr, pool_size: usize, tcp_fallback: Arc<TcpTransport>) -> Result<Self> {
        let mut pool = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let domain = if upstream.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
            let sock2 = Socket::new(domain, Type::DGRAM, None)?;
            sock2.set_nonblocking(true)?;
            let bind_addr: SocketAddr = if upstream.is_ipv6() {
                "[::]:0".parse().unwrap()
            } else {
                "0.0.0.0:0".parse().unwrap()
            };
            sock2.bind(&bind_addr.into())?;
            sock2.set_recv_buffer_size(4 * 1024 * 1024).ok();
            sock2.set_send_buffer_size(4 * 1024 * 1024).ok();
            let std_sock: std::net::UdpSocket = sock2.into();
            let socket = Arc::new(UdpSocket::from_std(std_sock)?);
            socket.connect(upstream).await?;

            let inflight: Arc<DashMap<u16, (u16, Pending), FxBuildHasher>> =
                Arc::new(DashMap::with_hasher(FxBuildHasher::default()));

            let reader_socket = socket.clone();
            let reader_inflight = inflight.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; UDP_RECV_BUF];
                loop {
                    match reader_socket.recv(&mut buf).await {
                        Ok(n) if n >= 2 => {
                            let rewritten_id = u16::from_be_bytes([buf[0], buf[1]]);
                            if let Some((_, (orig_id, tx))) = reader_inflight.remove(&rewritten_id) {
                                let mut body = buf[..n].to_vec();
                                body[0] = (orig_id >> 8) as u8;
                                body[1] = (orig_id & 0xff) as u8;
                                let _ = tx.send(Bytes::from(body));
                            }
                        }
                        Ok(_) => continue,
                        Err(_) => break,
                    }
                }
            });

            pool.push(UdpSocketState {
                socket,
                inflight,
                next_id: AtomicU16::new(0),
            });
        }

        Ok(Self {
            pool,
            next_idx: AtomicUsize::new(0),
            upstream,
            tcp_fallback,
        })
    }

    async fn send_pooled(&self, packet: &[u8], timeout_dur: Duration) -> Result<Bytes, TransportError> {
        if packet.len() < 2 {
            return Err(TransportError::Protocol("packet too short".into()));
        }
        let idx = self.next_idx.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        let state = &self.pool[idx];
        let orig_id = u16::from_be_bytes([packet[0], packet[1]]);

        let mut rewritten_id = None;
        for _ in 0..100 {
            let candidate = state.next_id.fetch_add(1, Ordering::Relaxed);
            if !state.inflight.contains_key(&candidate) {
                rewritten_id = Some(candidate);
                break;
            }
        }
        let rewritten_id = rewritten_id.ok_or(TransportError::Exhausted)?;

        let mut out = packet.to_vec();
        out[0] = (rewritten_id >> 8) as u8;
        out[1] = (rewritten_id & 0xff) as u8;

        let (tx, rx) = oneshot::channel();
        state.inflight.insert(rewritten_id, (orig_id, tx));

        if let Err(e) = state.socket.send(&out).await {
            state.inflight.remove(&rewritten_id);
            return Err(TransportError::Io(e));
        }

        match timeout(timeout_dur, rx).await {
            Ok(Ok(mut bytes)) => {
                let mut body = bytes.to_vec();
                if body.len() >= 2 {
                    body[0] = (orig_id >> 8) as u8;
                    body[1] = (orig_id & 0xff) as u8;
                }
                bytes = Bytes::from(body);
                Ok(bytes)
            }
            Ok(Err(_)) => Err(TransportError::Protocol("udp reader closed".into())),
            Err(_) => {
                state.inflight.remove(&rewritten_id);
                Err(TransportError::TimedOut)
            }
        }
    }
}

#[async_trait]
impl Upstream for UdpTransport {
    async fn exchange(&self, ctx: &TransportCtx, wire: &[u8]) -> Result<Bytes, TransportError> {
        let response = self.send_pooled(wire, ctx.timeout).await?;
        // RFC 1035 §4.2.1: a truncated UDP response must be retried over TCP.
        if is_truncated(&response) {
            return self.tcp_fallback.exchange(ctx, wire).await;
        }
        Ok(response)
    }
}

fn is_truncated(wire: &[u8]) -> bool {
    wire.len() > 2 && (wire[2] & 0x02) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_bit_detected() {
        let mut header = vec![0u8; 12];
        header[2] = 0x02; // TC bit set
        assert!(is_truncated(&header));
        header[2] = 0x00;
        assert!(!is_truncated(&header));
    }
}
