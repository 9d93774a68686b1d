//! UDP front-end: the teacher's `SO_REUSEPORT` multi-worker accept loop
//! (formerly `main.rs::run_udp_worker`), generalized to call the `Engine`
//! and to truncate oversized responses per spec.md §4.8.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::net::UdpSocket;
use tracing::error;

use crate::engine::Engine;
use crate::wire::UDP_RECV_BUF;

use super::serve_query;

/// Floor applied regardless of the requester's advertised EDNS0 buffer
/// size (spec.md §4.1/§4.8: "SHOULD be at least 4096... 512 minimum").
const MIN_UDP_RESPONSE_SIZE: usize = 512;
/// Ceiling applied even if the requester advertises a larger EDNS0 buffer,
/// keeping worst-case datagrams comfortably under common path MTUs.
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// Spawns `workers` UDP listener tasks bound to `addr`. On Unix, each
/// worker gets its own `SO_REUSEPORT` socket so the kernel load-balances
/// inbound datagrams across them; elsewhere all workers share one socket.
pub async fn spawn(addr: SocketAddr, workers: usize, engine: Engine) -> Result<Vec<tokio::task::JoinHandle<()>>> {
    let workers = workers.max(1);
    let mut handles = Vec::with_capacity(workers);

    #[cfg(unix)]
    {
        for worker_id in 0..workers {
            let std_socket = create_reuseport_socket(addr)
                .with_context(|| format!("create udp socket for worker {worker_id}"))?;
            let socket = Arc::new(UdpSocket::from_std(std_socket)?);
            let engine = engine.with_listener_label("udp");
            handles.push(tokio::spawn(async move {
                if let Err(err) = run_worker(worker_id, socket, engine).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            }));
        }
    }

    #[cfg(not(unix))]
    {
        let socket = Arc::new(bind_shared_socket(addr)?);
        for worker_id in 0..workers {
            let socket = socket.clone();
            let engine = engine.with_listener_label("udp");
            handles.push(tokio::spawn(async move {
                if let Err(err) = run_worker(worker_id, socket, engine).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            }));
        }
    }

    Ok(handles)
}

#[cfg(unix)]
fn create_reuseport_socket(addr: SocketAddr) -> Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    #[allow(unused_imports)]
    use libc::{c_int, c_void, setsockopt, socklen_t, SOL_SOCKET, SO_REUSEPORT};
    let val: c_int = 1;
    let fd = socket.as_raw_fd();
    unsafe {
        // Non-fatal if unsupported: fall back to a single shared socket's
        // worth of throughput rather than failing startup.
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const _ as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        );
    }

    socket.set_recv_buffer_size(4 * 1024 * 1024).ok();
    socket.set_send_buffer_size(4 * 1024 * 1024).ok();
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

#[cfg(not(unix))]
fn bind_shared_socket(addr: SocketAddr) -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    socket.set_recv_buffer_size(4 * 1024 * 1024).ok();
    socket.set_send_buffer_size(4 * 1024 * 1024).ok();
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket.bind(&addr.into()).context("bind socket")?;
    UdpSocket::from_std(socket.into()).context("wrap udp socket")
}

async fn run_worker(_worker_id: usize, socket: Arc<UdpSocket>, engine: Engine) -> Result<()> {
    let mut buf = BytesMut::with_capacity(UDP_RECV_BUF);
    loop {
        if buf.capacity() < UDP_RECV_BUF {
            buf.reserve(UDP_RECV_BUF - buf.len());
        }
        // SAFETY: `recv_from` immediately overwrites up to `len` bytes of
        // the reserved, uninitialized tail; we truncate back down to `len`
        // before ever reading it.
        unsafe {
            buf.set_len(buf.capacity());
        }

        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                unsafe {
                    buf.set_len(len);
                }
                let packet = buf.split().freeze();
                let socket = socket.clone();
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Some(resp) = serve_query(&engine, &packet, peer.ip(), false).await {
                        let resp = truncate_for_udp(&packet, resp);
                        let _ = socket.send_to(&resp, peer).await;
                    }
                });
            }
            Err(_) => buf.clear(),
        }
    }
}

/// Truncates an oversized response per RFC 1035 §4.2.1: strips the
/// answer/authority/additional sections and sets TC=1, leaving only the
/// header and question -- which, at `udp_size >= 512`, always fits.
fn truncate_for_udp(request: &[u8], resp: Bytes) -> Bytes {
    let udp_size = request_udp_size(request);
    if resp.len() <= udp_size {
        return resp;
    }
    match Message::from_bytes(&resp) {
        Ok(mut msg) => {
            msg.take_answers();
            msg.take_name_servers();
            msg.take_additionals();
            msg.set_truncated(true);
            msg.to_bytes().map(Bytes::from).unwrap_or(resp)
        }
        Err(_) => resp,
    }
}

fn request_udp_size(request: &[u8]) -> usize {
    Message::from_bytes(request)
        .ok()
        .and_then(|m| m.edns().map(|e| e.max_payload() as usize))
        .unwrap_or(MIN_UDP_RESPONSE_SIZE)
        .clamp(MIN_UDP_RESPONSE_SIZE, MAX_UDP_RESPONSE_SIZE)
}
