//! TCP front-end: one accept loop per listener, one task per connection,
//! pipelined so a client can have several in-flight queries on the same
//! connection (spec.md §4.8, mirroring the upstream pipelined-reuse mode
//! this forwarder itself uses against its own upstreams in
//! `transport::tcp`).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::wire::{read_tcp_framed, write_tcp_framed};

use super::serve_query;

/// Connection is dropped after this much time with no query in flight.
pub(crate) const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
/// A single frame write must complete within this long or the connection
/// is considered stalled and dropped.
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
/// Backoff applied between `accept()` errors so a persistent failure
/// (e.g. file-descriptor exhaustion) doesn't spin the loop hot.
pub(crate) const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub async fn spawn(addr: SocketAddr, engine: Engine) -> Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(addr).await?;
    let engine = engine.with_listener_label("tcp");
    Ok(tokio::spawn(accept_loop(listener, engine)))
}

async fn accept_loop(listener: TcpListener, engine: Engine) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let engine = engine.clone();
                tokio::spawn(async move {
                    handle_conn(stream, peer, engine).await;
                });
            }
            Err(err) => {
                warn!(error = %err, "tcp accept failed, backing off");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

async fn handle_conn(stream: TcpStream, peer: SocketAddr, engine: Engine) {
    stream.set_nodelay(true).ok();
    let (mut read_half, write_half) = stream.into_split();
    let write_half = Arc::new(Mutex::new(write_half));

    loop {
        let frame = match tokio::time::timeout(IDLE_TIMEOUT, read_tcp_framed(&mut read_half)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => break,
            Err(_) => {
                debug!(%peer, "tcp connection idle timeout");
                break;
            }
        };

        let engine = engine.clone();
        let write_half = write_half.clone();
        tokio::spawn(async move {
            if let Some(resp) = serve_query(&engine, &frame, peer.ip(), true).await {
                let mut guard = write_half.lock().await;
                if tokio::time::timeout(WRITE_TIMEOUT, write_tcp_framed(&mut guard, &resp))
                    .await
                    .is_err()
                {
                    warn!(%peer, "tcp response write timed out");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::engine::CompiledConfig;
    use arc_swap::ArcSwap;
    use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::{Name, RecordType};
    use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
    use serde_json::json;
    use std::str::FromStr;

    fn test_engine() -> Engine {
        let cfg: PipelineConfig = serde_json::from_value(json!({
            "settings": {
                "bind_tcp": "127.0.0.1:0",
                "default_upstream": "udp://127.0.0.1:1",
                "query_timeout_ms": 200,
                "limiter_max_running": 8,
                "limiter_max_waiting": 8
            },
            "pipelines": [ { "id": "default", "rules": [] } ]
        }))
        .unwrap();
        let compiled = CompiledConfig::compile(cfg).unwrap();
        let swap = Arc::new(ArcSwap::from_pointee(compiled));
        Engine::new(swap, "default".to_string()).unwrap()
    }

    #[tokio::test]
    async fn round_trips_a_query_over_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let engine = test_engine();
        tokio::spawn(accept_loop(listener, engine));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut read_half, mut write_half) = stream.into_split();

        let mut msg = Message::new();
        msg.set_id(7);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::A));
        write_tcp_framed(&mut write_half, &msg.to_bytes().unwrap()).await.unwrap();

        let resp = tokio::time::timeout(Duration::from_secs(2), read_tcp_framed(&mut read_half))
            .await
            .unwrap()
            .unwrap();
        let parsed = Message::from_bytes(&resp).unwrap();
        assert_eq!(parsed.id(), 7);
        assert_eq!(parsed.response_code(), ResponseCode::ServFail);
    }
}
