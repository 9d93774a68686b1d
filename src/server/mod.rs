//! Protocol front-ends: per-transport listeners that decode an inbound wire
//! query, run it through the `Engine`, and encode the outcome back onto the
//! wire, per spec.md §4.8. Each front-end owns its own accept/read loop and
//! framing, but all of them funnel the actual query handling through
//! `serve_query` below so admission control, deadline bounding, and SERVFAIL
//! synthesis on error stay in one place rather than four.

pub mod dot;
pub mod doh;
pub mod tcp;
pub mod udp;

use std::net::IpAddr;

use bytes::Bytes;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tracing::warn;

use crate::engine::Engine;
use crate::pipeline::synthesize_servfail;

/// Runs one query end-to-end: admission limiter -> bounded-deadline
/// pipeline execution -> wire-format response.
///
/// Returns `None` when the query should receive no answer at all: either
/// admission refused it (spec.md §4.6, a silent drop) or the inbound bytes
/// never decoded as a DNS message in the first place (spec.md §7 treats a
/// malformed query as a protocol error, not something to SERVFAIL). Any
/// other pipeline failure -- upstream error, missing pipeline, deadline
/// exceeded -- synthesizes a SERVFAIL matching the original question, so a
/// client always gets a well-formed answer for a well-formed query.
pub async fn serve_query(engine: &Engine, packet: &[u8], client_ip: IpAddr, over_stream: bool) -> Option<Bytes> {
    let admission = match engine.limiter.admit().await {
        Ok(a) => a,
        Err(_) => return None,
    };

    let outcome = tokio::time::timeout(
        engine.query_timeout(),
        engine.handle_query(packet, client_ip, over_stream),
    )
    .await;
    drop(admission);

    match outcome {
        Ok(Ok(bytes)) => Some(bytes),
        Ok(Err(err)) => {
            warn!(error = %err, "pipeline error, answering with servfail");
            servfail_for(packet)
        }
        Err(_) => {
            warn!("query exceeded deadline, answering with servfail");
            servfail_for(packet)
        }
    }
}

fn servfail_for(packet: &[u8]) -> Option<Bytes> {
    let question = Message::from_bytes(packet).ok()?;
    let resp = synthesize_servfail(&question);
    resp.to_bytes().ok().map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::engine::CompiledConfig;
    use arc_swap::ArcSwap;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RecordType};
    use serde_json::json;
    use std::str::FromStr;
    use std::sync::Arc;

    fn test_engine() -> Engine {
        let cfg: PipelineConfig = serde_json::from_value(json!({
            "settings": {
                "default_upstream": "udp://127.0.0.1:1", // never reachable: forces servfail
                "query_timeout_ms": 50,
                "limiter_max_running": 4,
                "limiter_max_waiting": 4
            },
            "pipelines": [ { "id": "default", "rules": [] } ]
        }))
        .unwrap();
        let compiled = CompiledConfig::compile(cfg).unwrap();
        let swap = Arc::new(ArcSwap::from_pointee(compiled));
        Engine::new(swap, "default".to_string()).unwrap()
    }

    fn sample_packet() -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(99);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::A));
        msg.to_bytes().unwrap()
    }

    #[tokio::test]
    async fn unreachable_upstream_yields_servfail_matching_question() {
        let engine = test_engine();
        let packet = sample_packet();
        let resp = serve_query(&engine, &packet, "127.0.0.1".parse().unwrap(), false)
            .await
            .expect("response expected");
        let parsed = Message::from_bytes(&resp).unwrap();
        assert_eq!(parsed.id(), 99);
        assert_eq!(parsed.response_code(), hickory_proto::op::ResponseCode::ServFail);
    }

    #[tokio::test]
    async fn undecodable_packet_yields_no_response() {
        let engine = test_engine();
        let garbage = vec![1, 2, 3];
        assert!(serve_query(&engine, &garbage, "127.0.0.1".parse().unwrap(), false)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn admission_queue_full_drops_silently() {
        let cfg: PipelineConfig = serde_json::from_value(json!({
            "settings": {
                "default_upstream": "udp://127.0.0.1:1",
                "query_timeout_ms": 5000,
                "limiter_max_running": 0,
                "limiter_max_waiting": 0
            },
            "pipelines": [ { "id": "default", "rules": [] } ]
        }))
        .unwrap();
        let compiled = CompiledConfig::compile(cfg).unwrap();
        let swap = Arc::new(ArcSwap::from_pointee(compiled));
        let engine = Engine::new(swap, "default".to_string()).unwrap();
        let packet = sample_packet();
        assert!(serve_query(&engine, &packet, "127.0.0.1".parse().unwrap(), false)
            .await
            .is_none());
    }
}
