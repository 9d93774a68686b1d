//! The in-flight query context threaded through one pipeline execution,
//! generalizing the teacher's per-query scratch state (formerly local to
//! `engine.rs`'s `apply_rules`/`apply_response_actions` loop) into a type
//! the engine and server front-ends both share.

use std::net::IpAddr;

use bytes::Bytes;
use hickory_proto::op::{Message, ResponseCode};

/// Status of an in-flight query, set once a pipeline node decides the
/// outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Fresh,
    Responded,
    ServerFailed,
}

/// Client-supplied metadata carried alongside the query: the source
/// address and whether it arrived over a stream transport (TCP/DoT/DoH),
/// which gates whether a truncated UDP-style answer may instead be
/// returned in full.
#[derive(Debug, Clone, Copy)]
pub struct ClientMeta {
    pub addr: IpAddr,
    pub over_stream: bool,
}

/// A hook registered on a `QueryContext` to run after the main pipeline
/// returns, regardless of outcome (success, server failure, or error).
/// Used by the cache to record a freshly fetched answer without coupling
/// the forward step to cache bookkeeping.
pub type DeferredAction = Box<dyn FnOnce(&QueryContext) + Send>;

/// The in-flight unit of work threaded through a pipeline execution.
/// Single-owner: exactly one pipeline frame holds it at a time. `fork()`
/// produces the "copy-without-response" clone spec'd for parallel upstream
/// attempts (UDP->TCP truncation fallback, lazy-refresh background task).
pub struct QueryContext {
    pub question: Message,
    pub response: Option<Bytes>,
    pub status: QueryStatus,
    pub client_meta: ClientMeta,
    pub deferred: Vec<DeferredAction>,
}

impl QueryContext {
    pub fn new(question: Message, client_meta: ClientMeta) -> Self {
        Self {
            question,
            response: None,
            status: QueryStatus::Fresh,
            client_meta,
            deferred: Vec::new(),
        }
    }

    /// A shallow copy without the response, deferred actions, or status,
    /// used to dispatch a parallel or background attempt that must not
    /// observe (or mutate) the original's in-flight bookkeeping.
    pub fn fork(&self) -> Self {
        Self {
            question: self.question.clone(),
            response: None,
            status: QueryStatus::Fresh,
            client_meta: self.client_meta,
            deferred: Vec::new(),
        }
    }

    pub fn defer(&mut self, action: DeferredAction) {
        self.deferred.push(action);
    }

    /// Runs every deferred action in last-registered-first order, exactly
    /// once each, regardless of how the main pipeline concluded.
    pub fn run_deferred(&mut self) {
        let actions: Vec<DeferredAction> = self.deferred.drain(..).rev().collect();
        for action in actions {
            action(self);
        }
    }
}

/// Builds a synthetic SERVFAIL response matching the request's question,
/// for the server front-end to hand back whenever the pipeline errors out
/// (and wasn't a plain cancellation).
pub fn synthesize_servfail(question: &Message) -> Message {
    let mut resp = Message::new();
    resp.set_id(question.id());
    resp.set_message_type(hickory_proto::op::MessageType::Response);
    resp.set_op_code(question.op_code());
    resp.set_response_code(ResponseCode::ServFail);
    for q in question.queries() {
        resp.add_query(q.clone());
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn sample_question() -> Message {
        let mut msg = Message::new();
        msg.set_id(42);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::A));
        msg
    }

    fn meta() -> ClientMeta {
        ClientMeta { addr: "127.0.0.1".parse().unwrap(), over_stream: false }
    }

    #[test]
    fn fork_clears_response_and_status() {
        let mut qctx = QueryContext::new(sample_question(), meta());
        qctx.response = Some(Bytes::from_static(b"x"));
        qctx.status = QueryStatus::Responded;
        let forked = qctx.fork();
        assert!(forked.response.is_none());
        assert_eq!(forked.status, QueryStatus::Fresh);
        assert_eq!(forked.question.id(), qctx.question.id());
    }

    #[test]
    fn deferred_actions_run_last_registered_first_exactly_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut qctx = QueryContext::new(sample_question(), meta());
        for i in 0..3 {
            let order = order.clone();
            qctx.defer(Box::new(move |_| order.lock().unwrap().push(i)));
        }
        qctx.run_deferred();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert!(qctx.deferred.is_empty());
    }

    #[test]
    fn deferred_actions_run_even_on_error_status() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut qctx = QueryContext::new(sample_question(), meta());
        qctx.status = QueryStatus::ServerFailed;
        let count2 = count.clone();
        qctx.defer(Box::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        qctx.run_deferred();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn synthesize_servfail_matches_question() {
        let q = sample_question();
        let resp = synthesize_servfail(&q);
        assert_eq!(resp.id(), q.id());
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
        assert_eq!(resp.queries(), q.queries());
    }

}
