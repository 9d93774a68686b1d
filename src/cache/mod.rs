pub mod lru;
pub mod redis;

use bytes::Bytes;
use dashmap::DashMap;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use rustc_hash::FxBuildHasher;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;

use lru::ShardedLru;

/// One cached response: the wire-format message plus the bookkeeping
/// timestamps needed to rewrite TTLs on read without re-querying upstream.
///
/// `soft_deadline` is the record's own min-TTL-derived expiry (when it
/// goes stale and should be refreshed); `expires_at` is the hard expiry
/// the entry is evicted at (under lazy refresh this is stretched out to
/// `lazy_ttl_secs` so a stale hit can still be served while a refresh
/// runs). For non-lazy entries the two coincide.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub bytes: Bytes,
    pub stored_at: SystemTime,
    pub soft_deadline: SystemTime,
    pub expires_at: SystemTime,
}

impl CacheEntry {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at <= now
    }

    fn is_stale(&self, now: SystemTime) -> bool {
        now >= self.soft_deadline
    }
}

/// Lazy-refresh single-flight deadline: a background revalidation is
/// allowed this long before it's abandoned.
pub const LAZY_REFRESH_DEADLINE: Duration = Duration::from_secs(5);

/// Lowest answer TTL across a message's answer section, in seconds.
fn min_ttl(msg: &Message) -> u32 {
    msg.answers().iter().map(|r| r.ttl()).min().unwrap_or(0)
}

pub struct ResponseCache {
    lru: ShardedLru<CacheEntry>,
    inflight: DashMap<String, Vec<oneshot::Sender<()>>, FxBuildHasher>,
}

impl ResponseCache {
    pub fn new(capacity: usize, shards: usize) -> Self {
        Self {
            lru: ShardedLru::new(capacity, shards),
            inflight: DashMap::with_hasher(FxBuildHasher::default()),
        }
    }

    /// Builds the cache fingerprint: the wire-format question with a
    /// zeroed transaction id, optionally salted by a routing-branch tag so
    /// two pipelines forwarding the same name to different upstreams don't
    /// collide.
    pub fn fingerprint(question: &Message, branch: &str) -> String {
        let mut msg = question.clone();
        msg.set_id(0);
        let wire = msg.to_bytes().unwrap_or_default();
        format!("{branch}:{}", hex_encode(&wire))
    }

    /// Returns a deep copy of the cached response with TTLs rewritten to
    /// `max(1, orig_ttl - elapsed)`, or `None` on a miss (or an expired
    /// entry when `allow_expired` is false).
    pub fn get(&self, key: &str, allow_expired: bool) -> Option<Bytes> {
        let entry = self.lru.get(key)?;
        let now = SystemTime::now();
        if entry.is_expired(now) && !allow_expired {
            return None;
        }
        let elapsed = now
            .duration_since(entry.stored_at)
            .unwrap_or_default()
            .as_secs();
        rewrite_ttl(&entry.bytes, elapsed)
    }

    /// Stores a response if it passes admission: `NOERROR`, not truncated,
    /// and a non-empty answer section.
    pub fn store(&self, key: &str, msg: &Message, stored_at: SystemTime, expires_at: SystemTime) {
        use hickory_proto::op::ResponseCode;
        if msg.response_code() != ResponseCode::NoError {
            return;
        }
        if msg.truncated() {
            return;
        }
        if msg.answers().is_empty() {
            return;
        }
        if expires_at <= stored_at {
            return;
        }
        let bytes = match msg.to_bytes() {
            Ok(b) => Bytes::from(b),
            Err(_) => return,
        };
        let soft_deadline =
            (stored_at + Duration::from_secs(min_ttl(msg).max(1) as u64)).min(expires_at);
        self.lru.insert(
            key.to_string(),
            CacheEntry {
                bytes,
                stored_at,
                soft_deadline,
                expires_at,
            },
        );
    }

    /// Like `get`, but also reports whether the hit is past its min-TTL
    /// soft deadline (and therefore due for a lazy refresh) so the caller
    /// can kick one off without a second lookup.
    pub fn get_with_staleness(&self, key: &str, allow_expired: bool) -> Option<(Bytes, bool)> {
        let entry = self.lru.get(key)?;
        let now = SystemTime::now();
        if entry.is_expired(now) && !allow_expired {
            return None;
        }
        let stale = entry.is_stale(now);
        let elapsed = now
            .duration_since(entry.stored_at)
            .unwrap_or_default()
            .as_secs();
        let bytes = rewrite_ttl(&entry.bytes, elapsed)?;
        Some((bytes, stale))
    }

    /// Registers this caller as the single-flight leader for `key` if no
    /// refresh is already running, returning `true` when the caller should
    /// perform the refresh itself.
    pub fn try_begin_refresh(&self, key: &str) -> bool {
        match self.inflight.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Vec::new());
                true
            }
        }
    }

    pub fn end_refresh(&self, key: &str) {
        self.inflight.remove(key);
    }

    pub fn clean_expired(&self) -> usize {
        let now = SystemTime::now();
        self.lru.clean(|e| e.is_expired(now))
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{b:02x}").unwrap();
    }
    s
}

/// Parses `wire`, rewrites every record's TTL to `max(1, ttl - elapsed)`,
/// and re-serializes. Returns `None` if the stored bytes don't parse
/// (treated as a cache miss by callers).
pub(crate) fn rewrite_ttl(wire: &Bytes, elapsed_secs: u64) -> Option<Bytes> {
    let mut msg = Message::from_bytes(wire).ok()?;
    let rewrite = |rec: &mut hickory_proto::rr::Record| {
        let orig = rec.ttl() as u64;
        let new_ttl = orig.saturating_sub(elapsed_secs).max(1) as u32;
        rec.set_ttl(new_ttl);
    };
    for rec in msg.answers_mut() {
        rewrite(rec);
    }
    for rec in msg.name_servers_mut() {
        rewrite(rec);
    }
    for rec in msg.additionals_mut() {
        rewrite(rec);
    }
    msg.to_bytes().ok().map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;
    use std::time::Duration;

    fn sample_response(ttl: u32) -> Message {
        let mut msg = Message::new();
        msg.set_id(0);
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);
        msg.set_response_code(ResponseCode::NoError);
        let name = Name::from_str("example.com.").unwrap();
        msg.add_query(Query::query(name.clone(), RecordType::A));
        let mut record = Record::from_rdata(name, ttl, RData::A(A::new(1, 2, 3, 4)));
        record.set_dns_class(hickory_proto::op::DNSClass::IN);
        msg.add_answer(record);
        msg
    }

    #[test]
    fn store_then_get_round_trips_and_decays_ttl() {
        let cache = ResponseCache::new(1024, 4);
        let msg = sample_response(300);
        let now = SystemTime::now();
        cache.store("key1", &msg, now, now + Duration::from_secs(300));

        let got = cache.get("key1", false).expect("cache hit");
        let parsed = Message::from_bytes(&got).unwrap();
        assert_eq!(parsed.answers()[0].ttl(), 300);
    }

    #[test]
    fn store_rejects_empty_answers() {
        let cache = ResponseCache::new(1024, 4);
        let mut msg = sample_response(300);
        msg.take_answers();
        let now = SystemTime::now();
        cache.store("key2", &msg, now, now + Duration::from_secs(300));
        assert!(cache.get("key2", true).is_none());
    }

    #[test]
    fn expired_entry_hidden_unless_allow_expired() {
        let cache = ResponseCache::new(1024, 4);
        let msg = sample_response(10);
        let now = SystemTime::now() - Duration::from_secs(100);
        cache.store("key3", &msg, now, now + Duration::from_secs(10));
        assert!(cache.get("key3", false).is_none());
        assert!(cache.get("key3", true).is_some());
    }

    #[test]
    fn single_flight_refresh_gate_is_exclusive() {
        let cache = ResponseCache::new(1024, 4);
        assert!(cache.try_begin_refresh("k"));
        assert!(!cache.try_begin_refresh("k"));
        cache.end_refresh("k");
        assert!(cache.try_begin_refresh("k"));
    }

    #[test]
    fn get_with_staleness_flags_expired_hits() {
        let cache = ResponseCache::new(1024, 4);
        let fresh_msg = sample_response(300);
        let now = SystemTime::now();
        cache.store("fresh", &fresh_msg, now, now + Duration::from_secs(300));
        let (_, stale) = cache.get_with_staleness("fresh", false).expect("fresh hit");
        assert!(!stale);

        let stale_msg = sample_response(10);
        let past = SystemTime::now() - Duration::from_secs(100);
        cache.store("stale", &stale_msg, past, past + Duration::from_secs(10));
        assert!(cache.get_with_staleness("stale", false).is_none());
        let (_, stale) = cache.get_with_staleness("stale", true).expect("stale hit allowed");
        assert!(stale);
    }

    #[test]
    fn lazy_entry_goes_stale_at_min_ttl_not_at_lazy_expiry() {
        // record TTL=60, lazy hard expiry=86400s, sampled at t=120: past the
        // record's own deadline but nowhere near the lazy one.
        let cache = ResponseCache::new(1024, 4);
        let msg = sample_response(60);
        let stored_at = SystemTime::now() - Duration::from_secs(120);
        cache.store("lazy", &msg, stored_at, stored_at + Duration::from_secs(86_400));

        let (_, stale) = cache
            .get_with_staleness("lazy", false)
            .expect("still within hard expiry, so this is a hit");
        assert!(stale, "hit past the min-TTL deadline must be flagged stale");
    }

    #[test]
    fn fingerprint_ignores_transaction_id() {
        let mut a = sample_response(300);
        a.set_id(111);
        let mut b = sample_response(300);
        b.set_id(222);
        assert_eq!(
            ResponseCache::fingerprint(&a, "branch"),
            ResponseCache::fingerprint(&b, "branch")
        );
    }
}
