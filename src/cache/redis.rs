use anyhow::{Context, Result};
use bytes::Bytes;
use rand::Rng;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

const MAX_BACKOFF: Duration = Duration::from_secs(30);
const BASE_BACKOFF: Duration = Duration::from_millis(200);

/// Redis-backed response cache, an alternative to the in-process sharded
/// LRU for deployments sharing a cache across multiple forwarder
/// instances. Value layout: `BE64(stored_at) || BE64(expires_at) ||
/// wire-format-message`.
pub struct RedisCache {
    client: redis::Client,
    conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
    disabled_until: AtomicU64, // unix seconds; 0 means not disabled
    failing: AtomicBool,
}

impl RedisCache {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("parse redis url")?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            disabled_until: AtomicU64::new(0),
            failing: AtomicBool::new(false),
        })
    }

    fn now_unix() -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    fn is_disabled(&self) -> bool {
        Self::now_unix() < self.disabled_until.load(Ordering::Relaxed)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .context("connect to redis")?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    fn record_failure(&self) {
        let was_failing = self.failing.swap(true, Ordering::Relaxed);
        let backoff = if was_failing {
            let mut rng = rand::thread_rng();
            let jitter_ms = rng.gen_range(0..BASE_BACKOFF.as_millis() as u64);
            (BASE_BACKOFF + Duration::from_millis(jitter_ms)).min(MAX_BACKOFF)
        } else {
            BASE_BACKOFF
        };
        self.disabled_until
            .store(Self::now_unix() + backoff.as_secs().max(1), Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.failing.store(false, Ordering::Relaxed);
        self.disabled_until.store(0, Ordering::Relaxed);
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        if self.is_disabled() {
            return None;
        }
        let mut conn = match self.connection().await {
            Ok(c) => c,
            Err(_) => {
                self.record_failure();
                return None;
            }
        };
        let raw: Option<Vec<u8>> = match conn.get(key).await {
            Ok(v) => v,
            Err(_) => {
                self.record_failure();
                return None;
            }
        };
        self.record_success();
        let raw = raw?;
        decode_payload(&raw)
    }

    pub async fn set(&self, key: &str, stored_at: SystemTime, expires_at: SystemTime, wire: &[u8]) {
        if self.is_disabled() {
            return;
        }
        let ttl = match expires_at.duration_since(SystemTime::now()) {
            Ok(d) if d.as_secs() > 0 => d.as_secs(),
            _ => return,
        };
        let stored_secs = stored_at
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let expires_secs = expires_at
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut payload = Vec::with_capacity(16 + wire.len());
        payload.extend_from_slice(&stored_secs.to_be_bytes());
        payload.extend_from_slice(&expires_secs.to_be_bytes());
        payload.extend_from_slice(wire);

        let mut conn = match self.connection().await {
            Ok(c) => c,
            Err(_) => {
                self.record_failure();
                return;
            }
        };
        let result: redis::RedisResult<()> = conn.set_ex(key, payload, ttl as usize).await;
        match result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
    }
}

/// Decodes a stored `BE64(stored_at) || BE64(expires_at) || wire` payload,
/// rewriting the wire message's TTLs for the time elapsed since it was
/// stored. The key's own Redis TTL already enforces hard expiry, so unlike
/// the in-memory cache this never needs to report staleness.
fn decode_payload(raw: &[u8]) -> Option<Bytes> {
    if raw.len() < 16 {
        return None;
    }
    let stored_secs = u64::from_be_bytes(raw[0..8].try_into().ok()?);
    let stored_at = SystemTime::UNIX_EPOCH + Duration::from_secs(stored_secs);
    let elapsed = SystemTime::now().duration_since(stored_at).unwrap_or_default().as_secs();
    crate::cache::rewrite_ttl(&Bytes::from(raw[16..].to_vec()), elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
    use std::str::FromStr;

    #[test]
    fn payload_layout_round_trips_timestamps() {
        let stored: u64 = 1_000_000;
        let expires: u64 = 1_000_300;
        let wire = b"wire-bytes";
        let mut payload = Vec::new();
        payload.extend_from_slice(&stored.to_be_bytes());
        payload.extend_from_slice(&expires.to_be_bytes());
        payload.extend_from_slice(wire);

        assert_eq!(&payload[0..8], &stored.to_be_bytes());
        assert_eq!(&payload[8..16], &expires.to_be_bytes());
        assert_eq!(&payload[16..], wire);
    }

    #[test]
    fn decode_payload_rewrites_ttl_for_elapsed_time() {
        let mut msg = Message::new();
        msg.set_id(0);
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);
        msg.set_response_code(ResponseCode::NoError);
        let name = Name::from_str("example.com.").unwrap();
        msg.add_query(Query::query(name.clone(), RecordType::A));
        let mut record = Record::from_rdata(name, 300, RData::A(A::new(1, 2, 3, 4)));
        record.set_dns_class(hickory_proto::op::DNSClass::IN);
        msg.add_answer(record);
        let wire = msg.to_bytes().unwrap();

        let stored_secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            - 120;
        let mut payload = Vec::with_capacity(16 + wire.len());
        payload.extend_from_slice(&stored_secs.to_be_bytes());
        payload.extend_from_slice(&(stored_secs + 300).to_be_bytes());
        payload.extend_from_slice(&wire);

        let decoded = decode_payload(&payload).expect("payload decodes");
        let parsed = Message::from_bytes(&decoded).unwrap();
        let ttl = parsed.answers()[0].ttl();
        assert!(ttl <= 180 && ttl >= 170, "expected ~180s remaining, got {ttl}");
    }

    #[test]
    fn backoff_is_capped_at_30s() {
        let cache = RedisCache::new("redis://127.0.0.1:0").unwrap();
        for _ in 0..20 {
            cache.record_failure();
        }
        let now = RedisCache::now_unix();
        let disabled_until = cache.disabled_until.load(Ordering::Relaxed);
        assert!(disabled_until <= now + MAX_BACKOFF.as_secs() + 1);
    }
}
