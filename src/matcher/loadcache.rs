use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Process-wide cache for decoded matcher-list blobs (text lists, decoded
/// GeoSite/GeoIP protobuf tables), namespaced by file path so repeated
/// config reloads referencing the same list don't re-decode it every time.
const TTL: Duration = Duration::from_secs(15);

struct Entry {
    loaded_at: Instant,
    data: std::sync::Arc<dyn std::any::Any + Send + Sync>,
}

static CACHE: OnceLock<Mutex<HashMap<String, Entry>>> = OnceLock::new();

fn store() -> &'static Mutex<HashMap<String, Entry>> {
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns a cached value for `key` if present and younger than 15s.
pub fn get<T: Send + Sync + 'static>(key: &str) -> Option<std::sync::Arc<T>> {
    let guard = store().lock().unwrap();
    let entry = guard.get(key)?;
    if entry.loaded_at.elapsed() > TTL {
        return None;
    }
    entry.data.clone().downcast::<T>().ok()
}

pub fn put<T: Send + Sync + 'static>(key: &str, value: std::sync::Arc<T>) {
    let mut guard = store().lock().unwrap();
    guard.insert(
        key.to_string(),
        Entry {
            loaded_at: Instant::now(),
            data: value,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let key = "test-namespace::file.dat";
        put(key, std::sync::Arc::new(vec![1u8, 2, 3]));
        let got: Option<std::sync::Arc<Vec<u8>>> = get(key);
        assert_eq!(got.as_deref(), Some(&vec![1u8, 2, 3]));
    }

    #[test]
    fn missing_key_returns_none() {
        let got: Option<std::sync::Arc<Vec<u8>>> = get("never-stored-key");
        assert!(got.is_none());
    }
}
