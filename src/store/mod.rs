//! Process-wide TTL key/value store shared by the response cache and session subsystems.
//!
//! Not part of the host proxy's original architecture - grounded on the `moka`-backed cache
//! manager pattern used for HTTP response caching, adapted to a synchronous API (store reads
//! and writes happen inline inside pipeline filter callbacks, which never `.await`).

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use moka::sync::Cache;
use moka::Expiry;
use once_cell::sync::Lazy;

/// A blob plus the metadata needed to serve conditional-GET responses and drive expiry.
#[derive(Clone)]
struct Entry {
    value: Bytes,
    modified: SystemTime,
    lifespan: Duration,
}

struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.lifespan)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.lifespan)
    }
}

/// A process-wide key/value store with per-entry TTL.
///
/// Store read errors are never surfaced as a distinct error type to callers - a failed read
/// degrades to a cache miss, which the cache and session subsystems already treat as a valid
/// steady state.
pub trait TtlStore: Send + Sync {
    /// Reads a value and its last-modified time, or `None` on a miss.
    fn read(&self, key: &str) -> Option<(Bytes, SystemTime)>;

    /// Writes a value with the given last-modified time and lifespan, overwriting any
    /// existing entry for the same key.
    fn write(&self, key: String, value: Bytes, modified: SystemTime, lifespan: Duration);

    /// Removes an entry. Returns `true` if an entry was present.
    fn remove(&self, key: &str) -> bool;
}

/// `TtlStore` backed by `moka::sync::Cache` with a per-entry expiry policy.
pub struct MokaTtlStore {
    cache: Cache<String, Entry>,
}

impl MokaTtlStore {
    /// Creates a store with the given maximum entry count.
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryExpiry)
            .build();
        Self { cache }
    }
}

impl Default for MokaTtlStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl TtlStore for MokaTtlStore {
    fn read(&self, key: &str) -> Option<(Bytes, SystemTime)> {
        self.cache.get(key).map(|e| (e.value, e.modified))
    }

    fn write(&self, key: String, value: Bytes, modified: SystemTime, lifespan: Duration) {
        self.cache.insert(
            key,
            Entry {
                value,
                modified,
                lifespan,
            },
        );
    }

    fn remove(&self, key: &str) -> bool {
        self.cache.remove(key).is_some()
    }
}

/// Process-wide response-cache body store.
static RESPONSE_STORE: Lazy<Arc<dyn TtlStore>> = Lazy::new(|| Arc::new(MokaTtlStore::new(10_000)));
/// Process-wide session variable store, kept separate from the response cache so a burst of
/// new sessions cannot evict hot response-cache entries, and vice versa.
static SESSION_STORE: Lazy<Arc<dyn TtlStore>> = Lazy::new(|| Arc::new(MokaTtlStore::new(50_000)));

pub fn response_store() -> Arc<dyn TtlStore> {
    RESPONSE_STORE.clone()
}

pub fn session_store() -> Arc<dyn TtlStore> {
    SESSION_STORE.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_write() {
        let store = MokaTtlStore::new(16);
        let now = SystemTime::now();
        store.write(
            "k".to_string(),
            Bytes::from_static(b"hello"),
            now,
            Duration::from_secs(60),
        );

        let (value, modified) = store.read("k").expect("entry should be present");
        assert_eq!(value, Bytes::from_static(b"hello"));
        assert_eq!(modified, now);
    }

    #[test]
    fn missing_key_is_none() {
        let store = MokaTtlStore::new(16);
        assert!(store.read("missing").is_none());
    }

    #[test]
    fn remove_reports_whether_an_entry_existed() {
        let store = MokaTtlStore::new(16);
        store.write(
            "k".to_string(),
            Bytes::from_static(b"v"),
            SystemTime::now(),
            Duration::from_secs(60),
        );
        assert!(store.remove("k"));
        assert!(!store.remove("k"));
    }

    #[test]
    fn overwrite_replaces_value_and_modified() {
        let store = MokaTtlStore::new(16);
        let t1 = SystemTime::now();
        store.write(
            "k".to_string(),
            Bytes::from_static(b"old"),
            t1,
            Duration::from_secs(60),
        );
        let t2 = t1 + Duration::from_secs(5);
        store.write(
            "k".to_string(),
            Bytes::from_static(b"new"),
            t2,
            Duration::from_secs(60),
        );

        let (value, modified) = store.read("k").unwrap();
        assert_eq!(value, Bytes::from_static(b"new"));
        assert_eq!(modified, t2);
    }
}
