//! Key-value store abstraction for shared pipeline state.
//!
//! Session snapshots, rate windows, and penalty records all live
//! behind this trait so the in-memory store used here can be swapped
//! for a shared store without touching the callers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};

/// Get/put-with-TTL contract consumed by the session manager and the
/// rate limiter.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn put_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration);
    async fn delete(&self, key: &str);
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-memory store with lazy TTL expiry.
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn put_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        // Opportunistic prune so long-lived stores do not accumulate
        // expired entries between reads.
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    async fn delete(&self, key: &str) {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryKvStore::new();
        store
            .put_with_ttl("session:abc", b"state".to_vec(), Duration::from_secs(60))
            .await;
        assert_eq!(store.get("session:abc").await, Some(b"state".to_vec()));
        assert_eq!(store.get("session:missing").await, None);
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let clock = Arc::new(MockClock::new());
        let store = MemoryKvStore::with_clock(clock.clone());

        store
            .put_with_ttl("key", b"value".to_vec(), Duration::from_secs(30))
            .await;
        assert!(store.get("key").await.is_some());

        clock.advance(Duration::from_secs(31));
        assert_eq!(store.get("key").await, None);
    }

    #[tokio::test]
    async fn test_delete_removes_entry() {
        let store = MemoryKvStore::new();
        store
            .put_with_ttl("key", b"value".to_vec(), Duration::from_secs(30))
            .await;
        store.delete("key").await;
        assert_eq!(store.get("key").await, None);
    }

    #[tokio::test]
    async fn test_overwrite_refreshes_ttl() {
        let clock = Arc::new(MockClock::new());
        let store = MemoryKvStore::with_clock(clock.clone());

        store
            .put_with_ttl("key", b"one".to_vec(), Duration::from_secs(10))
            .await;
        clock.advance(Duration::from_secs(8));
        store
            .put_with_ttl("key", b"two".to_vec(), Duration::from_secs(10))
            .await;
        clock.advance(Duration::from_secs(8));

        assert_eq!(store.get("key").await, Some(b"two".to_vec()));
    }
}
