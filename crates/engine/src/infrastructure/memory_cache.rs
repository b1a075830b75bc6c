//! In-process TTL cache backend.
//!
//! Default [`CacheStorePort`] implementation for single-node deployments and
//! tests. Entries carry their own TTL; expired entries are dropped lazily on
//! access and in bulk via `cleanup_expired()`, which a long-running host
//! should call periodically to bound memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::ports::{CacheError, CacheStorePort, ClockPort};

struct CacheEntry {
    value: String,
    inserted_at: DateTime<Utc>,
    ttl: Duration,
}

impl CacheEntry {
    fn expired_at(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now - self.inserted_at >= ttl,
            Err(_) => false,
        }
    }
}

/// Thread-safe in-memory cache with per-entry time-to-live.
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    clock: Arc<dyn ClockPort>,
    evictions: AtomicU64,
}

impl MemoryCacheStore {
    pub fn new(clock: Arc<dyn ClockPort>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            evictions: AtomicU64::new(0),
        }
    }

    /// Remove all expired entries and return the count of removed entries.
    pub async fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut guard = self.entries.write().await;
        let before_count = guard.len();
        guard.retain(|_, entry| !entry.expired_at(now));
        let removed = before_count - guard.len();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Current number of entries, expired ones not yet cleaned included.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStorePort for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = self.clock.now();
        {
            let guard = self.entries.read().await;
            match guard.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.expired_at(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        // Expired: drop it under the write lock, re-checking in case a
        // concurrent put replaced the entry in between.
        let mut guard = self.entries.write().await;
        if guard.get(key).map(|e| e.expired_at(now)).unwrap_or(false) {
            guard.remove(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let entry = CacheEntry {
            value,
            inserted_at: self.clock.now(),
            ttl,
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut guard = self.entries.write().await;
        let before_count = guard.len();
        guard.retain(|key, _| !key.starts_with(prefix));
        Ok((before_count - guard.len()) as u64)
    }

    async fn count_by_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let now = self.clock.now();
        let guard = self.entries.read().await;
        let count = guard
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.expired_at(now))
            .count();
        Ok(count as u64)
    }

    async fn eviction_count(&self) -> Result<u64, CacheError> {
        Ok(self.evictions.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Clock whose current time is advanced by hand.
    struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Utc::now()),
            })
        }

        fn advance(&self, by: Duration) {
            let mut guard = self.now.lock().expect("clock lock");
            *guard += chrono::Duration::from_std(by).expect("duration in range");
        }
    }

    impl ClockPort for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().expect("clock lock")
        }
    }

    fn ttl(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn put_and_get() {
        let cache = MemoryCacheStore::new(ManualClock::new());
        cache.put("k", "v".to_string(), ttl(60)).await.expect("put");
        assert_eq!(cache.get("k").await.expect("get"), Some("v".to_string()));
    }

    #[tokio::test]
    async fn get_returns_none_for_missing() {
        let cache = MemoryCacheStore::new(ManualClock::new());
        assert_eq!(cache.get("missing").await.expect("get"), None);
    }

    #[tokio::test]
    async fn entry_expires_after_ttl() {
        let clock = ManualClock::new();
        let cache = MemoryCacheStore::new(clock.clone());
        cache.put("k", "v".to_string(), ttl(300)).await.expect("put");

        clock.advance(ttl(299));
        assert_eq!(cache.get("k").await.expect("get"), Some("v".to_string()));

        // At t+301s the entry is a miss, independent of any invalidation.
        clock.advance(ttl(2));
        assert_eq!(cache.get("k").await.expect("get"), None);
        assert_eq!(cache.eviction_count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn put_resets_ttl() {
        let clock = ManualClock::new();
        let cache = MemoryCacheStore::new(clock.clone());
        cache.put("k", "v1".to_string(), ttl(10)).await.expect("put");
        clock.advance(ttl(8));
        cache.put("k", "v2".to_string(), ttl(10)).await.expect("put");
        clock.advance(ttl(8));
        assert_eq!(cache.get("k").await.expect("get"), Some("v2".to_string()));
    }

    #[tokio::test]
    async fn delete_absent_key_is_noop() {
        let cache = MemoryCacheStore::new(ManualClock::new());
        cache.delete("absent").await.expect("delete");
    }

    #[tokio::test]
    async fn delete_by_prefix_removes_matching_keys() {
        let cache = MemoryCacheStore::new(ManualClock::new());
        cache
            .put("lf:settlement:42:b1:pop", "1".to_string(), ttl(60))
            .await
            .expect("put");
        cache
            .put("lf:settlement:42:b1:defense", "2".to_string(), ttl(60))
            .await
            .expect("put");
        cache
            .put("lf:structure:7:b1:bonus", "3".to_string(), ttl(60))
            .await
            .expect("put");

        let removed = cache
            .delete_by_prefix("lf:settlement:42:")
            .await
            .expect("delete");
        assert_eq!(removed, 2);
        assert_eq!(cache.get("lf:settlement:42:b1:pop").await.expect("get"), None);
        assert_eq!(
            cache.get("lf:structure:7:b1:bonus").await.expect("get"),
            Some("3".to_string())
        );
    }

    #[tokio::test]
    async fn count_by_prefix_skips_expired() {
        let clock = ManualClock::new();
        let cache = MemoryCacheStore::new(clock.clone());
        cache.put("p:a", "1".to_string(), ttl(10)).await.expect("put");
        cache.put("p:b", "2".to_string(), ttl(600)).await.expect("put");
        cache.put("q:c", "3".to_string(), ttl(600)).await.expect("put");

        clock.advance(ttl(11));
        assert_eq!(cache.count_by_prefix("p:").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn cleanup_removes_expired_and_counts_evictions() {
        let clock = ManualClock::new();
        let cache = MemoryCacheStore::new(clock.clone());
        cache.put("a", "1".to_string(), ttl(10)).await.expect("put");
        cache.put("b", "2".to_string(), ttl(10)).await.expect("put");
        cache.put("c", "3".to_string(), ttl(600)).await.expect("put");

        clock.advance(ttl(11));
        let removed = cache.cleanup_expired().await;
        assert_eq!(removed, 2);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.eviction_count().await.expect("count"), 2);
    }
}
