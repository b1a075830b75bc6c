// Port traits define the full contract - many methods are for future use
#![allow(dead_code)]

//! Cache store port.
//!
//! The concrete backend (a distributed key-value store in production, the
//! in-process [`MemoryCacheStore`](crate::infrastructure::MemoryCacheStore)
//! in tests and single-node deployments) sits behind this trait. The cache
//! is a pure accelerator: every operation may fail, and the engine must
//! treat any failure as a miss, never as a user-visible error.

use std::time::Duration;

use async_trait::async_trait;

use super::error::CacheError;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheStorePort: Send + Sync {
    /// Fetch a value. `Ok(None)` is a miss.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store a value with a time-to-live. Entries are never mutated in
    /// place; a put replaces the whole entry and resets the TTL.
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Delete one key. Deleting an absent key is a no-op, not an error -
    /// invalidation must be idempotent.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Delete every key starting with `prefix`; returns how many were
    /// removed. Used for cascading invalidation of whole hierarchies.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, CacheError>;

    /// Count live (unexpired) keys starting with `prefix`. Monitoring only.
    async fn count_by_prefix(&self, prefix: &str) -> Result<u64, CacheError>;

    /// Total entries removed by TTL expiry since the backend started.
    async fn eviction_count(&self) -> Result<u64, CacheError>;
}
