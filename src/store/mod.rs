//! Shared state stores used by the rate limiter and the response cache.
//!
//! Both stores expose atomic primitives only (increment-and-read, get, put)
//! so the in-memory tables and a remote Redis instance are interchangeable
//! without changing pipeline logic.

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::{MemoryCacheStore, MemoryCounterStore};
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Failures of a backing store. All of them are recovered by the caller.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("stored value could not be decoded: {0}")]
    Codec(String),
}

/// Atomic counters with expiry, keyed by rate-limit window
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and return the post-increment count. A missing or
    /// expired key starts at zero and lives for `ttl`.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Current count for `key`, if it exists and has not expired
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Drop expired entries; remote stores expire keys themselves
    fn purge_expired(&self) {}
}

/// Byte values with expiry, keyed by canonical request signature
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Store `value` under `key`; the last writer wins
    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;
}

/// Bound a store round-trip, mapping an elapsed deadline to `StoreError::Timeout`
pub async fn with_timeout<T, F>(limit: Duration, operation: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
