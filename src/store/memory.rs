/// Single-process store implementations
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use log::debug;
use pingora_memory_cache::MemoryCache;
use std::sync::Arc;
use std::time::Duration;

use super::{CacheStore, CounterStore, StoreError};
use crate::clock::Clock;

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at_ms: u64,
}

/// Concurrent counter table. Increments on one key hold the shard lock for
/// the read-modify-write, so they are linearizable.
pub struct MemoryCounterStore {
    windows: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    /// Increment synchronously; shared with the rate limiter's local fallback
    pub fn incr_now(&self, key: &str, ttl: Duration) -> u64 {
        let now = self.clock.now_millis();
        let expires_at_ms = now + ttl.as_millis() as u64;

        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert(CounterEntry {
                count: 0,
                expires_at_ms,
            });

        if entry.expires_at_ms <= now {
            entry.count = 0;
            entry.expires_at_ms = expires_at_ms;
        }
        entry.count += 1;
        entry.count
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        Ok(self.incr_now(key, ttl))
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now_millis();
        Ok(self
            .windows
            .get(key)
            .filter(|entry| entry.expires_at_ms > now)
            .map(|entry| entry.count))
    }

    fn purge_expired(&self) {
        let now = self.clock.now_millis();
        let before = self.windows.len();
        self.windows.retain(|_, entry| entry.expires_at_ms > now);
        let purged = before.saturating_sub(self.windows.len());
        if purged > 0 {
            debug!("Purged {} expired rate limit windows", purged);
        }
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Bytes,
    expires_at_ms: u64,
}

/// Bounded in-memory cache using pingora's TinyUFO eviction.
///
/// Expiry is checked against the injected clock as well as the cache's own
/// TTL so that entries are never returned past their deadline.
pub struct MemoryCacheStore {
    cache: MemoryCache<String, StoredValue>,
    clock: Arc<dyn Clock>,
}

impl MemoryCacheStore {
    pub fn new(max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: MemoryCache::new(max_entries.max(1)),
            clock,
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let key = key.to_string();
        let (value, _status) = self.cache.get(&key);
        let now = self.clock.now_millis();

        Ok(value
            .filter(|stored| stored.expires_at_ms > now)
            .map(|stored| stored.bytes))
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        let stored = StoredValue {
            bytes: value,
            expires_at_ms: self.clock.now_millis() + ttl.as_millis() as u64,
        };
        self.cache.put(&key.to_string(), stored, Some(ttl));
        Ok(())
    }
}
