/// Redis-backed counter and cache store for multi-instance deployments
use async_trait::async_trait;
use bytes::Bytes;
use log::info;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;

use super::{CacheStore, CounterStore, StoreError};

/// One multiplexed connection shared by every request
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    prefix: String,
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl RedisStore {
    /// Connect to the given `redis://` URL
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis store at {}", url);

        Ok(Self {
            conn,
            prefix: "prism:".to_string(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

// Redis expiries have one-second granularity
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let key = self.key(key);
        let mut conn = self.conn.clone();

        // INCR and EXPIRE in one MULTI so a key can never be left without a TTL
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(&key, 1u64)
            .expire(&key, ttl_secs(ttl) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = conn.get(self.key(key)).await?;
        Ok(count)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(self.key(key)).await?;
        Ok(value.map(Bytes::from))
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.key(key), value.to_vec(), ttl_secs(ttl))
            .await?;
        Ok(())
    }
}
