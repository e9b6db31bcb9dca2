//! Redis-backed window state store.
//!
//! Production deployments keep window/session tracking in Redis so it
//! survives process restarts and is shared across workers. One multiplexed
//! connection serves all operations; failures map to `StoreError` and are
//! degraded by the `WindowStateStore` layer, which is why no additional
//! protection is layered here.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;

use crate::stores::{StateStore, StoreError};

/// `StateStore` over a Redis connection.
#[derive(Clone)]
pub struct RedisStateStore {
    conn: MultiplexedConnection,
}

impl RedisStateStore {
    /// Connect to the given Redis URL.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(format!("redis connect failed: {e}")))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(|e| StoreError::Unavailable(format!("redis GET failed: {e}")))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs());
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(format!("redis SET failed: {e}")))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| StoreError::Unavailable(format!("redis DEL failed: {e}")))
    }
}
