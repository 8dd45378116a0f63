//! Redis-backed store.
//!
//! Follows the multiplexed-connection pattern: the connection is cheap to
//! clone and safe to use concurrently, so every operation clones it instead
//! of locking.

use super::{LocationStore, StoreError};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tracing::error;

const SCAN_COUNT: usize = 100;

#[derive(Clone)]
pub struct RedisLocationStore {
    connection: MultiplexedConnection,
}

impl RedisLocationStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the client cannot be opened or connected.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do not log the URL, it may carry credentials.
            error!(target: "location.redis", error = %e, "Failed to open Redis client");
            StoreError(format!("Failed to open Redis client: {e}"))
        })?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "location.redis", error = %e, "Failed to connect to Redis");
                StoreError(format!("Failed to connect to Redis: {e}"))
            })?;
        Ok(Self { connection })
    }

    #[must_use]
    pub fn from_connection(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }
}

/// Escape glob metacharacters so ids match literally in `SCAN MATCH`.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl LocationStore for RedisLocationStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .set_ex(key, value, ttl_secs(ttl))
            .await
            .map_err(|e| StoreError(format!("SET failed: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        conn.get(key)
            .await
            .map_err(|e| StoreError(format!("GET failed: {e}")))
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn
            .del(key)
            .await
            .map_err(|e| StoreError(format!("DEL failed: {e}")))?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let seconds = i64::try_from(ttl_secs(ttl)).unwrap_or(i64::MAX);
        conn.expire(key, seconds)
            .await
            .map_err(|e| StoreError(format!("EXPIRE failed: {e}")))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", escape_glob(prefix));

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError(format!("SCAN failed: {e}")))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
