//! TTL-keyed string store behind the registry.

mod memory;
mod redis;

pub use self::memory::MemoryLocationStore;
pub use self::redis::RedisLocationStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Write `value` under `key`, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete `key`. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Reset the TTL of `key`. Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// All live keys starting with `prefix`, sorted.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
