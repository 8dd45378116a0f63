//! Storage behind the registry.
//!
//! Records are keyed by node id. A backend stores them under leases and
//! streams changes to watchers.

mod memory;
mod redis;

pub use self::memory::MemoryDiscovery;
pub use self::redis::RedisDiscovery;

use crate::error::RegistryError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// A change to a registered record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Record created or updated.
    Put { key: String, value: String },
    /// Record deleted or its lease expired.
    Delete { key: String },
}

impl WatchEvent {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key,
        }
    }
}

#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Write a record that disappears unless re-put within `ttl`.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RegistryError>;

    /// Remove a record.
    async fn delete(&self, key: &str) -> Result<(), RegistryError>;

    /// All live records whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, RegistryError>;

    /// Stream changes to records whose key starts with `prefix`. Dropping
    /// the receiver stops the watch.
    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, RegistryError>;
}
