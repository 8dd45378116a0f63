//! In-process discovery backend with lease expiry.

use super::{DiscoveryBackend, WatchEvent};
use crate::error::RegistryError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EVENT_BUFFER: usize = 1024;

struct Lease {
    value: String,
    deadline: Instant,
}

/// Discovery backend that lives in process memory.
///
/// Leases are enforced by [`MemoryDiscovery::reap_expired`], which
/// [`MemoryDiscovery::spawn_reaper`] runs periodically.
pub struct MemoryDiscovery {
    leases: Mutex<HashMap<String, Lease>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDiscovery {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            leases: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Drop every record whose lease ran out and announce the deletions.
    /// Returns how many records expired.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut leases = self.leases.lock();
            let keys: Vec<String> = leases
                .iter()
                .filter(|(_, lease)| lease.deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                leases.remove(key);
            }
            keys
        };

        for key in &expired {
            debug!(target: "registry.memory", key = %key, "Lease expired");
            let _ = self.events.send(WatchEvent::Delete { key: key.clone() });
        }
        expired.len()
    }

    /// Run [`Self::reap_expired`] every `interval` until cancelled.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let backend = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    _ = ticker.tick() => {
                        backend.reap_expired();
                    }
                }
            }
        })
    }
}

#[async_trait]
impl DiscoveryBackend for MemoryDiscovery {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RegistryError> {
        self.leases.lock().insert(
            key.to_string(),
            Lease {
                value: value.to_string(),
                deadline: Instant::now() + ttl,
            },
        );
        let _ = self.events.send(WatchEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RegistryError> {
        if self.leases.lock().remove(key).is_some() {
            let _ = self.events.send(WatchEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, RegistryError> {
        let now = Instant::now();
        let mut records: Vec<(String, String)> = self
            .leases
            .lock()
            .iter()
            .filter(|(key, lease)| key.starts_with(prefix) && lease.deadline > now)
            .map(|(key, lease)| (key.clone(), lease.value.clone()))
            .collect();
        records.sort();
        Ok(records)
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::Receiver<WatchEvent>, RegistryError> {
        let mut events = self.events.subscribe();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    received = events.recv() => match received {
                        Ok(event) => {
                            if event.key().starts_with(&prefix) && tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(target: "registry.memory", missed = missed, "Watcher lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(rx)
    }
}
