//! Publishing this process's own node record.

use crate::backend::DiscoveryBackend;
use crate::error::RegistryError;
use crate::node::Node;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared load metric, reported on every lease refresh.
#[derive(Debug, Clone, Default)]
pub struct LoadGauge(Arc<AtomicU64>);

impl LoadGauge {
    pub fn set(&self, load: u64) {
        self.0.store(load, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A leased node record kept alive by a refresh task.
pub struct NodeRegistration {
    backend: Arc<dyn DiscoveryBackend>,
    node: Node,
    ttl: Duration,
    load: LoadGauge,
}

impl NodeRegistration {
    pub fn new(backend: Arc<dyn DiscoveryBackend>, node: Node, ttl: Duration) -> Self {
        let load = LoadGauge::default();
        load.set(node.load_value().unwrap_or_default());
        Self {
            backend,
            node,
            ttl,
            load,
        }
    }

    #[must_use]
    pub fn node(&self) -> &Node {
        &self.node
    }

    #[must_use]
    pub fn load_gauge(&self) -> LoadGauge {
        self.load.clone()
    }

    /// Interval between lease refreshes.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        (self.ttl / 3).max(Duration::from_millis(100))
    }

    /// Write (or rewrite) the record with the current load.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    pub async fn register(&self) -> Result<(), RegistryError> {
        let record = self.node.clone().with_load(self.load.get());
        self.backend
            .put(&record.node_id, &record.encode()?, self.ttl)
            .await
    }

    /// Refresh the lease and load until cancelled.
    pub fn spawn_keepalive(self: &Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        let registration = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registration.refresh_interval());
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        info!(target: "registry.registration", node_id = %registration.node.node_id, "Lease refresh stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = registration.register().await {
                            warn!(target: "registry.registration", node_id = %registration.node.node_id, error = %e, "Lease refresh failed");
                        }
                    }
                }
            }
        })
    }

    /// Remove the record on graceful shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend delete fails.
    pub async fn deregister(&self) -> Result<(), RegistryError> {
        self.backend.delete(&self.node.node_id).await
    }
}
