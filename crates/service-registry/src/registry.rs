//! Local cache of registered nodes and the watch loop that feeds it.

use crate::backend::{DiscoveryBackend, WatchEvent};
use crate::error::RegistryError;
use crate::node::{Node, NodeState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Node cache keyed by node id.
///
/// All reads and writes go through one mutex, so a lookup never observes a
/// half-applied update.
pub struct ServiceRegistry {
    backend: Arc<dyn DiscoveryBackend>,
    nodes: Mutex<HashMap<String, Node>>,
}

impl ServiceRegistry {
    pub fn new(backend: Arc<dyn DiscoveryBackend>) -> Self {
        Self {
            backend,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn DiscoveryBackend> {
        &self.backend
    }

    /// All cached nodes of a service, keyed by node id.
    #[must_use]
    pub fn lookup(&self, service: &str) -> HashMap<String, Node> {
        self.nodes
            .lock()
            .values()
            .filter(|node| node.service == service)
            .map(|node| (node.node_id.clone(), node.clone()))
            .collect()
    }

    #[must_use]
    pub fn lookup_by_id(&self, node_id: &str) -> Option<Node> {
        self.nodes.lock().get(node_id).cloned()
    }

    /// Least-loaded node of `service` in `region`.
    ///
    /// Ties go to the lowest node id. Nodes whose load metric does not parse
    /// are never selected.
    #[must_use]
    pub fn lookup_least_loaded(&self, region: &str, service: &str) -> Option<Node> {
        let nodes = self.nodes.lock();
        nodes
            .values()
            .filter(|node| node.region == region && node.service == service)
            .filter_map(|node| match node.load_value() {
                Some(load) => Some((load, node)),
                None => {
                    warn!(target: "registry.lookup", node_id = %node.node_id, load = %node.load, "Skipping node with unparseable load");
                    None
                }
            })
            .min_by(|(load_a, a), (load_b, b)| {
                load_a.cmp(load_b).then_with(|| a.node_id.cmp(&b.node_id))
            })
            .map(|(_, node)| node.clone())
    }

    /// Drop a node from the cache.
    pub fn unregister(&self, node_id: &str) -> Option<Node> {
        self.nodes.lock().remove(node_id)
    }

    /// Insert or replace a node in the cache.
    pub fn insert(&self, node: Node) {
        self.nodes.lock().insert(node.node_id.clone(), node);
    }

    /// Apply a backend change to the cache. Returns what the watch callback
    /// should see, or `None` for events that are ignored.
    fn apply(&self, event: WatchEvent) -> Option<(NodeState, Node)> {
        match event {
            WatchEvent::Put { key, value } => {
                let node = match Node::decode(&value) {
                    Ok(node) => node,
                    Err(e) => {
                        warn!(target: "registry.watch", key = %key, error = %e, "Ignoring undecodable node record");
                        return None;
                    }
                };
                if node.node_id != key {
                    warn!(target: "registry.watch", key = %key, node_id = %node.node_id, "Ignoring node record stored under a foreign key");
                    return None;
                }
                self.insert(node.clone());
                Some((NodeState::Up, node))
            }
            WatchEvent::Delete { key } => {
                let node = self.unregister(&key);
                if node.is_none() {
                    debug!(target: "registry.watch", key = %key, "Delete for unknown node");
                }
                node.map(|node| (NodeState::Down, node))
            }
        }
    }

    /// Watch nodes whose id starts with `prefix`.
    ///
    /// Every currently registered node is reported `Up` first, then live
    /// changes follow until `cancel_token` fires. The callback runs inline in
    /// the watch loop and must not block.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot start the watch or enumerate
    /// existing records.
    #[instrument(skip_all, fields(prefix = %prefix))]
    pub async fn watch<F>(
        self: &Arc<Self>,
        prefix: &str,
        callback: F,
        cancel_token: CancellationToken,
    ) -> Result<JoinHandle<()>, RegistryError>
    where
        F: Fn(NodeState, &Node) + Send + Sync + 'static,
    {
        // Subscribe before listing so nothing registered in between is lost.
        let mut changes = self.backend.watch(prefix).await?;
        let existing = self.backend.list(prefix).await?;

        for (key, value) in existing {
            if let Some((state, node)) = self.apply(WatchEvent::Put { key, value }) {
                callback(state, &node);
            }
        }
        info!(target: "registry.watch", nodes = self.nodes.lock().len(), "Initial node enumeration complete");

        let registry = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    change = changes.recv() => {
                        let Some(change) = change else {
                            warn!(target: "registry.watch", "Change stream ended");
                            break;
                        };
                        if let Some((state, node)) = registry.apply(change) {
                            debug!(target: "registry.watch", node_id = %node.node_id, service = %node.service, state = ?state, "Node changed");
                            callback(state, &node);
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backend::MemoryDiscovery;
    use crate::node::service;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const TTL: Duration = Duration::from_secs(30);

    fn registry_with(nodes: &[Node]) -> ServiceRegistry {
        let registry = ServiceRegistry::new(Arc::new(MemoryDiscovery::new()));
        for node in nodes {
            registry.insert(node.clone());
        }
        registry
    }

    #[test]
    fn test_least_loaded_picks_minimum() {
        let registry = registry_with(&[
            Node::new("sz", "A", service::RELAY).with_load(5),
            Node::new("sz", "B", service::RELAY).with_load(2),
            Node::new("sz", "C", service::RELAY).with_load(8),
        ]);

        let node = registry.lookup_least_loaded("sz", service::RELAY).unwrap();
        assert_eq!(node.node_id, "B");
    }

    #[test]
    fn test_least_loaded_scopes_region_and_service() {
        let registry = registry_with(&[
            Node::new("bj", "far", service::RELAY).with_load(0),
            Node::new("sz", "coord", service::COORDINATOR).with_load(0),
            Node::new("sz", "near", service::RELAY).with_load(9),
        ]);

        let node = registry.lookup_least_loaded("sz", service::RELAY).unwrap();
        assert_eq!(node.node_id, "near");
        assert!(registry.lookup_least_loaded("sh", service::RELAY).is_none());
    }

    #[test]
    fn test_least_loaded_tie_breaks_on_lowest_id() {
        let registry = registry_with(&[
            Node::new("sz", "relay-c", service::RELAY).with_load(1),
            Node::new("sz", "relay-a", service::RELAY).with_load(1),
            Node::new("sz", "relay-b", service::RELAY).with_load(1),
        ]);

        for _ in 0..5 {
            let node = registry.lookup_least_loaded("sz", service::RELAY).unwrap();
            assert_eq!(node.node_id, "relay-a");
        }
    }

    #[test]
    fn test_least_loaded_skips_garbage_load() {
        let mut broken = Node::new("sz", "broken", service::RELAY);
        broken.load = "lots".to_string();
        let registry = registry_with(&[broken, Node::new("sz", "ok", service::RELAY).with_load(100)]);

        let node = registry.lookup_least_loaded("sz", service::RELAY).unwrap();
        assert_eq!(node.node_id, "ok");
    }

    #[test]
    fn test_lookup_by_service_and_id() {
        let registry = registry_with(&[
            Node::new("sz", "r1", service::RELAY),
            Node::new("sz", "r2", service::RELAY),
            Node::new("sz", "l1", service::LOCATION),
        ]);

        let relays = registry.lookup(service::RELAY);
        assert_eq!(relays.len(), 2);
        assert!(relays.contains_key("r1"));
        assert_eq!(registry.lookup_by_id("l1").unwrap().service, service::LOCATION);

        assert!(registry.unregister("l1").is_some());
        assert!(registry.lookup_by_id("l1").is_none());
    }

    #[tokio::test]
    async fn test_watch_reports_existing_then_live_changes() {
        let backend = Arc::new(MemoryDiscovery::new());
        let existing = Node::new("sz", "r1", service::RELAY);
        backend
            .put("r1", &existing.encode().unwrap(), TTL)
            .await
            .unwrap();

        let registry = Arc::new(ServiceRegistry::new(backend.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = registry
            .watch(
                "",
                move |state, node: &Node| {
                    let _ = tx.send((state, node.node_id.clone()));
                },
                cancel.clone(),
            )
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), (NodeState::Up, "r1".to_string()));

        let joining = Node::new("sz", "r2", service::RELAY).with_load(4);
        backend
            .put("r2", &joining.encode().unwrap(), TTL)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), (NodeState::Up, "r2".to_string()));
        assert_eq!(registry.lookup_by_id("r2").unwrap().load, "4");

        backend.delete("r1").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), (NodeState::Down, "r1".to_string()));
        assert!(registry.lookup_by_id("r1").is_none());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_rejects_record_under_foreign_key() {
        let backend = Arc::new(MemoryDiscovery::new());
        let registry = Arc::new(ServiceRegistry::new(backend.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let _handle = registry
            .watch(
                "",
                move |state, node: &Node| {
                    let _ = tx.send((state, node.node_id.clone()));
                },
                cancel.clone(),
            )
            .await
            .unwrap();

        let impostor = Node::new("sz", "someone-else", service::RELAY);
        backend
            .put("r9", &impostor.encode().unwrap(), TTL)
            .await
            .unwrap();
        backend.put("r8", "{not a record", TTL).await.unwrap();
        let honest = Node::new("sz", "r7", service::RELAY);
        backend
            .put("r7", &honest.encode().unwrap(), TTL)
            .await
            .unwrap();

        // Only the honest record makes it through.
        assert_eq!(rx.recv().await.unwrap(), (NodeState::Up, "r7".to_string()));
        assert!(registry.lookup_by_id("someone-else").is_none());
        assert!(registry.lookup_by_id("r9").is_none());
        cancel.cancel();
    }
}
