//! Coordinators in separate processes, each with its own Redis bus and
//! embedded location service, wired the way the binary wires them.
//!
//! Needs a running Redis: `REDIS_URL=redis://127.0.0.1:6379 cargo test -p
//! signal-controller --test redis_fabric -- --ignored`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use location_registry::{LocationRegistry, LocationService, MemoryLocationStore};
use message_bus::{MessageBus, RedisBus};
use sc_test_utils::{wait_until, TestClient, TEST_LEASE, TEST_REGION};
use serde_json::json;
use service_registry::backend::MemoryDiscovery;
use service_registry::{service, DiscoveryBackend, Node, NodeRegistration, ServiceRegistry};
use signal_controller::transport::{serve_connection, DEFAULT_MAILBOX_CAPACITY};
use signal_controller::{Coordinator, CoordinatorSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One signal-controller process.
struct Process {
    coordinator: Arc<Coordinator>,
    shutdown: CancellationToken,
    _registrations: Vec<Arc<NodeRegistration>>,
}

impl Process {
    async fn start(
        discovery: &Arc<MemoryDiscovery>,
        store: &Arc<MemoryLocationStore>,
        node_id: &str,
    ) -> Self {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let bus: Arc<dyn MessageBus> = Arc::new(
            RedisBus::connect(&url, Duration::from_secs(3))
                .await
                .expect("Redis reachable"),
        );
        let backend: Arc<dyn DiscoveryBackend> = discovery.clone();
        let shutdown = CancellationToken::new();

        let location_id = format!("{node_id}-location");
        let location = Arc::new(LocationService::new(
            location_id.clone(),
            LocationRegistry::new(store.clone()),
            Arc::clone(&bus),
            16,
        ));
        location.start(shutdown.child_token()).await.unwrap();

        let mut registrations = Vec::new();
        for node in [
            Node::new(TEST_REGION, location_id, service::LOCATION),
            Node::new(TEST_REGION, node_id, service::COORDINATOR),
        ] {
            let registration = Arc::new(NodeRegistration::new(backend.clone(), node, TEST_LEASE));
            registration.register().await.unwrap();
            registrations.push(registration);
        }
        let load = registrations.last().unwrap().load_gauge();

        let coordinator = Coordinator::new(
            CoordinatorSettings {
                node_id: node_id.to_string(),
                region: TEST_REGION.to_string(),
                reconcile_interval: Duration::from_secs(24 * 60 * 60),
                max_inflight_requests: 16,
            },
            Arc::new(ServiceRegistry::new(backend)),
            bus,
            load,
            shutdown.child_token(),
        );
        coordinator.start().await.unwrap();

        Self {
            coordinator,
            shutdown,
            _registrations: registrations,
        }
    }

    fn connect(&self) -> TestClient {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let coordinator = Arc::clone(&self.coordinator);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            serve_connection(server_end, coordinator, DEFAULT_MAILBOX_CAPACITY, &shutdown).await;
        });
        TestClient::new(client_end)
    }

    fn knows(&self, node_id: &str) -> bool {
        self.coordinator
            .remote_node_ids()
            .iter()
            .any(|id| id == node_id)
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test]
#[ignore = "requires a running Redis (REDIS_URL)"]
async fn test_join_and_kick_across_processes() {
    let run = Uuid::new_v4().simple().to_string();
    let a_id = format!("sc-a-{run}");
    let b_id = format!("sc-b-{run}");
    let discovery = Arc::new(MemoryDiscovery::new());
    let store = Arc::new(MemoryLocationStore::new());

    let a = Process::start(&discovery, &store, &a_id).await;
    let b = Process::start(&discovery, &store, &b_id).await;
    wait_until("processes see each other", || {
        a.knows(&b_id) && b.knows(&a_id) && b.knows(&format!("{a_id}-location"))
    })
    .await;

    // sc-b uses the lowest location id, which only sc-a's process serves.
    let mut bob = b.connect();
    let joined = bob.join("room", "bob").await;
    assert!(joined.users.is_empty());

    let mut alice = a.connect();
    let joined = alice.join("room", "alice").await;
    assert_eq!(joined.users.first().unwrap().node_id, b_id);
    let join = bob.expect_notification("peer-join").await;
    assert_eq!(join["uid"], json!("alice"));

    // Rejoining through sc-b kicks the session held by sc-a.
    let mut again = b.connect();
    again.join("room", "alice").await;
    alice.wait_closed().await;
    wait_until("sc-a released alice", || {
        a.coordinator
            .rooms()
            .get("room")
            .map_or(true, |room| room.get("alice").is_none())
    })
    .await;
}
