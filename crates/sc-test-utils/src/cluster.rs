//! In-process cluster fixture.
//!
//! One [`MemoryBus`], one [`MemoryDiscovery`] and one running location
//! registry backed by a [`MemoryLocationStore`]. Coordinators and relays
//! started against it see each other exactly as they would on a real fabric.

use crate::mock_relay::MockRelay;
use location_registry::{LocationClient, LocationRegistry, LocationService, MemoryLocationStore};
use message_bus::{MemoryBus, MessageBus};
use service_registry::backend::MemoryDiscovery;
use service_registry::{service, DiscoveryBackend, Node, NodeRegistration, ServiceRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Region every fixture node registers in.
pub const TEST_REGION: &str = "sz";

/// Node id of the fixture's location registry.
pub const TEST_LOCATION_ID: &str = "location-1";

/// Lease used for fixture registrations; long enough to never lapse in a test.
pub const TEST_LEASE: Duration = Duration::from_secs(300);

pub struct TestCluster {
    pub bus: Arc<MemoryBus>,
    pub discovery: Arc<MemoryDiscovery>,
    pub store: Arc<MemoryLocationStore>,
    pub location: Arc<LocationService>,
    cancel_token: CancellationToken,
}

impl TestCluster {
    /// Start the bus, discovery and a registered location registry.
    pub async fn start() -> Self {
        Self::start_with_bus(MemoryBus::new()).await
    }

    /// Same as [`TestCluster::start`] with a caller-configured bus, e.g. a
    /// short request timeout.
    pub async fn start_with_bus(bus: MemoryBus) -> Self {
        let bus = Arc::new(bus);
        let discovery = Arc::new(MemoryDiscovery::new());
        let store = Arc::new(MemoryLocationStore::new());
        let cancel_token = CancellationToken::new();

        let bus_dyn: Arc<dyn MessageBus> = bus.clone();
        let location = Arc::new(LocationService::new(
            TEST_LOCATION_ID,
            LocationRegistry::new(store.clone()),
            bus_dyn,
            64,
        ));
        location
            .start(cancel_token.child_token())
            .await
            .expect("location service starts");

        let cluster = Self {
            bus,
            discovery,
            store,
            location,
            cancel_token,
        };
        cluster
            .register(Node::new(TEST_REGION, TEST_LOCATION_ID, service::LOCATION))
            .await;
        cluster
    }

    /// The bus as the trait object every component takes.
    pub fn bus(&self) -> Arc<dyn MessageBus> {
        self.bus.clone()
    }

    pub fn backend(&self) -> Arc<dyn DiscoveryBackend> {
        self.discovery.clone()
    }

    /// A fresh registry cache over the shared discovery backend, as each
    /// node process would have.
    pub fn registry(&self) -> Arc<ServiceRegistry> {
        Arc::new(ServiceRegistry::new(self.backend()))
    }

    /// Client talking to the fixture's location registry.
    pub fn location_client(&self) -> LocationClient {
        LocationClient::new(self.bus(), TEST_LOCATION_ID)
    }

    /// Write a node record with the fixture lease.
    pub async fn register(&self, node: Node) -> Arc<NodeRegistration> {
        let registration = Arc::new(NodeRegistration::new(self.backend(), node, TEST_LEASE));
        registration.register().await.expect("node registers");
        registration
    }

    /// Start a mock relay in [`TEST_REGION`] reporting `load`.
    pub async fn add_relay(&self, node_id: &str, load: u64) -> MockRelay {
        MockRelay::start(self, node_id, load).await
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
