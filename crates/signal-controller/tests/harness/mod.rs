//! Coordinator nodes running against an in-process cluster.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use sc_test_utils::{wait_until, TestClient, TestCluster, TEST_REGION};
use serde_json::{json, Value};
use service_registry::{service, Node, NodeRegistration};
use signal_controller::transport::{serve_connection, DEFAULT_MAILBOX_CAPACITY};
use signal_controller::{Coordinator, CoordinatorSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sweeps only run when a test calls `reconcile` itself.
const MANUAL_SWEEP: Duration = Duration::from_secs(24 * 60 * 60);

pub struct TestNode {
    pub coordinator: Arc<Coordinator>,
    pub registration: Arc<NodeRegistration>,
    shutdown: CancellationToken,
}

impl TestNode {
    /// Register a coordinator node and start it.
    pub async fn start(cluster: &TestCluster, node_id: &str) -> Self {
        let registration = cluster
            .register(Node::new(TEST_REGION, node_id, service::COORDINATOR))
            .await;
        let shutdown = cluster.cancel_token().child_token();
        let coordinator = Coordinator::new(
            CoordinatorSettings {
                node_id: node_id.to_string(),
                region: TEST_REGION.to_string(),
                reconcile_interval: MANUAL_SWEEP,
                max_inflight_requests: 64,
            },
            cluster.registry(),
            cluster.bus(),
            registration.load_gauge(),
            shutdown.child_token(),
        );
        coordinator.start().await.expect("coordinator starts");
        Self {
            coordinator,
            registration,
            shutdown,
        }
    }

    pub fn node_id(&self) -> &str {
        self.coordinator.node_id()
    }

    /// Open a peer connection to this node.
    pub fn connect(&self) -> TestClient {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let coordinator = Arc::clone(&self.coordinator);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            serve_connection(server_end, coordinator, DEFAULT_MAILBOX_CAPACITY, &shutdown).await;
        });
        TestClient::new(client_end)
    }

    /// Wait until this node holds handles for every node in `node_ids`.
    pub async fn wait_for_nodes(&self, node_ids: &[&str]) {
        let coordinator = Arc::clone(&self.coordinator);
        let wanted: Vec<String> = node_ids.iter().map(ToString::to_string).collect();
        wait_until("remote nodes", move || {
            let known = coordinator.remote_node_ids();
            wanted.iter().all(|id| known.contains(id))
        })
        .await;
    }

    /// Whether `user_id` has a local entry in `room_id`.
    pub fn holds(&self, room_id: &str, user_id: &str) -> bool {
        self.coordinator
            .rooms()
            .get(room_id)
            .is_some_and(|room| room.get(user_id).is_some())
    }
}

/// Two coordinators that can see each other.
pub async fn start_pair(cluster: &TestCluster) -> (TestNode, TestNode) {
    let a = TestNode::start(cluster, "sc-a").await;
    let b = TestNode::start(cluster, "sc-b").await;
    a.wait_for_nodes(&["sc-b"]).await;
    b.wait_for_nodes(&["sc-a"]).await;
    (a, b)
}

pub fn offer() -> Value {
    json!({"type": "offer", "sdp": "v=0"})
}

pub fn publish_payload(room_id: &str) -> Value {
    json!({
        "rid": room_id,
        "jsep": offer(),
        "minfo": {"audio": true, "video": true, "videotype": 0}
    })
}
