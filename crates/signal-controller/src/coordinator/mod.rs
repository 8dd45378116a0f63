//! Session coordinator.
//!
//! Owns the local room table and the table of remote nodes, dispatches peer
//! requests, serves the coordinator-to-coordinator `kick` RPC, relays
//! cluster events to local peers and runs the reconciliation sweep.
//!
//! # Ownership
//!
//! The location registry is the only cluster-wide record of which node holds
//! a user. Writes to it are last-write-wins, so two nodes may briefly both
//! hold a peer for the same user. The kick on join and the periodic sweep
//! converge that state; nothing here tries to make it atomic.

mod cluster;
mod events;
mod handlers;
mod sweep;
mod teardown;

pub use cluster::CoordinatorRequest;
pub use sweep::SweepReport;

use crate::config::Config;
use crate::errors::ScError;
use crate::observability::metrics;
use crate::rooms::Rooms;
use crate::transport::{PeerHandle, PeerHandler, Responder};
use message_bus::{MessageBus, WorkerPool};
use parking_lot::Mutex;
use service_registry::{LoadGauge, ServiceRegistry};
use signal_protocol::envelope::{NotificationMessage, RequestMessage};
use signal_protocol::{ClientRequest, Method};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consumer group coordinators join on relay event channels.
pub const RELAY_CONSUMER_GROUP: &str = "coordinator";

/// Static knobs for one coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub node_id: String,
    pub region: String,
    pub reconcile_interval: Duration,
    pub max_inflight_requests: usize,
}

impl CoordinatorSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            node_id: config.node_id.clone(),
            region: config.region.clone(),
            reconcile_interval: config.reconcile_interval,
            max_inflight_requests: config.max_inflight_requests,
        }
    }
}

pub struct Coordinator {
    this: Weak<Coordinator>,
    settings: CoordinatorSettings,
    registry: Arc<ServiceRegistry>,
    bus: Arc<dyn MessageBus>,
    rooms: Rooms,
    /// Remote nodes learned from the registry watch, keyed by node id.
    nodes: Mutex<HashMap<String, cluster::RemoteNode>>,
    workers: WorkerPool,
    load: LoadGauge,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("node_id", &self.settings.node_id)
            .field("region", &self.settings.region)
            .field("rooms", &self.rooms.room_count())
            .field("nodes", &self.nodes.lock().len())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Build a coordinator. Nothing runs until [`Coordinator::start`].
    ///
    /// `load` is the gauge this node's registry record reports; the
    /// coordinator keeps it equal to its local peer count.
    pub fn new(
        settings: CoordinatorSettings,
        registry: Arc<ServiceRegistry>,
        bus: Arc<dyn MessageBus>,
        load: LoadGauge,
        cancel_token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            workers: WorkerPool::new("coordinator", settings.max_inflight_requests),
            settings,
            registry,
            bus,
            rooms: Rooms::new(),
            nodes: Mutex::new(HashMap::new()),
            load,
            cancel_token,
        })
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.settings.node_id
    }

    #[must_use]
    pub fn region(&self) -> &str {
        &self.settings.region
    }

    /// Local room table.
    #[must_use]
    pub fn rooms(&self) -> &Rooms {
        &self.rooms
    }

    /// Start the kick server, the node watch and the sweep.
    ///
    /// Nodes already registered are connected before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if this node's RPC channel is already served or the
    /// registry watch cannot start.
    pub async fn start(self: &Arc<Self>) -> Result<(), ScError> {
        self.serve_node_requests().await?;
        self.watch_nodes().await?;
        self.spawn_sweep();
        info!(target: "sc.coordinator", node_id = %self.node_id(), region = %self.region(), "Coordinator started");
        Ok(())
    }

    /// Stop every background task and subscription.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    fn spawn_sweep(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let period = self.settings.reconcile_interval;
        let cancel_token = self.cancel_token.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    _ = ticker.tick() => {
                        this.reconcile().await;
                    }
                }
            }
            debug!(target: "sc.sweep", "Reconciliation loop stopped");
        });
    }

    /// Publish local room and peer counts, and the peer count as load.
    pub(crate) fn refresh_gauges(&self) {
        let peers = self.rooms.peer_count();
        metrics::set_rooms_active(self.rooms.room_count());
        metrics::set_peers_active(peers);
        self.load.set(u64::try_from(peers).unwrap_or(u64::MAX));
    }

    async fn dispatch(&self, peer: PeerHandle, request: RequestMessage, responder: Responder) {
        let start = Instant::now();
        let method_label = Method::parse(&request.method).map_or("unknown", Method::as_str);

        let result = match ClientRequest::decode(&request.method, &request.data) {
            Ok(decoded) => self.handle(&peer, decoded).await,
            Err(rejection) => Err(ScError::from(rejection)),
        };

        match result {
            Ok(data) => {
                metrics::record_request(method_label, "ok", start.elapsed());
                responder.accept(data).await;
            }
            Err(e) => {
                warn!(
                    target: "sc.coordinator",
                    connection_id = peer.id(),
                    method = method_label,
                    code = e.error_code(),
                    error = %e,
                    "Request rejected"
                );
                metrics::record_request(method_label, e.status_label(), start.elapsed());
                responder.reject(e.error_code(), e.client_message()).await;
            }
        }
    }
}

impl PeerHandler for Coordinator {
    fn on_request(&self, peer: &PeerHandle, request: RequestMessage, responder: Responder) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let peer = peer.clone();
        self.workers.spawn("client_request", async move {
            this.dispatch(peer, request, responder).await;
        });
    }

    fn on_notification(&self, peer: &PeerHandle, notification: NotificationMessage) {
        debug!(target: "sc.coordinator", connection_id = peer.id(), method = %notification.method, "Ignoring peer notification");
    }

    fn on_close(&self, peer: &PeerHandle) {
        // The room entry stays until the sweep sees the owner lease lapse.
        debug!(target: "sc.coordinator", connection_id = peer.id(), user_id = ?peer.user_id(), "Peer connection closed");
    }
}
