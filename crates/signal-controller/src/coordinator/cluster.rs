//! Remote node table, kick server and handle resolution.

use super::{Coordinator, RELAY_CONSUMER_GROUP};
use crate::errors::ScError;
use common::catalog::MethodCatalog;
use common::types::RoomUser;
use location_registry::error::CODE_INVALID_REQUEST;
use location_registry::LocationClient;
use message_bus::{event_channel, rpc_channel, BusEvent, BusRequest, RpcHandle};
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_registry::{service, Node, NodeState};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Requests one coordinator sends another on `rpc-{node-id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "data")]
pub enum CoordinatorRequest {
    /// Tear down the user's session on the receiving node.
    #[serde(rename = "kick")]
    Kick(RoomUser),
}

impl MethodCatalog for CoordinatorRequest {}

pub(crate) struct RemoteNode {
    service: String,
    handle: RpcHandle,
    /// Cancels the event subscription, if one was opened.
    subscription: Option<CancellationToken>,
}

/// Which event stream a node's `event-{id}` channel carries for us.
#[derive(Debug, Clone, Copy)]
enum EventSource {
    Sibling,
    Relay,
}

impl Coordinator {
    pub(super) async fn serve_node_requests(self: &Arc<Self>) -> Result<(), ScError> {
        let mut requests = self
            .bus
            .serve(&rpc_channel(self.node_id()))
            .await
            .map_err(ScError::Bus)?;

        let this = Arc::clone(self);
        let cancel_token = self.cancel_token.child_token();
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    () = cancel_token.cancelled() => break,
                    request = requests.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                let worker = Arc::clone(&this);
                this.workers.spawn("node_request", async move {
                    worker.handle_node_request(request).await;
                });
            }
            debug!(target: "sc.coordinator", "Node request loop stopped");
        });
        Ok(())
    }

    async fn handle_node_request(&self, mut request: BusRequest) {
        let data = std::mem::take(&mut request.data);
        match CoordinatorRequest::decode(&request.method, data) {
            Ok(CoordinatorRequest::Kick(target)) => {
                info!(target: "sc.coordinator", room_id = %target.room_id, user_id = %target.user_id, "Kicked by another node");
                self.teardown(&target.room_id, &target.user_id, None).await;
                request.accept(json!({}));
            }
            Err(e) => {
                debug!(target: "sc.coordinator", method = %request.method, error = %e, "Invalid node request");
                let reason = format!("invalid request {}: {e}", request.method);
                request.reject(CODE_INVALID_REQUEST, reason);
            }
        }
    }

    /// Ask the owning node to tear down a user's session.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no handle for `owner` or the call fails.
    pub(super) async fn kick(&self, owner: &str, room_id: &str, user_id: &str) -> Result<(), ScError> {
        let handle = self
            .handle_for(owner, service::COORDINATOR)
            .ok_or_else(|| ScError::Internal(format!("no handle for coordinator {owner}")))?;
        let target = RoomUser {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        };
        handle
            .call::<_, serde_json::Value>(&CoordinatorRequest::Kick(target))
            .await
            .map(|_| ())
            .map_err(ScError::Bus)
    }

    pub(super) async fn watch_nodes(self: &Arc<Self>) -> Result<(), ScError> {
        // The watch callback must not block, so changes are queued and
        // applied by a task that can await subscriptions.
        let (changes_tx, mut changes) = mpsc::unbounded_channel::<(NodeState, Node)>();
        self.registry
            .watch(
                "",
                move |state, node| {
                    let _ = changes_tx.send((state, node.clone()));
                },
                self.cancel_token.child_token(),
            )
            .await
            .map_err(|e| ScError::Registry(e.to_string()))?;

        while let Ok((state, node)) = changes.try_recv() {
            self.apply_node_change(state, &node).await;
        }

        let this = Arc::clone(self);
        let cancel_token = self.cancel_token.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    change = changes.recv() => {
                        let Some((state, node)) = change else { break };
                        this.apply_node_change(state, &node).await;
                    }
                }
            }
        });
        Ok(())
    }

    #[instrument(skip_all, fields(node_id = %node.node_id, service = %node.service, state = ?state))]
    async fn apply_node_change(self: &Arc<Self>, state: NodeState, node: &Node) {
        if node.node_id == self.node_id() {
            return;
        }
        match state {
            NodeState::Up => {
                // Load refreshes arrive as repeated Ups.
                if self.nodes.lock().contains_key(&node.node_id) {
                    return;
                }
                let source = match node.service.as_str() {
                    service::COORDINATOR => Some(EventSource::Sibling),
                    service::RELAY => Some(EventSource::Relay),
                    _ => None,
                };
                let subscription = match source {
                    Some(source) => self.subscribe_events(&node.node_id, source).await,
                    None => None,
                };
                self.nodes.lock().insert(
                    node.node_id.clone(),
                    RemoteNode {
                        service: node.service.clone(),
                        handle: RpcHandle::new(Arc::clone(&self.bus), node.node_id.clone()),
                        subscription,
                    },
                );
                info!(target: "sc.coordinator", "Remote node up");
            }
            NodeState::Down => {
                let removed = self.nodes.lock().remove(&node.node_id);
                if let Some(subscription) = removed.and_then(|remote| remote.subscription) {
                    subscription.cancel();
                }
                info!(target: "sc.coordinator", "Remote node down");
            }
        }
    }

    async fn subscribe_events(
        self: &Arc<Self>,
        node_id: &str,
        source: EventSource,
    ) -> Option<CancellationToken> {
        let group = match source {
            EventSource::Sibling => None,
            EventSource::Relay => Some(RELAY_CONSUMER_GROUP),
        };
        let channel = event_channel(node_id);
        let mut events = match self.bus.subscribe(&channel, group).await {
            Ok(events) => events,
            Err(e) => {
                warn!(target: "sc.coordinator", channel = %channel, error = %e, "Event subscription failed");
                return None;
            }
        };

        let token = self.cancel_token.child_token();
        let cancel_token = token.clone();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event: BusEvent = tokio::select! {
                    () = cancel_token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match source {
                    EventSource::Sibling => this.relay_sibling_event(event),
                    EventSource::Relay => {
                        let worker = Arc::clone(&this);
                        this.workers.spawn("relay_event", async move {
                            worker.on_relay_event(event).await;
                        });
                    }
                }
            }
            debug!(target: "sc.coordinator", channel = %channel, "Event subscription closed");
        });
        Some(token)
    }

    /// Ids of remote nodes with an open handle, sorted.
    #[must_use]
    pub fn remote_node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn handle_for(&self, node_id: &str, service_name: &str) -> Option<RpcHandle> {
        self.nodes
            .lock()
            .get(node_id)
            .filter(|remote| remote.service == service_name)
            .map(|remote| remote.handle.clone())
    }

    /// Client for the location registry with the lowest node id.
    ///
    /// # Errors
    ///
    /// [`ScError::LocationNotFound`] if none is registered,
    /// [`ScError::NoLocationHandle`] if none is reachable.
    pub(crate) fn location(&self) -> Result<LocationClient, ScError> {
        let handle = self
            .nodes
            .lock()
            .iter()
            .filter(|(_, remote)| remote.service == service::LOCATION)
            .min_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, remote)| remote.handle.clone());

        match handle {
            Some(handle) => Ok(LocationClient::from_handle(handle)),
            None if self.registry.lookup(service::LOCATION).is_empty() => {
                Err(ScError::LocationNotFound)
            }
            None => Err(ScError::NoLocationHandle),
        }
    }

    /// Handle for a specific relay.
    ///
    /// # Errors
    ///
    /// [`ScError::NoRelayHandle`] if the relay is unknown.
    pub(crate) fn relay(&self, relay_id: &str) -> Result<RpcHandle, ScError> {
        self.handle_for(relay_id, service::RELAY)
            .ok_or_else(|| ScError::NoRelayHandle(relay_id.to_string()))
    }

    /// Handle for the least loaded relay in this node's region.
    ///
    /// # Errors
    ///
    /// [`ScError::RelayNotFound`] if the region has no relay,
    /// [`ScError::NoRelayHandle`] if the chosen relay is unreachable.
    pub(crate) fn least_loaded_relay(&self) -> Result<RpcHandle, ScError> {
        let node = self
            .registry
            .lookup_least_loaded(self.region(), service::RELAY)
            .ok_or_else(|| ScError::RelayNotFound(self.region().to_string()))?;
        self.relay(&node.node_id)
    }
}
