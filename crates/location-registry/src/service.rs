//! Location registry served over the message bus.

use crate::error::LocationError;
use crate::registry::LocationRegistry;
use crate::rpc::{LocationRequest, PubsReply, RelayReply, StreamRemoveReply, UsersReply};
use common::catalog::MethodCatalog;
use message_bus::{rpc_channel, BusError, MessageBus, RpcError, WorkerPool};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Answers [`LocationRequest`]s on `rpc-{node-id}`.
pub struct LocationService {
    node_id: String,
    registry: LocationRegistry,
    bus: Arc<dyn MessageBus>,
    workers: WorkerPool,
}

impl LocationService {
    pub fn new(
        node_id: impl Into<String>,
        registry: LocationRegistry,
        bus: Arc<dyn MessageBus>,
        max_inflight: usize,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            registry,
            bus,
            workers: WorkerPool::new("location", max_inflight),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub fn registry(&self) -> &LocationRegistry {
        &self.registry
    }

    /// Claim the request channel and serve it until `cancel_token` fires.
    ///
    /// Every request runs as its own unit of work, so one slow store round
    /// trip does not hold up the others.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ChannelTaken`] if another server owns the channel.
    pub async fn start(
        self: &Arc<Self>,
        cancel_token: CancellationToken,
    ) -> Result<JoinHandle<()>, BusError> {
        let channel = rpc_channel(&self.node_id);
        let mut requests = self.bus.serve(&channel).await?;
        let service = Arc::clone(self);

        info!(target: "location.service", node_id = %self.node_id, channel = %channel, "Location service started");

        Ok(tokio::spawn(async move {
            loop {
                let mut request = tokio::select! {
                    () = cancel_token.cancelled() => break,
                    received = requests.recv() => match received {
                        Some(request) => request,
                        None => break,
                    },
                };

                let unit = Arc::clone(&service);
                service.workers.spawn("location.request", async move {
                    let data = std::mem::take(&mut request.data);
                    let result = unit.handle(&request.method, data).await;
                    request.respond(result);
                });
            }
            info!(target: "location.service", node_id = %service.node_id, "Location service stopped");
        }))
    }

    /// Decode and execute one request.
    ///
    /// # Errors
    ///
    /// Returns the [`RpcError`] carrying the registry's failure code.
    pub async fn handle(&self, method: &str, data: Value) -> Result<Value, RpcError> {
        let start = Instant::now();
        let request = LocationRequest::decode(method, data).map_err(|e| {
            warn!(target: "location.service", method = %method, error = %e, "Rejecting undecodable request");
            RpcError::from(LocationError::InvalidRequest(format!("{method}: {e}")))
        })?;

        let result = self.dispatch(request).await;
        match &result {
            Ok(_) => debug!(
                target: "location.service",
                method = %method,
                elapsed = ?start.elapsed(),
                "Request handled"
            ),
            Err(e) => debug!(
                target: "location.service",
                method = %method,
                code = e.code(),
                error = %e,
                "Request failed"
            ),
        }
        result.map_err(RpcError::from)
    }

    async fn dispatch(&self, request: LocationRequest) -> Result<Value, LocationError> {
        match request {
            LocationRequest::Join(location) => reply(
                &self
                    .registry
                    .join(&location.room_id, &location.user_id, &location.node_id)
                    .await?,
            ),
            LocationRequest::Leave(user) => {
                reply(&self.registry.leave(&user.room_id, &user.user_id).await?)
            }
            LocationRequest::KeepAlive(user) => {
                reply(&self.registry.keepalive(&user.room_id, &user.user_id).await?)
            }
            LocationRequest::StreamAdd(stream) => reply(&self.registry.stream_add(stream).await?),
            LocationRequest::StreamRemove { rid, uid, mid } => {
                let mid = mid.filter(|m| !m.as_str().is_empty());
                let removed = self.registry.stream_remove(&rid, &uid, mid.as_ref()).await?;
                reply(&StreamRemoveReply { removed })
            }
            LocationRequest::GetOwner(user) => {
                reply(&self.registry.get_owner(&user.room_id, &user.user_id).await?)
            }
            LocationRequest::GetRelay { rid, mid } => {
                let sfuid = self.registry.get_relay_for_stream(&rid, &mid).await?;
                reply(&RelayReply { rid, mid, sfuid })
            }
            LocationRequest::GetRoomUsers { rid, uid } => {
                let users = self.registry.get_room_users(&rid, &uid).await?;
                reply(&UsersReply { users })
            }
            LocationRequest::GetRoomPubs { rid, uid } => {
                let pubs = self.registry.get_room_streams(&rid, &uid).await?;
                reply(&PubsReply { pubs })
            }
        }
    }
}

fn reply<T: Serialize>(payload: &T) -> Result<Value, LocationError> {
    serde_json::to_value(payload).map_err(|e| LocationError::Store(format!("encode reply: {e}")))
}
