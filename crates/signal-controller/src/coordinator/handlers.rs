//! Client request handlers.
//!
//! Every handler returns the accept payload or an [`ScError`] whose code and
//! message go back to the peer.

use super::Coordinator;
use crate::errors::ScError;
use crate::observability::metrics;
use crate::transport::PeerHandle;
use common::types::{RemovedStream, StreamId, StreamLocation, UserLocation};
use location_registry::client::is_not_found;
use message_bus::{BusError, RpcHandle};
use serde::Serialize;
use serde_json::{json, Value};
use signal_protocol::client::{
    BroadcastRequest, JoinRequest, JoinResponse, PublishRequest, PublishResponse, PubsResponse,
    SubscribeRequest, SubscribeResponse, UnpublishRequest, UnsubscribeRequest, UsersResponse,
};
use signal_protocol::notification::BroadcastPayload;
use signal_protocol::relay::{PublishAnswer, RelayRequest, SubscribeAnswer, STREAM_GONE};
use signal_protocol::{ClientRequest, RoomEvent};
use tracing::{debug, info, instrument, warn};

fn reply<T: Serialize>(body: &T) -> Result<Value, ScError> {
    serde_json::to_value(body).map_err(|e| ScError::Internal(format!("reply encode: {e}")))
}

impl Coordinator {
    pub(super) async fn handle(
        &self,
        peer: &PeerHandle,
        request: ClientRequest,
    ) -> Result<Value, ScError> {
        let request = match request {
            ClientRequest::Join(join) => return self.join(peer, join).await,
            other => other,
        };

        let user_id = peer.user_id().ok_or(ScError::NotJoined)?;
        match request {
            ClientRequest::Join(_) => Err(ScError::Internal("join dispatched twice".to_string())),
            ClientRequest::Leave(r) => self.leave(peer, &r.room_id, &user_id).await,
            ClientRequest::KeepAlive(r) => self.keepalive(&r.room_id, &user_id).await,
            ClientRequest::Publish(r) => self.publish(&user_id, r).await,
            ClientRequest::Unpublish(r) => self.unpublish(r).await,
            ClientRequest::Subscribe(r) => self.subscribe(&user_id, r).await,
            ClientRequest::Unsubscribe(r) => self.unsubscribe(r).await,
            ClientRequest::Broadcast(r) => self.broadcast(&user_id, r).await,
            ClientRequest::GetUsers(r) => self.get_users(&r.room_id, &user_id).await,
            ClientRequest::GetPubs(r) => self.get_pubs(&r.room_id, &user_id).await,
        }
    }

    /// The room must have a local entry for the user.
    fn require_member(&self, room_id: &str, user_id: &str) -> Result<(), ScError> {
        self.rooms
            .get(room_id)
            .and_then(|room| room.get(user_id))
            .map(|_| ())
            .ok_or_else(|| ScError::RoomNotFound(room_id.to_string()))
    }

    #[instrument(skip_all, fields(room_id = %request.room_id, user_id = %request.user_id))]
    async fn join(&self, peer: &PeerHandle, request: JoinRequest) -> Result<Value, ScError> {
        let JoinRequest { room_id, user_id } = request;
        let location = self.location()?;

        // Evict any previous session for this user, wherever it lives.
        match location.get_owner(&room_id, &user_id).await {
            Ok(owner) if owner == self.node_id() => {
                debug!(target: "sc.coordinator", "Rejoin on this node, tearing down previous session");
                self.teardown(&room_id, &user_id, Some(peer.id())).await;
            }
            Ok(owner) => {
                info!(target: "sc.coordinator", owner = %owner, "User owned by another node, kicking");
                if let Err(e) = self.kick(&owner, &room_id, &user_id).await {
                    // The owner may be gone; clean up its registry state here.
                    warn!(target: "sc.coordinator", owner = %owner, error = %e, "Kick failed, releasing registry state locally");
                    metrics::record_rpc_failure("coordinator");
                    self.release(&location, &room_id, &user_id).await;
                }
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                warn!(target: "sc.coordinator", error = %e, "Owner lookup failed, continuing join");
                metrics::record_rpc_failure("location");
            }
        }

        // Claim ownership before the peer becomes visible locally: a sweep
        // that sees the peer must also see this node as its owner.
        location
            .join(&room_id, &user_id, self.node_id())
            .await
            .map_err(|e| {
                metrics::record_rpc_failure("location");
                ScError::Location(e)
            })?;

        if let Some(stale) = self.rooms.attach(&room_id, &user_id, peer.clone()) {
            if stale.id() != peer.id() {
                debug!(target: "sc.coordinator", stale_connection_id = stale.id(), "Closing stale connection");
                stale.close();
            }
        }
        peer.bind_user(&user_id);
        self.refresh_gauges();

        self.announce(RoomEvent::PeerJoin(UserLocation {
            room_id: room_id.clone(),
            user_id: user_id.clone(),
            node_id: self.node_id().to_string(),
        }))
        .await;

        let users = location
            .room_users(&room_id, &user_id)
            .await
            .unwrap_or_else(|e| {
                warn!(target: "sc.coordinator", error = %e, "Roster read failed after join");
                Vec::new()
            });
        let pubs = location
            .room_streams(&room_id, &user_id)
            .await
            .unwrap_or_else(|e| {
                warn!(target: "sc.coordinator", error = %e, "Stream list read failed after join");
                Vec::new()
            });

        info!(target: "sc.coordinator", users = users.len(), pubs = pubs.len(), "Peer joined");
        reply(&JoinResponse { users, pubs })
    }

    #[instrument(skip_all, fields(room_id = %room_id, user_id = %user_id))]
    async fn leave(&self, peer: &PeerHandle, room_id: &str, user_id: &str) -> Result<Value, ScError> {
        self.teardown(room_id, user_id, Some(peer.id())).await;
        info!(target: "sc.coordinator", "Peer left");
        Ok(json!({}))
    }

    async fn keepalive(&self, room_id: &str, user_id: &str) -> Result<Value, ScError> {
        self.require_member(room_id, user_id)?;
        self.location()?
            .keepalive(room_id, user_id)
            .await
            .map_err(ScError::Location)?;
        Ok(json!({}))
    }

    #[instrument(skip_all, fields(room_id = %request.room_id, user_id = %user_id))]
    async fn publish(&self, user_id: &str, request: PublishRequest) -> Result<Value, ScError> {
        let PublishRequest {
            room_id,
            offer,
            media_info,
        } = request;
        self.require_member(&room_id, user_id)?;
        let location = self.location()?;
        let relay = self.least_loaded_relay()?;

        let answer: PublishAnswer = relay
            .call(&RelayRequest::Publish {
                rid: room_id.clone(),
                uid: user_id.to_string(),
                jsep: offer,
            })
            .await
            .map_err(|e| {
                metrics::record_rpc_failure("relay");
                ScError::Relay(e)
            })?;

        if answer.mid.owner() != user_id {
            self.undo_publish(&relay, &room_id, &answer.mid).await;
            return Err(ScError::StreamOwnerMismatch {
                stream_id: answer.mid.into_inner(),
                user_id: user_id.to_string(),
            });
        }

        let stream = StreamLocation {
            room_id,
            user_id: user_id.to_string(),
            stream_id: answer.mid.clone(),
            relay_id: relay.node_id().to_string(),
            media_info: Some(media_info),
        };
        if let Err(e) = location.stream_add(stream.clone()).await {
            metrics::record_rpc_failure("location");
            self.undo_publish(&relay, &stream.room_id, &stream.stream_id).await;
            return Err(ScError::Location(e));
        }

        info!(target: "sc.coordinator", stream_id = %stream.stream_id, relay_id = %stream.relay_id, "Stream published");
        self.announce(RoomEvent::StreamAdd(stream)).await;

        reply(&PublishResponse {
            mid: answer.mid,
            sfuid: relay.node_id().to_string(),
            jsep: answer.jsep,
        })
    }

    async fn undo_publish(&self, relay: &RpcHandle, room_id: &str, stream_id: &StreamId) {
        let undo = RelayRequest::Unpublish {
            rid: room_id.to_string(),
            mid: stream_id.clone(),
        };
        if let Err(e) = relay.call::<_, Value>(&undo).await {
            warn!(target: "sc.coordinator", relay_id = %relay.node_id(), stream_id = %stream_id, error = %e, "Undoing relay publication failed");
            metrics::record_rpc_failure("relay");
        }
    }

    /// Relay for a stream: the explicit override, else the registry's record.
    async fn resolve_relay(
        &self,
        room_id: &str,
        stream_id: &StreamId,
        relay_id: Option<&str>,
    ) -> Result<RpcHandle, ScError> {
        if let Some(relay_id) = relay_id {
            return self.relay(relay_id);
        }
        let relay_id = self
            .location()?
            .get_relay(room_id, stream_id)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    ScError::RelayNotFound(stream_id.to_string())
                } else {
                    ScError::Location(e)
                }
            })?;
        self.relay(&relay_id)
    }

    #[instrument(skip_all, fields(room_id = %request.room_id, stream_id = %request.stream_id))]
    async fn unpublish(&self, request: UnpublishRequest) -> Result<Value, ScError> {
        let UnpublishRequest {
            room_id,
            stream_id,
            relay_id,
        } = request;
        let relay = self
            .resolve_relay(&room_id, &stream_id, relay_id.as_deref())
            .await?;

        relay
            .call::<_, Value>(&RelayRequest::Unpublish {
                rid: room_id.clone(),
                mid: stream_id.clone(),
            })
            .await
            .map_err(|e| {
                metrics::record_rpc_failure("relay");
                ScError::Relay(e)
            })?;

        self.location()?
            .stream_remove(&room_id, stream_id.owner(), Some(&stream_id))
            .await
            .map_err(ScError::Location)?;

        info!(target: "sc.coordinator", "Stream unpublished");
        self.announce(RoomEvent::StreamRemove(RemovedStream {
            room_id,
            user_id: stream_id.owner().to_string(),
            stream_id,
        }))
        .await;
        Ok(json!({}))
    }

    #[instrument(skip_all, fields(room_id = %request.room_id, stream_id = %request.stream_id, user_id = %user_id))]
    async fn subscribe(&self, user_id: &str, request: SubscribeRequest) -> Result<Value, ScError> {
        let SubscribeRequest {
            room_id,
            stream_id,
            offer,
            relay_id,
        } = request;
        let relay = self
            .resolve_relay(&room_id, &stream_id, relay_id.as_deref())
            .await?;

        let result: Result<SubscribeAnswer, BusError> = relay
            .call(&RelayRequest::Subscribe {
                rid: room_id.clone(),
                suid: user_id.to_string(),
                mid: stream_id.clone(),
                jsep: offer,
            })
            .await;

        match result {
            Ok(answer) => reply(&SubscribeResponse {
                sid: answer.sid,
                jsep: answer.jsep,
            }),
            Err(e) => {
                metrics::record_rpc_failure("relay");
                if matches!(&e, BusError::Remote(remote) if remote.code == STREAM_GONE) {
                    // A stream-remove from the relay was missed.
                    info!(target: "sc.coordinator", "Relay reports stream gone, cleaning up");
                    self.forget_stream(&room_id, &stream_id).await;
                }
                Err(ScError::Relay(e))
            }
        }
    }

    async fn unsubscribe(&self, request: UnsubscribeRequest) -> Result<Value, ScError> {
        let UnsubscribeRequest {
            room_id,
            stream_id,
            subscription_id,
            relay_id,
        } = request;
        let relay = self
            .resolve_relay(&room_id, &stream_id, relay_id.as_deref())
            .await?;

        relay
            .call::<_, Value>(&RelayRequest::Unsubscribe {
                rid: room_id,
                mid: stream_id,
                sid: subscription_id,
            })
            .await
            .map_err(|e| {
                metrics::record_rpc_failure("relay");
                ScError::Relay(e)
            })?;
        Ok(json!({}))
    }

    async fn broadcast(&self, user_id: &str, request: BroadcastRequest) -> Result<Value, ScError> {
        self.require_member(&request.room_id, user_id)?;
        self.announce(RoomEvent::Broadcast(BroadcastPayload {
            room_id: request.room_id,
            user_id: user_id.to_string(),
            data: request.data,
        }))
        .await;
        Ok(json!({}))
    }

    async fn get_users(&self, room_id: &str, user_id: &str) -> Result<Value, ScError> {
        let users = self
            .location()?
            .room_users(room_id, user_id)
            .await
            .map_err(ScError::Location)?;
        reply(&UsersResponse { users })
    }

    async fn get_pubs(&self, room_id: &str, user_id: &str) -> Result<Value, ScError> {
        let pubs = self
            .location()?
            .room_streams(room_id, user_id)
            .await
            .map_err(ScError::Location)?;
        reply(&PubsResponse { pubs })
    }
}
