//! Typed client for a remote location service.

use crate::error::{CODE_OWNER_NOT_FOUND, CODE_RELAY_NOT_FOUND};
use crate::rpc::{LocationRequest, PubsReply, RelayReply, StreamRemoveReply, UsersReply};
use common::types::{RemovedStream, RoomUser, StreamId, StreamLocation, UserLocation};
use message_bus::{BusError, MessageBus, RpcHandle};
use std::sync::Arc;

/// Calls one location node over the bus.
#[derive(Debug, Clone)]
pub struct LocationClient {
    handle: RpcHandle,
}

/// Whether a failed call means "no such record" rather than an outage.
#[must_use]
pub fn is_not_found(err: &BusError) -> bool {
    matches!(err, BusError::Remote(e) if e.code == CODE_OWNER_NOT_FOUND || e.code == CODE_RELAY_NOT_FOUND)
}

fn room_user(room_id: &str, user_id: &str) -> RoomUser {
    RoomUser {
        room_id: room_id.to_string(),
        user_id: user_id.to_string(),
    }
}

impl LocationClient {
    pub fn new(bus: Arc<dyn MessageBus>, node_id: impl Into<String>) -> Self {
        Self {
            handle: RpcHandle::new(bus, node_id),
        }
    }

    #[must_use]
    pub fn from_handle(handle: RpcHandle) -> Self {
        Self { handle }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        self.handle.node_id()
    }

    /// # Errors
    ///
    /// Returns the bus or registry error.
    pub async fn join(
        &self,
        room_id: &str,
        user_id: &str,
        node_id: &str,
    ) -> Result<UserLocation, BusError> {
        self.handle
            .call(&LocationRequest::Join(UserLocation {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
                node_id: node_id.to_string(),
            }))
            .await
    }

    /// # Errors
    ///
    /// Returns the bus or registry error.
    pub async fn leave(&self, room_id: &str, user_id: &str) -> Result<RoomUser, BusError> {
        self.handle
            .call(&LocationRequest::Leave(room_user(room_id, user_id)))
            .await
    }

    /// # Errors
    ///
    /// Returns the bus or registry error; code 402 when the lease is gone.
    pub async fn keepalive(&self, room_id: &str, user_id: &str) -> Result<RoomUser, BusError> {
        self.handle
            .call(&LocationRequest::KeepAlive(room_user(room_id, user_id)))
            .await
    }

    /// # Errors
    ///
    /// Returns the bus or registry error.
    pub async fn stream_add(&self, stream: StreamLocation) -> Result<StreamLocation, BusError> {
        self.handle.call(&LocationRequest::StreamAdd(stream)).await
    }

    /// Remove one stream, or all of the user's streams when `stream_id` is
    /// `None`.
    ///
    /// # Errors
    ///
    /// Returns the bus or registry error.
    pub async fn stream_remove(
        &self,
        room_id: &str,
        user_id: &str,
        stream_id: Option<&StreamId>,
    ) -> Result<Vec<RemovedStream>, BusError> {
        let reply: StreamRemoveReply = self
            .handle
            .call(&LocationRequest::StreamRemove {
                rid: room_id.to_string(),
                uid: user_id.to_string(),
                mid: stream_id.cloned(),
            })
            .await?;
        Ok(reply.removed)
    }

    /// Node id of the coordinator that owns the user.
    ///
    /// # Errors
    ///
    /// Returns the bus or registry error; see [`is_not_found`].
    pub async fn get_owner(&self, room_id: &str, user_id: &str) -> Result<String, BusError> {
        let owner: UserLocation = self
            .handle
            .call(&LocationRequest::GetOwner(room_user(room_id, user_id)))
            .await?;
        Ok(owner.node_id)
    }

    /// Node id of the relay serving the stream.
    ///
    /// # Errors
    ///
    /// Returns the bus or registry error; see [`is_not_found`].
    pub async fn get_relay(&self, room_id: &str, stream_id: &StreamId) -> Result<String, BusError> {
        let reply: RelayReply = self
            .handle
            .call(&LocationRequest::GetRelay {
                rid: room_id.to_string(),
                mid: stream_id.clone(),
            })
            .await?;
        Ok(reply.sfuid)
    }

    /// # Errors
    ///
    /// Returns the bus or registry error.
    pub async fn room_users(
        &self,
        room_id: &str,
        exclude_user: &str,
    ) -> Result<Vec<UserLocation>, BusError> {
        let reply: UsersReply = self
            .handle
            .call(&LocationRequest::GetRoomUsers {
                rid: room_id.to_string(),
                uid: exclude_user.to_string(),
            })
            .await?;
        Ok(reply.users)
    }

    /// # Errors
    ///
    /// Returns the bus or registry error.
    pub async fn room_streams(
        &self,
        room_id: &str,
        exclude_user: &str,
    ) -> Result<Vec<StreamLocation>, BusError> {
        let reply: PubsReply = self
            .handle
            .call(&LocationRequest::GetRoomPubs {
                rid: room_id.to_string(),
                uid: exclude_user.to_string(),
            })
            .await?;
        Ok(reply.pubs)
    }
}
