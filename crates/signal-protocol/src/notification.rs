//! Room events pushed to peers and relayed between coordinator nodes.
//!
//! The same catalog is used on a peer connection (as notification envelopes)
//! and on a coordinator's `event-{node-id}` channel.

use common::catalog::MethodCatalog;
use common::types::{RemovedStream, RoomUser, StreamLocation, UserLocation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Application payload broadcast by one peer to the rest of its room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastPayload {
    #[serde(rename = "rid")]
    pub room_id: String,
    #[serde(rename = "uid")]
    pub user_id: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "data")]
pub enum RoomEvent {
    #[serde(rename = "peer-join")]
    PeerJoin(UserLocation),
    #[serde(rename = "peer-leave")]
    PeerLeave(RoomUser),
    #[serde(rename = "stream-add")]
    StreamAdd(StreamLocation),
    #[serde(rename = "stream-remove")]
    StreamRemove(RemovedStream),
    #[serde(rename = "broadcast")]
    Broadcast(BroadcastPayload),
}

impl MethodCatalog for RoomEvent {}

impl RoomEvent {
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            RoomEvent::PeerJoin(_) => "peer-join",
            RoomEvent::PeerLeave(_) => "peer-leave",
            RoomEvent::StreamAdd(_) => "stream-add",
            RoomEvent::StreamRemove(_) => "stream-remove",
            RoomEvent::Broadcast(_) => "broadcast",
        }
    }

    #[must_use]
    pub fn room_id(&self) -> &str {
        match self {
            RoomEvent::PeerJoin(e) => &e.room_id,
            RoomEvent::PeerLeave(e) => &e.room_id,
            RoomEvent::StreamAdd(e) => &e.room_id,
            RoomEvent::StreamRemove(e) => &e.room_id,
            RoomEvent::Broadcast(e) => &e.room_id,
        }
    }

    /// User the event is about. That user's own peer never receives it.
    #[must_use]
    pub fn user_id(&self) -> &str {
        match self {
            RoomEvent::PeerJoin(e) => &e.user_id,
            RoomEvent::PeerLeave(e) => &e.user_id,
            RoomEvent::StreamAdd(e) => &e.user_id,
            RoomEvent::StreamRemove(e) => &e.user_id,
            RoomEvent::Broadcast(e) => &e.user_id,
        }
    }
}
