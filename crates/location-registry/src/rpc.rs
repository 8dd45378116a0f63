//! Request catalog and reply payloads of the location service.

use common::catalog::MethodCatalog;
use common::types::{RemovedStream, RoomUser, StreamId, StreamLocation, UserLocation};
use serde::{Deserialize, Serialize};

/// Requests served on the location node's `rpc-{node-id}` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "data")]
pub enum LocationRequest {
    #[serde(rename = "onJoin")]
    Join(UserLocation),

    #[serde(rename = "onLeave")]
    Leave(RoomUser),

    #[serde(rename = "keepalive")]
    KeepAlive(RoomUser),

    #[serde(rename = "streamAdd")]
    StreamAdd(StreamLocation),

    /// Without `mid` (or with an empty one) every stream of the user goes.
    #[serde(rename = "streamRemove")]
    StreamRemove {
        rid: String,
        uid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mid: Option<StreamId>,
    },

    #[serde(rename = "getBizInfo")]
    GetOwner(RoomUser),

    #[serde(rename = "getSfuInfo")]
    GetRelay { rid: String, mid: StreamId },

    /// `uid` is excluded from the result.
    #[serde(rename = "getRoomUsers")]
    GetRoomUsers {
        rid: String,
        #[serde(default)]
        uid: String,
    },

    /// Streams published by `uid` are excluded from the result.
    #[serde(rename = "getRoomPubs")]
    GetRoomPubs {
        rid: String,
        #[serde(default)]
        uid: String,
    },
}

impl MethodCatalog for LocationRequest {}

impl LocationRequest {
    /// Method name, for logs and metrics.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            LocationRequest::Join(_) => "onJoin",
            LocationRequest::Leave(_) => "onLeave",
            LocationRequest::KeepAlive(_) => "keepalive",
            LocationRequest::StreamAdd(_) => "streamAdd",
            LocationRequest::StreamRemove { .. } => "streamRemove",
            LocationRequest::GetOwner(_) => "getBizInfo",
            LocationRequest::GetRelay { .. } => "getSfuInfo",
            LocationRequest::GetRoomUsers { .. } => "getRoomUsers",
            LocationRequest::GetRoomPubs { .. } => "getRoomPubs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRemoveReply {
    #[serde(rename = "rmPubs", default)]
    pub removed: Vec<RemovedStream>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayReply {
    pub rid: String,
    pub mid: StreamId,
    pub sfuid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsersReply {
    #[serde(default)]
    pub users: Vec<UserLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubsReply {
    #[serde(default)]
    pub pubs: Vec<StreamLocation>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_wire_shape() {
        let req = LocationRequest::Join(UserLocation {
            room_id: "r".to_string(),
            user_id: "u".to_string(),
            node_id: "sc-1".to_string(),
        });
        let (method, data) = req.encode().unwrap();
        assert_eq!(method, "onJoin");
        assert_eq!(data, json!({"rid": "r", "uid": "u", "bizid": "sc-1"}));
    }

    #[test]
    fn test_stream_remove_without_mid_is_bulk() {
        let req = LocationRequest::decode("streamRemove", json!({"rid": "r", "uid": "u"})).unwrap();
        assert_eq!(
            req,
            LocationRequest::StreamRemove {
                rid: "r".to_string(),
                uid: "u".to_string(),
                mid: None,
            }
        );

        let (_, data) = req.encode().unwrap();
        assert!(data.get("mid").is_none());
    }

    #[test]
    fn test_get_relay_decodes() {
        let req = LocationRequest::decode("getSfuInfo", json!({"rid": "r", "mid": "bob#Ab12Cd"}))
            .unwrap();
        assert_eq!(req.method(), "getSfuInfo");
    }

    #[test]
    fn test_unknown_method_fails() {
        assert!(LocationRequest::decode("getEverything", json!({})).is_err());
    }

    #[test]
    fn test_stream_remove_reply_field_name() {
        let reply: StreamRemoveReply = serde_json::from_value(json!({
            "rmPubs": [{"rid": "r", "uid": "u", "mid": "u#aaaaaa"}]
        }))
        .unwrap();
        assert_eq!(reply.removed.len(), 1);
    }
}
