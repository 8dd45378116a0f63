//! Peer-to-coordinator method catalog.
//!
//! Every inbound request is decoded and validated exactly once, here, into a
//! [`ClientRequest`]. Fields are checked in catalog order and the first one
//! missing decides the rejection code.

use crate::error_code::{ErrorCode, Rejection};
use common::types::{MediaInfo, StreamId, StreamLocation, UserLocation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// An SDP offer or answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub sdp: String,
}

/// Methods a peer may call on its coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Join,
    Leave,
    KeepAlive,
    Publish,
    Unpublish,
    Subscribe,
    Unsubscribe,
    Broadcast,
    GetUsers,
    GetPubs,
}

impl Method {
    pub const ALL: [Method; 10] = [
        Method::Join,
        Method::Leave,
        Method::KeepAlive,
        Method::Publish,
        Method::Unpublish,
        Method::Subscribe,
        Method::Unsubscribe,
        Method::Broadcast,
        Method::GetUsers,
        Method::GetPubs,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Join => "join",
            Method::Leave => "leave",
            Method::KeepAlive => "keepalive",
            Method::Publish => "publish",
            Method::Unpublish => "unpublish",
            Method::Subscribe => "subscribe",
            Method::Unsubscribe => "unsubscribe",
            Method::Broadcast => "broadcast",
            Method::GetUsers => "getusers",
            Method::GetPubs => "getpubs",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Method::ALL.into_iter().find(|m| m.as_str() == name)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub room_id: String,
    pub user_id: String,
}

/// Payload of methods that only name a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRequest {
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub room_id: String,
    pub offer: SessionDescription,
    pub media_info: MediaInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpublishRequest {
    pub room_id: String,
    pub stream_id: StreamId,
    pub relay_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub room_id: String,
    pub stream_id: StreamId,
    pub offer: SessionDescription,
    pub relay_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeRequest {
    pub room_id: String,
    pub stream_id: StreamId,
    pub subscription_id: String,
    pub relay_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastRequest {
    pub room_id: String,
    pub data: Value,
}

/// A validated peer request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Join(JoinRequest),
    Leave(RoomRequest),
    KeepAlive(RoomRequest),
    Publish(PublishRequest),
    Unpublish(UnpublishRequest),
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    Broadcast(BroadcastRequest),
    GetUsers(RoomRequest),
    GetPubs(RoomRequest),
}

impl ClientRequest {
    /// Decode and validate a request.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::Unknown`] for a method outside the catalog, or the
    /// code of the first required field that is missing.
    pub fn decode(method: &str, data: &Value) -> Result<Self, Rejection> {
        let method = Method::parse(method).ok_or(Rejection(ErrorCode::Unknown))?;
        let fields = Fields(data.as_object());
        let room_id = fields.text("rid", ErrorCode::RidNotFound)?;

        let request = match method {
            Method::Join => ClientRequest::Join(JoinRequest {
                room_id,
                user_id: fields.text("uid", ErrorCode::UidNotFound)?,
            }),
            Method::Leave => ClientRequest::Leave(RoomRequest { room_id }),
            Method::KeepAlive => ClientRequest::KeepAlive(RoomRequest { room_id }),
            Method::Publish => {
                let offer = fields.session_description()?;
                let media_info = fields
                    .object("minfo", ErrorCode::MinfoNotFound)
                    .and_then(|raw| {
                        serde_json::from_value(raw.clone())
                            .map_err(|_| Rejection(ErrorCode::MinfoNotFound))
                    })?;
                ClientRequest::Publish(PublishRequest {
                    room_id,
                    offer,
                    media_info,
                })
            }
            Method::Unpublish => ClientRequest::Unpublish(UnpublishRequest {
                room_id,
                stream_id: fields.text("mid", ErrorCode::MidNotFound)?.into(),
                relay_id: fields.optional_text("sfuid"),
            }),
            Method::Subscribe => {
                let stream_id = fields.text("mid", ErrorCode::MidNotFound)?.into();
                ClientRequest::Subscribe(SubscribeRequest {
                    room_id,
                    stream_id,
                    offer: fields.session_description()?,
                    relay_id: fields.optional_text("sfuid"),
                })
            }
            Method::Unsubscribe => {
                let stream_id = fields.text("mid", ErrorCode::MidNotFound)?.into();
                ClientRequest::Unsubscribe(UnsubscribeRequest {
                    room_id,
                    stream_id,
                    subscription_id: fields.text("sid", ErrorCode::SidNotFound)?,
                    relay_id: fields.optional_text("sfuid"),
                })
            }
            Method::Broadcast => ClientRequest::Broadcast(BroadcastRequest {
                room_id,
                data: fields.raw("data"),
            }),
            Method::GetUsers => ClientRequest::GetUsers(RoomRequest { room_id }),
            Method::GetPubs => ClientRequest::GetPubs(RoomRequest { room_id }),
        };
        Ok(request)
    }

    #[must_use]
    pub fn method(&self) -> Method {
        match self {
            ClientRequest::Join(_) => Method::Join,
            ClientRequest::Leave(_) => Method::Leave,
            ClientRequest::KeepAlive(_) => Method::KeepAlive,
            ClientRequest::Publish(_) => Method::Publish,
            ClientRequest::Unpublish(_) => Method::Unpublish,
            ClientRequest::Subscribe(_) => Method::Subscribe,
            ClientRequest::Unsubscribe(_) => Method::Unsubscribe,
            ClientRequest::Broadcast(_) => Method::Broadcast,
            ClientRequest::GetUsers(_) => Method::GetUsers,
            ClientRequest::GetPubs(_) => Method::GetPubs,
        }
    }

    #[must_use]
    pub fn room_id(&self) -> &str {
        match self {
            ClientRequest::Join(r) => &r.room_id,
            ClientRequest::Leave(r)
            | ClientRequest::KeepAlive(r)
            | ClientRequest::GetUsers(r)
            | ClientRequest::GetPubs(r) => &r.room_id,
            ClientRequest::Publish(r) => &r.room_id,
            ClientRequest::Unpublish(r) => &r.room_id,
            ClientRequest::Subscribe(r) => &r.room_id,
            ClientRequest::Unsubscribe(r) => &r.room_id,
            ClientRequest::Broadcast(r) => &r.room_id,
        }
    }
}

struct Fields<'a>(Option<&'a Map<String, Value>>);

impl<'a> Fields<'a> {
    fn get(&self, name: &str) -> Option<&'a Value> {
        self.0.and_then(|map| map.get(name))
    }

    /// A non-empty string field.
    fn text(&self, name: &str, code: ErrorCode) -> Result<String, Rejection> {
        self.optional_text(name).ok_or(Rejection(code))
    }

    fn optional_text(&self, name: &str) -> Option<String> {
        self.get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn object(&self, name: &str, code: ErrorCode) -> Result<&'a Value, Rejection> {
        self.get(name)
            .filter(|v| v.is_object())
            .ok_or(Rejection(code))
    }

    fn raw(&self, name: &str) -> Value {
        self.get(name).cloned().unwrap_or(Value::Null)
    }

    fn session_description(&self) -> Result<SessionDescription, Rejection> {
        let jsep = Fields(
            self.object("jsep", ErrorCode::JsepNotFound)?
                .as_object(),
        );
        Ok(SessionDescription {
            kind: jsep.optional_text("type").unwrap_or_default(),
            sdp: jsep.text("sdp", ErrorCode::SdpNotFound)?,
        })
    }
}

/// Result of a successful join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub users: Vec<UserLocation>,
    pub pubs: Vec<StreamLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub mid: StreamId,
    pub sfuid: String,
    pub jsep: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub sid: String,
    pub jsep: SessionDescription,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsersResponse {
    pub users: Vec<UserLocation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubsResponse {
    pub pubs: Vec<StreamLocation>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rejection(method: &str, data: &Value) -> ErrorCode {
        ClientRequest::decode(method, data).unwrap_err().0
    }

    #[test]
    fn test_method_names_round_trip() {
        for method in Method::ALL {
            assert_eq!(Method::parse(method.as_str()), Some(method));
        }
        assert_eq!(Method::parse("kick"), None);
    }

    #[test]
    fn test_unknown_method_rejected() {
        assert_eq!(rejection("dance", &json!({"rid": "r"})), ErrorCode::Unknown);
    }

    #[test]
    fn test_join_requires_rid_then_uid() {
        assert_eq!(rejection("join", &json!({})), ErrorCode::RidNotFound);
        assert_eq!(rejection("join", &json!({"uid": "u"})), ErrorCode::RidNotFound);
        assert_eq!(rejection("join", &json!({"rid": "r"})), ErrorCode::UidNotFound);
        assert_eq!(
            rejection("join", &json!({"rid": "r", "uid": ""})),
            ErrorCode::UidNotFound
        );

        let req = ClientRequest::decode("join", &json!({"rid": "r", "uid": "u"})).unwrap();
        assert_eq!(
            req,
            ClientRequest::Join(JoinRequest {
                room_id: "r".to_string(),
                user_id: "u".to_string(),
            })
        );
    }

    #[test]
    fn test_non_object_data_rejects_on_rid() {
        assert_eq!(rejection("leave", &json!("r")), ErrorCode::RidNotFound);
        assert_eq!(rejection("leave", &Value::Null), ErrorCode::RidNotFound);
    }

    #[test]
    fn test_publish_validation_order() {
        assert_eq!(
            rejection("publish", &json!({"rid": "r"})),
            ErrorCode::JsepNotFound
        );
        assert_eq!(
            rejection("publish", &json!({"rid": "r", "jsep": "v=0"})),
            ErrorCode::JsepNotFound
        );
        assert_eq!(
            rejection("publish", &json!({"rid": "r", "jsep": {"type": "offer"}})),
            ErrorCode::SdpNotFound
        );
        assert_eq!(
            rejection(
                "publish",
                &json!({"rid": "r", "jsep": {"type": "offer", "sdp": "v=0"}})
            ),
            ErrorCode::MinfoNotFound
        );
    }

    #[test]
    fn test_publish_decodes_offer_and_media_info() {
        let req = ClientRequest::decode(
            "publish",
            &json!({
                "rid": "r",
                "jsep": {"type": "offer", "sdp": "v=0"},
                "minfo": {"audio": true, "video": false, "videotype": 1}
            }),
        )
        .unwrap();

        let ClientRequest::Publish(publish) = req else {
            unreachable!("expected publish")
        };
        assert_eq!(publish.offer.kind, "offer");
        assert_eq!(publish.offer.sdp, "v=0");
        assert!(publish.media_info.audio);
        assert_eq!(publish.media_info.video_type, 1);
    }

    #[test]
    fn test_subscribe_validation_order() {
        assert_eq!(
            rejection("subscribe", &json!({"rid": "r"})),
            ErrorCode::MidNotFound
        );
        assert_eq!(
            rejection("subscribe", &json!({"rid": "r", "mid": "u#abcdef"})),
            ErrorCode::JsepNotFound
        );
        assert_eq!(
            rejection(
                "subscribe",
                &json!({"rid": "r", "mid": "u#abcdef", "jsep": {}})
            ),
            ErrorCode::SdpNotFound
        );
    }

    #[test]
    fn test_unsubscribe_requires_sid() {
        assert_eq!(
            rejection("unsubscribe", &json!({"rid": "r", "mid": "u#abcdef"})),
            ErrorCode::SidNotFound
        );
    }

    #[test]
    fn test_optional_relay_override() {
        let req = ClientRequest::decode(
            "unpublish",
            &json!({"rid": "r", "mid": "u#abcdef", "sfuid": "relay-2"}),
        )
        .unwrap();
        let ClientRequest::Unpublish(unpublish) = req else {
            unreachable!("expected unpublish")
        };
        assert_eq!(unpublish.relay_id.as_deref(), Some("relay-2"));

        let req =
            ClientRequest::decode("unpublish", &json!({"rid": "r", "mid": "u#abcdef"})).unwrap();
        let ClientRequest::Unpublish(unpublish) = req else {
            unreachable!("expected unpublish")
        };
        assert!(unpublish.relay_id.is_none());
    }

    #[test]
    fn test_broadcast_payload_is_opaque() {
        let req = ClientRequest::decode(
            "broadcast",
            &json!({"rid": "r", "data": {"chat": "hi", "n": [1, 2]}}),
        )
        .unwrap();
        assert_eq!(req.method(), Method::Broadcast);
        assert_eq!(req.room_id(), "r");
        let ClientRequest::Broadcast(broadcast) = req else {
            unreachable!("expected broadcast")
        };
        assert_eq!(broadcast.data, json!({"chat": "hi", "n": [1, 2]}));
    }
}
