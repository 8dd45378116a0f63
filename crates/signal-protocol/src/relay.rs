//! RPC contract between coordinators and relay nodes.
//!
//! Relays serve these methods on `rpc-{node-id}` and announce streams that
//! disappeared on their own (publisher gone, transport failure) as a
//! `stream-remove` event on `event-{node-id}`.

use crate::client::SessionDescription;
use common::catalog::MethodCatalog;
use common::types::{RemovedStream, StreamId};
use serde::{Deserialize, Serialize};

/// Relay status meaning the stream no longer exists there.
pub const STREAM_GONE: i32 = 403;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "data")]
pub enum RelayRequest {
    #[serde(rename = "publish")]
    Publish {
        rid: String,
        uid: String,
        jsep: SessionDescription,
    },
    #[serde(rename = "unpublish")]
    Unpublish { rid: String, mid: StreamId },
    #[serde(rename = "subscribe")]
    Subscribe {
        rid: String,
        /// Subscribing user.
        suid: String,
        mid: StreamId,
        jsep: SessionDescription,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        rid: String,
        mid: StreamId,
        sid: String,
    },
}

impl MethodCatalog for RelayRequest {}

/// Answer to a relay `publish`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAnswer {
    pub mid: StreamId,
    pub jsep: SessionDescription,
}

/// Answer to a relay `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeAnswer {
    pub sid: String,
    pub jsep: SessionDescription,
}

/// Events a relay announces on its event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "data")]
pub enum RelayEvent {
    #[serde(rename = "stream-remove")]
    StreamRemove(RemovedStream),
}

impl MethodCatalog for RelayEvent {}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe_payload_shape() {
        let request = RelayRequest::Subscribe {
            rid: "r".to_string(),
            suid: "viewer".to_string(),
            mid: StreamId::from("pub#abcdef"),
            jsep: SessionDescription {
                kind: "offer".to_string(),
                sdp: "v=0".to_string(),
            },
        };

        let (method, data) = request.encode().unwrap();
        assert_eq!(method, "subscribe");
        assert_eq!(
            data,
            json!({
                "rid": "r",
                "suid": "viewer",
                "mid": "pub#abcdef",
                "jsep": {"type": "offer", "sdp": "v=0"}
            })
        );
    }

    #[test]
    fn test_relay_stream_remove_event() {
        let event = RelayEvent::decode(
            "stream-remove",
            json!({"rid": "r", "uid": "u", "mid": "u#abcdef"}),
        )
        .unwrap();
        let RelayEvent::StreamRemove(removed) = event;
        assert_eq!(removed.stream_id.owner(), "u");
    }
}
