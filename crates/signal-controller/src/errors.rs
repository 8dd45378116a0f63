//! Signal controller error types.
//!
//! Every variant maps to a stable client error code. Rejections returned by
//! a remote handler on a primary operation pass its code and reason through
//! unchanged. Transport failures (no responder, timeout, dropped reply) and
//! everything else use the negative catalog codes, so internal channel names
//! never reach a peer.

use message_bus::BusError;
use signal_protocol::{ErrorCode, Rejection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScError {
    /// A required request field is missing.
    #[error("Invalid request: {0}")]
    Invalid(#[from] Rejection),

    /// The connection has not completed a join.
    #[error("Peer has not joined")]
    NotJoined,

    /// The room has no local presence on this node.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// No relay node is registered in the region, or the stream has no
    /// recorded relay.
    #[error("Relay not found: {0}")]
    RelayNotFound(String),

    /// No location registry node is registered.
    #[error("Location registry not found")]
    LocationNotFound,

    /// A relay is registered but there is no request channel for it.
    #[error("No RPC handle for relay {0}")]
    NoRelayHandle(String),

    /// A location registry is registered but there is no request channel
    /// for it.
    #[error("No RPC handle for location registry")]
    NoLocationHandle,

    /// The location registry failed a primary operation.
    #[error("Location registry call failed: {0}")]
    Location(BusError),

    /// A relay failed a primary operation.
    #[error("Relay call failed: {0}")]
    Relay(BusError),

    /// The relay handed back a stream id owned by someone else.
    #[error("Relay returned stream {stream_id} not owned by {user_id}")]
    StreamOwnerMismatch { stream_id: String, user_id: String },

    /// The peer connection went away before answering.
    #[error("Peer connection closed")]
    PeerClosed,

    /// The peer rejected a server-initiated request.
    #[error("Peer rejected request: {code} {reason}")]
    PeerRejected { code: i32, reason: String },

    /// Bus setup failed (channel already served, etc.).
    #[error("Message bus error: {0}")]
    Bus(BusError),

    /// Service registry failure during startup.
    #[error("Service registry error: {0}")]
    Registry(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScError {
    /// Returns the client error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            ScError::Invalid(rejection) => rejection.code(),
            ScError::NotJoined => ErrorCode::UidNotFound.code(),
            ScError::RoomNotFound(_) => ErrorCode::RidNotFound.code(),
            ScError::RelayNotFound(_) => ErrorCode::RelayNotFound.code(),
            ScError::LocationNotFound => ErrorCode::LocationNotFound.code(),
            ScError::NoRelayHandle(_) => ErrorCode::RelayRpcNotFound.code(),
            ScError::NoLocationHandle => ErrorCode::LocationRpcNotFound.code(),
            ScError::Location(BusError::Remote(e)) | ScError::Relay(BusError::Remote(e)) => e.code,
            ScError::Location(e) => transport_code(e, ErrorCode::LocationRpcNotFound).code(),
            ScError::Relay(e) => transport_code(e, ErrorCode::RelayRpcNotFound).code(),
            ScError::PeerRejected { code, .. } => *code,
            ScError::StreamOwnerMismatch { .. }
            | ScError::PeerClosed
            | ScError::Bus(_)
            | ScError::Registry(_)
            | ScError::Internal(_) => ErrorCode::Unknown.code(),
        }
    }

    /// Returns a client-safe error message.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            ScError::Invalid(rejection) => rejection.reason().to_string(),
            ScError::NotJoined => ErrorCode::UidNotFound.reason().to_string(),
            ScError::RoomNotFound(_) => ErrorCode::RidNotFound.reason().to_string(),
            ScError::RelayNotFound(_) => ErrorCode::RelayNotFound.reason().to_string(),
            ScError::LocationNotFound => ErrorCode::LocationNotFound.reason().to_string(),
            ScError::NoRelayHandle(_) => ErrorCode::RelayRpcNotFound.reason().to_string(),
            ScError::NoLocationHandle => ErrorCode::LocationRpcNotFound.reason().to_string(),
            ScError::Location(BusError::Remote(e)) | ScError::Relay(BusError::Remote(e)) => {
                e.reason.clone()
            }
            ScError::Location(e) => transport_code(e, ErrorCode::LocationRpcNotFound)
                .reason()
                .to_string(),
            ScError::Relay(e) => transport_code(e, ErrorCode::RelayRpcNotFound)
                .reason()
                .to_string(),
            ScError::PeerRejected { reason, .. } => reason.clone(),
            ScError::StreamOwnerMismatch { .. }
            | ScError::PeerClosed
            | ScError::Bus(_)
            | ScError::Registry(_)
            | ScError::Internal(_) => ErrorCode::Unknown.reason().to_string(),
        }
    }

    /// Bounded status label for request metrics.
    #[must_use]
    pub fn status_label(&self) -> &'static str {
        match self {
            ScError::Invalid(_) | ScError::NotJoined => "invalid",
            ScError::RoomNotFound(_) | ScError::RelayNotFound(_) | ScError::LocationNotFound => {
                "not_found"
            }
            ScError::NoRelayHandle(_) | ScError::NoLocationHandle => "unavailable",
            ScError::Location(_) | ScError::Relay(_) => "remote_error",
            _ => "error",
        }
    }
}

/// Catalog code for a call that never got a remote answer.
fn transport_code(err: &BusError, unreachable: ErrorCode) -> ErrorCode {
    match err {
        BusError::NoResponders(_)
        | BusError::Timeout(_)
        | BusError::NoReply(_)
        | BusError::Transport(_) => unreachable,
        _ => ErrorCode::Unknown,
    }
}
