//! Fabric and remote-call errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by the remote handler of a request.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("rpc error {code}: {reason}")]
pub struct RpcError {
    pub code: i32,
    pub reason: String,
}

impl RpcError {
    pub fn new(code: i32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Message bus error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The remote handler rejected the request.
    #[error(transparent)]
    Remote(#[from] RpcError),

    /// Nothing is serving the channel.
    #[error("No responders on channel {0}")]
    NoResponders(String),

    /// The remote handler did not answer in time.
    #[error("Request on channel {0} timed out")]
    Timeout(String),

    /// The remote handler dropped the request without answering.
    #[error("Request on channel {0} was dropped without a reply")]
    NoReply(String),

    /// The fabric itself failed (connection lost, command rejected).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Another server already owns the channel.
    #[error("Channel {0} is already served")]
    ChannelTaken(String),

    /// Payload could not be encoded.
    #[error("Encode error: {0}")]
    Encode(String),

    /// Reply could not be decoded into the expected type.
    #[error("Decode error: {0}")]
    Decode(String),
}

impl BusError {
    /// Code surfaced to callers: the remote code when there is one, otherwise
    /// an HTTP-like transport status.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            BusError::Remote(e) => e.code,
            BusError::NoResponders(_) | BusError::NoReply(_) | BusError::Transport(_) => 503,
            BusError::Timeout(_) => 504,
            BusError::ChannelTaken(_) => 409,
            BusError::Encode(_) | BusError::Decode(_) => 500,
        }
    }

    /// Reason surfaced to callers.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            BusError::Remote(e) => e.reason.clone(),
            other => other.to_string(),
        }
    }

    /// Bounded label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            BusError::Remote(_) => "remote",
            BusError::NoResponders(_) => "no_responders",
            BusError::Timeout(_) => "timeout",
            BusError::NoReply(_) => "no_reply",
            BusError::Transport(_) => "transport",
            BusError::ChannelTaken(_) => "channel_taken",
            BusError::Encode(_) => "encode",
            BusError::Decode(_) => "decode",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_code_passes_through() {
        let err = BusError::from(RpcError::new(403, "stream gone"));
        assert_eq!(err.code(), 403);
        assert_eq!(err.reason(), "stream gone");
    }

    #[test]
    fn test_transport_codes() {
        assert_eq!(BusError::NoResponders("rpc-x".to_string()).code(), 503);
        assert_eq!(BusError::Timeout("rpc-x".to_string()).code(), 504);
        assert_eq!(
            BusError::Timeout("rpc-x".to_string()).reason(),
            "Request on channel rpc-x timed out"
        );
    }
}
