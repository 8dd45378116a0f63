//! Location registry errors and their RPC codes.

use message_bus::RpcError;
use thiserror::Error;

/// Unknown method or undecodable payload.
pub const CODE_INVALID_REQUEST: i32 = 400;
/// Writing the user ownership record failed.
pub const CODE_JOIN_FAILED: i32 = 401;
/// Extending the user ownership lease failed or the lease is gone.
pub const CODE_KEEPALIVE_FAILED: i32 = 402;
/// Writing stream records failed.
pub const CODE_STREAM_ADD_FAILED: i32 = 405;
/// No owner recorded for the user.
pub const CODE_OWNER_NOT_FOUND: i32 = 410;
/// No relay recorded for the stream.
pub const CODE_RELAY_NOT_FOUND: i32 = 411;
/// Store failure on any other path.
pub const CODE_STORE_FAILED: i32 = 500;

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Join failed: {0}")]
    JoinFailed(String),

    #[error("Keepalive failed: {0}")]
    KeepAliveFailed(String),

    #[error("Stream add failed: {0}")]
    StreamAddFailed(String),

    #[error("Owner not found for {room_id}/{user_id}")]
    OwnerNotFound { room_id: String, user_id: String },

    #[error("Relay not found for stream {0}")]
    RelayNotFound(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl LocationError {
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            LocationError::InvalidRequest(_) => CODE_INVALID_REQUEST,
            LocationError::JoinFailed(_) => CODE_JOIN_FAILED,
            LocationError::KeepAliveFailed(_) => CODE_KEEPALIVE_FAILED,
            LocationError::StreamAddFailed(_) => CODE_STREAM_ADD_FAILED,
            LocationError::OwnerNotFound { .. } => CODE_OWNER_NOT_FOUND,
            LocationError::RelayNotFound(_) => CODE_RELAY_NOT_FOUND,
            LocationError::Store(_) => CODE_STORE_FAILED,
        }
    }
}

impl From<LocationError> for RpcError {
    fn from(err: LocationError) -> Self {
        RpcError::new(err.code(), err.to_string())
    }
}
