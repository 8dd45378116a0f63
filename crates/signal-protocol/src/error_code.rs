//! Stable error codes returned to peers in reject envelopes.

/// Client-visible error code. Values are part of the wire contract and must
/// never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    UidNotFound = -1,
    RidNotFound = -2,
    MidNotFound = -3,
    SidNotFound = -4,
    JsepNotFound = -5,
    SdpNotFound = -6,
    MinfoNotFound = -7,
    PubNotFound = -8,
    SubNotFound = -9,
    RelayNotFound = -10,
    LocationNotFound = -11,
    RelayRpcNotFound = -12,
    LocationRpcNotFound = -13,
    Unknown = -14,
}

impl ErrorCode {
    #[must_use]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Human-readable reason sent alongside the code.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            ErrorCode::Ok => "ok",
            ErrorCode::UidNotFound => "uid not found",
            ErrorCode::RidNotFound => "rid not found",
            ErrorCode::MidNotFound => "mid not found",
            ErrorCode::SidNotFound => "sid not found",
            ErrorCode::JsepNotFound => "jsep not found",
            ErrorCode::SdpNotFound => "sdp not found",
            ErrorCode::MinfoNotFound => "minfo not found",
            ErrorCode::PubNotFound => "pub not found",
            ErrorCode::SubNotFound => "sub not found",
            ErrorCode::RelayNotFound => "relay not found",
            ErrorCode::LocationNotFound => "location registry not found",
            ErrorCode::RelayRpcNotFound => "relay rpc not found",
            ErrorCode::LocationRpcNotFound => "location registry rpc not found",
            ErrorCode::Unknown => "unknown error",
        }
    }
}

/// A validation failure carrying the code for the first missing field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", .0.reason())]
pub struct Rejection(pub ErrorCode);

impl Rejection {
    #[must_use]
    pub fn code(&self) -> i32 {
        self.0.code()
    }

    #[must_use]
    pub fn reason(&self) -> &'static str {
        self.0.reason()
    }
}
