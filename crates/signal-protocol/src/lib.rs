//! Wire protocol between peers and coordinator nodes.
//!
//! - [`codec`]: 2-byte little-endian length framing, 4096-byte payload cap
//! - [`envelope`]: request / response / notification JSON envelopes
//! - [`client`]: the closed catalog of peer requests and their responses
//! - [`notification`]: room events fanned out to peers and sibling nodes
//! - [`relay`]: RPC contract with relay nodes
//! - [`error_code`]: stable client error codes

#![warn(clippy::pedantic)]

pub mod client;
pub mod codec;
pub mod envelope;
pub mod error_code;
pub mod notification;
pub mod relay;

pub use client::{ClientRequest, Method, SessionDescription};
pub use envelope::Envelope;
pub use error_code::{ErrorCode, Rejection};
pub use notification::RoomEvent;
