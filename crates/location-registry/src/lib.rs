//! Media-location registry.
//!
//! The cluster's source of truth for which coordinator owns a user and which
//! relay owns a stream. State lives in a TTL-keyed store ([`store`]) using
//! the layout in [`keys`]; every operation touches its keys independently,
//! with no cross-key atomicity.
//!
//! Other nodes reach the registry over the message bus ([`service`],
//! [`client`]) using the catalog in [`rpc`].

#![warn(clippy::pedantic)]

pub mod client;
pub mod error;
pub mod keys;
pub mod registry;
pub mod rpc;
pub mod service;
pub mod store;

pub use client::LocationClient;
pub use error::LocationError;
pub use registry::LocationRegistry;
pub use service::LocationService;
pub use store::{LocationStore, MemoryLocationStore, RedisLocationStore, StoreError};
