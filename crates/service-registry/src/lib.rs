//! Service registry: which nodes exist, what they serve, how loaded they are.
//!
//! Nodes publish a leased [`Node`] record through a [`DiscoveryBackend`]
//! ([`NodeRegistration`]). Every process keeps a local cache of the records
//! it cares about ([`ServiceRegistry`]) fed by a watch loop that reports
//! nodes going up and down.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod node;
pub mod registration;
pub mod registry;

pub use backend::{DiscoveryBackend, WatchEvent};
pub use error::RegistryError;
pub use node::{service, Node, NodeState};
pub use registration::{LoadGauge, NodeRegistration};
pub use registry::ServiceRegistry;
