//! Signal Controller
//!
//! The session coordinator of a clustered media relay. Peers hold one
//! framed connection to a coordinator node; the coordinator routes their
//! room, publish and subscribe requests to the cluster's location registry
//! and media relays, and keeps every node holding part of a room informed.
//!
//! # Components
//!
//! - [`transport`] - length-prefixed peer connections, request correlation
//! - [`rooms`] - local room and peer tables
//! - [`coordinator`] - request handlers, kick RPC, event relay, sweep
//! - [`config`] - configuration from environment
//! - [`errors`] - error types mapped to client error codes
//! - [`observability`] - health probes and Prometheus metrics
//!
//! # Consistency
//!
//! Ownership of a user is a leased record in the location registry with
//! last-write-wins semantics. Two nodes can briefly both hold a peer for the
//! same user while a kick is in flight. The reconciliation sweep converges
//! whatever the kick and the lease expiry miss.

#![warn(clippy::pedantic)]

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod observability;
pub mod rooms;
pub mod transport;

pub use coordinator::{Coordinator, CoordinatorSettings, SweepReport};
