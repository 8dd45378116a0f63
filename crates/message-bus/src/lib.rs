//! Messaging fabric used between cluster nodes.
//!
//! Every node answers requests on `rpc-{node-id}` and publishes events on
//! `event-{node-id}`. The [`MessageBus`] trait captures the delivery contract
//! (request/reply, fan-out publish, consumer-group subscribe). [`MemoryBus`]
//! implements it in-process; [`RedisBus`] connects separate processes through
//! a shared Redis.

#![warn(clippy::pedantic)]

pub mod bus;
pub mod error;
pub mod handle;
pub mod memory;
pub mod redis_bus;
pub mod worker;

pub use bus::{BusEvent, BusRequest, MessageBus};
pub use error::{BusError, RpcError};
pub use handle::RpcHandle;
pub use memory::MemoryBus;
pub use redis_bus::RedisBus;
pub use worker::WorkerPool;

/// Channel a node serves requests on.
#[must_use]
pub fn rpc_channel(node_id: &str) -> String {
    format!("rpc-{node_id}")
}

/// Channel a node publishes events on.
#[must_use]
pub fn event_channel(node_id: &str) -> String {
    format!("event-{node_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        assert_eq!(rpc_channel("sc-1"), "rpc-sc-1");
        assert_eq!(event_channel("relay-sz-2"), "event-relay-sz-2");
    }
}
