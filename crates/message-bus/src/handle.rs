//! Outbound request handle for one remote node.

use crate::bus::MessageBus;
use crate::error::BusError;
use crate::rpc_channel;
use common::catalog::MethodCatalog;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Sends requests to a single node's `rpc-{node-id}` channel.
#[derive(Clone)]
pub struct RpcHandle {
    node_id: String,
    channel: String,
    bus: Arc<dyn MessageBus>,
}

impl fmt::Debug for RpcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcHandle")
            .field("node_id", &self.node_id)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl RpcHandle {
    pub fn new(bus: Arc<dyn MessageBus>, node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            channel: rpc_channel(&node_id),
            node_id,
            bus,
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Send a raw request.
    ///
    /// # Errors
    ///
    /// Returns the fabric or remote error.
    pub async fn request(&self, method: &str, data: Value) -> Result<Value, BusError> {
        self.bus.request(&self.channel, method, data).await
    }

    /// Send a catalog request and decode the typed reply.
    ///
    /// # Errors
    ///
    /// Returns the fabric or remote error, or [`BusError::Decode`] if the
    /// reply does not match `R`.
    pub async fn call<C, R>(&self, request: &C) -> Result<R, BusError>
    where
        C: MethodCatalog + Sync,
        R: DeserializeOwned,
    {
        let (method, data) = request
            .encode()
            .map_err(|e| BusError::Encode(e.to_string()))?;
        let reply = self.request(&method, data).await?;
        serde_json::from_value(reply).map_err(|e| BusError::Decode(format!("{method}: {e}")))
    }
}
