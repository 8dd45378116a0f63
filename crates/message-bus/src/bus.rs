//! The fabric contract.

use crate::error::{BusError, RpcError};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

/// An incoming request together with its reply slot.
#[derive(Debug)]
pub struct BusRequest {
    pub method: String,
    pub data: Value,
    reply: oneshot::Sender<Result<Value, RpcError>>,
}

impl BusRequest {
    /// Create a request and the receiver its reply will arrive on.
    #[must_use]
    pub fn new(
        method: String,
        data: Value,
    ) -> (Self, oneshot::Receiver<Result<Value, RpcError>>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                method,
                data,
                reply,
            },
            rx,
        )
    }

    /// Answer the request. A requester that already gave up is ignored.
    pub fn respond(self, result: Result<Value, RpcError>) {
        let _ = self.reply.send(result);
    }

    pub fn accept(self, data: Value) {
        self.respond(Ok(data));
    }

    pub fn reject(self, code: i32, reason: impl Into<String>) {
        self.respond(Err(RpcError::new(code, reason)));
    }
}

/// An event received from a subscribed channel.
#[derive(Debug, Clone, PartialEq)]
pub struct BusEvent {
    pub channel: String,
    pub method: String,
    pub data: Value,
}

/// Request/reply and broadcast delivery between cluster nodes.
///
/// Requests are at-most-once with no automatic retry. Published events reach
/// every ungrouped subscriber of the channel and exactly one member of each
/// consumer group. Dropping a returned receiver ends that serve or subscribe.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Send a request and wait for its reply.
    async fn request(&self, channel: &str, method: &str, data: Value) -> Result<Value, BusError>;

    /// Start serving requests addressed to `channel`.
    async fn serve(&self, channel: &str) -> Result<mpsc::Receiver<BusRequest>, BusError>;

    /// Publish an event on `channel`. Delivery is best-effort.
    async fn publish(&self, channel: &str, method: &str, data: Value) -> Result<(), BusError>;

    /// Subscribe to events on `channel`, optionally as a member of a
    /// consumer group.
    async fn subscribe(
        &self,
        channel: &str,
        group: Option<&str>,
    ) -> Result<mpsc::Receiver<BusEvent>, BusError>;
}
