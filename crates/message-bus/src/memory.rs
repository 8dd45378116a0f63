//! In-process message bus.
//!
//! All nodes sharing one [`MemoryBus`] behave like nodes on one fabric. Used
//! for single-process deployments and for every cluster-level test.

use crate::bus::{BusEvent, BusRequest, MessageBus};
use crate::error::BusError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default time a requester waits for a reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffer for each serve and subscribe receiver.
const CHANNEL_BUFFER: usize = 1024;

struct Subscriber {
    group: Option<String>,
    tx: mpsc::Sender<BusEvent>,
}

#[derive(Default)]
struct Inner {
    servers: HashMap<String, mpsc::Sender<BusRequest>>,
    subscribers: HashMap<String, Vec<Subscriber>>,
    /// Round-robin position per (channel, group).
    cursors: HashMap<(String, String), usize>,
}

/// In-process [`MessageBus`].
pub struct MemoryBus {
    inner: Mutex<Inner>,
    request_timeout: Duration,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_request_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    #[must_use]
    pub fn with_request_timeout(request_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            request_timeout,
        }
    }

    /// Pick the senders a published event goes to: every ungrouped
    /// subscriber plus one live member per group.
    fn targets(&self, channel: &str) -> Vec<mpsc::Sender<BusEvent>> {
        let mut inner = self.inner.lock();
        let Inner {
            subscribers,
            cursors,
            ..
        } = &mut *inner;

        let Some(subs) = subscribers.get_mut(channel) else {
            return Vec::new();
        };
        subs.retain(|s| !s.tx.is_closed());

        let mut targets = Vec::new();
        let mut groups: Vec<&str> = Vec::new();
        for sub in subs.iter() {
            match &sub.group {
                None => targets.push(sub.tx.clone()),
                Some(group) if !groups.contains(&group.as_str()) => groups.push(group),
                Some(_) => {}
            }
        }

        for group in groups {
            let members: Vec<&Subscriber> = subs
                .iter()
                .filter(|s| s.group.as_deref() == Some(group))
                .collect();
            let cursor = cursors
                .entry((channel.to_string(), group.to_string()))
                .or_insert(0);
            if let Some(member) = members.get(*cursor % members.len()) {
                targets.push(member.tx.clone());
            }
            *cursor = cursor.wrapping_add(1);
        }

        targets
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn request(&self, channel: &str, method: &str, data: Value) -> Result<Value, BusError> {
        let server = self.inner.lock().servers.get(channel).cloned();
        let Some(server) = server else {
            return Err(BusError::NoResponders(channel.to_string()));
        };

        let (request, reply) = BusRequest::new(method.to_string(), data);
        if server.send(request).await.is_err() {
            self.inner.lock().servers.remove(channel);
            return Err(BusError::NoResponders(channel.to_string()));
        }

        match tokio::time::timeout(self.request_timeout, reply).await {
            Ok(Ok(result)) => result.map_err(BusError::Remote),
            Ok(Err(_)) => Err(BusError::NoReply(channel.to_string())),
            Err(_) => {
                warn!(target: "bus.memory", channel = %channel, method = %method, "Request timed out");
                Err(BusError::Timeout(channel.to_string()))
            }
        }
    }

    async fn serve(&self, channel: &str) -> Result<mpsc::Receiver<BusRequest>, BusError> {
        let mut inner = self.inner.lock();
        if inner
            .servers
            .get(channel)
            .is_some_and(|existing| !existing.is_closed())
        {
            return Err(BusError::ChannelTaken(channel.to_string()));
        }

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        inner.servers.insert(channel.to_string(), tx);
        debug!(target: "bus.memory", channel = %channel, "Serving channel");
        Ok(rx)
    }

    async fn publish(&self, channel: &str, method: &str, data: Value) -> Result<(), BusError> {
        for target in self.targets(channel) {
            let event = BusEvent {
                channel: channel.to_string(),
                method: method.to_string(),
                data: data.clone(),
            };
            if let Err(e) = target.try_send(event) {
                warn!(target: "bus.memory", channel = %channel, method = %method, error = %e, "Dropped event for slow subscriber");
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        group: Option<&str>,
    ) -> Result<mpsc::Receiver<BusEvent>, BusError> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        self.inner
            .lock()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber {
                group: group.map(str::to_string),
                tx,
            });
        debug!(target: "bus.memory", channel = %channel, group = ?group, "Subscribed");
        Ok(rx)
    }
}
