//! Redis-backed message bus.
//!
//! Connects nodes running in separate processes through the Redis that
//! already holds the service registry. Delivery is built on lists, so a
//! popped message reaches exactly one reader:
//!
//! - `/bus/server/{channel}`: claim held by the instance serving a channel
//! - `/bus/rpc/{channel}`: requests waiting for that server
//! - `/bus/reply/{instance}`: replies addressed to one bus instance
//! - `/bus/subs/{channel}`: subscription leases `{group}|{queue}`, scored by
//!   expiry in epoch milliseconds
//! - `/bus/queue/{id}`: events for one subscription
//! - `/bus/cursor/{channel}/{group}`: round-robin position of a group
//!
//! Claims and leases lapse when their holder dies, so a crashed process
//! stops receiving work within [`LEASE`].

use crate::bus::{BusEvent, BusRequest, MessageBus};
use crate::error::{BusError, RpcError};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

const NAMESPACE: &str = "/bus/";

/// Lifetime of a server claim or subscription lease. Holders renew at a
/// third of it.
pub const LEASE: Duration = Duration::from_secs(6);

/// Seconds a blocking pop waits before its loop re-checks for shutdown.
const POP_TIMEOUT_SECS: u64 = 1;

/// Idle lifetime of queues and reply lists nobody pops any more.
const QUEUE_TTL_SECS: u64 = 60;

const CHANNEL_BUFFER: usize = 1024;
const RETRY_DELAY: Duration = Duration::from_millis(500);

const RENEW_CLAIM: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0";

const RELEASE_CLAIM: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0";

type ReplySlot = oneshot::Sender<Option<Result<Value, RpcError>>>;
type PendingReplies = Mutex<HashMap<u64, ReplySlot>>;

#[derive(Debug, Serialize, Deserialize)]
struct WireRequest {
    id: u64,
    reply_to: String,
    method: String,
    data: Value,
}

/// `result` is `None` when the server dropped the request unanswered.
#[derive(Debug, Serialize, Deserialize)]
struct WireReply {
    id: u64,
    result: Option<Result<Value, RpcError>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    method: String,
    data: Value,
}

fn server_key(channel: &str) -> String {
    format!("{NAMESPACE}server/{channel}")
}

fn request_key(channel: &str) -> String {
    format!("{NAMESPACE}rpc/{channel}")
}

fn reply_key(instance_id: &str) -> String {
    format!("{NAMESPACE}reply/{instance_id}")
}

fn subscribers_key(channel: &str) -> String {
    format!("{NAMESPACE}subs/{channel}")
}

fn queue_key(id: &Uuid) -> String {
    format!("{NAMESPACE}queue/{id}")
}

fn cursor_key(channel: &str, group: &str) -> String {
    format!("{NAMESPACE}cursor/{channel}/{group}")
}

fn lease_member(group: Option<&str>, queue: &str) -> String {
    format!("{}|{queue}", group.unwrap_or_default())
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        })
}

fn lease_millis() -> u64 {
    u64::try_from(LEASE.as_millis()).unwrap_or(u64::MAX)
}

fn transport(op: &str, e: &redis::RedisError) -> BusError {
    BusError::Transport(format!("{op} failed: {e}"))
}

/// Live subscriptions of one channel.
#[derive(Debug, Default, PartialEq, Eq)]
struct Subscribers {
    ungrouped: Vec<String>,
    /// Queues per consumer group, sorted so every publisher agrees on the
    /// round-robin order.
    groups: BTreeMap<String, Vec<String>>,
}

impl Subscribers {
    fn parse(members: &[String]) -> Self {
        let mut subscribers = Self::default();
        for member in members {
            // Queue keys never contain '|', group names might.
            let Some((group, queue)) = member.rsplit_once('|') else {
                continue;
            };
            if group.is_empty() {
                subscribers.ungrouped.push(queue.to_string());
            } else {
                subscribers
                    .groups
                    .entry(group.to_string())
                    .or_default()
                    .push(queue.to_string());
            }
        }
        for queues in subscribers.groups.values_mut() {
            queues.sort();
        }
        subscribers
    }

    fn is_empty(&self) -> bool {
        self.ungrouped.is_empty() && self.groups.is_empty()
    }
}

/// Group member that takes the event at `cursor`.
fn pick(queues: &[String], cursor: u64) -> Option<&String> {
    let len = u64::try_from(queues.len()).ok().filter(|len| *len > 0)?;
    queues.get(usize::try_from(cursor % len).ok()?)
}

async fn push(
    conn: &mut MultiplexedConnection,
    key: &str,
    payload: &str,
    ttl_secs: u64,
) -> Result<(), BusError> {
    let _: () = redis::pipe()
        .cmd("LPUSH")
        .arg(key)
        .arg(payload)
        .ignore()
        .cmd("EXPIRE")
        .arg(key)
        .arg(ttl_secs.max(1))
        .ignore()
        .query_async(conn)
        .await
        .map_err(|e| transport("LPUSH", &e))?;
    Ok(())
}

/// Blocking pop with the loop timeout. `Ok(None)` when nothing arrived.
async fn pop(conn: &mut MultiplexedConnection, key: &str) -> Result<Option<String>, BusError> {
    let popped: Option<(String, String)> = redis::cmd("BRPOP")
        .arg(key)
        .arg(POP_TIMEOUT_SECS)
        .query_async(conn)
        .await
        .map_err(|e| transport("BRPOP", &e))?;
    Ok(popped.map(|(_, payload)| payload))
}

/// [`MessageBus`] shared by every process connected to one Redis.
///
/// Blocking pops run on dedicated connections, one per serve or subscribe
/// loop plus one for replies; everything else shares a multiplexed
/// connection.
pub struct RedisBus {
    client: Client,
    connection: MultiplexedConnection,
    instance_id: String,
    pending: Arc<PendingReplies>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl RedisBus {
    /// Connect and start receiving replies.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Transport`] if the client cannot be opened or
    /// connected.
    pub async fn connect(redis_url: &str, request_timeout: Duration) -> Result<Self, BusError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do not log the URL, it may carry credentials.
            error!(target: "bus.redis", error = %e, "Failed to open Redis client");
            transport("open", &e)
        })?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "bus.redis", error = %e, "Failed to connect to Redis");
                transport("connect", &e)
            })?;
        let replies = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| transport("connect", &e))?;

        let instance_id = Uuid::new_v4().to_string();
        let pending = Arc::new(PendingReplies::default());
        tokio::spawn(dispatch_replies(
            replies,
            reply_key(&instance_id),
            Arc::downgrade(&pending),
        ));

        Ok(Self {
            client,
            connection,
            instance_id,
            pending,
            next_id: AtomicU64::new(1),
            request_timeout,
        })
    }

    /// Unique id of this bus instance; names its reply list.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn blocking_connection(&self) -> Result<MultiplexedConnection, BusError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| transport("connect", &e))
    }
}

/// Route replies to their waiting requests until the bus is dropped.
async fn dispatch_replies(
    mut conn: MultiplexedConnection,
    key: String,
    pending: Weak<PendingReplies>,
) {
    while pending.strong_count() > 0 {
        let payload = match pop(&mut conn, &key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(e) => {
                warn!(target: "bus.redis", error = %e, "Reply pop failed");
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };
        let reply: WireReply = match serde_json::from_str(&payload) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(target: "bus.redis", error = %e, "Discarding undecodable reply");
                continue;
            }
        };
        let Some(pending) = pending.upgrade() else {
            break;
        };
        let slot = pending.lock().remove(&reply.id);
        match slot {
            Some(slot) => {
                let _ = slot.send(reply.result);
            }
            None => debug!(target: "bus.redis", id = reply.id, "Reply arrived after its request gave up"),
        }
    }
    debug!(target: "bus.redis", "Reply dispatcher stopped");
}

/// Serve loop for one claimed channel.
struct ChannelServer {
    channel: String,
    instance_id: String,
    connection: MultiplexedConnection,
    popper: MultiplexedConnection,
    tx: mpsc::Sender<BusRequest>,
}

impl ChannelServer {
    async fn run(mut self) {
        let claim = server_key(&self.channel);
        let requests = request_key(&self.channel);
        let mut renewed = Instant::now();

        while !self.tx.is_closed() {
            if renewed.elapsed() >= LEASE / 3 {
                if !self.renew_claim(&claim).await {
                    error!(target: "bus.redis", channel = %self.channel, "Channel claim lost to another server, stopping");
                    break;
                }
                renewed = Instant::now();
            }

            let payload = match pop(&mut self.popper, &requests).await {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    warn!(target: "bus.redis", channel = %self.channel, error = %e, "Request pop failed");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };
            match serde_json::from_str::<WireRequest>(&payload) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => {
                    warn!(target: "bus.redis", channel = %self.channel, error = %e, "Discarding undecodable request");
                }
            }
        }

        let released: Result<i64, _> = Script::new(RELEASE_CLAIM)
            .key(&claim)
            .arg(&self.instance_id)
            .invoke_async(&mut self.connection)
            .await;
        if let Err(e) = released {
            warn!(target: "bus.redis", channel = %self.channel, error = %e, "Claim release failed, it will lapse");
        }
        debug!(target: "bus.redis", channel = %self.channel, "Stopped serving channel");
    }

    /// Extend the claim, or take it back if it lapsed unclaimed.
    async fn renew_claim(&mut self, claim: &str) -> bool {
        let renewed: Result<i64, _> = Script::new(RENEW_CLAIM)
            .key(claim)
            .arg(&self.instance_id)
            .arg(lease_millis())
            .invoke_async(&mut self.connection)
            .await;
        match renewed {
            Ok(1) => true,
            Ok(_) => {
                let reclaimed: Result<Option<String>, _> = redis::cmd("SET")
                    .arg(claim)
                    .arg(&self.instance_id)
                    .arg("NX")
                    .arg("PX")
                    .arg(lease_millis())
                    .query_async(&mut self.connection)
                    .await;
                matches!(reclaimed, Ok(Some(_)))
            }
            Err(e) => {
                // Keep serving; the next renewal retries.
                warn!(target: "bus.redis", channel = %self.channel, error = %e, "Claim renewal failed");
                true
            }
        }
    }

    async fn dispatch(&self, wire: WireRequest) {
        let WireRequest {
            id,
            reply_to,
            method,
            data,
        } = wire;
        let (request, reply) = BusRequest::new(method, data);
        // A failed send drops the request, which answers "no reply" below.
        let _ = self.tx.send(request).await;

        let mut conn = self.connection.clone();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            let result = reply.await.ok();
            let payload = match serde_json::to_string(&WireReply { id, result }) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(target: "bus.redis", channel = %channel, error = %e, "Reply not encodable");
                    return;
                }
            };
            if let Err(e) = push(&mut conn, &reply_to, &payload, QUEUE_TTL_SECS).await {
                warn!(target: "bus.redis", channel = %channel, error = %e, "Reply push failed");
            }
        });
    }
}

/// Receive loop for one subscription queue.
struct Subscription {
    channel: String,
    queue: String,
    member: String,
    connection: MultiplexedConnection,
    popper: MultiplexedConnection,
    tx: mpsc::Sender<BusEvent>,
}

impl Subscription {
    async fn renew_lease(&mut self) -> Result<(), BusError> {
        let expiry = epoch_millis().saturating_add(lease_millis());
        let _: () = redis::cmd("ZADD")
            .arg(subscribers_key(&self.channel))
            .arg(expiry)
            .arg(&self.member)
            .query_async(&mut self.connection)
            .await
            .map_err(|e| transport("ZADD", &e))?;
        Ok(())
    }

    async fn run(mut self) {
        let mut renewed = Instant::now();

        while !self.tx.is_closed() {
            if renewed.elapsed() >= LEASE / 3 {
                if let Err(e) = self.renew_lease().await {
                    warn!(target: "bus.redis", channel = %self.channel, error = %e, "Subscription renewal failed");
                }
                renewed = Instant::now();
            }

            let payload = match pop(&mut self.popper, &self.queue).await {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    warn!(target: "bus.redis", channel = %self.channel, error = %e, "Event pop failed");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };
            let event: WireEvent = match serde_json::from_str(&payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(target: "bus.redis", channel = %self.channel, error = %e, "Discarding undecodable event");
                    continue;
                }
            };
            let event = BusEvent {
                channel: self.channel.clone(),
                method: event.method,
                data: event.data,
            };
            if self.tx.send(event).await.is_err() {
                break;
            }
        }

        let cleanup: Result<(), _> = redis::pipe()
            .cmd("ZREM")
            .arg(subscribers_key(&self.channel))
            .arg(&self.member)
            .ignore()
            .cmd("DEL")
            .arg(&self.queue)
            .ignore()
            .query_async(&mut self.connection)
            .await;
        if let Err(e) = cleanup {
            warn!(target: "bus.redis", channel = %self.channel, error = %e, "Subscription cleanup failed, its lease will lapse");
        }
        debug!(target: "bus.redis", channel = %self.channel, "Subscription closed");
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn request(&self, channel: &str, method: &str, data: Value) -> Result<Value, BusError> {
        let mut conn = self.connection.clone();
        let served: bool = redis::cmd("EXISTS")
            .arg(server_key(channel))
            .query_async(&mut conn)
            .await
            .map_err(|e| transport("EXISTS", &e))?;
        if !served {
            return Err(BusError::NoResponders(channel.to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_string(&WireRequest {
            id,
            reply_to: reply_key(&self.instance_id),
            method: method.to_string(),
            data,
        })
        .map_err(|e| BusError::Encode(e.to_string()))?;

        let (slot, reply) = oneshot::channel();
        self.pending.lock().insert(id, slot);
        // Requests nobody popped within the timeout are stale for every caller.
        let ttl = self.request_timeout.as_secs().saturating_add(1);
        if let Err(e) = push(&mut conn, &request_key(channel), &payload, ttl).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, reply).await {
            Ok(Ok(Some(result))) => result.map_err(BusError::Remote),
            Ok(Ok(None) | Err(_)) => Err(BusError::NoReply(channel.to_string())),
            Err(_) => {
                self.pending.lock().remove(&id);
                warn!(target: "bus.redis", channel = %channel, method = %method, "Request timed out");
                Err(BusError::Timeout(channel.to_string()))
            }
        }
    }

    async fn serve(&self, channel: &str) -> Result<mpsc::Receiver<BusRequest>, BusError> {
        let mut conn = self.connection.clone();
        let claimed: Option<String> = redis::cmd("SET")
            .arg(server_key(channel))
            .arg(&self.instance_id)
            .arg("NX")
            .arg("PX")
            .arg(lease_millis())
            .query_async(&mut conn)
            .await
            .map_err(|e| transport("SET", &e))?;
        if claimed.is_none() {
            return Err(BusError::ChannelTaken(channel.to_string()));
        }

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let server = ChannelServer {
            channel: channel.to_string(),
            instance_id: self.instance_id.clone(),
            connection: conn,
            popper: self.blocking_connection().await?,
            tx,
        };
        tokio::spawn(server.run());
        debug!(target: "bus.redis", channel = %channel, "Serving channel");
        Ok(rx)
    }

    async fn publish(&self, channel: &str, method: &str, data: Value) -> Result<(), BusError> {
        let mut conn = self.connection.clone();
        let key = subscribers_key(channel);
        let (_, members): (u64, Vec<String>) = redis::pipe()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(epoch_millis())
            .cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| transport("ZRANGE", &e))?;

        let subscribers = Subscribers::parse(&members);
        if subscribers.is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_string(&WireEvent {
            method: method.to_string(),
            data,
        })
        .map_err(|e| BusError::Encode(e.to_string()))?;

        let mut targets = subscribers.ungrouped.clone();
        for (group, queues) in &subscribers.groups {
            let cursor: u64 = redis::cmd("INCR")
                .arg(cursor_key(channel, group))
                .query_async(&mut conn)
                .await
                .map_err(|e| transport("INCR", &e))?;
            if let Some(queue) = pick(queues, cursor.wrapping_sub(1)) {
                targets.push(queue.clone());
            }
        }

        for queue in targets {
            if let Err(e) = push(&mut conn, &queue, &payload, QUEUE_TTL_SECS).await {
                warn!(target: "bus.redis", channel = %channel, method = %method, error = %e, "Dropped event for subscriber");
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        group: Option<&str>,
    ) -> Result<mpsc::Receiver<BusEvent>, BusError> {
        let queue = queue_key(&Uuid::new_v4());
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let mut subscription = Subscription {
            channel: channel.to_string(),
            member: lease_member(group, &queue),
            queue,
            connection: self.connection.clone(),
            popper: self.blocking_connection().await?,
            tx,
        };
        subscription.renew_lease().await?;
        tokio::spawn(subscription.run());
        debug!(target: "bus.redis", channel = %channel, group = ?group, "Subscribed");
        Ok(rx)
    }
}
