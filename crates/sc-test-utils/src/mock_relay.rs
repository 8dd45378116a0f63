//! Scriptable relay node.
//!
//! Serves the relay RPC contract on `rpc-{node-id}` with in-memory stream
//! and subscription tables, and lets tests inject the failures a real relay
//! produces: streams vanishing underneath a subscriber, load changes, and a
//! misbehaving relay that hands back someone else's stream id.

use crate::cluster::{TestCluster, TEST_REGION};
use common::catalog::MethodCatalog;
use common::types::{RemovedStream, StreamId};
use message_bus::{event_channel, rpc_channel, BusRequest, MessageBus};
use parking_lot::Mutex;
use serde_json::{json, Value};
use service_registry::{service, Node, NodeRegistration};
use signal_protocol::client::SessionDescription;
use signal_protocol::relay::{PublishAnswer, RelayEvent, RelayRequest, SubscribeAnswer, STREAM_GONE};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Status a relay returns for a subscription id it never issued.
pub const UNKNOWN_SUBSCRIPTION: i32 = 404;

/// Status a relay returns for a method outside its contract.
pub const UNKNOWN_METHOD: i32 = 400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockStream {
    pub room_id: String,
    pub user_id: String,
}

#[derive(Default)]
struct RelayState {
    streams: HashMap<StreamId, MockStream>,
    subscriptions: HashMap<String, StreamId>,
    next_subscription: u64,
    forged_owner: Option<String>,
    calls: Vec<String>,
}

pub struct MockRelay {
    node_id: String,
    bus: Arc<dyn MessageBus>,
    registration: Arc<NodeRegistration>,
    state: Arc<Mutex<RelayState>>,
    cancel_token: CancellationToken,
}

impl MockRelay {
    /// Register a relay node in [`TEST_REGION`] and start serving.
    pub async fn start(cluster: &TestCluster, node_id: &str, load: u64) -> Self {
        let bus = cluster.bus();
        let mut requests = bus
            .serve(&rpc_channel(node_id))
            .await
            .expect("relay channel is free");

        let state = Arc::new(Mutex::new(RelayState::default()));
        let cancel_token = cluster.cancel_token().child_token();
        let loop_state = Arc::clone(&state);
        let loop_token = cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = loop_token.cancelled() => break,
                    request = requests.recv() => match request {
                        Some(request) => answer(&loop_state, request),
                        None => break,
                    },
                }
            }
        });

        let registration = cluster
            .register(Node::new(TEST_REGION, node_id, service::RELAY).with_load(load))
            .await;

        Self {
            node_id: node_id.to_string(),
            bus,
            registration,
            state,
            cancel_token,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Report a new load through the registry.
    pub async fn set_load(&self, load: u64) {
        self.registration.load_gauge().set(load);
        self.registration.register().await.expect("load update");
    }

    /// Make every following publish return a stream id owned by `owner`.
    pub fn forge_stream_owner(&self, owner: &str) {
        self.state.lock().forged_owner = Some(owner.to_string());
    }

    pub fn streams(&self) -> Vec<StreamId> {
        let mut streams: Vec<StreamId> = self.state.lock().streams.keys().cloned().collect();
        streams.sort();
        streams
    }

    pub fn has_stream(&self, stream_id: &StreamId) -> bool {
        self.state.lock().streams.contains_key(stream_id)
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Forget a stream without telling anyone, as if the relay lost it.
    pub fn drop_stream(&self, stream_id: &StreamId) -> Option<MockStream> {
        let mut state = self.state.lock();
        state.subscriptions.retain(|_, mid| mid != stream_id);
        state.streams.remove(stream_id)
    }

    /// Drop a stream and announce it on this relay's event channel.
    pub async fn announce_stream_removed(&self, stream_id: &StreamId) {
        let stream = self.drop_stream(stream_id).expect("stream is known");
        let event = RelayEvent::StreamRemove(RemovedStream {
            room_id: stream.room_id,
            user_id: stream.user_id,
            stream_id: stream_id.clone(),
        });
        let (method, data) = event.encode().expect("event encodes");
        self.bus
            .publish(&event_channel(&self.node_id), &method, data)
            .await
            .expect("event published");
    }

    /// Methods received so far, in arrival order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Stop serving and remove the node record.
    pub async fn stop(&self) {
        self.cancel_token.cancel();
        self.registration.deregister().await.expect("relay deregisters");
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn answer_sdp() -> SessionDescription {
    SessionDescription {
        kind: "answer".to_string(),
        sdp: "v=0".to_string(),
    }
}

fn encoded<T: serde::Serialize>(body: &T) -> Value {
    serde_json::to_value(body).expect("answer encodes")
}

fn answer(state: &Mutex<RelayState>, mut request: BusRequest) {
    let method = request.method.clone();
    state.lock().calls.push(method.clone());
    let data = std::mem::take(&mut request.data);
    let Ok(relay_request) = RelayRequest::decode(&method, data) else {
        request.reject(UNKNOWN_METHOD, format!("unknown method {method}"));
        return;
    };

    let mut state = state.lock();
    match relay_request {
        RelayRequest::Publish { rid, uid, .. } => {
            let owner = state.forged_owner.clone().unwrap_or_else(|| uid.clone());
            let mid = StreamId::generate(&owner);
            state.streams.insert(
                mid.clone(),
                MockStream {
                    room_id: rid,
                    user_id: uid,
                },
            );
            request.accept(encoded(&PublishAnswer {
                mid,
                jsep: answer_sdp(),
            }));
        }
        RelayRequest::Unpublish { mid, .. } => {
            if state.streams.remove(&mid).is_some() {
                state.subscriptions.retain(|_, stream| *stream != mid);
                request.accept(json!({}));
            } else {
                request.reject(STREAM_GONE, format!("stream {mid} not found"));
            }
        }
        RelayRequest::Subscribe { suid, mid, .. } => {
            if !state.streams.contains_key(&mid) {
                request.reject(STREAM_GONE, format!("stream {mid} not found"));
                return;
            }
            state.next_subscription += 1;
            let sid = format!("{suid}-{}", state.next_subscription);
            state.subscriptions.insert(sid.clone(), mid);
            request.accept(encoded(&SubscribeAnswer {
                sid,
                jsep: answer_sdp(),
            }));
        }
        RelayRequest::Unsubscribe { sid, .. } => {
            if state.subscriptions.remove(&sid).is_some() {
                request.accept(json!({}));
            } else {
                request.reject(UNKNOWN_SUBSCRIPTION, format!("subscription {sid} not found"));
            }
        }
    }
}
