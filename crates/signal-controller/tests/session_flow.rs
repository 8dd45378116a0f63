//! Peer sessions on a single coordinator: join, publish, subscribe, leave.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod harness;

use common::types::{StreamId, StreamLocation};
use harness::{offer, publish_payload, TestNode};
use sc_test_utils::{TestClient, TestCluster, TEST_LOCATION_ID};
use serde_json::json;
use signal_controller::transport::{run_listener, DEFAULT_MAILBOX_CAPACITY};
use signal_protocol::client::{PublishResponse, PubsResponse, SubscribeResponse, UsersResponse};
use signal_protocol::ErrorCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_join_reports_room_roster() {
    let cluster = TestCluster::start().await;
    let node = TestNode::start(&cluster, "sc-a").await;

    let mut alice = node.connect();
    let joined = alice.join("room", "alice").await;
    assert!(joined.users.is_empty());
    assert!(joined.pubs.is_empty());

    let mut bob = node.connect();
    let joined = bob.join("room", "bob").await;
    assert_eq!(joined.users.len(), 1);
    let other = joined.users.first().unwrap();
    assert_eq!(other.user_id, "alice");
    assert_eq!(other.node_id, "sc-a");

    let join = alice.expect_notification("peer-join").await;
    assert_eq!(join, json!({"rid": "room", "uid": "bob", "bizid": "sc-a"}));

    let owner = cluster.location_client().get_owner("room", "bob").await.unwrap();
    assert_eq!(owner, "sc-a");
    assert_eq!(node.registration.load_gauge().get(), 2);
}

#[tokio::test]
async fn test_requests_before_join_are_rejected() {
    let cluster = TestCluster::start().await;
    let node = TestNode::start(&cluster, "sc-a").await;
    let mut client = node.connect();

    let err = client
        .request("keepalive", json!({"rid": "room"}))
        .await
        .unwrap_err();
    assert_eq!(err.0, ErrorCode::UidNotFound.code());
}

#[tokio::test]
async fn test_invalid_requests_use_catalog_codes() {
    let cluster = TestCluster::start().await;
    let node = TestNode::start(&cluster, "sc-a").await;
    let mut client = node.connect();

    let err = client.request("join", json!({"uid": "alice"})).await.unwrap_err();
    assert_eq!(err.0, ErrorCode::RidNotFound.code());

    let err = client.request("teleport", json!({"rid": "room"})).await.unwrap_err();
    assert_eq!(err.0, ErrorCode::Unknown.code());

    client.join("room", "alice").await;
    let err = client
        .request("publish", json!({"rid": "room", "jsep": offer()}))
        .await
        .unwrap_err();
    assert_eq!(err.0, ErrorCode::MinfoNotFound.code());

    // The connection survives rejected requests.
    client
        .request("keepalive", json!({"rid": "room"}))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_publish_subscribe_unpublish() {
    let cluster = TestCluster::start().await;
    let busy = cluster.add_relay("relay-1", 10).await;
    let idle = cluster.add_relay("relay-2", 1).await;
    let node = TestNode::start(&cluster, "sc-a").await;

    let mut alice = node.connect();
    alice.join("room", "alice").await;
    let mut bob = node.connect();
    bob.join("room", "bob").await;

    let published: PublishResponse = serde_json::from_value(
        alice.request("publish", publish_payload("room")).await.unwrap(),
    )
    .unwrap();
    assert_eq!(published.sfuid, "relay-2");
    assert_eq!(published.mid.owner(), "alice");
    assert_eq!(published.jsep.kind, "answer");
    assert!(idle.has_stream(&published.mid));
    assert!(busy.streams().is_empty());

    let added: StreamLocation =
        serde_json::from_value(bob.expect_notification("stream-add").await).unwrap();
    assert_eq!(added.stream_id, published.mid);
    assert_eq!(added.relay_id, "relay-2");
    assert!(added.media_info.is_some_and(|m| m.video));

    let pubs: PubsResponse = serde_json::from_value(
        bob.request("getpubs", json!({"rid": "room"})).await.unwrap(),
    )
    .unwrap();
    assert_eq!(pubs.pubs.len(), 1);

    let subscribed: SubscribeResponse = serde_json::from_value(
        bob.request(
            "subscribe",
            json!({"rid": "room", "mid": published.mid, "jsep": offer()}),
        )
        .await
        .unwrap(),
    )
    .unwrap();
    assert!(subscribed.sid.starts_with("bob-"));
    assert_eq!(idle.subscription_count(), 1);

    bob.request(
        "unsubscribe",
        json!({"rid": "room", "mid": published.mid, "sid": subscribed.sid}),
    )
    .await
    .unwrap();
    assert_eq!(idle.subscription_count(), 0);

    alice
        .request("unpublish", json!({"rid": "room", "mid": published.mid}))
        .await
        .unwrap();
    let removed = bob.expect_notification("stream-remove").await;
    assert_eq!(removed["mid"], json!(published.mid.as_str()));
    assert!(!idle.has_stream(&published.mid));

    let err = cluster
        .location_client()
        .get_relay("room", &published.mid)
        .await
        .unwrap_err();
    assert_eq!(err.code(), location_registry::error::CODE_RELAY_NOT_FOUND);
}

#[tokio::test]
async fn test_publish_without_relay_is_rejected() {
    let cluster = TestCluster::start().await;
    let node = TestNode::start(&cluster, "sc-a").await;
    let mut alice = node.connect();
    alice.join("room", "alice").await;

    let err = alice
        .request("publish", publish_payload("room"))
        .await
        .unwrap_err();
    assert_eq!(err.0, ErrorCode::RelayNotFound.code());
}

#[tokio::test]
async fn test_publish_rejects_foreign_stream_id() {
    let cluster = TestCluster::start().await;
    let relay = cluster.add_relay("relay-1", 0).await;
    relay.forge_stream_owner("mallory");
    let node = TestNode::start(&cluster, "sc-a").await;
    let mut alice = node.connect();
    alice.join("room", "alice").await;

    let err = alice
        .request("publish", publish_payload("room"))
        .await
        .unwrap_err();
    assert_eq!(err.0, ErrorCode::Unknown.code());

    // The relay publication was rolled back and nothing was recorded.
    assert!(relay.streams().is_empty());
    assert_eq!(relay.calls(), vec!["publish", "unpublish"]);
    let pubs = cluster
        .location_client()
        .room_streams("room", "")
        .await
        .unwrap();
    assert!(pubs.is_empty());
}

#[tokio::test]
async fn test_subscribe_to_vanished_stream_cleans_registry() {
    let cluster = TestCluster::start().await;
    let relay = cluster.add_relay("relay-1", 0).await;
    let node = TestNode::start(&cluster, "sc-a").await;

    let mut alice = node.connect();
    alice.join("room", "alice").await;
    let mut bob = node.connect();
    bob.join("room", "bob").await;

    let published: PublishResponse = serde_json::from_value(
        alice.request("publish", publish_payload("room")).await.unwrap(),
    )
    .unwrap();
    bob.expect_notification("stream-add").await;

    // The relay loses the stream and its event never arrives.
    relay.drop_stream(&published.mid);

    let err = bob
        .request(
            "subscribe",
            json!({"rid": "room", "mid": published.mid, "jsep": offer()}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.0, signal_protocol::relay::STREAM_GONE);

    let removed = bob.expect_notification("stream-remove").await;
    assert_eq!(removed["mid"], json!(published.mid.as_str()));

    let pubs: PubsResponse = serde_json::from_value(
        bob.request("getpubs", json!({"rid": "room"})).await.unwrap(),
    )
    .unwrap();
    assert!(pubs.pubs.is_empty());
}

#[tokio::test]
async fn test_stream_gone_twice_is_announced_once() {
    let cluster = TestCluster::start().await;
    let relay = cluster.add_relay("relay-1", 0).await;
    let node = TestNode::start(&cluster, "sc-a").await;

    let mut alice = node.connect();
    alice.join("room", "alice").await;
    let mut bob = node.connect();
    bob.join("room", "bob").await;
    let mut carol = node.connect();
    carol.join("room", "carol").await;

    let published: PublishResponse = serde_json::from_value(
        alice.request("publish", publish_payload("room")).await.unwrap(),
    )
    .unwrap();
    carol.expect_notification("stream-add").await;
    relay.drop_stream(&published.mid);

    // The first miss cleans up the registry; the second finds nothing left.
    let subscribe = json!({
        "rid": "room",
        "mid": published.mid,
        "jsep": offer(),
        "sfuid": "relay-1"
    });
    for _ in 0..2 {
        let err = bob.request("subscribe", subscribe.clone()).await.unwrap_err();
        assert_eq!(err.0, signal_protocol::relay::STREAM_GONE);
    }

    bob.request("broadcast", json!({"rid": "room", "data": "done"}))
        .await
        .unwrap();
    carol.expect_notification("broadcast").await;

    let removes: Vec<_> = carol
        .try_notifications()
        .into_iter()
        .filter(|note| note.method == "stream-remove")
        .collect();
    assert_eq!(removes.len(), 1);
    assert_eq!(removes.first().unwrap().data["mid"], json!(published.mid.as_str()));
}

#[tokio::test]
async fn test_subscribe_to_unknown_stream() {
    let cluster = TestCluster::start().await;
    let _relay = cluster.add_relay("relay-1", 0).await;
    let node = TestNode::start(&cluster, "sc-a").await;
    let mut bob = node.connect();
    bob.join("room", "bob").await;

    let err = bob
        .request(
            "subscribe",
            json!({"rid": "room", "mid": StreamId::from("ghost#abcdef"), "jsep": offer()}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.0, ErrorCode::RelayNotFound.code());

    let err = bob
        .request(
            "subscribe",
            json!({"rid": "room", "mid": "ghost#abcdef", "jsep": offer(), "sfuid": "relay-9"}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.0, ErrorCode::RelayRpcNotFound.code());
}

#[tokio::test]
async fn test_broadcast_reaches_others_only() {
    let cluster = TestCluster::start().await;
    let node = TestNode::start(&cluster, "sc-a").await;
    let mut alice = node.connect();
    alice.join("room", "alice").await;
    let mut bob = node.connect();
    bob.join("room", "bob").await;

    alice
        .request("broadcast", json!({"rid": "room", "data": {"chat": "hi"}}))
        .await
        .unwrap();

    let message = bob.expect_notification("broadcast").await;
    assert_eq!(message, json!({"rid": "room", "uid": "alice", "data": {"chat": "hi"}}));
    assert!(alice
        .try_notifications()
        .iter()
        .all(|note| note.method != "broadcast"));
}

#[tokio::test]
async fn test_get_users_excludes_caller() {
    let cluster = TestCluster::start().await;
    let node = TestNode::start(&cluster, "sc-a").await;
    let mut alice = node.connect();
    alice.join("room", "alice").await;
    let mut bob = node.connect();
    bob.join("room", "bob").await;

    let users: UsersResponse = serde_json::from_value(
        alice.request("getusers", json!({"rid": "room"})).await.unwrap(),
    )
    .unwrap();
    let ids: Vec<&str> = users.users.iter().map(|u| u.user_id.as_str()).collect();
    assert_eq!(ids, vec!["bob"]);
}

#[tokio::test]
async fn test_leave_notifies_room_and_keeps_connection() {
    let cluster = TestCluster::start().await;
    let relay = cluster.add_relay("relay-1", 0).await;
    let node = TestNode::start(&cluster, "sc-a").await;
    let mut alice = node.connect();
    alice.join("room", "alice").await;
    let mut bob = node.connect();
    bob.join("room", "bob").await;

    alice
        .request("publish", publish_payload("room"))
        .await
        .unwrap();
    bob.expect_notification("stream-add").await;

    alice.request("leave", json!({"rid": "room"})).await.unwrap();

    let removed = bob.expect_notification("stream-remove").await;
    assert_eq!(removed["uid"], json!("alice"));
    let left = bob.expect_notification("peer-leave").await;
    assert_eq!(left, json!({"rid": "room", "uid": "alice"}));
    assert!(!node.holds("room", "alice"));
    assert_eq!(relay.streams().len(), 1);

    // Still connected, but no longer a member.
    let err = alice
        .request("keepalive", json!({"rid": "room"}))
        .await
        .unwrap_err();
    assert_eq!(err.0, ErrorCode::RidNotFound.code());
    assert!(!alice.is_closed());
}

#[tokio::test]
async fn test_rejoin_on_same_node_replaces_connection() {
    let cluster = TestCluster::start().await;
    let node = TestNode::start(&cluster, "sc-a").await;
    let mut bob = node.connect();
    bob.join("room", "bob").await;

    let mut first = node.connect();
    first.join("room", "alice").await;
    let mut second = node.connect();
    second.join("room", "alice").await;

    first.wait_closed().await;
    assert!(node.holds("room", "alice"));
    assert_eq!(node.coordinator.rooms().peer_count(), 2);

    second
        .request("keepalive", json!({"rid": "room"}))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_join_without_location_registry() {
    let cluster = TestCluster::start().await;
    cluster.backend().delete(TEST_LOCATION_ID).await.unwrap();
    let node = TestNode::start(&cluster, "sc-a").await;
    let mut alice = node.connect();

    let err = alice
        .request("join", json!({"rid": "room", "uid": "alice"}))
        .await
        .unwrap_err();
    assert_eq!(err.0, ErrorCode::LocationNotFound.code());
    assert!(!node.holds("room", "alice"));
}

#[tokio::test]
async fn test_unreachable_location_uses_catalog_code() {
    let cluster = TestCluster::start().await;
    // Registered with the lowest id, but nothing serves its channel.
    let _silent = cluster
        .register(service_registry::Node::new(
            sc_test_utils::TEST_REGION,
            "location-0",
            service_registry::service::LOCATION,
        ))
        .await;
    let node = TestNode::start(&cluster, "sc-a").await;
    node.wait_for_nodes(&["location-0"]).await;

    let mut alice = node.connect();
    let (code, reason) = alice
        .request("join", json!({"rid": "room", "uid": "alice"}))
        .await
        .unwrap_err();
    assert_eq!(code, ErrorCode::LocationRpcNotFound.code());
    assert_eq!(reason, ErrorCode::LocationRpcNotFound.reason());
    assert!(!reason.contains("location-0"));

    // Nothing was attached for the failed join.
    assert!(!node.holds("room", "alice"));
    assert!(node.coordinator.rooms().get("room").is_none());
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let cluster = TestCluster::start().await;
    let node = TestNode::start(&cluster, "sc-a").await;
    let mut alice = node.connect();
    alice.join("room", "alice").await;

    // Declared length 4097, one past the limit.
    alice.send_raw(&[0x01, 0x10]).await;
    alice.wait_closed().await;
}

#[tokio::test]
async fn test_tcp_listener_serves_peers() {
    let cluster = TestCluster::start().await;
    let node = TestNode::start(&cluster, "sc-a").await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(run_listener(
        listener,
        Arc::clone(&node.coordinator),
        DEFAULT_MAILBOX_CAPACITY,
        shutdown.clone(),
    ));

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut alice = TestClient::new(stream);
    alice.join("room", "alice").await;
    assert!(node.holds("room", "alice"));

    shutdown.cancel();
    alice.wait_closed().await;
}
