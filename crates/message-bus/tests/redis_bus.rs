//! Two bus instances sharing one Redis, as two processes would.
//!
//! Needs a running Redis: `REDIS_URL=redis://127.0.0.1:6379 cargo test -p
//! message-bus -- --ignored`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use message_bus::{BusError, MessageBus, RedisBus, RpcError};
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

async fn connect() -> RedisBus {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    RedisBus::connect(&url, Duration::from_secs(3))
        .await
        .expect("Redis reachable")
}

/// Channel names unique to one test run.
fn channel(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires a running Redis (REDIS_URL)"]
async fn test_request_crosses_instances() {
    let server_bus = connect().await;
    let client_bus = connect().await;
    let rpc = channel("rpc-loc");

    let mut requests = server_bus.serve(&rpc).await.unwrap();
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            match request.method.as_str() {
                "getBizInfo" => request.reject(410, "owner not found"),
                _ => {
                    let echoed = json!({"method": request.method, "data": request.data});
                    request.accept(echoed);
                }
            }
        }
    });

    let reply = client_bus
        .request(&rpc, "onJoin", json!({"rid": "room", "uid": "alice"}))
        .await
        .unwrap();
    assert_eq!(
        reply,
        json!({"method": "onJoin", "data": {"rid": "room", "uid": "alice"}})
    );

    let err = client_bus
        .request(&rpc, "getBizInfo", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err, BusError::Remote(RpcError::new(410, "owner not found")));
}

#[tokio::test]
#[ignore = "requires a running Redis (REDIS_URL)"]
async fn test_unserved_channel_has_no_responders() {
    let bus = connect().await;
    let rpc = channel("rpc-nobody");
    let err = bus.request(&rpc, "ping", json!({})).await.unwrap_err();
    assert_eq!(err, BusError::NoResponders(rpc));
}

#[tokio::test]
#[ignore = "requires a running Redis (REDIS_URL)"]
async fn test_second_server_is_rejected_across_instances() {
    let first = connect().await;
    let second = connect().await;
    let rpc = channel("rpc-sc");

    let _serving = first.serve(&rpc).await.unwrap();
    let err = second.serve(&rpc).await.unwrap_err();
    assert_eq!(err, BusError::ChannelTaken(rpc));
}

#[tokio::test]
#[ignore = "requires a running Redis (REDIS_URL)"]
async fn test_dropped_request_reports_no_reply() {
    let server_bus = connect().await;
    let client_bus = connect().await;
    let rpc = channel("rpc-drop");

    let mut requests = server_bus.serve(&rpc).await.unwrap();
    tokio::spawn(async move {
        let request = requests.recv().await;
        drop(request);
    });

    let err = client_bus.request(&rpc, "ping", json!({})).await.unwrap_err();
    assert_eq!(err, BusError::NoReply(rpc));
}

#[tokio::test]
#[ignore = "requires a running Redis (REDIS_URL)"]
async fn test_events_fan_out_and_split_across_group() {
    let publisher = connect().await;
    let node_a = connect().await;
    let node_b = connect().await;
    let events = channel("event-relay");

    let mut plain = node_a.subscribe(&events, None).await.unwrap();
    let mut grouped_a = node_a.subscribe(&events, Some("coordinator")).await.unwrap();
    let mut grouped_b = node_b.subscribe(&events, Some("coordinator")).await.unwrap();

    for i in 0..4 {
        publisher
            .publish(&events, "stream-remove", json!({"i": i}))
            .await
            .unwrap();
    }

    let mut plain_seen = Vec::new();
    for _ in 0..4 {
        let event = tokio::time::timeout(Duration::from_secs(5), plain.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.channel, events);
        assert_eq!(event.method, "stream-remove");
        plain_seen.push(event.data["i"].as_i64().unwrap());
    }
    plain_seen.sort_unstable();
    assert_eq!(plain_seen, vec![0, 1, 2, 3]);

    // Each event reaches the group once; the two members share the work.
    let mut group_seen = Vec::new();
    let mut per_member = [0usize; 2];
    while group_seen.len() < 4 {
        tokio::select! {
            Some(event) = grouped_a.recv() => {
                per_member[0] += 1;
                group_seen.push(event.data["i"].as_i64().unwrap());
            }
            Some(event) = grouped_b.recv() => {
                per_member[1] += 1;
                group_seen.push(event.data["i"].as_i64().unwrap());
            }
            () = tokio::time::sleep(Duration::from_secs(5)) => panic!("group events missing"),
        }
    }
    group_seen.sort_unstable();
    assert_eq!(group_seen, vec![0, 1, 2, 3]);
    assert_eq!(per_member, [2, 2]);
}
