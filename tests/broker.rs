//! End-to-end broker behavior over real sockets.

mod common;

use std::time::Duration;

use common::{single_node_config, spawn_broker, TestClient};
use trellis::protocol::Packet;

/// An empty client id yields a broker-assigned identity that is accepted on
/// reconnect.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn assigned_client_id_survives_reconnect() {
    let broker = spawn_broker(single_node_config()).await;

    let (client, assigned) = TestClient::connect_assigned(broker.addr).await;
    drop(client);

    let (_client, code) = TestClient::connect_raw(broker.addr, &assigned).await;
    assert_eq!(code, 0, "assigned id must be accepted on reconnect");
}

/// A mangled client id is refused.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_client_id_is_refused() {
    let broker = spawn_broker(single_node_config()).await;
    let (_client, code) = TestClient::connect_raw(broker.addr, "definitely-not-an-id").await;
    assert_eq!(code, 0x02);
}

/// A key issued for one topic admits that topic and rejects siblings.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn issued_key_gates_subscriptions() {
    let broker = spawn_broker(single_node_config()).await;
    let (mut client, _id) = TestClient::connect_assigned(broker.addr).await;

    let key = client.request_key("teams.alpha.ch1.u1", "rw").await;

    let granted = client.subscribe(&format!("{key}/teams.alpha.ch1.u1")).await;
    assert_eq!(granted.grants, vec![0x00]);

    // Same key, different channel: rejected with a key error notification.
    let message_id = 99;
    client
        .send(Packet::Subscribe(trellis::protocol::Subscribe {
            message_id,
            filters: vec![format!("{key}/teams.alpha.ch2.u1")],
            is_forwarded: false,
        }))
        .await;
    let mut saw_key_error = false;
    loop {
        match client.recv().await {
            Packet::Publish(publish) if publish.topic == "trace/error/" => {
                let body: serde_json::Value = serde_json::from_slice(&publish.payload).unwrap();
                assert_eq!(body["id"], message_id);
                assert_eq!(body["code"], 421, "expected the invalid-key code");
                saw_key_error = true;
            }
            Packet::SubAck(ack) => {
                assert_eq!(ack.grants, vec![0x80]);
                break;
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }
    assert!(saw_key_error);
}

/// Publishing without the write permission is refused.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_only_key_cannot_publish() {
    let broker = spawn_broker(single_node_config()).await;
    let (mut client, _id) = TestClient::connect_assigned(broker.addr).await;

    let key = client.request_key("teams.alpha.ch1", "r").await;
    client
        .publish(&format!("{key}/teams.alpha.ch1"), &b"nope"[..])
        .await;
    let err = client.expect_publish("trace/error/").await;
    let body: serde_json::Value = serde_json::from_slice(&err.payload).unwrap();
    assert_eq!(body["code"], 403);
}

/// Trailing multi-wildcard subscriptions cover the subtree and nothing else.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_wildcard_subscription_scopes_to_subtree() {
    let broker = spawn_broker(single_node_config()).await;

    let (mut subscriber, _id) = TestClient::connect_assigned(broker.addr).await;
    let secondary = subscriber.request_client_id("0").await;
    let mut publisher = TestClient::connect(broker.addr, &secondary).await;

    let sub_key = subscriber.request_key("teams.alpha...", "r").await;
    assert_eq!(
        subscriber
            .subscribe(&format!("{sub_key}/teams.alpha..."))
            .await
            .grants,
        vec![0x00]
    );

    let alpha_key = publisher.request_key("teams.alpha.ch1.u1", "w").await;
    let beta_key = publisher.request_key("teams.beta.ch1.u1", "w").await;

    let payload: Vec<u8> = (0..=255u8).collect();
    publisher
        .publish(&format!("{alpha_key}/teams.alpha.ch1.u1"), payload.clone())
        .await;
    publisher
        .publish(&format!("{beta_key}/teams.beta.ch1.u1"), &b"other"[..])
        .await;

    let got = subscriber.expect_publish("teams.alpha.ch1.u1").await;
    assert_eq!(&got.payload[..], &payload[..], "payload must be byte-exact");
    subscriber.expect_silence(Duration::from_millis(300)).await;
}

/// A single-level wildcard matches exactly one part.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_wildcard_matches_one_level_only() {
    let broker = spawn_broker(single_node_config()).await;

    let (mut subscriber, _id) = TestClient::connect_assigned(broker.addr).await;
    let secondary = subscriber.request_client_id("0").await;
    let mut publisher = TestClient::connect(broker.addr, &secondary).await;

    let sub_key = subscriber.request_key("teams.*.ch1.u1", "r").await;
    assert_eq!(
        subscriber
            .subscribe(&format!("{sub_key}/teams.*.ch1.u1"))
            .await
            .grants,
        vec![0x00]
    );

    let shallow_key = publisher.request_key("teams.alpha.ch1.u1", "w").await;
    let deep_key = publisher.request_key("teams.alpha.ch1.ch1.u1", "w").await;

    publisher
        .publish(&format!("{shallow_key}/teams.alpha.ch1.u1"), &b"one"[..])
        .await;
    publisher
        .publish(&format!("{deep_key}/teams.alpha.ch1.ch1.u1"), &b"two"[..])
        .await;

    let got = subscriber.expect_publish("teams.alpha.ch1.u1").await;
    assert_eq!(&got.payload[..], b"one");
    subscriber.expect_silence(Duration::from_millis(300)).await;
}

/// Distinct primary ids never see each other's traffic, even on identical
/// topic strings.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contracts_are_isolated() {
    let broker = spawn_broker(single_node_config()).await;

    let (mut tenant_a, _) = TestClient::connect_assigned(broker.addr).await;
    let (mut tenant_b, _) = TestClient::connect_assigned(broker.addr).await;

    let key_a = tenant_a.request_key("shared.topic", "rw").await;
    let key_b = tenant_b.request_key("shared.topic", "rw").await;

    assert_eq!(
        tenant_a
            .subscribe(&format!("{key_a}/shared.topic"))
            .await
            .grants,
        vec![0x00]
    );
    tenant_b
        .publish(&format!("{key_b}/shared.topic"), &b"b-traffic"[..])
        .await;
    tenant_a.expect_silence(Duration::from_millis(300)).await;
}

/// Unsubscribing stops delivery; refcounts only drop the trie entry on the
/// last reference.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unsubscribe_stops_delivery() {
    let broker = spawn_broker(single_node_config()).await;

    let (mut subscriber, _id) = TestClient::connect_assigned(broker.addr).await;
    let secondary = subscriber.request_client_id("0").await;
    let mut publisher = TestClient::connect(broker.addr, &secondary).await;

    let sub_key = subscriber.request_key("news.flash", "r").await;
    let pub_key = publisher.request_key("news.flash", "w").await;
    let filter = format!("{sub_key}/news.flash");

    subscriber.subscribe(&filter).await;
    publisher
        .publish(&format!("{pub_key}/news.flash"), &b"first"[..])
        .await;
    subscriber.expect_publish("news.flash").await;

    subscriber.unsubscribe(&filter).await;
    common::wait_for("trie to empty", || broker.service.subscriptions.is_empty()).await;

    publisher
        .publish(&format!("{pub_key}/news.flash"), &b"second"[..])
        .await;
    subscriber.expect_silence(Duration::from_millis(300)).await;
}

/// A subscriber that stops reading loses deliveries but neither stalls the
/// publisher nor gets disconnected.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_subscriber_drops_without_stalling_the_publisher() {
    let broker = spawn_broker(single_node_config()).await;

    let (mut subscriber, _id) = TestClient::connect_assigned(broker.addr).await;
    let secondary = subscriber.request_client_id("0").await;
    let mut publisher = TestClient::connect(broker.addr, &secondary).await;

    let sub_key = subscriber.request_key("firehose...", "r").await;
    let pub_key = publisher.request_key("firehose.data", "w").await;
    subscriber
        .subscribe(&format!("{sub_key}/firehose..."))
        .await;

    // The subscriber now stops reading entirely. Saturate its socket buffer
    // and then its send queue with large frames.
    let blob = vec![0xABu8; 48 * 1024];
    let start = std::time::Instant::now();
    for _ in 0..64 {
        publisher
            .publish(&format!("{pub_key}/firehose.data"), blob.clone())
            .await;
    }
    // The publisher's requests keep being served promptly.
    publisher.ping().await;
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "publisher stalled behind a slow subscriber"
    );

    // The slow subscriber is still connected; deliveries were dropped, not
    // the connection.
    assert_eq!(broker.service.conns.len(), 2);
    drop(subscriber);
}

/// Presence requests report current subscribers of a topic.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn presence_reports_subscribers() {
    let broker = spawn_broker(single_node_config()).await;

    let (mut subscriber, _id) = TestClient::connect_assigned(broker.addr).await;
    let secondary = subscriber.request_client_id("0").await;
    let mut observer = TestClient::connect(broker.addr, &secondary).await;

    let key = subscriber.request_key("rooms.lobby", "r").await;
    subscriber.subscribe(&format!("{key}/rooms.lobby")).await;

    let body = serde_json::json!({ "topic": "rooms.lobby" });
    observer
        .publish("unitd/presence", serde_json::to_vec(&body).unwrap())
        .await;
    let event = observer.expect_publish("unitd/presence").await;
    let parsed: serde_json::Value = serde_json::from_slice(&event.payload).unwrap();
    assert_eq!(parsed["topic"], "rooms.lobby");
    assert_eq!(parsed["status"], "online");
    assert_eq!(
        parsed["who"].as_array().map(Vec::len),
        Some(1),
        "one subscriber should be present"
    );
}

/// Secondary ids minted over the wire share the primary's contract.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn minted_secondary_shares_contract() {
    let broker = spawn_broker(single_node_config()).await;
    let (mut client, primary) = TestClient::connect_assigned(broker.addr).await;
    let secondary = client.request_client_id("0").await;

    let primary = trellis::ClientId::parse(&primary).unwrap();
    let secondary = trellis::ClientId::parse(&secondary).unwrap();
    assert_eq!(primary.contract(), secondary.contract());
    assert!(primary.is_primary());
    assert!(!secondary.is_primary());
}

/// Closing a connection releases its cache slot and trie entries.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_cleans_up() {
    let broker = spawn_broker(single_node_config()).await;

    let (mut client, _id) = TestClient::connect_assigned(broker.addr).await;
    let key = client.request_key("cleanup.test", "r").await;
    client.subscribe(&format!("{key}/cleanup.test")).await;
    common::wait_for("subscription to land", || {
        broker.service.subscriptions.len() == 1
    })
    .await;

    client.send(Packet::Disconnect).await;
    drop(client);

    common::wait_for("connection cache to drain", || {
        broker.service.conns.is_empty()
    })
    .await;
    common::wait_for("trie to drain", || broker.service.subscriptions.is_empty()).await;
}
