//! Shared helpers for integration tests: config builders, broker spawning,
//! and a minimal raw-socket client speaking the broker's own codec.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::time::timeout;

use trellis::broker::Service;
use trellis::core::config::Config;
use trellis::core::time::SystemClock;
use trellis::protocol::{read_packet, Connect, Packet, Publish, SubAck, Subscribe, Unsubscribe};
use trellis::{Cluster, Listener};

pub const MASTER_KEY_HEX: &str =
    "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

const RECV_DEADLINE: Duration = Duration::from_secs(10);

/// Allocate an ephemeral loopback port. Returns the address with assigned port.
pub fn ephemeral_port() -> SocketAddr {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("ephemeral addr")
}

/// Single-node broker config bound to an ephemeral port.
pub fn single_node_config() -> Config {
    let doc = format!(
        r#"
[listener]
bind = "127.0.0.1:0"

[security]
master_key_hex = "{MASTER_KEY_HEX}"

[telemetry]
log_level = "warn"
"#
    );
    toml::from_str(&doc).expect("test config parses")
}

/// Clustered broker config with explicit RPC bind and peers.
pub fn cluster_node_config(
    node_id: &str,
    rpc_bind: SocketAddr,
    peers: &[(&str, SocketAddr)],
) -> Config {
    let peer_list = peers
        .iter()
        .map(|(id, addr)| format!(r#"{{ node_id = "{id}", addr = "{addr}" }}"#))
        .collect::<Vec<_>>()
        .join(", ");
    let doc = format!(
        r#"
[listener]
bind = "127.0.0.1:0"

[security]
master_key_hex = "{MASTER_KEY_HEX}"

[cluster]
node_id = "{node_id}"
rpc_bind = "{rpc_bind}"
peers = [{peer_list}]

[telemetry]
log_level = "warn"
"#
    );
    toml::from_str(&doc).expect("test cluster config parses")
}

pub struct TestBroker {
    pub addr: SocketAddr,
    pub service: Arc<Service>,
    pub cluster: Option<Arc<Cluster>>,
}

/// Boot a broker from the given config and return its client address.
pub async fn spawn_broker(cfg: Config) -> TestBroker {
    let service = Service::new(&cfg, Arc::new(SystemClock)).expect("service boots");
    let cluster = if let Some(cluster_cfg) = &cfg.cluster {
        let cluster = Cluster::new(cluster_cfg);
        cluster.bind(&service);
        service.attach_cluster(Arc::clone(&cluster));
        cluster.start().await.expect("cluster starts");
        Some(cluster)
    } else {
        None
    };
    let addr = Listener::start(Arc::clone(&service), &cfg.listener)
        .await
        .expect("listener starts");
    TestBroker {
        addr,
        service,
        cluster,
    }
}

/// Poll a condition until it holds or the deadline passes.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + RECV_DEADLINE;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Minimal client driving the broker over a raw socket.
pub struct TestClient {
    stream: TcpStream,
    next_message_id: u16,
}

impl TestClient {
    /// Connect and require CONNACK success.
    pub async fn connect(addr: SocketAddr, client_id: &str) -> Self {
        let (client, code) = Self::connect_raw(addr, client_id).await;
        assert_eq!(code, 0, "expected CONNACK success");
        client
    }

    /// Connect and return the CONNACK code without asserting.
    pub async fn connect_raw(addr: SocketAddr, client_id: &str) -> (Self, u8) {
        let stream = TcpStream::connect(addr).await.expect("tcp connect");
        let mut client = Self {
            stream,
            next_message_id: 1,
        };
        client
            .send(Packet::Connect(Connect {
                client_id: client_id.to_string(),
                username: None,
                password: None,
                keep_alive: 30,
                clean_session: true,
            }))
            .await;
        let Packet::ConnAck(ack) = client.recv().await else {
            panic!("expected CONNACK");
        };
        (client, ack.code)
    }

    /// Connect with the empty id and wait for the assigned identity.
    pub async fn connect_assigned(addr: SocketAddr) -> (Self, String) {
        let mut client = Self::connect(addr, "").await;
        let assigned = client.expect_publish("$SYS/client_identifier/").await;
        let id = String::from_utf8(assigned.payload.to_vec()).expect("utf8 client id");
        assert!(!id.is_empty());
        (client, id)
    }

    pub async fn send(&mut self, packet: Packet) {
        use tokio::io::AsyncWriteExt;
        self.stream
            .write_all(&packet.encode())
            .await
            .expect("write packet");
    }

    pub async fn recv(&mut self) -> Packet {
        timeout(RECV_DEADLINE, read_packet(&mut self.stream, 1024 * 1024))
            .await
            .expect("recv deadline")
            .expect("decode packet")
    }

    /// Read until a PUBLISH on the given topic arrives; any other publish is
    /// a test failure.
    pub async fn expect_publish(&mut self, topic: &str) -> Publish {
        loop {
            if let Packet::Publish(publish) = self.recv().await {
                assert_eq!(publish.topic, topic, "unexpected publish topic");
                return publish;
            }
        }
    }

    /// Assert that nothing is delivered within the grace window.
    pub async fn expect_silence(&mut self, grace: Duration) {
        let got = timeout(grace, read_packet(&mut self.stream, 1024 * 1024)).await;
        assert!(got.is_err(), "expected silence, got {:?}", got.unwrap());
    }

    fn message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }

    /// Subscribe to one filter and return the SUBACK.
    pub async fn subscribe(&mut self, filter: &str) -> SubAck {
        let message_id = self.message_id();
        self.send(Packet::Subscribe(Subscribe {
            message_id,
            filters: vec![filter.to_string()],
            is_forwarded: false,
        }))
        .await;
        loop {
            match self.recv().await {
                Packet::SubAck(ack) => {
                    assert_eq!(ack.message_id, message_id);
                    return ack;
                }
                // An error notification may precede the ack.
                Packet::Publish(publish) if publish.topic == "trace/error/" => {}
                other => panic!("expected SUBACK, got {other:?}"),
            }
        }
    }

    pub async fn unsubscribe(&mut self, filter: &str) {
        let message_id = self.message_id();
        self.send(Packet::Unsubscribe(Unsubscribe {
            message_id,
            filters: vec![filter.to_string()],
            is_forwarded: false,
        }))
        .await;
        loop {
            match self.recv().await {
                Packet::UnsubAck { message_id: got } => {
                    assert_eq!(got, message_id);
                    return;
                }
                Packet::Publish(publish) if publish.topic == "trace/error/" => {}
                other => panic!("expected UNSUBACK, got {other:?}"),
            }
        }
    }

    pub async fn publish(&mut self, topic: &str, payload: impl Into<Bytes>) {
        self.send(Packet::Publish(Publish {
            message_id: 0,
            topic: topic.to_string(),
            payload: payload.into(),
            is_forwarded: false,
        }))
        .await;
    }

    /// Request a topic key via `unitd/keygen` and return the issued token.
    pub async fn request_key(&mut self, topic: &str, access: &str) -> String {
        let body = serde_json::json!({ "topic": topic, "type": access });
        self.publish("unitd/keygen", serde_json::to_vec(&body).unwrap())
            .await;
        let reply = self.expect_publish("unitd/keygen").await;
        String::from_utf8(reply.payload.to_vec()).expect("utf8 key")
    }

    /// Request a fresh client id via `unitd/clientid`.
    pub async fn request_client_id(&mut self, kind: &str) -> String {
        let body = serde_json::json!({ "type": kind });
        self.publish("unitd/clientid", serde_json::to_vec(&body).unwrap())
            .await;
        let reply = self.expect_publish("$SYS/client_identifier/").await;
        String::from_utf8(reply.payload.to_vec()).expect("utf8 client id")
    }

    pub async fn ping(&mut self) {
        self.send(Packet::PingReq).await;
        loop {
            match self.recv().await {
                Packet::PingResp => return,
                Packet::Publish(_) => {}
                other => panic!("expected PINGRESP, got {other:?}"),
            }
        }
    }
}
