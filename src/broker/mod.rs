//! Broker service: the connection cache, the subscription index, meters,
//! key authorization, and the locality decision that sends operations either
//! into the local trie or across the cluster.

pub mod meters;

pub use meters::Meters;

use std::collections::HashMap;
use std::iter;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;

use crate::cluster::{Cluster, RouteOp};
use crate::core::config::Config;
use crate::core::ids::{ClientId, SystemHashes};
use crate::core::time::Clock;
use crate::messaging::topic::{Part, Topic};
use crate::messaging::trie::{Subscriber, SubscriptionTrie};
use crate::messaging::Message;
use crate::net::conn::Connection;
use crate::net::security::{Access, KeyCodec, KeyError};

/// Server-originated reply topics, delivered verbatim (never parsed).
pub const CLIENT_ID_REPLY_TOPIC: &str = "$SYS/client_identifier/";
pub const ERROR_TOPIC: &str = "trace/error/";
pub const KEYGEN_TOPIC: &str = "unitd/keygen";
pub const PRESENCE_TOPIC: &str = "unitd/presence";

/// Client-visible error kinds carried on `trace/error/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    TopicInvalid,
    KeyInvalid,
    KeyExpired,
    RateLimited,
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::TopicInvalid => 420,
            ErrorKind::KeyInvalid => 421,
            ErrorKind::KeyExpired => 422,
            ErrorKind::RateLimited => 429,
            ErrorKind::Internal => 500,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::TopicInvalid => "invalid topic",
            ErrorKind::KeyInvalid => "invalid key",
            ErrorKind::KeyExpired => "key expired",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::Internal => "internal error",
        }
    }
}

impl From<KeyError> for ErrorKind {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::BadFormat | KeyError::BadMac | KeyError::TopicMismatch => {
                ErrorKind::KeyInvalid
            }
            KeyError::Expired => ErrorKind::KeyExpired,
            KeyError::Forbidden => ErrorKind::Forbidden,
        }
    }
}

/// Live connections by connection id.
#[derive(Default)]
pub struct ConnectionCache {
    inner: RwLock<HashMap<u64, Arc<Connection>>>,
}

impl ConnectionCache {
    pub fn add(&self, conn: Arc<Connection>) {
        self.inner.write().insert(conn.conn_id(), conn);
    }

    pub fn get(&self, conn_id: u64) -> Option<Arc<Connection>> {
        self.inner.read().get(&conn_id).cloned()
    }

    pub fn remove(&self, conn_id: u64) -> Option<Arc<Connection>> {
        self.inner.write().remove(&conn_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct ClientIdRequest {
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct KeygenRequest {
    topic: String,
    #[serde(rename = "type", default)]
    access: String,
}

#[derive(Debug, Deserialize)]
struct PresenceRequest {
    topic: String,
}

/// The broker's shared state, passed around as an explicit handle so tests
/// can run several independent instances in one process.
pub struct Service {
    key_codec: KeyCodec,
    salt: u32,
    hashes: SystemHashes,
    pub subscriptions: SubscriptionTrie,
    pub conns: ConnectionCache,
    pub meters: Meters,
    cluster: RwLock<Option<Arc<Cluster>>>,
    clock: Arc<dyn Clock>,
    send_queue_depth: usize,
    send_timeout: std::time::Duration,
    max_packet_bytes: usize,
}

impl Service {
    pub fn new(cfg: &Config, clock: Arc<dyn Clock>) -> anyhow::Result<Arc<Self>> {
        let master = cfg.master_key()?;
        let salt = cfg.security.hash_salt;
        let hashes = SystemHashes::new(salt);
        Ok(Arc::new(Self {
            key_codec: KeyCodec::new(master, salt),
            salt,
            hashes,
            subscriptions: SubscriptionTrie::new(hashes),
            conns: ConnectionCache::default(),
            meters: Meters::default(),
            cluster: RwLock::new(None),
            clock,
            send_queue_depth: cfg.listener.send_queue_depth,
            send_timeout: std::time::Duration::from_micros(cfg.listener.send_timeout_micros),
            max_packet_bytes: cfg.listener.max_packet_bytes,
        }))
    }

    /// Wire up the cluster overlay; done once at startup on clustered nodes.
    pub fn attach_cluster(&self, cluster: Arc<Cluster>) {
        *self.cluster.write() = Some(cluster);
    }

    pub fn cluster(&self) -> Option<Arc<Cluster>> {
        self.cluster.read().clone()
    }

    pub fn salt(&self) -> u32 {
        self.salt
    }

    pub fn hashes(&self) -> &SystemHashes {
        &self.hashes
    }

    pub fn key_codec(&self) -> &KeyCodec {
        &self.key_codec
    }

    pub fn unix_now(&self) -> u32 {
        self.clock.unix_now()
    }

    pub fn send_queue_depth(&self) -> usize {
        self.send_queue_depth
    }

    pub fn send_timeout(&self) -> std::time::Duration {
        self.send_timeout
    }

    pub fn max_packet_bytes(&self) -> usize {
        self.max_packet_bytes
    }

    /// Trie path for a pattern: the contract id leads so tenants never see
    /// each other's traffic, even for textually identical topics.
    fn pattern_path(contract: u32, parts: &[Part]) -> Vec<Part> {
        iter::once(Part::Literal(contract))
            .chain(parts.iter().copied())
            .collect()
    }

    fn lookup_keys(&self, contract: u32, parts: &[Part]) -> Vec<u32> {
        let path = Self::pattern_path(contract, parts);
        self.subscriptions.concrete_keys(&path)
    }

    /// Validate the presented key for an operation. The key must also belong
    /// to the caller's own contract; a foreign key never grants access.
    fn authorize(
        &self,
        conn: &Connection,
        topic: &Topic,
        required: Access,
    ) -> Result<u32, ErrorKind> {
        if topic.key.is_empty() {
            return Err(ErrorKind::Unauthorized);
        }
        let contract =
            self.key_codec
                .validate(&topic.key, topic, required, self.clock.unix_now())?;
        if contract != conn.contract() {
            return Err(ErrorKind::Unauthorized);
        }
        Ok(contract)
    }

    fn is_presence_filter(&self, topic: &Topic) -> bool {
        topic.is_system_request() && topic.single_literal() == Some(self.hashes.presence)
    }

    /// SUBSCRIBE one filter. Returns the SUBACK grant outcome.
    pub fn subscribe(
        &self,
        conn: &Arc<Connection>,
        message_id: u16,
        raw: &str,
        topic: &Topic,
        is_forwarded: bool,
    ) -> Result<(), ErrorKind> {
        let contract = if self.is_presence_filter(topic) {
            conn.contract()
        } else {
            match self.authorize(conn, topic, Access::READ) {
                Ok(contract) => contract,
                Err(kind) => {
                    self.notify_error(conn, kind, message_id);
                    return Err(kind);
                }
            }
        };

        if !is_forwarded {
            if let Some(cluster) = self.cluster() {
                if cluster.is_remote_contract(contract) {
                    return self
                        .route(&cluster, RouteOp::Subscribe, conn, message_id, raw, &[])
                        .map_err(|kind| {
                            self.notify_error(conn, kind, message_id);
                            kind
                        });
                }
            }
        }

        if conn.is_closed() {
            return Err(ErrorKind::Internal);
        }
        let first = conn.subs.lock().increment(raw.as_bytes(), &topic.parts);
        if first {
            let path = Self::pattern_path(contract, &topic.parts);
            self.subscriptions
                .subscribe(&path, topic.depth, Arc::clone(conn) as Arc<dyn Subscriber>);
            self.meters.subscriptions.inc();
        }
        Ok(())
    }

    /// UNSUBSCRIBE one filter.
    pub fn unsubscribe(
        &self,
        conn: &Arc<Connection>,
        message_id: u16,
        raw: &str,
        topic: &Topic,
        is_forwarded: bool,
    ) -> Result<(), ErrorKind> {
        let contract = if self.is_presence_filter(topic) {
            conn.contract()
        } else {
            match self.authorize(conn, topic, Access::READ) {
                Ok(contract) => contract,
                Err(kind) => {
                    self.notify_error(conn, kind, message_id);
                    return Err(kind);
                }
            }
        };

        if let Some((parts, last)) = conn.subs.lock().decrement(raw.as_bytes()) {
            if last && self.remove_subscription(contract, &parts, conn.conn_id()) {
                self.meters.subscriptions.dec();
            }
        }

        if !is_forwarded {
            if let Some(cluster) = self.cluster() {
                if cluster.is_remote_contract(contract) {
                    return self
                        .route(&cluster, RouteOp::Unsubscribe, conn, message_id, raw, &[])
                        .map_err(|kind| {
                            self.notify_error(conn, kind, message_id);
                            kind
                        });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn remove_subscription(&self, contract: u32, parts: &[Part], conn_id: u64) -> bool {
        let path = Self::pattern_path(contract, parts);
        self.subscriptions.unsubscribe(&path, conn_id)
    }

    /// PUBLISH: local fan-out, then a cluster forward when the contract is
    /// owned elsewhere. Returns how many local subscribers accepted the
    /// message.
    pub fn publish(
        &self,
        conn: &Arc<Connection>,
        message_id: u16,
        raw: &str,
        topic: &Topic,
        payload: bytes::Bytes,
        is_forwarded: bool,
    ) -> Result<usize, ErrorKind> {
        let contract = match self.authorize(conn, topic, Access::WRITE) {
            Ok(contract) => contract,
            Err(kind) => {
                self.notify_error(conn, kind, message_id);
                return Err(kind);
            }
        };

        self.meters.in_msgs.add(1);
        self.meters.in_bytes.add(payload.len() as u64);

        let msg = Message::new(topic.text.clone(), payload.clone());
        let delivered = self.fan_out(contract, &topic.parts, &msg);

        if !is_forwarded {
            if let Some(cluster) = self.cluster() {
                if cluster.is_remote_contract(contract) {
                    if let Err(kind) =
                        self.route(&cluster, RouteOp::Publish, conn, message_id, raw, &payload)
                    {
                        self.notify_error(conn, kind, message_id);
                        return Err(kind);
                    }
                }
            }
        }
        Ok(delivered)
    }

    fn fan_out(&self, contract: u32, parts: &[Part], msg: &Message) -> usize {
        let keys = self.lookup_keys(contract, parts);
        let mut delivered = 0usize;
        for subscriber in self.subscriptions.lookup(&keys) {
            if subscriber.send_message(msg) {
                delivered += 1;
            } else {
                tracing::warn!(
                    subscriber = subscriber.id(),
                    topic = %msg.topic,
                    "delivery dropped: send budget exhausted"
                );
            }
        }
        self.meters.out_msgs.add(delivered as u64);
        self.meters.out_bytes.add((msg.size() * delivered) as u64);
        delivered
    }

    fn route(
        &self,
        cluster: &Arc<Cluster>,
        op: RouteOp,
        conn: &Arc<Connection>,
        message_id: u16,
        raw: &str,
        payload: &[u8],
    ) -> Result<(), ErrorKind> {
        cluster
            .route_to_contract(op, conn, message_id, raw, payload)
            .map_err(|err| {
                tracing::warn!(conn_id = conn.conn_id(), %err, "cluster forward failed");
                ErrorKind::Internal
            })
    }

    /// Dispatch a PUBLISH whose topic is a system request (`unitd/...`).
    /// These bypass key authorization; their identities are fixed hashes.
    pub fn handle_system_publish(
        &self,
        conn: &Arc<Connection>,
        topic: &Topic,
        payload: &[u8],
        message_id: u16,
        is_forwarded: bool,
    ) {
        let Some(hash) = topic.single_literal() else {
            self.notify_error(conn, ErrorKind::BadRequest, message_id);
            return;
        };
        if hash == self.hashes.clientid {
            self.handle_client_id_request(conn, payload, message_id);
        } else if hash == self.hashes.keygen {
            self.handle_keygen_request(conn, payload, message_id);
        } else if hash == self.hashes.presence {
            self.handle_presence_request(conn, payload, message_id, is_forwarded);
        } else {
            self.notify_error(conn, ErrorKind::BadRequest, message_id);
        }
    }

    fn handle_client_id_request(&self, conn: &Arc<Connection>, payload: &[u8], message_id: u16) {
        let request: ClientIdRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(_) => {
                self.notify_error(conn, ErrorKind::BadRequest, message_id);
                return;
            }
        };
        let minted = match request.kind.as_str() {
            "1" => ClientId::new_primary(self.salt),
            _ => conn.client_id().new_secondary(),
        };
        self.send_client_id(conn, &minted);
    }

    pub fn send_client_id(&self, conn: &Connection, client_id: &ClientId) {
        let delivered = conn.send_message(&Message::new(
            CLIENT_ID_REPLY_TOPIC,
            client_id.encode().into_bytes(),
        ));
        if !delivered {
            tracing::warn!(conn_id = conn.conn_id(), "client id reply dropped");
        }
    }

    fn handle_keygen_request(&self, conn: &Arc<Connection>, payload: &[u8], message_id: u16) {
        let request: KeygenRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(_) => {
                self.notify_error(conn, ErrorKind::BadRequest, message_id);
                return;
            }
        };
        let topic = match Topic::parse(&request.topic, self.salt) {
            Ok(topic) => topic,
            Err(_) => {
                self.notify_error(conn, ErrorKind::TopicInvalid, message_id);
                return;
            }
        };
        let access = Access::from_type_chars(&request.access);
        let key = self.key_codec.generate(
            conn.contract(),
            &topic.literal_hashes(),
            access,
            None,
            self.clock.unix_now(),
        );
        conn.send_message(&Message::new(KEYGEN_TOPIC, key.into_bytes()));
    }

    fn handle_presence_request(
        &self,
        conn: &Arc<Connection>,
        payload: &[u8],
        message_id: u16,
        is_forwarded: bool,
    ) {
        let request: PresenceRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(_) => {
                self.notify_error(conn, ErrorKind::BadRequest, message_id);
                return;
            }
        };
        let topic = match Topic::parse(&request.topic, self.salt) {
            Ok(topic) => topic,
            Err(_) => {
                self.notify_error(conn, ErrorKind::TopicInvalid, message_id);
                return;
            }
        };
        let contract = conn.contract();

        // The owner node holds the contract's subscriptions; ask it instead
        // of answering from an empty local view.
        if !is_forwarded {
            if let Some(cluster) = self.cluster() {
                if cluster.is_remote_contract(contract) {
                    if self
                        .route(
                            &cluster,
                            RouteOp::Publish,
                            conn,
                            message_id,
                            PRESENCE_TOPIC,
                            payload,
                        )
                        .is_err()
                    {
                        self.notify_error(conn, ErrorKind::Internal, message_id);
                    }
                    return;
                }
            }
        }

        let who: Vec<u64> = self
            .subscriptions
            .lookup(&self.lookup_keys(contract, &topic.parts))
            .iter()
            .map(|s| s.id())
            .collect();
        let event = json!({
            "topic": request.topic,
            "who": who,
            "status": "online",
        });
        let msg = Message::new(
            PRESENCE_TOPIC,
            serde_json::to_vec(&event).unwrap_or_default(),
        );
        conn.send_message(&msg);

        // Contract-scoped presence listeners get the event too.
        let presence_parts = [Part::Literal(self.hashes.presence)];
        for subscriber in self
            .subscriptions
            .lookup(&self.lookup_keys(contract, &presence_parts))
        {
            if subscriber.id() != conn.conn_id() {
                subscriber.send_message(&msg);
            }
        }
    }

    /// Tell the connection about a rejected packet on `trace/error/`.
    pub fn notify_error(&self, conn: &Connection, kind: ErrorKind, message_id: u16) {
        let body = json!({
            "id": message_id,
            "code": kind.code(),
            "message": kind.message(),
        });
        let msg = Message::new(ERROR_TOPIC, serde_json::to_vec(&body).unwrap_or_default());
        if !conn.send_message(&msg) {
            tracing::debug!(conn_id = conn.conn_id(), ?kind, "error notification dropped");
        }
    }
}
