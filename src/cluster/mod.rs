//! Contract-sharded cluster overlay.
//!
//! Each contract id is owned by exactly one node (jump-consistent hash over
//! the membership). Operations for a remotely-owned contract are forwarded
//! to the owner over a persistent peer link; the owner executes them against
//! its own trie through a proxy connection and ships matched messages back.

pub mod ring;
pub mod rpc;

pub use ring::Ring;
pub use rpc::{PeerFrame, RouteOp};

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::broker::Service;
use crate::core::config::ClusterConfig;
use crate::core::ids::ClientId;
use crate::messaging::topic::Topic;
use crate::net::conn::{Connection, ProxyOrigin};

const OUTBOUND_RETRY_BASE: Duration = Duration::from_secs(2);
const OUTBOUND_RETRY_MAX: Duration = Duration::from_secs(30);
const PEER_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("peer frame codec error: {0}")]
    Codec(String),
    #[error("contract owner {0} is not a configured peer")]
    UnknownPeer(String),
    #[error("peer {0} link is saturated")]
    PeerBusy(String),
    #[error("peer link did not open with a hello frame")]
    Handshake,
}

struct Peer {
    tx: mpsc::Sender<PeerFrame>,
}

/// The overlay handle owned by the broker service on clustered nodes.
pub struct Cluster {
    node_id: String,
    rpc_bind: String,
    ring: Ring,
    peers: HashMap<String, Arc<Peer>>,
    service: OnceLock<Weak<Service>>,
    /// Proxy connections keyed by (origin node, origin connection id).
    proxies: Mutex<HashMap<(String, u64), Arc<Connection>>>,
    /// Receivers for the outbound links, consumed by `start`.
    pending_links: Mutex<Vec<(String, String, mpsc::Receiver<PeerFrame>)>>,
}

impl Cluster {
    pub fn new(cfg: &ClusterConfig) -> Arc<Self> {
        let mut nodes: Vec<String> = cfg.peers.iter().map(|p| p.node_id.clone()).collect();
        nodes.push(cfg.node_id.clone());

        let mut peers = HashMap::new();
        let mut pending = Vec::new();
        for peer in &cfg.peers {
            let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
            peers.insert(peer.node_id.clone(), Arc::new(Peer { tx }));
            pending.push((peer.node_id.clone(), peer.addr.clone(), rx));
        }

        Arc::new(Self {
            node_id: cfg.node_id.clone(),
            rpc_bind: cfg.rpc_bind.clone(),
            ring: Ring::new(nodes),
            peers,
            service: OnceLock::new(),
            proxies: Mutex::new(HashMap::new()),
            pending_links: Mutex::new(pending),
        })
    }

    /// Bind the overlay to its service. Required before `start`.
    pub fn bind(&self, service: &Arc<Service>) {
        let _ = self.service.set(Arc::downgrade(service));
    }

    fn service(&self) -> Option<Arc<Service>> {
        self.service.get().and_then(Weak::upgrade)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_remote_contract(&self, contract: u32) -> bool {
        self.ring.owner(contract) != self.node_id
    }

    pub fn owner_of(&self, contract: u32) -> &str {
        self.ring.owner(contract)
    }

    /// Forward an operation to the node that owns the connection's contract.
    /// Fire-and-forget: the link itself is the liveness signal.
    pub fn route_to_contract(
        &self,
        op: RouteOp,
        conn: &Arc<Connection>,
        message_id: u16,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), ClusterError> {
        let owner = self.ring.owner(conn.contract()).to_string();
        let peer = self
            .peers
            .get(&owner)
            .ok_or_else(|| ClusterError::UnknownPeer(owner.clone()))?;
        let frame = PeerFrame::Route {
            op,
            origin_conn: conn.conn_id(),
            client_id: conn.client_id().encode(),
            message_id,
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };
        peer.tx
            .try_send(frame)
            .map_err(|_| ClusterError::PeerBusy(owner.clone()))?;
        conn.told_nodes.lock().insert(owner);
        Ok(())
    }

    /// Broadcast that a local connection is gone to every peer that ever
    /// heard about it.
    pub fn conn_gone(&self, conn: &Connection) {
        let told: Vec<String> = conn.told_nodes.lock().iter().cloned().collect();
        for node in told {
            if let Some(peer) = self.peers.get(&node) {
                let frame = PeerFrame::ConnGone {
                    conn_id: conn.conn_id(),
                };
                if peer.tx.try_send(frame).is_err() {
                    tracing::warn!(peer = %node, conn_id = conn.conn_id(), "conn-gone notification dropped");
                }
            }
        }
    }

    /// Launch the outbound links and the inbound RPC listener. Returns the
    /// bound RPC address.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<std::net::SocketAddr> {
        for (node_id, addr, rx) in self.pending_links.lock().drain(..) {
            let local = self.node_id.clone();
            tokio::spawn(run_outbound_link(local, node_id, addr, rx));
        }

        let listener = TcpListener::bind(&self.rpc_bind).await?;
        let bound = listener.local_addr()?;
        tracing::info!(bind = %bound, node = %self.node_id, "cluster rpc listening");
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let cluster = Arc::clone(&cluster);
                        tokio::spawn(async move {
                            if let Err(err) = cluster.serve_peer(stream).await {
                                tracing::warn!(%peer_addr, %err, "peer session ended");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(%err, "cluster accept error");
                    }
                }
            }
        });
        Ok(bound)
    }

    async fn serve_peer(self: Arc<Self>, mut stream: TcpStream) -> Result<(), ClusterError> {
        let PeerFrame::Hello { node_id: from } = rpc::read_frame(&mut stream).await? else {
            return Err(ClusterError::Handshake);
        };
        tracing::info!(peer = %from, "peer link accepted");
        let result = loop {
            match rpc::read_frame(&mut stream).await {
                Ok(frame) => self.handle_frame(&from, frame),
                Err(err) => break err,
            }
        };
        // A dropped peer has lost all the connections it proxied here.
        self.drop_peer_proxies(&from);
        tracing::warn!(peer = %from, %result, "peer link lost");
        Ok(())
    }

    fn handle_frame(&self, from: &str, frame: PeerFrame) {
        match frame {
            PeerFrame::Hello { .. } => {}
            PeerFrame::Route {
                op,
                origin_conn,
                client_id,
                message_id,
                topic,
                payload,
            } => self.handle_route(from, op, origin_conn, &client_id, message_id, &topic, payload),
            PeerFrame::Deliver { conn_id, frame } => {
                if let Some(service) = self.service() {
                    if let Some(conn) = service.conns.get(conn_id) {
                        if !conn.send_raw(frame) {
                            tracing::debug!(conn_id, "cluster delivery dropped");
                        }
                    }
                }
            }
            PeerFrame::ConnGone { conn_id } => {
                let removed = self.proxies.lock().remove(&(from.to_string(), conn_id));
                if let (Some(proxy), Some(service)) = (removed, self.service()) {
                    drop_proxy(&service, &proxy);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_route(
        &self,
        from: &str,
        op: RouteOp,
        origin_conn: u64,
        client_id: &str,
        message_id: u16,
        raw_topic: &str,
        payload: Vec<u8>,
    ) {
        let Some(service) = self.service() else {
            return;
        };
        let Ok(client_id) = ClientId::parse(client_id) else {
            tracing::warn!(peer = %from, "forwarded op carries an invalid client id");
            return;
        };
        let Ok(topic) = Topic::parse(raw_topic, service.salt()) else {
            tracing::warn!(peer = %from, topic = %raw_topic, "forwarded op carries an invalid topic");
            return;
        };
        let proxy = self.proxy_for(&service, from, origin_conn, client_id);

        match op {
            RouteOp::Subscribe => {
                let _ = service.subscribe(&proxy, message_id, raw_topic, &topic, true);
            }
            RouteOp::Unsubscribe => {
                let _ = service.unsubscribe(&proxy, message_id, raw_topic, &topic, true);
            }
            RouteOp::Publish => {
                if topic.is_system_request() {
                    service.handle_system_publish(&proxy, &topic, &payload, message_id, true);
                } else {
                    let _ = service.publish(
                        &proxy,
                        message_id,
                        raw_topic,
                        &topic,
                        bytes::Bytes::from(payload),
                        true,
                    );
                }
            }
        }
    }

    /// Get or synthesize the proxy connection standing in for a remote
    /// origin connection. The proxy's outbound queue is pumped back to the
    /// origin node as delivery frames.
    fn proxy_for(
        &self,
        service: &Arc<Service>,
        from: &str,
        origin_conn: u64,
        client_id: ClientId,
    ) -> Arc<Connection> {
        let key = (from.to_string(), origin_conn);
        let mut proxies = self.proxies.lock();
        if let Some(existing) = proxies.get(&key) {
            return Arc::clone(existing);
        }
        let (proxy, mut rx) = Connection::proxy(
            service,
            client_id,
            ProxyOrigin {
                node_id: from.to_string(),
                conn_id: origin_conn,
            },
        );
        if let Some(peer) = self.peers.get(from) {
            let tx = peer.tx.clone();
            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    let deliver = PeerFrame::Deliver {
                        conn_id: origin_conn,
                        frame,
                    };
                    if tx.send(deliver).await.is_err() {
                        break;
                    }
                }
            });
        } else {
            tracing::warn!(peer = %from, "no return link for proxied deliveries");
        }
        proxies.insert(key, Arc::clone(&proxy));
        proxy
    }

    fn drop_peer_proxies(&self, from: &str) {
        let dropped: Vec<Arc<Connection>> = {
            let mut proxies = self.proxies.lock();
            let keys: Vec<(String, u64)> = proxies
                .keys()
                .filter(|(node, _)| node == from)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| proxies.remove(k)).collect()
        };
        if dropped.is_empty() {
            return;
        }
        tracing::info!(peer = %from, count = dropped.len(), "unsubscribing proxies for lost peer");
        if let Some(service) = self.service() {
            for proxy in dropped {
                drop_proxy(&service, &proxy);
            }
        }
    }
}

/// Tear down a proxy: its trie entries first (proxy close skips them by
/// design), then the connection itself.
fn drop_proxy(service: &Service, proxy: &Arc<Connection>) {
    let patterns = proxy.subs.lock().all();
    for parts in patterns {
        if service.remove_subscription(proxy.contract(), &parts, proxy.conn_id()) {
            service.meters.subscriptions.dec();
        }
    }
    proxy.close();
}

async fn run_outbound_link(
    local_node: String,
    peer_node: String,
    addr: String,
    mut rx: mpsc::Receiver<PeerFrame>,
) {
    let mut backoff = OUTBOUND_RETRY_BASE;
    loop {
        match TcpStream::connect(&addr).await {
            Ok(mut stream) => {
                let hello = PeerFrame::Hello {
                    node_id: local_node.clone(),
                };
                if rpc::write_frame(&mut stream, &hello).await.is_err() {
                    tracing::warn!(peer = %peer_node, "peer handshake failed");
                } else {
                    tracing::info!(peer = %peer_node, %addr, "peer link established");
                    backoff = OUTBOUND_RETRY_BASE;
                    loop {
                        let Some(frame) = rx.recv().await else {
                            return;
                        };
                        if let Err(err) = rpc::write_frame(&mut stream, &frame).await {
                            tracing::warn!(peer = %peer_node, %err, "peer write failed");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                tracing::debug!(peer = %peer_node, %addr, %err, "peer dial failed");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(OUTBOUND_RETRY_MAX);
    }
}
