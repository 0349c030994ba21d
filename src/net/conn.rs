//! Per-connection state: the outbound queue, subscription refcounts, and the
//! idempotent teardown path shared by direct and cluster-proxy connections.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::broker::Service;
use crate::core::ids::{ClientId, LocalId};
use crate::messaging::trie::{Subscriber, SubscriberKind};
use crate::messaging::{Counters, Message};
use crate::protocol::{Packet, Publish};

/// Where a cluster-proxy connection came from.
#[derive(Debug, Clone)]
pub struct ProxyOrigin {
    pub node_id: String,
    /// The connection id on the origin node, echoed back in deliveries.
    pub conn_id: u64,
}

pub struct Connection {
    conn_id: u64,
    client_id: ClientId,
    username: Option<String>,
    send: mpsc::Sender<Vec<u8>>,
    send_timeout: Duration,
    closed: AtomicBool,
    /// Guards the subscribe/unsubscribe path for this connection.
    pub(crate) subs: Mutex<Counters>,
    proxy_origin: Option<ProxyOrigin>,
    /// Peer nodes that have been told about this connection; each gets a
    /// gone-notification on close.
    pub(crate) told_nodes: Mutex<HashSet<String>>,
    service: Weak<Service>,
}

impl Connection {
    /// Create a connection for a live client socket. The caller owns the
    /// returned receiver and drains it to the socket.
    pub fn direct(
        service: &Arc<Service>,
        client_id: ClientId,
        username: Option<String>,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        Self::build(service, client_id, username, None)
    }

    /// Create a stand-in for a connection that lives on a peer node. The
    /// receiver is drained back over the peer link.
    pub fn proxy(
        service: &Arc<Service>,
        client_id: ClientId,
        origin: ProxyOrigin,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        Self::build(service, client_id, None, Some(origin))
    }

    fn build(
        service: &Arc<Service>,
        client_id: ClientId,
        username: Option<String>,
        proxy_origin: Option<ProxyOrigin>,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(service.send_queue_depth());
        let conn = Arc::new(Self {
            conn_id: LocalId::next(),
            client_id,
            username,
            send: tx,
            send_timeout: service.send_timeout(),
            closed: AtomicBool::new(false),
            subs: Mutex::new(Counters::new()),
            proxy_origin,
            told_nodes: Mutex::new(HashSet::new()),
            service: Arc::downgrade(service),
        });
        service.meters.connections.inc();
        service.conns.add(Arc::clone(&conn));
        (conn, rx)
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn contract(&self) -> u32 {
        self.client_id.contract()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn proxy_origin(&self) -> Option<&ProxyOrigin> {
        self.proxy_origin.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueue an already-encoded frame within the send budget. The queue is
    /// small on purpose; a subscriber that cannot keep up loses this frame
    /// rather than stalling the publisher.
    pub fn send_raw(&self, frame: Vec<u8>) -> bool {
        if self.is_closed() {
            return false;
        }
        let deadline = Instant::now() + self.send_timeout;
        let mut frame = frame;
        loop {
            match self.send.try_send(frame) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    frame = back;
                    std::hint::spin_loop();
                }
                Err(TrySendError::Closed(_)) => return false,
            }
        }
    }

    /// Enqueue a protocol acknowledgement. Unlike publish fan-out this waits
    /// for queue space: a client that stops reading stalls only its own
    /// acks. The long-stop deadline breaks the wait if the writer is gone.
    pub async fn send_ack(&self, frame: Vec<u8>) -> bool {
        if self.is_closed() {
            return false;
        }
        match tokio::time::timeout(Duration::from_secs(5), self.send.send(frame)).await {
            Ok(Ok(())) => true,
            _ => false,
        }
    }

    /// Terminate the connection. Idempotent and callable from either task.
    /// Proxy connections skip the trie removal path here; their subscriptions
    /// are torn down by the cluster when the origin reports them gone.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(service) = self.service.upgrade() else {
            return;
        };
        if self.proxy_origin.is_none() {
            let patterns = self.subs.lock().all();
            for parts in patterns {
                if service.remove_subscription(self.contract(), &parts, self.conn_id) {
                    service.meters.subscriptions.dec();
                }
            }
        }
        service.conns.remove(self.conn_id);
        if let Some(cluster) = service.cluster() {
            cluster.conn_gone(self);
        }
        service.meters.connections.dec();
        tracing::debug!(conn_id = self.conn_id, "connection closed");
    }
}

impl Subscriber for Connection {
    fn id(&self) -> u64 {
        self.conn_id
    }

    fn kind(&self) -> SubscriberKind {
        if self.proxy_origin.is_some() {
            SubscriberKind::Proxy
        } else {
            SubscriberKind::Direct
        }
    }

    fn send_message(&self, msg: &Message) -> bool {
        let frame = Packet::Publish(Publish {
            message_id: 0,
            topic: msg.topic.clone(),
            payload: msg.payload.clone(),
            is_forwarded: false,
        })
        .encode();
        self.send_raw(frame)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("client_id", &self.client_id)
            .field("proxy", &self.proxy_origin.is_some())
            .finish()
    }
}
