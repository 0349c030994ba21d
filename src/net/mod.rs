//! Client-facing listener and the per-connection session loop.
//!
//! Every accepted socket runs a pair of tasks: the reader drives the
//! connection state machine (`AwaitingConnect → Live → Closing`), the writer
//! drains the connection's bounded send queue. A panic in either task closes
//! that connection and nothing else.

pub mod conn;
pub mod security;
pub mod tls;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::broker::{ErrorKind, Service};
use crate::core::config::ListenerConfig;
use crate::core::ids::ClientId;
use crate::messaging::topic::Topic;
use crate::protocol::{
    self, return_codes, ConnAck, Packet, ProtocolError, SubAck,
};
use conn::Connection;

/// Outcome of one handled packet in the Live state.
enum SessionAction {
    Continue,
    Disconnect,
}

/// Closes the connection when the owning task unwinds, panics included.
struct CloseGuard(Arc<Connection>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

pub struct Listener;

impl Listener {
    /// Bind the client listener and run the accept loop in the background.
    /// Returns the bound address (useful with ephemeral ports).
    pub async fn start(service: Arc<Service>, cfg: &ListenerConfig) -> Result<std::net::SocketAddr> {
        let acceptor = match (&cfg.tls_chain_path, &cfg.tls_key_path) {
            (Some(chain), Some(key)) => Some(tls::build_acceptor(chain, key)?),
            _ => None,
        };
        let listener = TcpListener::bind(&cfg.bind)
            .await
            .with_context(|| format!("failed to bind listener on {}", cfg.bind))?;
        let addr = listener.local_addr().context("listener local addr")?;
        tracing::info!(bind = %addr, tls = acceptor.is_some(), "listener bound");

        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(%err, "accept error");
                        continue;
                    }
                };
                let service = Arc::clone(&service);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let outcome = match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => handle_session(service, stream).await,
                            Err(err) => {
                                tracing::warn!(%peer, %err, "tls handshake failed");
                                return;
                            }
                        },
                        None => handle_session(service, stream).await,
                    };
                    if let Err(err) = outcome {
                        tracing::debug!(%peer, %err, "session ended");
                    }
                });
            }
        });
        Ok(addr)
    }
}

/// Run one client session from CONNECT to teardown.
async fn handle_session<S>(service: Arc<Service>, mut stream: S) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let max_packet = service.max_packet_bytes();

    // AwaitingConnect: the first packet must be CONNECT.
    let connect = match protocol::read_packet(&mut stream, max_packet).await? {
        Packet::Connect(connect) => connect,
        other => {
            tracing::warn!(?other, "protocol violation before connect");
            return Ok(());
        }
    };

    let (client_id, assigned) = if connect.client_id.is_empty() {
        (ClientId::new_primary(service.salt()), true)
    } else {
        match ClientId::parse(&connect.client_id) {
            Ok(client_id) => (client_id, false),
            Err(err) => {
                tracing::debug!(%err, "rejecting unparseable client id");
                let nack = Packet::ConnAck(ConnAck {
                    session_present: false,
                    code: return_codes::REFUSED_IDENTIFIER,
                })
                .encode();
                let _ = stream.write_all(&nack).await;
                return Ok(());
            }
        }
    };

    let ack = Packet::ConnAck(ConnAck {
        session_present: false,
        code: return_codes::ACCEPTED,
    })
    .encode();
    stream.write_all(&ack).await?;

    let (read_half, write_half) = tokio::io::split(stream);
    let (connection, rx) = Connection::direct(&service, client_id, connect.username.clone());
    tracing::info!(
        conn_id = connection.conn_id(),
        contract = connection.contract(),
        assigned,
        "client connected"
    );
    tokio::spawn(run_writer(Arc::clone(&connection), write_half, rx));

    // A freshly minted identity is announced before any client traffic.
    if assigned {
        service.send_client_id(&connection, &client_id);
    }

    let guard = CloseGuard(Arc::clone(&connection));
    let mut read_half = read_half;
    loop {
        let packet = match protocol::read_packet(&mut read_half, max_packet).await {
            Ok(packet) => packet,
            Err(ProtocolError::Io(err)) => {
                tracing::debug!(conn_id = connection.conn_id(), %err, "socket closed");
                break;
            }
            Err(err) => {
                tracing::warn!(conn_id = connection.conn_id(), %err, "fatal decode error");
                break;
            }
        };
        match handle_packet(&service, &connection, packet).await {
            SessionAction::Continue => {}
            SessionAction::Disconnect => break,
        }
    }
    drop(guard);
    Ok(())
}

async fn run_writer<W>(connection: Arc<Connection>, mut writer: W, mut rx: mpsc::Receiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let _guard = CloseGuard(Arc::clone(&connection));
    while let Some(frame) = rx.recv().await {
        if writer.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Live-state dispatch for one decoded packet.
async fn handle_packet(
    service: &Arc<Service>,
    connection: &Arc<Connection>,
    packet: Packet,
) -> SessionAction {
    match packet {
        Packet::Subscribe(pkt) => {
            let mut grants = Vec::with_capacity(pkt.filters.len());
            for filter in &pkt.filters {
                grants.push(subscribe_one(
                    service,
                    connection,
                    pkt.message_id,
                    filter,
                    pkt.is_forwarded,
                ));
            }
            let ack = Packet::SubAck(SubAck {
                message_id: pkt.message_id,
                grants,
            })
            .encode();
            if !connection.send_ack(ack).await {
                return SessionAction::Disconnect;
            }
            SessionAction::Continue
        }
        Packet::Unsubscribe(pkt) => {
            for filter in &pkt.filters {
                match Topic::parse(filter, service.salt()) {
                    Ok(topic) => {
                        let _ = service.unsubscribe(
                            connection,
                            pkt.message_id,
                            filter,
                            &topic,
                            pkt.is_forwarded,
                        );
                    }
                    Err(_) => {
                        service.notify_error(connection, ErrorKind::TopicInvalid, pkt.message_id);
                    }
                }
            }
            let ack = Packet::UnsubAck {
                message_id: pkt.message_id,
            }
            .encode();
            if !connection.send_ack(ack).await {
                return SessionAction::Disconnect;
            }
            SessionAction::Continue
        }
        Packet::Publish(pkt) => {
            match Topic::parse(&pkt.topic, service.salt()) {
                Ok(topic) if topic.is_system_request() => {
                    service.handle_system_publish(
                        connection,
                        &topic,
                        &pkt.payload,
                        pkt.message_id,
                        pkt.is_forwarded,
                    );
                }
                Ok(topic) => {
                    let _ = service.publish(
                        connection,
                        pkt.message_id,
                        &pkt.topic,
                        &topic,
                        pkt.payload,
                        pkt.is_forwarded,
                    );
                }
                Err(_) => {
                    service.notify_error(connection, ErrorKind::TopicInvalid, pkt.message_id);
                }
            }
            SessionAction::Continue
        }
        Packet::PingReq => {
            if connection.send_ack(Packet::PingResp.encode()).await {
                SessionAction::Continue
            } else {
                SessionAction::Disconnect
            }
        }
        // QoS 0: nothing outstanding to settle.
        Packet::PubAck { .. } => SessionAction::Continue,
        Packet::Disconnect => SessionAction::Disconnect,
        other => {
            tracing::warn!(
                conn_id = connection.conn_id(),
                ?other,
                "protocol violation in live state"
            );
            SessionAction::Disconnect
        }
    }
}

fn subscribe_one(
    service: &Arc<Service>,
    connection: &Arc<Connection>,
    message_id: u16,
    filter: &str,
    is_forwarded: bool,
) -> u8 {
    match Topic::parse(filter, service.salt()) {
        Ok(topic) => {
            match service.subscribe(connection, message_id, filter, &topic, is_forwarded) {
                Ok(()) => 0x00,
                Err(_) => 0x80,
            }
        }
        Err(_) => {
            service.notify_error(connection, ErrorKind::TopicInvalid, message_id);
            0x80
        }
    }
}
