//! Peer-link wire format: length-prefixed bincode frames over TCP.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::ClusterError;

/// Upper bound on one peer frame; covers the largest client packet plus the
/// envelope.
pub const MAX_PEER_FRAME: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteOp {
    Subscribe,
    Unsubscribe,
    Publish,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerFrame {
    /// First frame on every link; names the dialing node.
    Hello { node_id: String },
    /// An operation forwarded to the contract's owner. Executed there with
    /// the forwarded flag set so it is never forwarded again.
    Route {
        op: RouteOp,
        origin_conn: u64,
        client_id: String,
        message_id: u16,
        topic: String,
        payload: Vec<u8>,
    },
    /// A matched message travelling back to the subscriber's home node.
    /// `frame` is a fully encoded client packet.
    Deliver { conn_id: u64, frame: Vec<u8> },
    /// The origin connection closed; drop its proxy and subscriptions.
    ConnGone { conn_id: u64 },
}

pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &PeerFrame,
) -> Result<(), ClusterError> {
    let body = bincode::serialize(frame).map_err(|e| ClusterError::Codec(e.to_string()))?;
    if body.len() > MAX_PEER_FRAME {
        return Err(ClusterError::Codec("peer frame too large".to_string()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<PeerFrame, ClusterError> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_PEER_FRAME {
        return Err(ClusterError::Codec(format!("peer frame of {len} bytes")));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body).map_err(|e| ClusterError::Codec(e.to_string()))
}
