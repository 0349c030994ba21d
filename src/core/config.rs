use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::ids::DEFAULT_SALT;

fn default_bind() -> String {
    "0.0.0.0:6060".to_string()
}

fn default_max_packet_bytes() -> usize {
    64 * 1024
}

fn default_send_queue_depth() -> usize {
    1
}

fn default_send_timeout_micros() -> u64 {
    50
}

fn default_hash_salt() -> u32 {
    DEFAULT_SALT
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Top-level configuration for the trellis broker.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listener: ListenerConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Hard cap on a single wire frame; oversize frames are rejected.
    #[serde(default = "default_max_packet_bytes")]
    pub max_packet_bytes: usize,
    /// Capacity of each connection's outbound queue.
    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,
    /// Budget for enqueueing one outbound frame before the delivery is dropped.
    #[serde(default = "default_send_timeout_micros")]
    pub send_timeout_micros: u64,
    #[serde(default)]
    pub tls_chain_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// 32-byte AEAD master key for topic-access tokens, hex encoded.
    pub master_key_hex: String,
    #[serde(default = "default_hash_salt")]
    pub hash_salt: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub node_id: String,
    pub rpc_bind: String,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub node_id: String,
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("failed to read config {}", path_ref.display()))?;
        let cfg: Config = toml::from_str(&data)
            .with_context(|| format!("failed to parse config {}", path_ref.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listener.bind.is_empty() {
            bail!("listener.bind must not be empty");
        }
        if self.listener.send_queue_depth == 0 {
            bail!("listener.send_queue_depth must be at least 1");
        }
        if self.listener.max_packet_bytes < 16 {
            bail!("listener.max_packet_bytes is too small to frame any packet");
        }
        self.master_key()?;
        if self.listener.tls_chain_path.is_some() != self.listener.tls_key_path.is_some() {
            bail!("listener.tls_chain_path and listener.tls_key_path must be set together");
        }
        if let Some(cluster) = &self.cluster {
            if cluster.node_id.is_empty() {
                bail!("cluster.node_id must not be empty");
            }
            if cluster.peers.iter().any(|p| p.node_id == cluster.node_id) {
                bail!("cluster.peers must not contain the local node");
            }
        }
        Ok(())
    }

    /// Decode the configured master key into the fixed 32-byte AEAD key.
    pub fn master_key(&self) -> Result<[u8; 32]> {
        let raw = decode_hex(&self.security.master_key_hex)
            .context("security.master_key_hex is not valid hex")?;
        if raw.len() != 32 {
            bail!(
                "security.master_key_hex must decode to 32 bytes, got {}",
                raw.len()
            );
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&raw);
        Ok(key)
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        bail!("odd-length hex string");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(Into::into))
        .collect()
}
