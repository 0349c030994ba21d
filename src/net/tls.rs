use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_rustls::TlsAcceptor;

/// Build a TLS acceptor from PEM chain and key files. The listener runs
/// plaintext when no TLS material is configured.
pub fn build_acceptor(chain_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let mut chain_reader = BufReader::new(
        File::open(chain_path)
            .with_context(|| format!("open tls chain {}", chain_path.display()))?,
    );
    let certs: Vec<_> = rustls_pemfile::certs(&mut chain_reader)
        .collect::<Result<_, _>>()
        .with_context(|| format!("parse tls chain {}", chain_path.display()))?;

    let mut key_reader = BufReader::new(
        File::open(key_path).with_context(|| format!("open tls key {}", key_path.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("parse tls key {}", key_path.display()))?
        .with_context(|| format!("no private key in {}", key_path.display()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build tls server config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
