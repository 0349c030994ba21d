//! Identifiers: the salted part hash, process-local connection ids, and
//! contract-carrying client ids.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;
use twox_hash::XxHash32;

/// Salt used by every deployment that does not override `security.hash_salt`.
/// The trie, the key codec and the system-topic table all share this value,
/// so changing it invalidates issued keys.
pub const DEFAULT_SALT: u32 = 3_376_684_800;

/// Stable keyed 32-bit hash of a topic part. Identical across restarts and
/// across nodes given the same salt.
pub fn hash_with_salt(bytes: &[u8], salt: u32) -> u32 {
    let mut hasher = XxHash32::with_seed(salt);
    hasher.write(bytes);
    hasher.finish() as u32
}

/// Hashes of the reserved names, precomputed once per salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemHashes {
    pub keygen: u32,
    pub clientid: u32,
    pub presence: u32,
    pub single_wildcard: u32,
    pub multi_wildcard: u32,
}

impl SystemHashes {
    pub fn new(salt: u32) -> Self {
        Self {
            keygen: hash_with_salt(b"keygen", salt),
            clientid: hash_with_salt(b"clientid", salt),
            presence: hash_with_salt(b"presence", salt),
            single_wildcard: hash_with_salt(b"*", salt),
            multi_wildcard: hash_with_salt(b"...", salt),
        }
    }
}

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-monotonic 64-bit id generator for connections.
pub struct LocalId;

impl LocalId {
    /// Strictly increasing within a process. Exhausting the space is fatal.
    pub fn next() -> u64 {
        let id = NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed);
        assert!(id != u64::MAX, "local id space exhausted");
        id
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("client id is not valid url-safe base64")]
    BadEncoding,
    #[error("client id must decode to {expected} bytes, got {got}")]
    BadLength { expected: usize, got: usize },
    #[error("unknown client id kind {0}")]
    BadKind(u8),
}

const CLIENT_ID_LEN: usize = 24;
const KIND_SECONDARY: u8 = 0;
const KIND_PRIMARY: u8 = 1;

/// 24-byte client identifier. Bytes 0..4 carry the contract id (big-endian),
/// byte 4 the kind, the rest disambiguates. Presented on the wire as
/// url-safe base64 without padding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId([u8; CLIENT_ID_LEN]);

impl ClientId {
    /// Mint a primary id with a fresh contract derived from the uniquifier.
    pub fn new_primary(salt: u32) -> Self {
        let mut unique = [0u8; CLIENT_ID_LEN - 5];
        fill_random(&mut unique);
        let mut contract = hash_with_salt(&unique, salt);
        if contract == 0 {
            contract = 1;
        }
        Self::assemble(contract, KIND_PRIMARY, &unique)
    }

    /// Mint a secondary id sharing this id's contract.
    pub fn new_secondary(&self) -> Self {
        let mut unique = [0u8; CLIENT_ID_LEN - 5];
        fill_random(&mut unique);
        Self::assemble(self.contract(), KIND_SECONDARY, &unique)
    }

    fn assemble(contract: u32, kind: u8, unique: &[u8; CLIENT_ID_LEN - 5]) -> Self {
        let mut raw = [0u8; CLIENT_ID_LEN];
        raw[0..4].copy_from_slice(&contract.to_be_bytes());
        raw[4] = kind;
        raw[5..].copy_from_slice(unique);
        Self(raw)
    }

    pub fn parse(text: &str) -> Result<Self, IdError> {
        let raw = URL_SAFE_NO_PAD
            .decode(text.as_bytes())
            .map_err(|_| IdError::BadEncoding)?;
        if raw.len() != CLIENT_ID_LEN {
            return Err(IdError::BadLength {
                expected: CLIENT_ID_LEN,
                got: raw.len(),
            });
        }
        if raw[4] != KIND_PRIMARY && raw[4] != KIND_SECONDARY {
            return Err(IdError::BadKind(raw[4]));
        }
        let mut bytes = [0u8; CLIENT_ID_LEN];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn contract(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn is_primary(&self) -> bool {
        self.0[4] == KIND_PRIMARY
    }
}

impl std::fmt::Debug for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientId")
            .field("contract", &self.contract())
            .field("primary", &self.is_primary())
            .finish()
    }
}

fn fill_random(buf: &mut [u8]) {
    // OS randomness; falling back is not an option for identifier material.
    getrandom::getrandom(buf).expect("os randomness unavailable");
}
