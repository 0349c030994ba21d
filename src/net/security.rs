//! Stateless topic-access keys.
//!
//! A key binds {contract, topic-part hash prefix, permission bits, issue
//! time, expiry} into a short url-safe token sealed with XChaCha20-Poly1305
//! under the node's 32-byte master key. The broker stores nothing about
//! issued keys; possession of a valid token is the whole credential.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bitflags::bitflags;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::XChaCha20Poly1305;
use thiserror::Error;

use crate::core::ids::hash_with_salt;
use crate::messaging::topic::{Part, Topic};

bitflags! {
    /// Operations a key grants on its topic subtree.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ = 1;
        const WRITE = 2;
        const PRESENT = 4;
        const EXTEND = 8;
    }
}

impl Access {
    /// Parse the request "type" characters (`r`, `w`, `p`, `e`); anything
    /// else is ignored.
    pub fn from_type_chars(s: &str) -> Self {
        let mut access = Access::empty();
        for c in s.chars() {
            match c {
                'r' => access |= Access::READ,
                'w' => access |= Access::WRITE,
                'p' => access |= Access::PRESENT,
                'e' => access |= Access::EXTEND,
                _ => {}
            }
        }
        access
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key is malformed")]
    BadFormat,
    #[error("key authentication failed")]
    BadMac,
    #[error("key has expired")]
    Expired,
    #[error("key does not grant the required access")]
    Forbidden,
    #[error("key was issued for a different topic")]
    TopicMismatch,
}

const HEADER_LEN: usize = 8;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// Issues and validates topic-access keys. Cheap to clone per the underlying
/// cipher; one per service.
pub struct KeyCodec {
    cipher: XChaCha20Poly1305,
    salt: u32,
}

impl KeyCodec {
    pub fn new(master: [u8; 32], salt: u32) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(GenericArray::from_slice(&master)),
            salt,
        }
    }

    /// Deterministically derive the 24-byte nonce from the clear header
    /// (contract id and issue time).
    fn derive_nonce(&self, header: &[u8; HEADER_LEN]) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..HEADER_LEN].copy_from_slice(header);
        let mut cursor = HEADER_LEN;
        let mut counter = 0u8;
        while cursor < NONCE_LEN {
            let mut seed = [0u8; HEADER_LEN + 1];
            seed[..HEADER_LEN].copy_from_slice(header);
            seed[HEADER_LEN] = counter;
            let word = hash_with_salt(&seed, self.salt).to_be_bytes();
            nonce[cursor..cursor + 4].copy_from_slice(&word);
            cursor += 4;
            counter += 1;
        }
        nonce
    }

    /// Issue a key for the literal part-hash prefix `parts`. `expiry` is a
    /// unix timestamp; `None` never expires.
    pub fn generate(
        &self,
        contract: u32,
        parts: &[u32],
        access: Access,
        expiry: Option<u32>,
        issued_at: u32,
    ) -> String {
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&contract.to_be_bytes());
        header[4..].copy_from_slice(&issued_at.to_be_bytes());

        let mut plain = Vec::with_capacity(6 + parts.len() * 4);
        plain.push(access.bits());
        plain.extend_from_slice(&expiry.unwrap_or(0).to_be_bytes());
        plain.push(parts.len() as u8);
        for part in parts {
            plain.extend_from_slice(&part.to_be_bytes());
        }

        let nonce = self.derive_nonce(&header);
        let sealed = self
            .cipher
            .encrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: &plain,
                    aad: &header,
                },
            )
            .expect("aead encryption is infallible for in-memory buffers");

        let mut token = Vec::with_capacity(HEADER_LEN + sealed.len());
        token.extend_from_slice(&header);
        token.extend_from_slice(&sealed);
        URL_SAFE_NO_PAD.encode(token)
    }

    /// Check a presented key against a presented topic and the access the
    /// operation needs. Returns the contract id the key was issued under.
    pub fn validate(
        &self,
        token: &[u8],
        topic: &Topic,
        required: Access,
        now: u32,
    ) -> Result<u32, KeyError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| KeyError::BadFormat)?;
        if raw.len() < HEADER_LEN + TAG_LEN {
            return Err(KeyError::BadFormat);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&raw[..HEADER_LEN]);
        let contract = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);

        let nonce = self.derive_nonce(&header);
        let plain = self
            .cipher
            .decrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: &raw[HEADER_LEN..],
                    aad: &header,
                },
            )
            .map_err(|_| KeyError::BadMac)?;

        if plain.len() < 6 {
            return Err(KeyError::BadFormat);
        }
        let access = Access::from_bits_truncate(plain[0]);
        let expiry = u32::from_be_bytes([plain[1], plain[2], plain[3], plain[4]]);
        let count = plain[5] as usize;
        if plain.len() != 6 + count * 4 {
            return Err(KeyError::BadFormat);
        }
        let mut key_parts = Vec::with_capacity(count);
        for chunk in plain[6..].chunks_exact(4) {
            key_parts.push(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }

        if expiry != 0 && now > expiry {
            return Err(KeyError::Expired);
        }
        if !access.contains(required) {
            return Err(KeyError::Forbidden);
        }

        // The key's literal prefix must cover the presented topic: every
        // encoded part must appear, literally, at the same position. A
        // wildcard inside the prefix would widen the grant, so it fails too.
        if topic.parts.len() < key_parts.len() {
            return Err(KeyError::TopicMismatch);
        }
        for (i, key_part) in key_parts.iter().enumerate() {
            match topic.parts[i] {
                Part::Literal(hash) if hash == *key_part => {}
                _ => return Err(KeyError::TopicMismatch),
            }
        }

        Ok(contract)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::DEFAULT_SALT;

    const MASTER: [u8; 32] = [7u8; 32];
    const CONTRACT: u32 = 0xCAFE_F00D;

    fn codec() -> KeyCodec {
        KeyCodec::new(MASTER, DEFAULT_SALT)
    }

    fn topic(raw: &str) -> Topic {
        Topic::parse(raw, DEFAULT_SALT).unwrap()
    }

    fn issue(codec: &KeyCodec, for_topic: &str, access: Access, expiry: Option<u32>) -> String {
        let t = topic(for_topic);
        codec.generate(CONTRACT, &t.literal_hashes(), access, expiry, 1_000)
    }

    #[test]
    fn access_chars_map_and_ignore_unknowns() {
        assert_eq!(
            Access::from_type_chars("rw"),
            Access::READ | Access::WRITE
        );
        assert_eq!(
            Access::from_type_chars("rwpe"),
            Access::READ | Access::WRITE | Access::PRESENT | Access::EXTEND
        );
        assert_eq!(Access::from_type_chars("zz"), Access::empty());
    }

    #[test]
    fn key_validates_for_its_exact_topic() {
        let codec = codec();
        let key = issue(&codec, "teams.alpha.ch1.u1", Access::READ | Access::WRITE, None);
        let got = codec
            .validate(key.as_bytes(), &topic("teams.alpha.ch1.u1"), Access::READ, 2_000)
            .unwrap();
        assert_eq!(got, CONTRACT);
    }

    #[test]
    fn key_for_a_sibling_topic_is_rejected() {
        let codec = codec();
        let key = issue(&codec, "teams.alpha.ch1.u1", Access::READ, None);
        assert_eq!(
            codec.validate(key.as_bytes(), &topic("teams.alpha.ch2.u1"), Access::READ, 2_000),
            Err(KeyError::TopicMismatch)
        );
    }

    #[test]
    fn subtree_key_authorizes_deeper_topics() {
        let codec = codec();
        let key = issue(&codec, "teams.alpha...", Access::READ, None);
        codec
            .validate(key.as_bytes(), &topic("teams.alpha.ch1"), Access::READ, 2_000)
            .unwrap();
        codec
            .validate(key.as_bytes(), &topic("teams.alpha.ch1.u1.extra"), Access::READ, 2_000)
            .unwrap();
        // The prefix itself is covered too.
        codec
            .validate(key.as_bytes(), &topic("teams.alpha"), Access::READ, 2_000)
            .unwrap();
    }

    #[test]
    fn wildcard_inside_the_key_prefix_is_rejected() {
        let codec = codec();
        let key = issue(&codec, "teams.alpha", Access::READ, None);
        // "teams.*" would also match teams.beta, wider than the grant.
        assert_eq!(
            codec.validate(key.as_bytes(), &topic("teams.*"), Access::READ, 2_000),
            Err(KeyError::TopicMismatch)
        );
        // Wildcards beyond the prefix are fine.
        codec
            .validate(key.as_bytes(), &topic("teams.alpha.*"), Access::READ, 2_000)
            .unwrap();
        codec
            .validate(key.as_bytes(), &topic("teams.alpha..."), Access::READ, 2_000)
            .unwrap();
    }

    #[test]
    fn missing_permission_is_forbidden() {
        let codec = codec();
        let key = issue(&codec, "teams.alpha", Access::READ, None);
        assert_eq!(
            codec.validate(key.as_bytes(), &topic("teams.alpha"), Access::WRITE, 2_000),
            Err(KeyError::Forbidden)
        );
    }

    #[test]
    fn expiry_is_enforced() {
        let codec = codec();
        let key = issue(&codec, "teams.alpha", Access::READ, Some(5_000));
        codec
            .validate(key.as_bytes(), &topic("teams.alpha"), Access::READ, 4_999)
            .unwrap();
        assert_eq!(
            codec.validate(key.as_bytes(), &topic("teams.alpha"), Access::READ, 5_001),
            Err(KeyError::Expired)
        );
    }

    #[test]
    fn tampering_breaks_the_mac() {
        let codec = codec();
        let key = issue(&codec, "teams.alpha", Access::READ, None);
        let mut raw = URL_SAFE_NO_PAD.decode(key.as_bytes()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let forged = URL_SAFE_NO_PAD.encode(raw);
        assert_eq!(
            codec.validate(forged.as_bytes(), &topic("teams.alpha"), Access::READ, 2_000),
            Err(KeyError::BadMac)
        );
    }

    #[test]
    fn wrong_master_key_fails_validation() {
        let issuer = codec();
        let other = KeyCodec::new([9u8; 32], DEFAULT_SALT);
        let key = issue(&issuer, "teams.alpha", Access::READ, None);
        assert_eq!(
            other.validate(key.as_bytes(), &topic("teams.alpha"), Access::READ, 2_000),
            Err(KeyError::BadMac)
        );
    }

    #[test]
    fn garbage_tokens_are_bad_format() {
        let codec = codec();
        assert_eq!(
            codec.validate(b"!!notbase64!!", &topic("teams.alpha"), Access::READ, 2_000),
            Err(KeyError::BadFormat)
        );
        assert_eq!(
            codec.validate(b"c2hvcnQ", &topic("teams.alpha"), Access::READ, 2_000),
            Err(KeyError::BadFormat)
        );
    }

    #[test]
    fn tokens_are_path_safe() {
        let codec = codec();
        for i in 0..16u32 {
            let key = codec.generate(i, &[i, i + 1], Access::READ, None, 1_000 + i);
            assert!(!key.contains('/'), "token must never contain '/'");
            assert!(!key.contains('+'));
        }
    }
}
