use thiserror::Error;

use crate::core::ids::hash_with_salt;

/// Separator between the access key and the dotted topic on the wire.
const KEY_SEPARATOR: char = '/';
/// Separator between topic parts.
const PART_SEPARATOR: char = '.';

pub const SINGLE_WILDCARD: &str = "*";
pub const MULTI_WILDCARD: &str = "...";

/// Reserved key presented for system requests (`unitd/keygen` etc).
pub const SYSTEM_KEY: &[u8] = b"unitd";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,
    #[error("topic part {0} is empty")]
    EmptyPart(usize),
    #[error("multi-level wildcard is only valid as the final part")]
    MultiWildcardNotLast,
    #[error("topic exceeds {0} parts")]
    TooDeep(usize),
}

const MAX_PARTS: usize = 128;

/// One parsed topic part. Literals are reduced to their salted hash at parse
/// time; the two wildcards stay tagged so the trie can place them under
/// their sentinel hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Part {
    Literal(u32),
    SingleWildcard,
    MultiWildcard,
}

/// A parsed `<key>/<dotted.topic>` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    /// Access key captured verbatim; empty when the client presented none.
    pub key: Vec<u8>,
    /// Dotted topic portion without the key prefix.
    pub text: String,
    pub parts: Vec<Part>,
    /// Count of literal and single-wildcard parts.
    pub depth: u8,
    pub has_trailing_multi: bool,
}

impl Topic {
    pub fn parse(raw: &str, salt: u32) -> Result<Self, TopicError> {
        if raw.is_empty() {
            return Err(TopicError::Empty);
        }
        let (key, text) = match raw.split_once(KEY_SEPARATOR) {
            Some((key, rest)) => (key.as_bytes().to_vec(), rest),
            None => (Vec::new(), raw),
        };
        if text.is_empty() {
            return Err(TopicError::Empty);
        }

        let raw_parts: Vec<&str> = text.split(PART_SEPARATOR).collect();
        if raw_parts.len() > MAX_PARTS {
            return Err(TopicError::TooDeep(MAX_PARTS));
        }
        let mut parts = Vec::with_capacity(raw_parts.len());
        let mut depth = 0u8;
        let mut has_trailing_multi = false;
        for (i, part) in raw_parts.iter().enumerate() {
            match *part {
                MULTI_WILDCARD => {
                    if i != raw_parts.len() - 1 {
                        return Err(TopicError::MultiWildcardNotLast);
                    }
                    parts.push(Part::MultiWildcard);
                    has_trailing_multi = true;
                }
                SINGLE_WILDCARD => {
                    parts.push(Part::SingleWildcard);
                    depth += 1;
                }
                "" => return Err(TopicError::EmptyPart(i)),
                literal => {
                    parts.push(Part::Literal(hash_with_salt(literal.as_bytes(), salt)));
                    depth += 1;
                }
            }
        }

        Ok(Self {
            key,
            text: text.to_string(),
            parts,
            depth,
            has_trailing_multi,
        })
    }

    /// Hash of the sole literal part, for system-topic dispatch.
    pub fn single_literal(&self) -> Option<u32> {
        match self.parts.as_slice() {
            [Part::Literal(hash)] => Some(*hash),
            _ => None,
        }
    }

    pub fn is_system_request(&self) -> bool {
        self.key == SYSTEM_KEY
    }

    /// Literal hashes only; `None` as soon as a wildcard appears. Keys are
    /// issued against literal prefixes, so this is what the key codec binds.
    pub fn literal_hashes(&self) -> Vec<u32> {
        self.parts
            .iter()
            .map_while(|p| match p {
                Part::Literal(h) => Some(*h),
                _ => None,
            })
            .collect()
    }
}
