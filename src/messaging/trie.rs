//! Wildcard-aware subscription index.
//!
//! Patterns are stored as paths of salted part hashes, with the two wildcard
//! parts living under their sentinel hashes. Lookups walk the concrete part
//! sequence, branching into the single-wildcard child at every level and
//! collecting multi-wildcard subscribers along the way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::ids::SystemHashes;
use crate::messaging::topic::Part;
use crate::messaging::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberKind {
    /// A live client connection on this node.
    Direct,
    /// A stand-in for a connection that lives on a peer node.
    Proxy,
}

/// Anything that can receive a published message.
pub trait Subscriber: Send + Sync {
    fn id(&self) -> u64;
    fn kind(&self) -> SubscriberKind;
    /// Deliver one message. Returns false when the subscriber's queue did
    /// not accept it within its budget; the message is dropped for that
    /// subscriber only.
    fn send_message(&self, msg: &Message) -> bool;
}

#[derive(Default)]
struct Node {
    children: HashMap<u32, Node>,
    subscribers: Vec<Arc<dyn Subscriber>>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.subscribers.is_empty()
    }
}

/// Registry of (pattern → subscriber set) supporting many concurrent
/// readers. Writers take the write lock briefly; lookups clone the matching
/// subscriber handles out so no lock is held during delivery.
pub struct SubscriptionTrie {
    root: RwLock<Node>,
    hashes: SystemHashes,
    count: AtomicUsize,
}

impl SubscriptionTrie {
    pub fn new(hashes: SystemHashes) -> Self {
        Self {
            root: RwLock::new(Node::default()),
            hashes,
            count: AtomicUsize::new(0),
        }
    }

    fn part_key(&self, part: &Part) -> u32 {
        match part {
            Part::Literal(hash) => *hash,
            Part::SingleWildcard => self.hashes.single_wildcard,
            Part::MultiWildcard => self.hashes.multi_wildcard,
        }
    }

    /// Register a subscriber under a pattern. Idempotent per
    /// (exact pattern, subscriber id).
    pub fn subscribe(&self, parts: &[Part], _depth: u8, subscriber: Arc<dyn Subscriber>) {
        let mut root = self.root.write();
        let mut node = &mut *root;
        for part in parts {
            node = node.children.entry(self.part_key(part)).or_default();
        }
        if node.subscribers.iter().any(|s| s.id() == subscriber.id()) {
            return;
        }
        node.subscribers.push(subscriber);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove one registration. Safe when absent. Empty nodes are pruned on
    /// the way back up.
    pub fn unsubscribe(&self, parts: &[Part], subscriber_id: u64) -> bool {
        let keys: Vec<u32> = parts.iter().map(|p| self.part_key(p)).collect();
        let mut root = self.root.write();
        let removed = Self::remove_at(&mut root, &keys, subscriber_id);
        if removed {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    fn remove_at(node: &mut Node, keys: &[u32], subscriber_id: u64) -> bool {
        match keys.split_first() {
            None => {
                let before = node.subscribers.len();
                node.subscribers.retain(|s| s.id() != subscriber_id);
                node.subscribers.len() < before
            }
            Some((key, rest)) => {
                let Some(child) = node.children.get_mut(key) else {
                    return false;
                };
                let removed = Self::remove_at(child, rest, subscriber_id);
                if child.is_empty() {
                    node.children.remove(key);
                }
                removed
            }
        }
    }

    /// All subscribers whose stored pattern matches the concrete part
    /// sequence. Each subscriber appears at most once even when several of
    /// its patterns match.
    pub fn lookup(&self, concrete: &[u32]) -> Vec<Arc<dyn Subscriber>> {
        let root = self.root.read();
        let mut out: Vec<Arc<dyn Subscriber>> = Vec::new();
        self.collect(&root, concrete, &mut out);
        out
    }

    fn collect(&self, node: &Node, parts: &[u32], out: &mut Vec<Arc<dyn Subscriber>>) {
        if let Some(multi) = node.children.get(&self.hashes.multi_wildcard) {
            Self::push_unique(out, &multi.subscribers);
        }
        let Some((first, rest)) = parts.split_first() else {
            Self::push_unique(out, &node.subscribers);
            return;
        };
        if let Some(child) = node.children.get(first) {
            self.collect(child, rest, out);
        }
        // The concrete part hash can itself be the single-wildcard sentinel
        // (a publish to a literal "*" part); don't walk the same child twice.
        if *first != self.hashes.single_wildcard {
            if let Some(child) = node.children.get(&self.hashes.single_wildcard) {
                self.collect(child, rest, out);
            }
        }
    }

    fn push_unique(out: &mut Vec<Arc<dyn Subscriber>>, subs: &[Arc<dyn Subscriber>]) {
        for sub in subs {
            if !out.iter().any(|s| s.id() == sub.id()) {
                out.push(Arc::clone(sub));
            }
        }
    }

    /// Total registrations across all patterns.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concrete lookup keys for a parsed part sequence, wildcards reduced to
    /// their sentinels. Used for publish-side lookups.
    pub fn concrete_keys(&self, parts: &[Part]) -> Vec<u32> {
        parts.iter().map(|p| self.part_key(p)).collect()
    }
}
