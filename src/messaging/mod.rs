//! Topic parsing, the subscription trie, and per-connection refcounts.

pub mod counters;
pub mod topic;
pub mod trie;

pub use counters::Counters;
pub use topic::{Part, Topic, TopicError};
pub use trie::{Subscriber, SubscriberKind, SubscriptionTrie};

use bytes::Bytes;

/// A message in flight: the wire topic it was published on and its payload.
/// Payload bytes are shared, not copied, across the fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
