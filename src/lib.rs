#![deny(clippy::all)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: dispatch paths are inherently branchy
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]

//! Trellis - a real-time publish/subscribe broker.
//!
//! Clients speak a lightweight MQTT 3.1 variant where every topic rides
//! behind a cryptographic access key (`<key>/<dotted.topic>`). Subscriptions
//! live in a wildcard trie keyed by salted part hashes; contracts (tenants)
//! are sharded across cluster nodes and operations for remotely-owned
//! contracts are forwarded to the owner for fan-out there.

pub mod broker;
pub mod cli;
pub mod cluster;
pub mod core;
pub mod messaging;
pub mod net;
pub mod ops;
pub mod protocol;

pub use self::core::config::Config;
pub use self::core::ids::{hash_with_salt, ClientId, SystemHashes};
pub use broker::Service;
pub use cluster::Cluster;
pub use messaging::topic::Topic;
pub use messaging::trie::SubscriptionTrie;
pub use net::security::{Access, KeyCodec};
pub use net::Listener;
