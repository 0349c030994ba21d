//! Core infrastructure: configuration, identifiers, and time.

pub mod config;
pub mod ids;
pub mod time;

pub use config::*;
pub use ids::*;
pub use time::*;
