//! # FlareKV Keyspace Engine
//!
//! Provide the in-memory string keyspace with TTL deadlines, one-shot
//! expiry timers, and the glob matching used by KEYS and SCAN.

pub mod pattern;
pub mod store;

pub use pattern::glob_match;
pub use store::{Store, Ttl};
