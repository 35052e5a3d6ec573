//! # FlareKV Server
//!
//! An in-memory, Redis-wire-compatible key/value store with
//! publish-subscribe messaging: the RESP front-end frames client traffic,
//! the keyspace handles TTL expiration, the broker fans published messages
//! out to subscribers, and a per-connection output multiplexer keeps
//! outbound queues bounded, batched, and priority-ordered.

pub mod config;
pub mod conn;
pub mod dispatch;
pub mod info;
pub mod metrics;
pub mod pubsub;
pub mod server;
pub mod writer;

pub use config::{BrokerConfig, ServerConfig, WriterConfig, DEFAULT_PORT};
pub use server::{Server, ServerState};
pub use writer::{ConnId, DropReason, Multiplexer, Priority, SlotHealth};
