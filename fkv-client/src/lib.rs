//! # FlareKV Sync Client
//!
//! Provide a lightweight, synchronous Redis-compatible client with
//! connection pooling, plus a dedicated subscriber mode for receiving
//! pushed pub/sub messages.

mod client;
mod pool;

pub use client::{ClientConfig, ClientError, ClientResult, ClientTtl, KVClient, Subscriber};
