//! # Server Configuration
//!
//! Plain configuration structs with defaults matching the documented knobs.
//! The port is resolved in three steps: CLI flag, then `REDIS_PORT`, then
//! `PORT`, falling back to 6380. `NODE_ENV` is accepted but ignored.

use std::env;
use std::time::Duration;

use fkv_common::{FkvError, FkvResult};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 6380;

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP listen port; 0 binds an ephemeral port (used by tests).
    pub port: u16,
    pub writer: WriterConfig,
    pub broker: BrokerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: DEFAULT_PORT,
            writer: WriterConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Configuration for an in-process test server on an ephemeral port.
    pub fn ephemeral() -> Self {
        ServerConfig {
            port: 0,
            ..ServerConfig::default()
        }
    }
}

/// Output-multiplexer tuning.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum messages coalesced into one socket write.
    pub batch_size: usize,
    /// How long a partial batch may wait before it is flushed.
    pub batch_timeout: Duration,
    /// Total queued messages allowed per connection slot.
    pub max_queue_size: usize,
    /// Payloads above this size are split into sequential chunks.
    pub max_chunk_size: usize,
    /// A flush slower than this counts toward the degraded label.
    pub slow_flush_threshold: Duration,
    /// Idle time after which a slot is labeled stale.
    pub stale_after: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            batch_size: 64,
            batch_timeout: Duration::from_millis(5),
            max_queue_size: 1000,
            max_chunk_size: 8192,
            slow_flush_threshold: Duration::from_millis(100),
            stale_after: Duration::from_secs(5 * 60),
        }
    }
}

/// Pub/sub broker tuning.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Subscriber count at which publishes switch to chunked broadcast.
    pub large_channel_threshold: usize,
    /// Period of the buffered-publish flush.
    pub buffer_flush_interval: Duration,
    /// Buffered payloads per channel that force an early flush.
    pub max_buffered_messages: usize,
    /// When false every publish is delivered directly.
    pub batching: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            large_channel_threshold: 100,
            buffer_flush_interval: Duration::from_millis(10),
            max_buffered_messages: 100,
            batching: true,
        }
    }
}

/// Resolves the listen port from the environment.
///
/// `REDIS_PORT` wins over `PORT`; an unset environment yields `None` and a
/// set-but-invalid value is a startup error rather than a silent fallback.
pub fn port_from_env() -> FkvResult<Option<u16>> {
    for name in ["REDIS_PORT", "PORT"] {
        if let Ok(raw) = env::var(name) {
            return parse_port(&raw)
                .map(Some)
                .map_err(|_| FkvError::Config(format!("{name}={raw} is not a valid port")));
        }
    }
    Ok(None)
}

/// Parses a port string, requiring the 1..=65535 range.
pub fn parse_port(raw: &str) -> Result<u16, ()> {
    match raw.trim().parse::<u32>() {
        Ok(port) if (1..=65535).contains(&port) => Ok(port as u16),
        _ => Err(()),
    }
}
