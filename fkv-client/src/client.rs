//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking API for issuing Redis-compatible
//! commands to a FlareKV server over RESP2.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides pooling and protocol details.
//! 2. **Borrow-Friendly API**: Accept `&[u8]` to avoid unnecessary copies.
//! 3. **Fail Fast**: Protocol violations surface immediately as errors.
//! 4. **Raw Escape Hatch**: `command` sends any argument list for callers
//!    exercising commands the typed surface does not cover.

use std::fmt;
use std::time::Duration;

use fkv_common::resp::Value;

use crate::pool::{Connection, ConnectionPool, PoolConfig};

/// Result type for the sync client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the sync client.
#[derive(Debug)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    Io(std::io::Error),
    /// RESP2 framing or parse error.
    Protocol,
    /// Server returned an error reply.
    Server { message: Vec<u8> },
    /// Response type did not match the expected command response.
    UnexpectedResponse,
    /// Pool is at capacity and no idle connections are available.
    PoolExhausted,
    /// Address could not be parsed into a socket address.
    InvalidAddress,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Io(err) => write!(f, "io error: {}", err),
            ClientError::Protocol => write!(f, "protocol error"),
            ClientError::Server { message } => {
                write!(f, "server error: {}", String::from_utf8_lossy(message))
            }
            ClientError::UnexpectedResponse => write!(f, "unexpected response"),
            ClientError::PoolExhausted => write!(f, "connection pool exhausted"),
            ClientError::InvalidAddress => write!(f, "invalid address"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err)
    }
}

/// TTL state returned by the server, mirroring Redis semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// Configuration for the synchronous client and its pool.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, e.g. "127.0.0.1:6380".
    pub addr: String,
    /// Maximum idle connections kept in the pool.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// Optional TCP read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "127.0.0.1:6380".to_string(),
            max_idle: 8,
            max_total: 16,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
        }
    }
}

/// Synchronous client with connection pooling.
///
/// This is a facade over the pool and the shared RESP codec. Each call
/// acquires a connection, executes one command, and returns the connection
/// to the pool.
pub struct KVClient {
    pool: ConnectionPool,
}

impl KVClient {
    /// Creates a client with default configuration.
    pub fn connect(addr: impl Into<String>) -> ClientResult<Self> {
        let config = ClientConfig {
            addr: addr.into(),
            ..ClientConfig::default()
        };
        Self::with_config(config)
    }

    /// Creates a client with a custom configuration.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        let pool = ConnectionPool::new(PoolConfig {
            addr: config.addr,
            max_idle: config.max_idle,
            max_total: config.max_total,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            connect_timeout: config.connect_timeout,
        })?;
        Ok(KVClient { pool })
    }

    /// Sends an arbitrary command and returns the raw reply value.
    pub fn command(&self, args: &[&[u8]]) -> ClientResult<Value> {
        let mut conn = self.pool.acquire()?;
        conn.exec(args)
    }

    /// Fetches a value by key. Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        match self.command(&[b"GET", key])? {
            Value::Bulk(data) => Ok(data),
            Value::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a value for a key without expiration.
    pub fn set(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        match self.command(&[b"SET", key, value])? {
            Value::Simple(_) => Ok(()),
            Value::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a value and attaches an expiration in seconds.
    pub fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> ClientResult<()> {
        let seconds = ttl.as_secs().to_string();
        match self.command(&[b"SET", key, value, b"EX", seconds.as_bytes()])? {
            Value::Simple(_) => Ok(()),
            Value::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Deletes a key. Returns true when a key was removed.
    pub fn delete(&self, key: &[u8]) -> ClientResult<bool> {
        match self.command(&[b"DEL", key])? {
            Value::Integer(count) => Ok(count > 0),
            Value::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Returns true when the key exists.
    pub fn exists(&self, key: &[u8]) -> ClientResult<bool> {
        match self.command(&[b"EXISTS", key])? {
            Value::Integer(count) => Ok(count > 0),
            Value::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a time-to-live on a key. Returns true when the TTL was set.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> ClientResult<bool> {
        let seconds = ttl.as_secs().to_string();
        match self.command(&[b"EXPIRE", key, seconds.as_bytes()])? {
            Value::Integer(value) => Ok(value == 1),
            Value::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Clears a key's TTL. Returns true when a TTL was removed.
    pub fn persist(&self, key: &[u8]) -> ClientResult<bool> {
        match self.command(&[b"PERSIST", key])? {
            Value::Integer(value) => Ok(value == 1),
            Value::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Returns TTL status for a key.
    pub fn ttl(&self, key: &[u8]) -> ClientResult<ClientTtl> {
        match self.command(&[b"TTL", key])? {
            Value::Integer(-2) => Ok(ClientTtl::Missing),
            Value::Integer(-1) => Ok(ClientTtl::NoExpiry),
            Value::Integer(value) if value >= 0 => {
                Ok(ClientTtl::ExpiresIn(Duration::from_secs(value as u64)))
            }
            Value::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Lists keys matching a glob pattern.
    pub fn keys(&self, pattern: &[u8]) -> ClientResult<Vec<Vec<u8>>> {
        match self.command(&[b"KEYS", pattern])? {
            Value::Array(Some(items)) => collect_bulks(items),
            Value::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// One SCAN step. Returns the next cursor and the keys in this slice.
    pub fn scan(&self, cursor: u64, count: usize) -> ClientResult<(u64, Vec<Vec<u8>>)> {
        let cursor = cursor.to_string();
        let count = count.to_string();
        let reply = self.command(&[b"SCAN", cursor.as_bytes(), b"COUNT", count.as_bytes()])?;
        match reply {
            Value::Array(Some(items)) if items.len() == 2 => {
                let mut items = items.into_iter();
                let next = match items.next() {
                    Some(Value::Bulk(Some(data))) => std::str::from_utf8(&data)
                        .ok()
                        .and_then(|text| text.parse().ok())
                        .ok_or(ClientError::UnexpectedResponse)?,
                    _ => return Err(ClientError::UnexpectedResponse),
                };
                let keys = match items.next() {
                    Some(Value::Array(Some(keys))) => collect_bulks(keys)?,
                    _ => return Err(ClientError::UnexpectedResponse),
                };
                Ok((next, keys))
            }
            Value::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Number of keys in the store.
    pub fn dbsize(&self) -> ClientResult<i64> {
        match self.command(&[b"DBSIZE"])? {
            Value::Integer(count) => Ok(count),
            Value::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Publishes a message; returns the delivered count.
    pub fn publish(&self, channel: &[u8], message: &[u8]) -> ClientResult<i64> {
        match self.command(&[b"PUBLISH", channel, message])? {
            Value::Integer(count) => Ok(count),
            Value::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Pings the server. Returns the raw response payload.
    pub fn ping(&self, payload: Option<&[u8]>) -> ClientResult<Vec<u8>> {
        let response = match payload {
            Some(data) => self.command(&[b"PING", data])?,
            None => self.command(&[b"PING"])?,
        };
        match response {
            Value::Simple(text) => Ok(text),
            Value::Bulk(Some(data)) => Ok(data),
            Value::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Fetches server INFO output.
    pub fn info(&self) -> ClientResult<Vec<u8>> {
        match self.command(&[b"INFO"])? {
            Value::Bulk(Some(data)) => Ok(data),
            Value::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Opens a dedicated subscriber connection outside the pool.
    pub fn subscriber(&self) -> ClientResult<Subscriber> {
        let conn = self.pool.dedicated()?;
        Ok(Subscriber { conn })
    }
}

fn collect_bulks(items: Vec<Value>) -> ClientResult<Vec<Vec<u8>>> {
    items
        .into_iter()
        .map(|item| match item {
            Value::Bulk(Some(data)) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse),
        })
        .collect()
}

/// A connection in subscriber mode: it issues SUBSCRIBE/UNSUBSCRIBE and
/// then consumes pushed `["message", channel, payload]` arrays.
pub struct Subscriber {
    conn: Connection,
}

impl Subscriber {
    /// Subscribes to a channel; returns the connection's subscription
    /// count from the confirmation array.
    pub fn subscribe(&mut self, channel: &[u8]) -> ClientResult<i64> {
        match self.conn.exec(&[b"SUBSCRIBE", channel])? {
            Value::Array(Some(items)) => confirmation_count(items, b"subscribe"),
            Value::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Drops one channel subscription.
    pub fn unsubscribe(&mut self, channel: &[u8]) -> ClientResult<i64> {
        match self.conn.exec(&[b"UNSUBSCRIBE", channel])? {
            Value::Array(Some(items)) => confirmation_count(items, b"unsubscribe"),
            Value::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Blocks until the next pushed message arrives; returns
    /// (channel, payload).
    pub fn next_message(&mut self) -> ClientResult<(Vec<u8>, Vec<u8>)> {
        loop {
            match self.conn.read_value()? {
                Value::Array(Some(items)) if items.len() == 3 => {
                    let mut items = items.into_iter();
                    let kind = items.next();
                    if !matches!(kind, Some(Value::Bulk(Some(ref data))) if data == b"message") {
                        // Confirmation frames may still be in flight.
                        continue;
                    }
                    let channel = match items.next() {
                        Some(Value::Bulk(Some(data))) => data,
                        _ => return Err(ClientError::UnexpectedResponse),
                    };
                    let payload = match items.next() {
                        Some(Value::Bulk(Some(data))) => data,
                        _ => return Err(ClientError::UnexpectedResponse),
                    };
                    return Ok((channel, payload));
                }
                Value::Error(message) => return Err(ClientError::Server { message }),
                _ => return Err(ClientError::UnexpectedResponse),
            }
        }
    }
}

fn confirmation_count(items: Vec<Value>, expected: &[u8]) -> ClientResult<i64> {
    if items.len() != 3 {
        return Err(ClientError::UnexpectedResponse);
    }
    match (&items[0], &items[2]) {
        (Value::Bulk(Some(kind)), Value::Integer(count)) if kind == expected => Ok(*count),
        _ => Err(ClientError::UnexpectedResponse),
    }
}
