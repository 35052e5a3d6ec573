//! # Connection Pool
//!
//! Purpose: Reuse TCP connections for the sync client's request/reply
//! traffic and dial dedicated ones for subscriber mode.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **LIFO Reuse**: Hand back the most recently parked connection so a
//!    busy caller keeps touching warm sockets.
//! 3. **Fail Fast**: Exceeding the pool limit returns an error immediately.
//! 4. **Out-of-Band Subscribers**: A subscriber connection turns into a
//!    push stream and never goes back into rotation, so it bypasses the
//!    pool accounting entirely.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;

use fkv_common::resp::{encode_command, Parsed, Parser, Value};

use crate::client::{ClientError, ClientResult};

/// Pool configuration for the sync client.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Server address, e.g. "127.0.0.1:6380".
    pub addr: String,
    /// Maximum number of idle connections to keep.
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

struct PoolState {
    /// Parked connections, most recently returned last.
    idle: Vec<Connection>,
    /// Pooled connections alive in total, parked or handed out.
    open: usize,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

/// Connection pool handle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a new connection pool with the provided configuration.
    pub fn new(config: PoolConfig) -> ClientResult<Self> {
        let state = PoolState {
            idle: Vec::with_capacity(config.max_idle),
            open: 0,
        };
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
            }),
        })
    }

    /// Takes a warm connection, or dials a new one while under the
    /// `max_total` budget.
    pub fn acquire(&self) -> ClientResult<PooledConnection> {
        {
            let mut state = self.inner.state.lock();
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledConnection::checked_out(self.inner.clone(), conn));
            }
            if state.open >= self.inner.config.max_total {
                return Err(ClientError::PoolExhausted);
            }
            // Reserve the slot before dialing so concurrent acquires
            // cannot overshoot the budget.
            state.open += 1;
        }

        match Connection::connect(&self.inner.config) {
            Ok(conn) => Ok(PooledConnection::checked_out(self.inner.clone(), conn)),
            Err(err) => {
                let mut state = self.inner.state.lock();
                state.open = state.open.saturating_sub(1);
                Err(err)
            }
        }
    }

    /// Dials a connection the pool never tracks, for subscriber mode.
    pub(crate) fn dedicated(&self) -> ClientResult<Connection> {
        Connection::connect(&self.inner.config)
    }
}

/// RAII wrapper parking the connection again on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    broken: bool,
}

impl PooledConnection {
    fn checked_out(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            broken: false,
        }
    }

    /// Executes a RESP command and returns the parsed response.
    pub fn exec(&mut self, args: &[&[u8]]) -> ClientResult<Value> {
        let conn = self.conn.as_mut().expect("connection exists");
        let response = conn.exec(args);
        if response.is_err() {
            // An IO or framing failure leaves the stream unusable; drop
            // it instead of parking it.
            self.broken = true;
        }
        response
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        let mut state = self.pool.state.lock();
        if self.broken || state.idle.len() >= self.pool.config.max_idle {
            state.open = state.open.saturating_sub(1);
        } else {
            state.idle.push(conn);
        }
    }
}

/// Single TCP connection with reusable buffers.
///
/// Incoming bytes accumulate in `read_buf` and are framed by the shared
/// incremental parser, so a reply split across reads is handled the same
/// way the server handles split commands.
pub(crate) struct Connection {
    stream: TcpStream,
    parser: Parser,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
}

impl Connection {
    pub(crate) fn connect(config: &PoolConfig) -> ClientResult<Self> {
        let stream = connect_stream(config)?;
        if let Some(timeout) = config.read_timeout {
            stream.set_read_timeout(Some(timeout))?;
        }
        if let Some(timeout) = config.write_timeout {
            stream.set_write_timeout(Some(timeout))?;
        }
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        Ok(Connection {
            stream,
            parser: Parser::new(),
            read_buf: BytesMut::with_capacity(4 * 1024),
            write_buf: Vec::with_capacity(256),
        })
    }

    pub(crate) fn exec(&mut self, args: &[&[u8]]) -> ClientResult<Value> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);
        self.stream.write_all(&self.write_buf)?;
        self.stream.flush()?;
        self.read_value()
    }

    /// Reads until one complete RESP value is framed.
    pub(crate) fn read_value(&mut self) -> ClientResult<Value> {
        loop {
            match self.parser.next(&mut self.read_buf) {
                Parsed::Value(value) => return Ok(value),
                Parsed::Skipped => return Err(ClientError::Protocol),
                Parsed::Incomplete => {
                    let mut chunk = [0u8; 4096];
                    let bytes = self.stream.read(&mut chunk)?;
                    if bytes == 0 {
                        return Err(ClientError::Protocol);
                    }
                    self.read_buf.extend_from_slice(&chunk[..bytes]);
                }
            }
        }
    }
}

fn connect_stream(config: &PoolConfig) -> ClientResult<TcpStream> {
    let addr: SocketAddr = config.addr.parse().map_err(|_| ClientError::InvalidAddress)?;
    let stream = match config.connect_timeout {
        Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
        None => TcpStream::connect(addr)?,
    };
    Ok(stream)
}
