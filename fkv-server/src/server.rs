//! # TCP Server
//!
//! Accept RESP2 connections and wire each one to the dispatcher, the
//! output multiplexer, and the pub/sub broker. All shared state hangs off
//! one `ServerState` value so tests can run several instances on
//! ephemeral ports.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use fkv_common::FkvResult;
use fkv_engine::Store;

use crate::config::ServerConfig;
use crate::conn::{handle_connection, Connection};
use crate::metrics::Metrics;
use crate::pubsub::Broker;
use crate::writer::{ConnId, Multiplexer};

const HEALTH_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Registry entry kept per live connection, for CLIENT LIST and INFO.
pub struct ClientMeta {
    pub addr: SocketAddr,
    pub name: Option<Vec<u8>>,
    pub created_at: Instant,
    pub subscriptions: usize,
}

/// Everything the dispatcher and background tasks share.
pub struct ServerState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub broker: Broker,
    pub om: Multiplexer,
    pub metrics: Metrics,
    pub clients: Mutex<HashMap<ConnId, ClientMeta, RandomState>>,
    pub started_at: Instant,
    /// Actual bound port, resolved after binding (the config may say 0).
    pub port: u16,
    next_conn_id: AtomicU64,
}

impl ServerState {
    fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

/// A bound server, ready to run.
pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    /// Binds on all interfaces at the configured port.
    pub async fn bind(config: ServerConfig) -> FkvResult<Server> {
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        let port = listener.local_addr()?.port();
        let state = Arc::new(ServerState {
            store: Arc::new(Store::new()),
            broker: Broker::new(config.broker.clone()),
            om: Multiplexer::new(config.writer.clone()),
            metrics: Metrics::new(),
            clients: Mutex::new(HashMap::with_hasher(RandomState::new())),
            started_at: Instant::now(),
            port,
            next_conn_id: AtomicU64::new(0),
            config,
        });
        Ok(Server { listener, state })
    }

    pub fn local_addr(&self) -> FkvResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Accepts connections until `shutdown` completes, then stops the
    /// background tasks. Existing connection tasks end with the process.
    pub async fn run(self, shutdown: impl Future) -> FkvResult<()> {
        let state = self.state;
        let background = spawn_background_tasks(&state);
        info!(port = state.port, "listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => accept_connection(&state, socket, addr),
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        for task in background {
            task.abort();
        }
        info!("server shut down");
        Ok(())
    }
}

fn accept_connection(state: &Arc<ServerState>, socket: TcpStream, addr: SocketAddr) {
    if let Err(err) = socket.set_nodelay(true) {
        debug!(error = %err, "set_nodelay failed");
    }
    let id = state.next_conn_id();
    state.metrics.record_connection_opened();

    let (read_half, write_half) = socket.into_split();
    let write_failed = state.om.register(id, write_half);
    state.clients.lock().insert(
        id,
        ClientMeta {
            addr,
            name: None,
            created_at: Instant::now(),
            subscriptions: 0,
        },
    );
    debug!(id, %addr, "connection accepted");

    tokio::spawn(handle_connection(
        Arc::clone(state),
        Connection::new(id, addr),
        read_half,
        write_failed,
    ));
}

/// Periodic work: pub/sub buffer flush, slot health sweep, metrics report.
/// Failures inside the tasks are logged by the callees and never escape.
fn spawn_background_tasks(state: &Arc<ServerState>) -> Vec<JoinHandle<()>> {
    let flush = {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            let mut tick = interval(state.config.broker.buffer_flush_interval);
            loop {
                tick.tick().await;
                state.broker.flush_buffers(&state.om);
            }
        })
    };

    let sweep = {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            let mut tick = interval(HEALTH_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                state.om.sweep_health();
            }
        })
    };

    let report = {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            let mut tick = interval(METRICS_REPORT_INTERVAL);
            // The first tick fires immediately; skip it so the first
            // report covers a full minute.
            tick.tick().await;
            loop {
                tick.tick().await;
                let metrics = state.metrics.snapshot();
                let writers = state.om.aggregate();
                info!(
                    connections = metrics.connections_current,
                    commands = metrics.commands_total,
                    errors = metrics.errors_total,
                    publishes = metrics.publishes_total,
                    delivered = metrics.messages_delivered,
                    queued = writers.queued_messages,
                    sent = writers.messages_sent,
                    dropped = writers.messages_dropped,
                    backpressure = writers.backpressure_events,
                    slow_flushes = writers.slow_flushes,
                    keys = state.store.len(),
                    channels = state.broker.channel_count(),
                    "metrics report"
                );
            }
        })
    };

    vec![flush, sweep, report]
}
