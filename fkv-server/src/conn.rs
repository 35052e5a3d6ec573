//! # Client Connection
//!
//! One accepted socket becomes one `Connection` record plus a reader task.
//! The reader feeds the incremental RESP parser, dispatches each complete
//! command, and enqueues the reply before touching the next command, so
//! pipelined replies never interleave. The writer half lives in the output
//! multiplexer; the reader only holds the slot's failure signal.
//!
//! Teardown order matters: subscriptions are released first, then the
//! writer slot (discarding queued bytes), then the client registry entry,
//! so no broadcast can observe a half-removed subscriber.

use std::net::SocketAddr;
use std::sync::Arc;

use ahash::RandomState;
use bytes::{Bytes, BytesMut};
use hashbrown::HashSet;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use fkv_common::{Parsed, Parser};

use crate::dispatch;
use crate::server::ServerState;
use crate::writer::{ConnId, Priority};

/// Per-connection session state owned by the reader task.
pub struct Connection {
    pub id: ConnId,
    pub addr: SocketAddr,
    subscriptions: HashSet<Vec<u8>, RandomState>,
}

impl Connection {
    pub fn new(id: ConnId, addr: SocketAddr) -> Connection {
        Connection {
            id,
            addr,
            subscriptions: HashSet::with_hasher(RandomState::new()),
        }
    }

    /// Records a channel membership; returns false when already present.
    pub fn subscribe(&mut self, channel: &[u8]) -> bool {
        self.subscriptions.insert(channel.to_vec())
    }

    /// Forgets a channel membership; returns false when absent.
    pub fn unsubscribe(&mut self, channel: &[u8]) -> bool {
        self.subscriptions.remove(channel)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn subscribed_channels(&self) -> Vec<Vec<u8>> {
        self.subscriptions.iter().cloned().collect()
    }

    fn drain_subscriptions(&mut self) -> Vec<Vec<u8>> {
        self.subscriptions.drain().collect()
    }
}

/// Reads and serves one client until EOF, a socket error, or a write-side
/// failure signaled by the multiplexer.
pub async fn handle_connection(
    state: Arc<ServerState>,
    mut connection: Connection,
    mut reader: OwnedReadHalf,
    write_failed: Arc<Notify>,
) {
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut parser = Parser::new();

    'session: loop {
        tokio::select! {
            _ = write_failed.notified() => {
                debug!(id = connection.id, "write side failed, closing");
                break 'session;
            }
            read = reader.read_buf(&mut buffer) => {
                match read {
                    Ok(0) => break 'session,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(id = connection.id, error = %err, "read failed");
                        break 'session;
                    }
                }

                loop {
                    match parser.next(&mut buffer) {
                        Parsed::Value(value) => {
                            let args = value.into_args();
                            if args.is_empty() {
                                continue;
                            }
                            let started = Instant::now();
                            let reply = dispatch::dispatch(&state, &mut connection, args).await;
                            let is_error = reply.first() == Some(&b'-');
                            state.metrics.record_command(started.elapsed());
                            if is_error {
                                state.metrics.record_error();
                            }
                            // The full reply is enqueued before the next
                            // command is parsed, preserving pipeline order.
                            if state
                                .om
                                .enqueue(connection.id, Bytes::from(reply), Priority::High)
                                .is_err()
                            {
                                break 'session;
                            }
                        }
                        Parsed::Skipped => {
                            debug!(id = connection.id, "discarded malformed protocol line");
                        }
                        Parsed::Incomplete => break,
                    }
                }
            }
        }
    }

    close(&state, &mut connection);
}

/// Releases everything a connection holds, in dependency order.
fn close(state: &Arc<ServerState>, connection: &mut Connection) {
    let channels = connection.drain_subscriptions();
    state.broker.unsubscribe_all(connection.id, channels);
    state.om.deregister(connection.id);
    state.clients.lock().remove(&connection.id);
    state.metrics.record_connection_closed();
    debug!(id = connection.id, addr = %connection.addr, "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_set_tracks_membership() {
        let mut connection = Connection::new(1, "127.0.0.1:0".parse().unwrap());
        assert!(connection.subscribe(b"news"));
        assert!(!connection.subscribe(b"news"));
        assert_eq!(connection.subscription_count(), 1);
        assert!(connection.unsubscribe(b"news"));
        assert!(!connection.unsubscribe(b"news"));
        assert_eq!(connection.subscription_count(), 0);
    }

    #[test]
    fn drain_empties_the_set() {
        let mut connection = Connection::new(1, "127.0.0.1:0".parse().unwrap());
        connection.subscribe(b"a");
        connection.subscribe(b"b");
        let mut drained = connection.drain_subscriptions();
        drained.sort();
        assert_eq!(drained, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(connection.subscription_count(), 0);
    }
}
