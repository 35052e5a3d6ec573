//! # INFO Rendering
//!
//! Builds the sectioned INFO block. Stats come from the live metrics
//! counters; memory figures are synthetic since the keyspace does not do
//! byte accounting.

use std::fmt::Write;

use crate::server::ServerState;

/// Reported for `redis_version`; chosen for client compatibility checks.
const COMPAT_VERSION: &str = "7.0.0";

/// Renders the full INFO block. A requested section name is accepted but
/// the whole block is always returned.
pub fn render(state: &ServerState) -> Vec<u8> {
    let metrics = state.metrics.snapshot();
    let writers = state.om.aggregate();
    let (keys, expires) = state.store.ttl_stats();
    let uptime = state.started_at.elapsed().as_secs();

    let mut out = String::with_capacity(768);
    let _ = write!(
        out,
        "# Server\r\n\
         redis_version:{COMPAT_VERSION}\r\n\
         flarekv_version:{}\r\n\
         redis_mode:standalone\r\n\
         os:{}\r\n\
         arch_bits:64\r\n\
         process_id:{}\r\n\
         tcp_port:{}\r\n\
         uptime_in_seconds:{uptime}\r\n\
         uptime_in_days:{}\r\n\
         \r\n",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::process::id(),
        state.port,
        uptime / 86_400,
    );
    let _ = write!(
        out,
        "# Clients\r\n\
         connected_clients:{}\r\n\
         blocked_clients:0\r\n\
         \r\n",
        state.client_count(),
    );
    let _ = write!(
        out,
        "# Memory\r\n\
         used_memory:1048576\r\n\
         used_memory_human:1.00M\r\n\
         \r\n",
    );
    let _ = write!(
        out,
        "# Stats\r\n\
         total_connections_received:{}\r\n\
         total_commands_processed:{}\r\n\
         total_error_replies:{}\r\n\
         total_publishes:{}\r\n\
         messages_delivered:{}\r\n\
         messages_dropped:{}\r\n\
         pubsub_channels:{}\r\n\
         \r\n",
        metrics.connections_accepted,
        metrics.commands_total,
        metrics.errors_total,
        metrics.publishes_total,
        metrics.messages_delivered,
        writers.messages_dropped,
        state.broker.channel_count(),
    );
    let _ = write!(
        out,
        "# Replication\r\n\
         role:master\r\n\
         connected_slaves:0\r\n\
         \r\n\
         # CPU\r\n\
         used_cpu_sys:0.00\r\n\
         used_cpu_user:0.00\r\n\
         \r\n",
    );
    let _ = write!(out, "# Keyspace\r\ndb0:keys={keys},expires={expires},avg_ttl=0\r\n");
    out.into_bytes()
}
