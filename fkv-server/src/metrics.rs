//! # Server Metrics
//!
//! Provide lightweight counters and a latency histogram to compute
//! command throughput, error rate, and tail latency for the server.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Use atomic counters to aggregate events cheaply.
//! 2. **Fixed Buckets**: Keep histogram buckets in a contiguous array for cache locality.
//! 3. **Zero-Cost Access**: Expose snapshots as plain structs without heap work.
//!
//! Counters feed the periodic report task and the INFO `# Stats` section,
//! so the numbers clients see are real rather than canned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default latency bucket boundaries in microseconds.
///
/// These are coarse on purpose to keep bucket scans short.
pub const DEFAULT_LATENCY_BUCKETS_US: [u64; 12] =
    [1, 2, 5, 10, 20, 50, 100, 200, 500, 1_000, 2_000, 5_000];

/// Snapshot of all server metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_current: u64,
    pub commands_total: u64,
    pub errors_total: u64,
    pub publishes_total: u64,
    pub messages_delivered: u64,
    pub latency: LatencySnapshot,
}

/// Snapshot of the latency histogram.
#[derive(Debug, Clone)]
pub struct LatencySnapshot {
    /// Bucket boundaries in microseconds.
    pub bounds_us: Vec<u64>,
    /// Bucket counts, including the overflow bucket at the end.
    pub buckets: Vec<u64>,
    /// Total number of samples.
    pub samples: u64,
    /// Sum of latencies in microseconds.
    pub sum_us: u64,
}

/// Thread-safe metrics aggregator for the server.
///
/// All fields are `AtomicU64` with relaxed ordering; the counters only need
/// eventual consistency, never cross-field ordering.
pub struct Metrics {
    connections_accepted: AtomicU64,
    connections_current: AtomicU64,
    commands_total: AtomicU64,
    errors_total: AtomicU64,
    publishes_total: AtomicU64,
    messages_delivered: AtomicU64,
    latency: LatencyHistogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Creates a metrics aggregator with the default latency buckets.
    pub fn new() -> Self {
        Metrics {
            connections_accepted: AtomicU64::new(0),
            connections_current: AtomicU64::new(0),
            commands_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            publishes_total: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            latency: LatencyHistogram::new(DEFAULT_LATENCY_BUCKETS_US.to_vec()),
        }
    }

    pub fn record_connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_current.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_current.fetch_sub(1, Ordering::Relaxed);
    }

    /// Records one handled command and its processing latency.
    pub fn record_command(&self, latency: Duration) {
        self.commands_total.fetch_add(1, Ordering::Relaxed);
        self.latency.record(latency);
    }

    /// Records a command that was answered with an error reply.
    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish(&self, delivered: u64) {
        self.publishes_total.fetch_add(1, Ordering::Relaxed);
        self.messages_delivered.fetch_add(delivered, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of all counters and buckets.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_current: self.connections_current.load(Ordering::Relaxed),
            commands_total: self.commands_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            publishes_total: self.publishes_total.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

/// Fixed-bucket latency histogram.
///
/// Bucket selection is a linear scan; the bound list is short and stays hot
/// in cache.
pub struct LatencyHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    /// Creates a histogram with explicit bucket boundaries (microseconds,
    /// ascending). The last bucket is the overflow bucket.
    pub fn new(bounds_us: Vec<u64>) -> Self {
        let mut buckets = Vec::with_capacity(bounds_us.len() + 1);
        for _ in 0..=bounds_us.len() {
            buckets.push(AtomicU64::new(0));
        }
        LatencyHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    /// Records a latency measurement into the histogram.
    pub fn record(&self, latency: Duration) {
        let micros = latency.as_micros().min(u128::from(u64::MAX)) as u64;
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);

        let idx = self
            .bounds_us
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(self.bounds_us.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of the histogram.
    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            bounds_us: self.bounds_us.clone(),
            buckets: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}
