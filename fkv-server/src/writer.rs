//! # Output Multiplexer
//!
//! Per-connection outbound queues with priority ordering, batching, a hard
//! capacity bound, and backpressure handling.
//!
//! ## Design Principles
//! 1. **Single Writer**: Each registered socket is owned by exactly one
//!    writer task, so at most one flush is ever active per slot.
//! 2. **Lock-Free I/O**: The slot mutex guards queue state only; it is
//!    released before any socket call.
//! 3. **Priority First**: Flushes drain the priority queue fully before
//!    normal, and normal fully before low; FIFO within a class.
//! 4. **Bounded Memory**: Enqueueing past the capacity evicts the oldest
//!    low (then disproportionate normal) message instead of growing.
//!
//! Large payloads are split into sequential chunks at enqueue time; chunks
//! stay contiguous because they enter the same FIFO back-to-back and no
//! other producer can interleave within one enqueue call.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::WriterConfig;

/// Stable identifier for a connection; the broker stores these instead of
/// connection references.
pub type ConnId = u64;

/// Outbound priority classes.
///
/// Replies use `High`; pub/sub deliveries default to `Normal` unless the
/// subscription says otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No slot is registered for the target connection.
    SocketNotRegistered,
    /// The slot is at capacity and the policy rejected the payload.
    QueueFull,
}

/// Health label of a slot, re-evaluated by the periodic sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotHealth {
    Healthy,
    Degraded,
    Overloaded,
    Unhealthy,
    Stale,
}

impl SlotHealth {
    fn as_u8(self) -> u8 {
        match self {
            SlotHealth::Healthy => 0,
            SlotHealth::Degraded => 1,
            SlotHealth::Overloaded => 2,
            SlotHealth::Unhealthy => 3,
            SlotHealth::Stale => 4,
        }
    }

    fn from_u8(raw: u8) -> SlotHealth {
        match raw {
            1 => SlotHealth::Degraded,
            2 => SlotHealth::Overloaded,
            3 => SlotHealth::Unhealthy,
            4 => SlotHealth::Stale,
            _ => SlotHealth::Healthy,
        }
    }
}

/// Result of a fan-out enqueue across many slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub failed: usize,
}

/// Aggregate counters across live slots, for the periodic report.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterTotals {
    pub slots: usize,
    pub queued_messages: usize,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_dropped: u64,
    pub queue_full_events: u64,
    pub backpressure_events: u64,
    pub write_errors: u64,
    pub slow_flushes: u64,
}

#[derive(Debug, Clone, Copy)]
struct Chunk {
    index: u32,
    total: u32,
}

#[derive(Debug)]
struct QueuedMessage {
    payload: Bytes,
    enqueued_at: Instant,
    original_size: usize,
    chunk: Option<Chunk>,
}

#[derive(Debug, Default)]
struct SlotQueues {
    high: VecDeque<QueuedMessage>,
    normal: VecDeque<QueuedMessage>,
    low: VecDeque<QueuedMessage>,
    /// Pending batch flush time for normal/low traffic.
    batch_deadline: Option<Instant>,
}

enum PushOutcome {
    /// Queued, after evicting this many older messages.
    Queued { evicted: usize },
    /// The incoming payload itself was refused.
    Rejected,
}

impl SlotQueues {
    fn total(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn is_empty(&self) -> bool {
        self.total() == 0
    }

    fn queue_mut(&mut self, priority: Priority) -> &mut VecDeque<QueuedMessage> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    /// Pops the next message in priority order.
    fn pop_next(&mut self) -> Option<QueuedMessage> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    /// Applies the capacity policy, then queues `payload`, splitting it
    /// into contiguous chunks when it exceeds `max_chunk_size`.
    ///
    /// An oversized payload enters the queue as several messages, so room
    /// is reserved for every chunk before anything is queued; the
    /// post-push total never exceeds `max_queue_size`.
    fn push(&mut self, payload: Bytes, priority: Priority, config: &WriterConfig) -> PushOutcome {
        let size = payload.len();
        let needed = size.div_ceil(config.max_chunk_size).max(1);
        let mut evicted = 0;
        while self.total() + needed > config.max_queue_size {
            if self.low.pop_front().is_some() {
                evicted += 1;
            } else if priority == Priority::Low {
                return PushOutcome::Rejected;
            } else if self.normal.len() > self.high.len() * 2 && self.normal.pop_front().is_some()
            {
                evicted += 1;
            } else {
                // Nothing evictable; refuse rather than grow past the cap.
                return PushOutcome::Rejected;
            }
        }

        let now = Instant::now();
        if size > config.max_chunk_size {
            let total = needed as u32;
            let queue = self.queue_mut(priority);
            for (index, start) in (0..size).step_by(config.max_chunk_size).enumerate() {
                let end = (start + config.max_chunk_size).min(size);
                queue.push_back(QueuedMessage {
                    payload: payload.slice(start..end),
                    enqueued_at: now,
                    original_size: size,
                    chunk: Some(Chunk {
                        index: index as u32,
                        total,
                    }),
                });
            }
        } else {
            self.queue_mut(priority).push_back(QueuedMessage {
                payload,
                enqueued_at: now,
                original_size: size,
                chunk: None,
            });
        }
        PushOutcome::Queued { evicted }
    }
}

#[derive(Debug, Default)]
struct SlotCounters {
    messages_queued: AtomicU64,
    bytes_queued: AtomicU64,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_dropped: AtomicU64,
    queue_full_events: AtomicU64,
    backpressure_events: AtomicU64,
    write_errors: AtomicU64,
    slow_flushes: AtomicU64,
    chunked_sent: AtomicU64,
}

struct Slot {
    id: ConnId,
    queues: Mutex<SlotQueues>,
    /// Wakes the writer task on new work or shutdown.
    notify: Notify,
    /// Signals the connection's reader that the write side failed.
    fail: Arc<Notify>,
    flushing: AtomicBool,
    closed: AtomicBool,
    counters: SlotCounters,
    health: AtomicU8,
    last_activity: Mutex<Instant>,
}

impl Slot {
    fn new(id: ConnId) -> Slot {
        Slot {
            id,
            queues: Mutex::new(SlotQueues::default()),
            notify: Notify::new(),
            fail: Arc::new(Notify::new()),
            flushing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            counters: SlotCounters::default(),
            health: AtomicU8::new(SlotHealth::Healthy.as_u8()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn health(&self) -> SlotHealth {
        SlotHealth::from_u8(self.health.load(Ordering::Relaxed))
    }

    fn set_health(&self, health: SlotHealth) {
        self.health.store(health.as_u8(), Ordering::Relaxed);
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }
}

/// Classifies a slot from its counters.
///
/// Error pressure dominates, then queue pressure, then slowness; a quiet
/// slot goes stale after the configured idle window.
fn classify(
    write_errors: u64,
    queue_full_events: u64,
    slow_flushes: u64,
    idle_for: Duration,
    stale_after: Duration,
) -> SlotHealth {
    if write_errors > 3 {
        SlotHealth::Unhealthy
    } else if queue_full_events > 3 {
        SlotHealth::Overloaded
    } else if slow_flushes > 5 {
        SlotHealth::Degraded
    } else if idle_for >= stale_after {
        SlotHealth::Stale
    } else {
        SlotHealth::Healthy
    }
}

/// Registry of per-connection writer slots.
pub struct Multiplexer {
    config: WriterConfig,
    slots: Mutex<HashMap<ConnId, Arc<Slot>, RandomState>>,
}

impl Multiplexer {
    pub fn new(config: WriterConfig) -> Multiplexer {
        Multiplexer {
            config,
            slots: Mutex::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    /// Registers the write half of an accepted socket and starts its
    /// writer task. The returned notify fires if the write side fails, so
    /// the reader can tear the connection down.
    pub fn register(&self, id: ConnId, writer: OwnedWriteHalf) -> Arc<Notify> {
        let slot = Arc::new(Slot::new(id));
        let fail = Arc::clone(&slot.fail);
        self.slots.lock().insert(id, Arc::clone(&slot));
        tokio::spawn(writer_task(slot, writer, self.config.clone()));
        fail
    }

    /// Removes a slot; queued bytes are discarded and the writer task
    /// exits.
    pub fn deregister(&self, id: ConnId) {
        let slot = self.slots.lock().remove(&id);
        if let Some(slot) = slot {
            slot.closed.store(true, Ordering::Release);
            slot.notify.notify_one();
            trace!(id, "slot deregistered");
        }
    }

    /// Queues `payload` for `id` at the given priority.
    pub fn enqueue(&self, id: ConnId, payload: Bytes, priority: Priority) -> Result<(), DropReason> {
        let slot = match self.slots.lock().get(&id) {
            Some(slot) => Arc::clone(slot),
            None => return Err(DropReason::SocketNotRegistered),
        };
        if slot.closed.load(Ordering::Acquire) {
            return Err(DropReason::SocketNotRegistered);
        }

        let size = payload.len() as u64;
        let outcome = {
            let mut queues = slot.queues.lock();
            let outcome = queues.push(payload, priority, &self.config);
            if matches!(outcome, PushOutcome::Queued { .. })
                && priority != Priority::High
                && queues.batch_deadline.is_none()
            {
                queues.batch_deadline = Some(Instant::now() + self.config.batch_timeout);
            }
            outcome
        };

        match outcome {
            PushOutcome::Queued { evicted } => {
                if evicted > 0 {
                    slot.counters
                        .messages_dropped
                        .fetch_add(evicted as u64, Ordering::Relaxed);
                    debug!(id, evicted, "queue at capacity, evicted oldest");
                }
                slot.counters.messages_queued.fetch_add(1, Ordering::Relaxed);
                slot.counters.bytes_queued.fetch_add(size, Ordering::Relaxed);
                slot.touch();
                slot.notify.notify_one();
                Ok(())
            }
            PushOutcome::Rejected => {
                slot.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
                slot.counters
                    .queue_full_events
                    .fetch_add(1, Ordering::Relaxed);
                debug!(id, "queue full, payload dropped");
                Err(DropReason::QueueFull)
            }
        }
    }

    /// Fan-out enqueue of one shared payload.
    ///
    /// Small target sets are handled inline; larger ones are processed in
    /// chunks of 50 with a yield between chunks so other tasks can run.
    pub async fn broadcast(
        &self,
        targets: &[ConnId],
        payload: &Bytes,
        priority: Priority,
    ) -> BroadcastOutcome {
        const SYNC_LIMIT: usize = 100;
        const CHUNK: usize = 50;

        let mut outcome = BroadcastOutcome::default();
        if targets.len() <= SYNC_LIMIT {
            for &id in targets {
                self.tally(&mut outcome, id, payload, priority);
            }
            return outcome;
        }

        for chunk in targets.chunks(CHUNK) {
            for &id in chunk {
                self.tally(&mut outcome, id, payload, priority);
            }
            tokio::task::yield_now().await;
        }
        outcome
    }

    fn tally(&self, outcome: &mut BroadcastOutcome, id: ConnId, payload: &Bytes, priority: Priority) {
        match self.enqueue(id, payload.clone(), priority) {
            Ok(()) => outcome.delivered += 1,
            Err(_) => outcome.failed += 1,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn slot_health(&self, id: ConnId) -> Option<SlotHealth> {
        self.slots.lock().get(&id).map(|slot| slot.health())
    }

    /// Re-labels every slot from its counters; run by the 30 s sweep.
    pub fn sweep_health(&self) {
        let slots: Vec<Arc<Slot>> = self.slots.lock().values().cloned().collect();
        let now = Instant::now();
        for slot in slots {
            let label = classify(
                slot.counters.write_errors.load(Ordering::Relaxed),
                slot.counters.queue_full_events.load(Ordering::Relaxed),
                slot.counters.slow_flushes.load(Ordering::Relaxed),
                slot.idle_for(now),
                self.config.stale_after,
            );
            if label != slot.health() {
                slot.set_health(label);
                match label {
                    SlotHealth::Healthy | SlotHealth::Stale => {
                        debug!(id = slot.id, ?label, "slot health changed")
                    }
                    _ => warn!(id = slot.id, ?label, "slot health changed"),
                }
            }
        }
    }

    /// Sums counters across live slots for the periodic report.
    pub fn aggregate(&self) -> WriterTotals {
        let slots: Vec<Arc<Slot>> = self.slots.lock().values().cloned().collect();
        let mut totals = WriterTotals {
            slots: slots.len(),
            ..WriterTotals::default()
        };
        for slot in &slots {
            totals.queued_messages += slot.queues.lock().total();
            totals.messages_sent += slot.counters.messages_sent.load(Ordering::Relaxed);
            totals.bytes_sent += slot.counters.bytes_sent.load(Ordering::Relaxed);
            totals.messages_dropped += slot.counters.messages_dropped.load(Ordering::Relaxed);
            totals.queue_full_events += slot.counters.queue_full_events.load(Ordering::Relaxed);
            totals.backpressure_events +=
                slot.counters.backpressure_events.load(Ordering::Relaxed);
            totals.write_errors += slot.counters.write_errors.load(Ordering::Relaxed);
            totals.slow_flushes += slot.counters.slow_flushes.load(Ordering::Relaxed);
        }
        totals
    }
}

/// Owns the socket write half for one slot: waits for work, batches, and
/// flushes priority-first until the slot closes or the socket fails.
async fn writer_task(slot: Arc<Slot>, mut writer: OwnedWriteHalf, config: WriterConfig) {
    enum Wait {
        Ready,
        Idle,
        Until(Instant),
    }

    loop {
        // Wait until a flush is due.
        loop {
            if slot.closed.load(Ordering::Acquire) {
                return;
            }
            let wait = {
                let queues = slot.queues.lock();
                if !queues.high.is_empty() {
                    Wait::Ready
                } else {
                    let pending = queues.normal.len() + queues.low.len();
                    if pending == 0 {
                        Wait::Idle
                    } else if pending >= config.batch_size {
                        Wait::Ready
                    } else {
                        match queues.batch_deadline {
                            Some(deadline) if deadline <= Instant::now() => Wait::Ready,
                            Some(deadline) => Wait::Until(deadline),
                            None => Wait::Ready,
                        }
                    }
                }
            };
            match wait {
                Wait::Ready => break,
                Wait::Idle => slot.notify.notified().await,
                Wait::Until(deadline) => {
                    tokio::select! {
                        _ = slot.notify.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => break,
                    }
                }
            }
        }

        if flush(&slot, &mut writer, &config).await.is_err() {
            // Socket is gone; tear the slot down and tell the reader.
            slot.closed.store(true, Ordering::Release);
            slot.set_health(SlotHealth::Unhealthy);
            slot.fail.notify_one();
            return;
        }
    }
}

/// Drains the queues priority-first, coalescing up to `batch_size`
/// messages per socket write.
async fn flush(slot: &Arc<Slot>, writer: &mut OwnedWriteHalf, config: &WriterConfig) -> io::Result<()> {
    slot.flushing.store(true, Ordering::Release);
    let started = Instant::now();
    let mut batch = Vec::with_capacity(16 * 1024);

    loop {
        batch.clear();
        let mut messages = 0u64;
        let mut chunked = 0u64;
        let mut oldest_wait = Duration::ZERO;
        {
            let mut queues = slot.queues.lock();
            while messages < config.batch_size as u64 {
                match queues.pop_next() {
                    Some(message) => {
                        oldest_wait = oldest_wait.max(message.enqueued_at.elapsed());
                        if message.chunk.is_some() {
                            chunked += 1;
                        }
                        batch.extend_from_slice(&message.payload);
                        messages += 1;
                    }
                    None => break,
                }
            }
            if queues.is_empty() {
                queues.batch_deadline = None;
            }
        }
        if messages == 0 {
            break;
        }

        if let Err(err) = write_with_backpressure(slot, writer, &batch).await {
            slot.counters.write_errors.fetch_add(1, Ordering::Relaxed);
            slot.flushing.store(false, Ordering::Release);
            warn!(id = slot.id, error = %err, "socket write failed");
            return Err(err);
        }

        slot.counters.messages_sent.fetch_add(messages, Ordering::Relaxed);
        slot.counters
            .bytes_sent
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        slot.counters.chunked_sent.fetch_add(chunked, Ordering::Relaxed);
        slot.touch();
        trace!(
            id = slot.id,
            messages,
            bytes = batch.len(),
            wait_ms = oldest_wait.as_millis() as u64,
            "flushed batch"
        );
    }

    let elapsed = started.elapsed();
    if elapsed >= config.slow_flush_threshold {
        slot.counters.slow_flushes.fetch_add(1, Ordering::Relaxed);
        debug!(id = slot.id, elapsed_ms = elapsed.as_millis() as u64, "slow flush");
    }
    slot.flushing.store(false, Ordering::Release);
    Ok(())
}

/// Writes the whole buffer, suspending on kernel backpressure and resuming
/// on the socket's writable signal.
async fn write_with_backpressure(
    slot: &Arc<Slot>,
    writer: &mut OwnedWriteHalf,
    buf: &[u8],
) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match writer.try_write(&buf[written..]) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "socket closed"));
            }
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                slot.counters
                    .backpressure_events
                    .fetch_add(1, Ordering::Relaxed);
                trace!(id = slot.id, "socket backpressure, waiting for drain");
                writer.writable().await?;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> WriterConfig {
        WriterConfig {
            max_queue_size: 4,
            max_chunk_size: 8,
            ..WriterConfig::default()
        }
    }

    fn frame(byte: u8, len: usize) -> Bytes {
        Bytes::from(vec![byte; len])
    }

    #[test]
    fn drains_priority_first_fifo_within_class() {
        let config = WriterConfig::default();
        let mut queues = SlotQueues::default();
        queues.push(frame(b'l', 1), Priority::Low, &config);
        queues.push(frame(b'a', 1), Priority::Normal, &config);
        queues.push(frame(b'b', 1), Priority::Normal, &config);
        queues.push(frame(b'h', 1), Priority::High, &config);

        let order: Vec<u8> = std::iter::from_fn(|| queues.pop_next())
            .map(|message| message.payload[0])
            .collect();
        assert_eq!(order, vec![b'h', b'a', b'b', b'l']);
    }

    #[test]
    fn capacity_evicts_oldest_low_first() {
        let config = test_config();
        let mut queues = SlotQueues::default();
        queues.push(frame(b'1', 1), Priority::Low, &config);
        for _ in 0..3 {
            queues.push(frame(b'n', 1), Priority::Normal, &config);
        }
        assert_eq!(queues.total(), 4);

        // At capacity: the oldest low is sacrificed for the new normal.
        match queues.push(frame(b'x', 1), Priority::Normal, &config) {
            PushOutcome::Queued { evicted } => assert_eq!(evicted, 1),
            PushOutcome::Rejected => panic!("should have evicted the low message"),
        }
        assert_eq!(queues.total(), 4);
        assert!(queues.low.is_empty());
    }

    #[test]
    fn capacity_rejects_incoming_low_when_no_low_queued() {
        let config = test_config();
        let mut queues = SlotQueues::default();
        for _ in 0..4 {
            queues.push(frame(b'h', 1), Priority::High, &config);
        }
        assert!(matches!(
            queues.push(frame(b'l', 1), Priority::Low, &config),
            PushOutcome::Rejected
        ));
        assert_eq!(queues.total(), 4);
    }

    #[test]
    fn capacity_evicts_normal_when_disproportionate() {
        let config = test_config();
        let mut queues = SlotQueues::default();
        queues.push(frame(b'h', 1), Priority::High, &config);
        for _ in 0..3 {
            queues.push(frame(b'n', 1), Priority::Normal, &config);
        }
        // normal (3) > 2 * high (1), so the oldest normal makes room.
        match queues.push(frame(b'p', 1), Priority::High, &config) {
            PushOutcome::Queued { evicted } => assert_eq!(evicted, 1),
            PushOutcome::Rejected => panic!("should have evicted a normal message"),
        }
        assert_eq!(queues.total(), 4);
        assert_eq!(queues.high.len(), 2);
        assert_eq!(queues.normal.len(), 2);
    }

    #[test]
    fn capacity_never_exceeded() {
        let config = test_config();
        let mut queues = SlotQueues::default();
        for _ in 0..10 {
            queues.push(frame(b'h', 1), Priority::High, &config);
            assert!(queues.total() <= config.max_queue_size);
        }
    }

    #[test]
    fn oversized_payload_splits_into_contiguous_chunks() {
        let config = test_config();
        let mut queues = SlotQueues::default();
        let payload = Bytes::from((0u8..20).collect::<Vec<u8>>());
        queues.push(payload.clone(), Priority::Normal, &config);

        assert_eq!(queues.normal.len(), 3);
        let mut reassembled = Vec::new();
        let mut index = 0;
        while let Some(message) = queues.pop_next() {
            let chunk = message.chunk.expect("chunk metadata");
            assert_eq!(chunk.index, index);
            assert_eq!(chunk.total, 3);
            assert_eq!(message.original_size, 20);
            reassembled.extend_from_slice(&message.payload);
            index += 1;
        }
        assert_eq!(reassembled, payload.to_vec());
    }

    #[test]
    fn chunked_push_reserves_room_for_every_chunk() {
        let config = test_config();
        let mut queues = SlotQueues::default();
        for _ in 0..3 {
            queues.push(frame(b'n', 1), Priority::Normal, &config);
        }

        // 20 bytes means 3 chunks; two queued normals must go so the
        // post-push total stays at the cap.
        match queues.push(frame(b'x', 20), Priority::Normal, &config) {
            PushOutcome::Queued { evicted } => assert_eq!(evicted, 2),
            PushOutcome::Rejected => panic!("should have evicted to fit the chunks"),
        }
        assert_eq!(queues.total(), 4);
        assert_eq!(queues.normal.len(), 4);
    }

    #[test]
    fn chunked_push_rejected_when_nothing_evictable() {
        let config = test_config();
        let mut queues = SlotQueues::default();
        for _ in 0..4 {
            queues.push(frame(b'h', 1), Priority::High, &config);
        }
        assert!(matches!(
            queues.push(frame(b'x', 20), Priority::High, &config),
            PushOutcome::Rejected
        ));
        assert_eq!(queues.total(), 4);
    }

    #[test]
    fn near_capacity_chunked_push_cannot_overflow() {
        let config = test_config();
        let mut queues = SlotQueues::default();
        for _ in 0..3 {
            queues.push(frame(b'l', 1), Priority::Low, &config);
        }
        // One slot free, three chunks incoming: two lows are sacrificed.
        match queues.push(frame(b'x', 20), Priority::Normal, &config) {
            PushOutcome::Queued { evicted } => assert_eq!(evicted, 2),
            PushOutcome::Rejected => panic!("should have evicted lows to fit"),
        }
        assert_eq!(queues.total(), 4);
        assert_eq!(queues.low.len(), 1);
        assert_eq!(queues.normal.len(), 3);
    }

    #[test]
    fn classify_prefers_errors_over_other_labels() {
        let stale_after = Duration::from_secs(300);
        let fresh = Duration::ZERO;
        assert_eq!(classify(4, 9, 9, fresh, stale_after), SlotHealth::Unhealthy);
        assert_eq!(classify(0, 4, 9, fresh, stale_after), SlotHealth::Overloaded);
        assert_eq!(classify(0, 0, 6, fresh, stale_after), SlotHealth::Degraded);
        assert_eq!(
            classify(0, 0, 0, Duration::from_secs(301), stale_after),
            SlotHealth::Stale
        );
        assert_eq!(classify(0, 0, 0, fresh, stale_after), SlotHealth::Healthy);
    }

    async fn socket_pair() -> (tokio::net::TcpStream, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn writer_delivers_enqueued_payloads_in_order() {
        use tokio::io::AsyncReadExt;

        let om = Multiplexer::new(WriterConfig::default());
        let (server, mut client) = socket_pair().await;
        let (_read, write) = server.into_split();
        om.register(7, write);

        om.enqueue(7, Bytes::from_static(b"+one\r\n"), Priority::High)
            .unwrap();
        om.enqueue(7, Bytes::from_static(b"+two\r\n"), Priority::High)
            .unwrap();

        let mut received = vec![0u8; 12];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"+one\r\n+two\r\n");
        om.deregister(7);
    }

    #[tokio::test]
    async fn enqueue_to_unknown_slot_reports_not_registered() {
        let om = Multiplexer::new(WriterConfig::default());
        assert_eq!(
            om.enqueue(42, Bytes::from_static(b"x"), Priority::Normal),
            Err(DropReason::SocketNotRegistered)
        );
    }

    #[tokio::test]
    async fn broadcast_counts_delivered_and_failed() {
        let om = Multiplexer::new(WriterConfig::default());
        let (server, client) = socket_pair().await;
        let (_read, write) = server.into_split();
        om.register(1, write);

        let payload = Bytes::from_static(b"+hi\r\n");
        let outcome = om.broadcast(&[1, 2, 3], &payload, Priority::Normal).await;
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.failed, 2);
        drop(client);
        om.deregister(1);
    }

    #[tokio::test]
    async fn deregister_discards_pending_work() {
        let om = Multiplexer::new(WriterConfig::default());
        let (server, client) = socket_pair().await;
        let (_read, write) = server.into_split();
        om.register(9, write);
        om.deregister(9);
        assert_eq!(om.slot_count(), 0);
        assert_eq!(
            om.enqueue(9, Bytes::from_static(b"x"), Priority::High),
            Err(DropReason::SocketNotRegistered)
        );
        drop(client);
    }
}
