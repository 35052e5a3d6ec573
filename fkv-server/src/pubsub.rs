//! # Pub/Sub Broker
//!
//! Channel membership with per-subscriber priorities, small-message
//! buffering, and large-fan-out delivery through the output multiplexer.
//!
//! ## Design Principles
//! 1. **Ids, Not References**: The broker stores connection ids; the
//!    dispatcher's close hook reconciles membership before a connection
//!    record is dropped, so there is no broker/connection cycle.
//! 2. **Format Once**: A published message is rendered to its wire form a
//!    single time and shared across every subscriber as `Bytes`.
//! 3. **Lock Then Deliver**: The membership lock covers map work only;
//!    delivery plans are executed after the lock is released.
//!
//! Three delivery strategies: small channels buffer payloads and release
//! them on a 10 ms cadence (or when 100 pile up), large channels go through
//! the multiplexer's chunked broadcast, and immediate publishes enqueue
//! per subscriber directly.

use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use fkv_common::resp;

use crate::config::BrokerConfig;
use crate::writer::{ConnId, Multiplexer, Priority};

/// Per-publish options; defaults match the PUBLISH command.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Delivery priority for broadcast fan-out; `None` means normal.
    pub priority: Option<Priority>,
    /// Skip buffering and enqueue per subscriber right away.
    pub immediate: bool,
    /// Force the multiplexer broadcast path regardless of channel size.
    pub broadcast: bool,
}

/// Point-in-time view of one channel's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub subscribers: usize,
    pub messages: u64,
    pub bytes: u64,
    pub avg_message_size: u64,
    pub last_activity: Instant,
}

struct Channel {
    subscribers: HashMap<ConnId, Priority, RandomState>,
    /// Formatted frames waiting for the periodic flush.
    buffer: Vec<Bytes>,
    messages: u64,
    bytes: u64,
    last_activity: Instant,
}

impl Channel {
    fn new() -> Channel {
        Channel {
            subscribers: HashMap::with_hasher(RandomState::new()),
            buffer: Vec::new(),
            messages: 0,
            bytes: 0,
            last_activity: Instant::now(),
        }
    }
}

enum DeliveryPlan {
    /// Nothing to do; the channel has no subscribers.
    None,
    /// Payload parked in the channel buffer; count estimated.
    Buffered(usize),
    /// Buffer limit reached; deliver the drained frames now.
    FlushNow {
        targets: Vec<(ConnId, Priority)>,
        payload: Bytes,
        subscribers: usize,
    },
    /// Large channel; hand the subscriber list to the multiplexer.
    Broadcast(Vec<ConnId>, Priority),
    /// Enqueue per subscriber at its subscription priority.
    Direct(Vec<(ConnId, Priority)>),
}

/// The channel → subscriber registry.
pub struct Broker {
    config: BrokerConfig,
    channels: Mutex<HashMap<Vec<u8>, Channel, RandomState>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Broker {
        Broker {
            config,
            channels: Mutex::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    /// Adds `id` to `channel`, creating the channel on first use.
    ///
    /// Idempotent; re-subscribing only updates the priority. Returns the
    /// channel's subscriber count afterwards.
    pub fn subscribe(&self, id: ConnId, channel: &[u8], priority: Priority) -> usize {
        let mut channels = self.channels.lock();
        let entry = channels
            .entry(channel.to_vec())
            .or_insert_with(Channel::new);
        entry.subscribers.insert(id, priority);
        entry.last_activity = Instant::now();
        entry.subscribers.len()
    }

    /// Removes `id` from `channel`; the channel itself is removed with its
    /// last subscriber. Returns the remaining subscriber count.
    pub fn unsubscribe(&self, id: ConnId, channel: &[u8]) -> usize {
        let mut channels = self.channels.lock();
        let remaining = match channels.get_mut(channel) {
            Some(entry) => {
                entry.subscribers.remove(&id);
                entry.subscribers.len()
            }
            None => return 0,
        };
        if remaining == 0 {
            channels.remove(channel);
        }
        remaining
    }

    /// Drops every membership of a closing connection.
    pub fn unsubscribe_all(&self, id: ConnId, channels: impl IntoIterator<Item = Vec<u8>>) {
        for channel in channels {
            self.unsubscribe(id, &channel);
        }
    }

    pub fn subscriber_count(&self, channel: &[u8]) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn stats(&self, channel: &[u8]) -> Option<ChannelStats> {
        let channels = self.channels.lock();
        channels.get(channel).map(|entry| ChannelStats {
            subscribers: entry.subscribers.len(),
            messages: entry.messages,
            bytes: entry.bytes,
            avg_message_size: if entry.messages == 0 {
                0
            } else {
                entry.bytes / entry.messages
            },
            last_activity: entry.last_activity,
        })
    }

    /// Publishes `message` on `channel`.
    ///
    /// Returns the delivered count: for direct and broadcast strategies the
    /// number of slots that accepted the payload, for the buffered strategy
    /// the subscriber count at publish time (a best-effort estimate, since
    /// membership may change before the buffer flushes).
    pub async fn publish(
        &self,
        om: &Multiplexer,
        channel: &[u8],
        message: &[u8],
        options: PublishOptions,
    ) -> usize {
        let frame = format_message(channel, message);
        let plan = {
            let mut channels = self.channels.lock();
            let entry = match channels.get_mut(channel) {
                Some(entry) => entry,
                None => return 0,
            };
            entry.messages += 1;
            entry.bytes += message.len() as u64;
            entry.last_activity = Instant::now();

            let subscribers = entry.subscribers.len();
            if subscribers == 0 {
                DeliveryPlan::None
            } else if options.broadcast || subscribers >= self.config.large_channel_threshold {
                DeliveryPlan::Broadcast(
                    entry.subscribers.keys().copied().collect(),
                    options.priority.unwrap_or(Priority::Normal),
                )
            } else if !self.config.batching || options.immediate {
                DeliveryPlan::Direct(
                    entry
                        .subscribers
                        .iter()
                        .map(|(&id, &priority)| (id, priority))
                        .collect(),
                )
            } else {
                entry.buffer.push(frame.clone());
                if entry.buffer.len() >= self.config.max_buffered_messages {
                    DeliveryPlan::FlushNow {
                        targets: entry
                            .subscribers
                            .iter()
                            .map(|(&id, &priority)| (id, priority))
                            .collect(),
                        payload: combine(entry.buffer.drain(..)),
                        subscribers,
                    }
                } else {
                    DeliveryPlan::Buffered(subscribers)
                }
            }
        };

        match plan {
            DeliveryPlan::None => 0,
            DeliveryPlan::Buffered(subscribers) => subscribers,
            DeliveryPlan::FlushNow {
                targets,
                payload,
                subscribers,
            } => {
                deliver(om, &targets, &payload);
                subscribers
            }
            DeliveryPlan::Broadcast(targets, priority) => {
                om.broadcast(&targets, &frame, priority).await.delivered
            }
            DeliveryPlan::Direct(targets) => deliver(om, &targets, &frame),
        }
    }

    /// Releases every non-empty channel buffer to its current subscribers.
    ///
    /// Driven by the periodic flush task; returns the number of slot
    /// enqueues that succeeded.
    pub fn flush_buffers(&self, om: &Multiplexer) -> usize {
        let work: Vec<(Vec<(ConnId, Priority)>, Bytes)> = {
            let mut channels = self.channels.lock();
            channels
                .values_mut()
                .filter(|entry| !entry.buffer.is_empty())
                .map(|entry| {
                    let payload = combine(entry.buffer.drain(..));
                    let targets = entry
                        .subscribers
                        .iter()
                        .map(|(&id, &priority)| (id, priority))
                        .collect();
                    (targets, payload)
                })
                .collect()
        };

        let mut delivered = 0;
        for (targets, payload) in work {
            delivered += deliver(om, &targets, &payload);
        }
        if delivered > 0 {
            trace!(delivered, "flushed channel buffers");
        }
        delivered
    }
}

fn deliver(om: &Multiplexer, targets: &[(ConnId, Priority)], payload: &Bytes) -> usize {
    let mut delivered = 0;
    for &(id, priority) in targets {
        if om.enqueue(id, payload.clone(), priority).is_ok() {
            delivered += 1;
        }
    }
    delivered
}

/// Concatenates buffered frames so each subscriber gets one coalesced
/// write; frame order within the buffer is publish order.
fn combine(frames: impl Iterator<Item = Bytes>) -> Bytes {
    let mut combined = Vec::new();
    for frame in frames {
        combined.extend_from_slice(&frame);
    }
    Bytes::from(combined)
}

/// Renders the `["message", channel, payload]` delivery array.
pub fn format_message(channel: &[u8], message: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(32 + channel.len() + message.len());
    resp::write_array_header(&mut out, 3);
    resp::write_bulk(&mut out, b"message");
    resp::write_bulk(&mut out, channel);
    resp::write_bulk(&mut out, message);
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriterConfig;

    fn broker() -> Broker {
        Broker::new(BrokerConfig::default())
    }

    #[test]
    fn message_frame_matches_wire_format() {
        let frame = format_message(b"news", b"hi");
        assert_eq!(&frame[..], b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$2\r\nhi\r\n");
    }

    #[test]
    fn subscribe_is_idempotent() {
        let broker = broker();
        assert_eq!(broker.subscribe(1, b"news", Priority::Normal), 1);
        assert_eq!(broker.subscribe(1, b"news", Priority::High), 1);
        assert_eq!(broker.subscribe(2, b"news", Priority::Normal), 2);
        assert_eq!(broker.subscriber_count(b"news"), 2);
    }

    #[test]
    fn last_unsubscribe_removes_channel() {
        let broker = broker();
        broker.subscribe(1, b"news", Priority::Normal);
        broker.subscribe(2, b"news", Priority::Normal);
        assert_eq!(broker.unsubscribe(1, b"news"), 1);
        assert_eq!(broker.channel_count(), 1);
        assert_eq!(broker.unsubscribe(2, b"news"), 0);
        assert_eq!(broker.channel_count(), 0);
        // Idempotent against channels that are already gone.
        assert_eq!(broker.unsubscribe(2, b"news"), 0);
    }

    #[test]
    fn unsubscribe_all_clears_every_membership() {
        let broker = broker();
        broker.subscribe(1, b"a", Priority::Normal);
        broker.subscribe(1, b"b", Priority::Low);
        broker.subscribe(2, b"b", Priority::Normal);

        broker.unsubscribe_all(1, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(broker.subscriber_count(b"a"), 0);
        assert_eq!(broker.subscriber_count(b"b"), 1);
        assert_eq!(broker.channel_count(), 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_delivers_zero() {
        let broker = broker();
        let om = Multiplexer::new(WriterConfig::default());
        let delivered = broker
            .publish(&om, b"nobody", b"hello", PublishOptions::default())
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn buffered_publish_reports_subscriber_count() {
        let broker = broker();
        let om = Multiplexer::new(WriterConfig::default());
        broker.subscribe(1, b"news", Priority::Normal);
        broker.subscribe(2, b"news", Priority::Normal);

        let delivered = broker
            .publish(&om, b"news", b"hi", PublishOptions::default())
            .await;
        assert_eq!(delivered, 2);

        let stats = broker.stats(b"news").expect("channel exists");
        assert_eq!(stats.messages, 1);
        assert_eq!(stats.bytes, 2);
        assert_eq!(stats.avg_message_size, 2);
    }

    #[tokio::test]
    async fn immediate_publish_counts_accepted_slots_only() {
        let broker = broker();
        let om = Multiplexer::new(WriterConfig::default());
        // Subscribers exist in the broker but have no registered slots, so
        // nothing is actually accepted.
        broker.subscribe(1, b"news", Priority::Normal);
        let delivered = broker
            .publish(
                &om,
                b"news",
                b"hi",
                PublishOptions {
                    immediate: true,
                    ..PublishOptions::default()
                },
            )
            .await;
        assert_eq!(delivered, 0);
    }
}
