//! Pub/sub broker: channel membership, buffered publish, and fan-out.
//!
//! Channel state lives in a `DashMap` keyed by channel name, so
//! membership changes and publishes serialize per channel without a
//! global lock. Connections are referenced by id only; the dispatcher
//! reconciles membership with each connection's own subscribed set and
//! calls [`Broker::unsubscribe_all`] from the close hook before the
//! connection record drops.
//!
//! Publishing picks one of three delivery strategies:
//! buffered batching for small channels (released by a periodic
//! flusher or a full buffer), multiplexer broadcast for large
//! channels, and direct per-subscriber enqueue when buffering is off
//! or the caller wants the message out now.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, trace};

use cinder_core::time;
use cinder_protocol::Frame;

use crate::config::BrokerConfig;
use crate::mux::{OutputMux, Priority};
use crate::ConnectionId;

/// Per-publish delivery options. The RESP PUBLISH path always uses the
/// defaults; the options exist for internal callers.
///
/// Mixing `immediate` and buffered publishes on the same channel can
/// reorder the caller's own messages relative to each other: the
/// buffered ones wait for the flusher, the immediate ones don't.
#[derive(Debug, Clone, Copy)]
pub struct PublishOptions {
    /// Skip buffering and deliver before returning.
    pub immediate: bool,
    /// Priority used when the large-channel broadcast path is taken.
    pub priority: Priority,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            immediate: false,
            priority: Priority::Normal,
        }
    }
}

/// Aggregate broker counters for INFO and the periodic report.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerStats {
    pub channels: usize,
    pub messages_published: u64,
    pub bytes_published: u64,
}

#[derive(Debug, Default)]
struct Channel {
    subscribers: HashMap<ConnectionId, Priority>,
    /// Formatted wire payloads awaiting the next buffer flush.
    buffer: Vec<Bytes>,
    messages: u64,
    bytes: u64,
    last_activity_ms: u64,
}

impl Channel {
    fn subscriber_snapshot(&self) -> Vec<(ConnectionId, Priority)> {
        self.subscribers.iter().map(|(id, p)| (*id, *p)).collect()
    }
}

/// Cheap-to-clone handle to the broker.
#[derive(Debug, Clone)]
pub struct Broker {
    shared: Arc<BrokerShared>,
}

#[derive(Debug)]
struct BrokerShared {
    config: BrokerConfig,
    mux: OutputMux,
    channels: DashMap<Bytes, Channel>,
    messages_published: AtomicU64,
    bytes_published: AtomicU64,
}

impl Broker {
    pub fn new(config: BrokerConfig, mux: OutputMux) -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                config,
                mux,
                channels: DashMap::new(),
                messages_published: AtomicU64::new(0),
                bytes_published: AtomicU64::new(0),
            }),
        }
    }

    /// Adds `id` to the channel at the given priority, creating the
    /// channel on first subscriber. Idempotent: re-subscribing only
    /// updates the priority. Returns the channel's subscriber count.
    pub fn subscribe(&self, id: ConnectionId, channel: Bytes, priority: Priority) -> usize {
        let mut entry = self.shared.channels.entry(channel).or_default();
        entry.subscribers.insert(id, priority);
        entry.last_activity_ms = time::now_ms();
        entry.subscribers.len()
    }

    /// Removes `id` from the channel; the channel itself is removed
    /// with its last subscriber. Idempotent. Returns the remaining
    /// subscriber count.
    pub fn unsubscribe(&self, id: ConnectionId, channel: &[u8]) -> usize {
        let remaining = match self.shared.channels.get_mut(channel) {
            Some(mut entry) => {
                entry.subscribers.remove(&id);
                entry.subscribers.len()
            }
            None => return 0,
        };
        if remaining == 0 {
            // re-check under the entry lock: a new subscriber may have
            // slipped in between the guard drop and this call
            self.shared
                .channels
                .remove_if(channel, |_, c| c.subscribers.is_empty());
        }
        remaining
    }

    /// Drops every subscription held by `id`. Called from the
    /// connection close hook. Each channel's removal is atomic under
    /// its entry lock, so no concurrent publish observes a
    /// half-removed subscriber.
    pub fn unsubscribe_all(&self, id: ConnectionId) {
        let mut emptied = Vec::new();
        for mut entry in self.shared.channels.iter_mut() {
            if entry.subscribers.remove(&id).is_some() && entry.subscribers.is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for key in emptied {
            self.shared
                .channels
                .remove_if(&key, |_, c| c.subscribers.is_empty());
        }
        trace!(conn = id, "subscriptions released");
    }

    /// Subscribers currently on a channel.
    pub fn subscriber_count(&self, channel: &[u8]) -> usize {
        self.shared
            .channels
            .get(channel)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    /// Active (non-empty) channels.
    pub fn channel_count(&self) -> usize {
        self.shared.channels.len()
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            channels: self.shared.channels.len(),
            messages_published: self.shared.messages_published.load(Ordering::Relaxed),
            bytes_published: self.shared.bytes_published.load(Ordering::Relaxed),
        }
    }

    /// Publishes `message` to `channel`.
    ///
    /// Returns the delivered count: for the buffered strategy this is
    /// the subscriber count at publish time (a best-effort estimate;
    /// the set may change before the buffer flushes); for the other
    /// strategies it is the number of slots that accepted the payload.
    pub async fn publish(
        &self,
        channel: Bytes,
        message: Bytes,
        options: PublishOptions,
    ) -> usize {
        self.shared.messages_published.fetch_add(1, Ordering::Relaxed);
        self.shared
            .bytes_published
            .fetch_add(message.len() as u64, Ordering::Relaxed);

        let Some(mut entry) = self.shared.channels.get_mut(&channel) else {
            return 0;
        };

        entry.messages += 1;
        entry.bytes += message.len() as u64;
        entry.last_activity_ms = time::now_ms();

        let sub_count = entry.subscribers.len();
        if sub_count == 0 {
            return 0;
        }

        let payload = format_message(&channel, &message);

        let buffered = self.shared.config.batching_enabled
            && !options.immediate
            && sub_count < self.shared.config.large_channel_threshold;

        if buffered {
            entry.buffer.push(payload);
            if entry.buffer.len() >= self.shared.config.max_buffered_messages {
                // full buffer: release now instead of waiting for the
                // periodic flusher
                let payloads = std::mem::take(&mut entry.buffer);
                let subs = entry.subscriber_snapshot();
                drop(entry);
                self.deliver(&subs, &payloads);
            }
            return sub_count;
        }

        let subs = entry.subscriber_snapshot();
        drop(entry); // never hold the entry lock across an await

        if sub_count >= self.shared.config.large_channel_threshold {
            let ids: Vec<ConnectionId> = subs.iter().map(|(id, _)| *id).collect();
            let outcome = self
                .shared
                .mux
                .broadcast(&ids, &payload, options.priority)
                .await;
            debug!(
                channel = %String::from_utf8_lossy(&channel),
                queued = outcome.queued,
                failed = outcome.failed,
                "large-channel broadcast"
            );
            return outcome.queued;
        }

        self.deliver(&subs, &[payload])
    }

    /// Enqueues `payloads` in order for every subscriber at its own
    /// subscription priority. Returns how many subscribers accepted
    /// the full sequence.
    fn deliver(&self, subs: &[(ConnectionId, Priority)], payloads: &[Bytes]) -> usize {
        let mut accepted = 0;
        for &(id, priority) in subs {
            let mut ok = true;
            for payload in payloads {
                if self
                    .shared
                    .mux
                    .enqueue(id, payload.clone(), priority)
                    .is_err()
                {
                    ok = false;
                    break;
                }
            }
            if ok {
                accepted += 1;
            }
        }
        accepted
    }

    /// Starts the periodic buffer flusher. The loop holds a weak
    /// reference and ends when the broker is dropped.
    pub fn spawn_flusher(&self) {
        let weak = Arc::downgrade(&self.shared);
        let interval_len = self.shared.config.buffer_flush_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_len);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(shared) = weak.upgrade() else { break };

                // drain buffers under each entry lock, deliver after
                let mut pending = Vec::new();
                for mut entry in shared.channels.iter_mut() {
                    if !entry.buffer.is_empty() {
                        let payloads = std::mem::take(&mut entry.buffer);
                        let subs = entry.subscriber_snapshot();
                        pending.push((subs, payloads));
                    }
                }

                let broker = Broker { shared };
                for (subs, payloads) in pending {
                    broker.deliver(&subs, &payloads);
                }
            }
        });
    }
}

/// The wire form subscribers receive:
/// `*3\r\n$7\r\nmessage\r\n$<len>\r\n<channel>\r\n$<len>\r\n<message>\r\n`.
pub fn format_message(channel: &[u8], message: &Bytes) -> Bytes {
    Frame::Array(vec![
        Frame::Bulk(Bytes::from_static(b"message")),
        Frame::Bulk(Bytes::copy_from_slice(channel)),
        Frame::Bulk(message.clone()),
    ])
    .to_bytes()
}
