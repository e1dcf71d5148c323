//! The output multiplexer: priority-queued, batched, backpressure-aware
//! socket writing for every connection.
//!
//! Each registered connection gets a [`Slot`]: three FIFO queues and
//! a dedicated writer task owning the socket write half. Producers
//! (command replies, pub/sub fan-out) enqueue payloads at a priority
//! and never touch the socket themselves, so a broadcast can safely
//! enqueue into hundreds of slots from one task.

mod health;
mod message;
mod slot;

pub use health::SlotHealth;
pub use message::Priority;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::{debug, info};

use crate::config::MuxConfig;
use crate::ConnectionId;

use slot::Slot;

/// Fan-outs at or below this size run fully synchronously.
const BROADCAST_SYNC_LIMIT: usize = 100;

/// Larger fan-outs yield to the scheduler between batches of this many
/// slots so broadcasts don't monopolize a worker.
const BROADCAST_CHUNK: usize = 50;

/// How often slot health labels are re-evaluated.
const HEALTH_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// How often aggregate counters are reported.
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Why an enqueue was refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// No slot is registered for the connection.
    #[error("socket not registered")]
    NotRegistered,
    /// The slot is at capacity and the incoming message was the lowest
    /// priority present.
    #[error("queue full")]
    QueueFull,
    /// The slot is being torn down.
    #[error("slot closed")]
    Closed,
}

/// Result of a broadcast: how many slots accepted the payload and how
/// many refused (unregistered, full, or closed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub queued: usize,
    pub failed: usize,
}

/// Aggregate counters across all slots, for the periodic report and INFO.
#[derive(Debug, Clone, Copy, Default)]
pub struct MuxReport {
    pub slots: usize,
    pub queued_now: usize,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub dropped_low: u64,
    pub dropped_normal: u64,
    pub dropped_high: u64,
    pub queue_full_events: u64,
    pub write_errors: u64,
    pub backpressure_events: u64,
    pub not_registered: u64,
}

/// Cheap-to-clone handle to the multiplexer.
#[derive(Debug, Clone)]
pub struct OutputMux {
    shared: Arc<MuxShared>,
}

#[derive(Debug)]
struct MuxShared {
    config: MuxConfig,
    slots: Arc<DashMap<ConnectionId, Arc<Slot>>>,
    /// Ids for chunked payloads, shared across slots.
    next_message_id: AtomicU64,
    /// Enqueues refused because no slot was registered.
    not_registered: AtomicU64,
}

impl OutputMux {
    pub fn new(config: MuxConfig) -> Self {
        Self {
            shared: Arc::new(MuxShared {
                config,
                slots: Arc::new(DashMap::new()),
                next_message_id: AtomicU64::new(1),
                not_registered: AtomicU64::new(0),
            }),
        }
    }

    /// Creates the slot for a connection and starts its writer task.
    /// Must be called before anything is enqueued for the id.
    pub fn register(&self, id: ConnectionId, write_half: OwnedWriteHalf) {
        let slot = Arc::new(Slot::new(id, self.shared.config.clone()));
        self.shared.slots.insert(id, Arc::clone(&slot));
        let weak = Arc::downgrade(&self.shared.slots);
        tokio::spawn(slot.run_writer(write_half, weak));
        debug!(slot = id, "slot registered");
    }

    /// Tears a slot down: pending queued bytes are discarded and the
    /// writer task exits.
    pub fn unregister(&self, id: ConnectionId) {
        if let Some((_, slot)) = self.shared.slots.remove(&id) {
            slot.close();
            debug!(slot = id, "slot unregistered");
        }
    }

    /// Queues `payload` for the connection at `priority`.
    ///
    /// HIGH payloads flush immediately; NORMAL/LOW wait for the batch
    /// window. Payloads over the chunk limit are split into ordered
    /// same-priority entries.
    pub fn enqueue(
        &self,
        id: ConnectionId,
        payload: Bytes,
        priority: Priority,
    ) -> Result<(), EnqueueError> {
        let Some(slot) = self.shared.slots.get(&id).map(|s| Arc::clone(&s)) else {
            self.shared.not_registered.fetch_add(1, Ordering::Relaxed);
            debug!(slot = id, "enqueue for unregistered socket dropped");
            return Err(EnqueueError::NotRegistered);
        };
        let message_id = self.shared.next_message_id.fetch_add(1, Ordering::Relaxed);
        slot.enqueue(payload, priority, message_id)
    }

    /// Asks a slot to flush whatever it has queued without waiting out
    /// the batch window. Used at the end of a pipelined command batch.
    pub fn kick(&self, id: ConnectionId) {
        if let Some(slot) = self.shared.slots.get(&id) {
            slot.kick();
        }
    }

    /// Enqueues one payload into many slots.
    ///
    /// Small fan-outs (≤ 100) run synchronously; larger ones yield to
    /// the scheduler every 50 slots so other work interleaves.
    pub async fn broadcast(
        &self,
        ids: &[ConnectionId],
        payload: &Bytes,
        priority: Priority,
    ) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();

        if ids.len() <= BROADCAST_SYNC_LIMIT {
            for &id in ids {
                self.broadcast_one(id, payload, priority, &mut outcome);
            }
            return outcome;
        }

        for chunk in ids.chunks(BROADCAST_CHUNK) {
            for &id in chunk {
                self.broadcast_one(id, payload, priority, &mut outcome);
            }
            tokio::task::yield_now().await;
        }
        outcome
    }

    fn broadcast_one(
        &self,
        id: ConnectionId,
        payload: &Bytes,
        priority: Priority,
        outcome: &mut BroadcastOutcome,
    ) {
        match self.enqueue(id, payload.clone(), priority) {
            Ok(()) => outcome.queued += 1,
            // per-socket failures are isolated: one dead or saturated
            // subscriber never affects the rest of the fan-out
            Err(_) => outcome.failed += 1,
        }
    }

    /// Kicks a slot and waits (bounded) for its queues to empty.
    /// Used before a graceful close so the final replies reach the
    /// wire; an abrupt close skips this and discards instead.
    pub async fn drain(&self, id: ConnectionId, timeout: Duration) {
        self.kick(id);
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            match self.queue_len(id) {
                Some(0) | None => return,
                Some(_) => tokio::time::sleep(Duration::from_millis(1)).await,
            }
        }
    }

    /// Current health label for a connection's slot.
    pub fn slot_health(&self, id: ConnectionId) -> Option<SlotHealth> {
        self.shared.slots.get(&id).map(|s| s.health.get())
    }

    /// Number of registered slots.
    pub fn slot_count(&self) -> usize {
        self.shared.slots.len()
    }

    /// Queued messages for one slot, if registered.
    pub fn queue_len(&self, id: ConnectionId) -> Option<usize> {
        self.shared.slots.get(&id).map(|s| s.queue_len())
    }

    /// Aggregates counters across every live slot.
    pub fn report(&self) -> MuxReport {
        let mut report = MuxReport {
            slots: self.shared.slots.len(),
            not_registered: self.shared.not_registered.load(Ordering::Relaxed),
            ..MuxReport::default()
        };
        for entry in self.shared.slots.iter() {
            let s = &entry.stats;
            report.queued_now += entry.queue_len();
            report.messages_sent += s.messages_sent.load(Ordering::Relaxed);
            report.bytes_sent += s.bytes_sent.load(Ordering::Relaxed);
            report.dropped_low += s.dropped_low.load(Ordering::Relaxed);
            report.dropped_normal += s.dropped_normal.load(Ordering::Relaxed);
            report.dropped_high += s.dropped_high.load(Ordering::Relaxed);
            report.queue_full_events += s.queue_full_events.load(Ordering::Relaxed);
            report.write_errors += s.error_total.load(Ordering::Relaxed);
            report.backpressure_events += s.backpressure_events.load(Ordering::Relaxed);
        }
        report
    }

    /// Starts the periodic health sweep and the aggregate report.
    /// Both loops hold only a weak reference and end when the
    /// multiplexer is dropped.
    pub fn spawn_maintenance(&self) {
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                for entry in shared.slots.iter() {
                    entry.refresh_health();
                }
            }
        });

        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REPORT_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                let mux = OutputMux { shared };
                let r = mux.report();
                info!(
                    slots = r.slots,
                    queued = r.queued_now,
                    sent = r.messages_sent,
                    bytes_sent = r.bytes_sent,
                    dropped_low = r.dropped_low,
                    dropped_normal = r.dropped_normal,
                    dropped_high = r.dropped_high,
                    queue_full = r.queue_full_events,
                    write_errors = r.write_errors,
                    backpressure = r.backpressure_events,
                    "output multiplexer report"
                );
            }
        });
    }
}
