//! Slot health classification.

use std::sync::atomic::{AtomicU8, Ordering};

/// Five-minute inactivity window separating healthy from stale slots.
const ACTIVITY_WINDOW_MS: u64 = 5 * 60 * 1000;

/// Coarse label describing how a slot is coping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotHealth {
    Healthy,
    /// Flushes keep running long (socket is slow but alive).
    Degraded,
    /// Enqueues keep hitting the queue cap.
    Overloaded,
    /// Writes keep failing.
    Unhealthy,
    /// No traffic for the activity window.
    Stale,
}

impl SlotHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotHealth::Healthy => "healthy",
            SlotHealth::Degraded => "degraded",
            SlotHealth::Overloaded => "overloaded",
            SlotHealth::Unhealthy => "unhealthy",
            SlotHealth::Stale => "stale",
        }
    }

    fn from_u8(v: u8) -> SlotHealth {
        match v {
            1 => SlotHealth::Degraded,
            2 => SlotHealth::Overloaded,
            3 => SlotHealth::Unhealthy,
            4 => SlotHealth::Stale,
            _ => SlotHealth::Healthy,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SlotHealth::Healthy => 0,
            SlotHealth::Degraded => 1,
            SlotHealth::Overloaded => 2,
            SlotHealth::Unhealthy => 3,
            SlotHealth::Stale => 4,
        }
    }
}

/// Atomic cell holding the current label so readers never lock.
#[derive(Debug, Default)]
pub struct HealthCell(AtomicU8);

impl HealthCell {
    pub fn get(&self) -> SlotHealth {
        SlotHealth::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, health: SlotHealth) {
        self.0.store(health.as_u8(), Ordering::Relaxed);
    }
}

/// Classifies a slot from its counters, worst condition first.
pub fn assess(
    consecutive_errors: u64,
    slow_flushes: u64,
    queue_full_events: u64,
    last_activity_ms: u64,
    now_ms: u64,
) -> SlotHealth {
    if consecutive_errors > 3 {
        return SlotHealth::Unhealthy;
    }
    if slow_flushes > 5 {
        return SlotHealth::Degraded;
    }
    if queue_full_events > 3 {
        return SlotHealth::Overloaded;
    }
    if now_ms.saturating_sub(last_activity_ms) <= ACTIVITY_WINDOW_MS {
        SlotHealth::Healthy
    } else {
        SlotHealth::Stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_slot_is_healthy() {
        assert_eq!(assess(0, 0, 0, 1000, 1000), SlotHealth::Healthy);
    }

    #[test]
    fn errors_win_over_everything() {
        assert_eq!(assess(4, 10, 10, 0, ACTIVITY_WINDOW_MS * 2), SlotHealth::Unhealthy);
        // exactly 3 is still tolerated
        assert_ne!(assess(3, 0, 0, 1000, 1000), SlotHealth::Unhealthy);
    }

    #[test]
    fn slow_flushes_degrade() {
        assert_eq!(assess(0, 6, 0, 1000, 1000), SlotHealth::Degraded);
        assert_ne!(assess(0, 5, 0, 1000, 1000), SlotHealth::Degraded);
    }

    #[test]
    fn queue_full_overloads() {
        assert_eq!(assess(0, 0, 4, 1000, 1000), SlotHealth::Overloaded);
    }

    #[test]
    fn idle_slot_goes_stale() {
        let now = ACTIVITY_WINDOW_MS + 1001;
        assert_eq!(assess(0, 0, 0, 1000, now), SlotHealth::Stale);
        // right at the window edge is still healthy
        assert_eq!(assess(0, 0, 0, 1000, ACTIVITY_WINDOW_MS + 1000), SlotHealth::Healthy);
    }

    #[test]
    fn cell_round_trips() {
        let cell = HealthCell::default();
        assert_eq!(cell.get(), SlotHealth::Healthy);
        for h in [
            SlotHealth::Degraded,
            SlotHealth::Overloaded,
            SlotHealth::Unhealthy,
            SlotHealth::Stale,
            SlotHealth::Healthy,
        ] {
            cell.set(h);
            assert_eq!(cell.get(), h);
        }
    }
}
