//! Shared store handle with one-shot TTL timers.
//!
//! [`Store`] is a cheap-to-clone handle over a single mutex-guarded
//! [`Keyspace`]. Lock sections are short, synchronous, and never held
//! across an `.await`. EXPIRE arms a one-shot tokio timer task per
//! key; the task re-checks the entry's generation when it fires, so a
//! timer invalidated by a later SET/DEL/EXPIRE/PERSIST never removes
//! live data.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tracing::trace;

use crate::keyspace::{Keyspace, ScanPage, TtlResult};
use crate::time;

/// Cloneable handle to the keyspace.
#[derive(Debug, Clone, Default)]
pub struct Store {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    keyspace: Mutex<Keyspace>,
    /// Keys removed by timer fire, for stats reporting.
    expired_total: AtomicU64,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn keyspace(&self) -> MutexGuard<'_, Keyspace> {
        // a poisoned lock only means a panic elsewhere mid-mutation;
        // the map itself is still structurally sound
        self.shared
            .keyspace
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// SET: store `value` under `key`, clearing any TTL.
    pub fn set(&self, key: Bytes, value: Bytes) {
        self.keyspace().set(key, value);
    }

    /// GET: the live value, or None when absent or expired.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.keyspace().get(key)
    }

    /// DEL: removes keys, returns how many were present.
    pub fn del(&self, keys: &[Bytes]) -> usize {
        self.keyspace().del(keys)
    }

    /// EXISTS: counts present keys, duplicates multiply.
    pub fn exists(&self, keys: &[Bytes]) -> usize {
        self.keyspace().exists(keys)
    }

    /// EXPIRE: schedules removal `seconds` from now (negative = now).
    /// Returns false when the key is absent. Re-arming replaces any
    /// previously scheduled removal.
    pub fn expire(&self, key: Bytes, seconds: i64) -> bool {
        let armed = self.keyspace().expire(&key, seconds);
        match armed {
            None => false,
            Some((deadline_ms, generation)) => {
                self.arm_timer(key, deadline_ms, generation);
                true
            }
        }
    }

    /// TTL: remaining lifetime of `key`.
    pub fn ttl(&self, key: &[u8]) -> TtlResult {
        self.keyspace().ttl(key)
    }

    /// PERSIST: clears the TTL. Returns true when one was cleared.
    pub fn persist(&self, key: &[u8]) -> bool {
        self.keyspace().persist(key)
    }

    /// KEYS: all live keys matching the glob pattern.
    pub fn keys(&self, pattern: &[u8]) -> Vec<Bytes> {
        self.keyspace().keys(pattern)
    }

    /// SCAN: one cursor page. Not a snapshot; see [`Keyspace::scan`].
    pub fn scan(&self, cursor: u64, pattern: Option<&[u8]>, count: Option<usize>) -> ScanPage {
        self.keyspace().scan(cursor, pattern, count)
    }

    /// DBSIZE: number of live keys.
    pub fn dbsize(&self) -> usize {
        self.keyspace().dbsize()
    }

    /// Live keys carrying a TTL, for the keyspace INFO line.
    pub fn expires_count(&self) -> usize {
        self.keyspace().expires_count()
    }

    /// TYPE: `"string"` for any live key, `"none"` otherwise.
    pub fn type_of(&self, key: &[u8]) -> &'static str {
        self.keyspace().type_of(key)
    }

    /// Total keys removed by timer fire since startup.
    pub fn expired_total(&self) -> u64 {
        self.shared.expired_total.load(Ordering::Relaxed)
    }

    /// Spawns the one-shot removal task for an armed expiry.
    ///
    /// Must be called from within a tokio runtime (the dispatcher
    /// always is). The task is deliberately not tracked: a stale timer
    /// is a cheap no-op thanks to the generation check.
    fn arm_timer(&self, key: Bytes, deadline_ms: u64, generation: u64) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let wait = deadline_ms.saturating_sub(time::now_ms());
            if wait > 0 {
                tokio::time::sleep(Duration::from_millis(wait)).await;
            }
            let removed = shared
                .keyspace
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove_if_generation(&key, generation);
            if removed {
                shared.expired_total.fetch_add(1, Ordering::Relaxed);
                trace!(key = ?String::from_utf8_lossy(&key), "key expired");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn timer_removes_key_physically() {
        let store = Store::new();
        store.set(b("k"), b("v"));
        assert!(store.expire(b("k"), 0));

        sleep(Duration::from_millis(50)).await;

        assert_eq!(store.get(b"k"), None);
        assert_eq!(store.ttl(b"k"), TtlResult::NotFound);
        assert_eq!(store.expired_total(), 1);
    }

    #[tokio::test]
    async fn overwrite_cancels_pending_timer() {
        let store = Store::new();
        store.set(b("k"), b("old"));
        assert!(store.expire(b("k"), 1));

        // replace before the timer fires; its generation is now stale
        store.set(b("k"), b("new"));
        sleep(Duration::from_millis(1100)).await;

        assert_eq!(store.get(b"k"), Some(b("new")));
        assert_eq!(store.expired_total(), 0);
    }

    #[tokio::test]
    async fn reschedule_outlives_first_timer() {
        let store = Store::new();
        store.set(b("k"), b("v"));
        assert!(store.expire(b("k"), 1));
        assert!(store.expire(b("k"), 30));

        // first timer fires but the generation moved on
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(store.get(b"k"), Some(b("v")));
    }

    #[tokio::test]
    async fn del_beats_timer() {
        let store = Store::new();
        store.set(b("k"), b("v"));
        assert!(store.expire(b("k"), 1));
        assert_eq!(store.del(&[b("k")]), 1);

        sleep(Duration::from_millis(1100)).await;
        assert_eq!(store.expired_total(), 0);
    }

    #[tokio::test]
    async fn expire_missing_key_is_false() {
        let store = Store::new();
        assert!(!store.expire(b("ghost"), 10));
    }

    #[tokio::test]
    async fn persist_defuses_timer() {
        let store = Store::new();
        store.set(b("k"), b("v"));
        assert!(store.expire(b("k"), 1));
        assert!(store.persist(b"k"));

        sleep(Duration::from_millis(1100)).await;
        assert_eq!(store.get(b"k"), Some(b("v")));
        assert_eq!(store.ttl(b"k"), TtlResult::NoExpiry);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = Store::new();
        let other = store.clone();
        store.set(b("k"), b("v"));
        assert_eq!(other.get(b"k"), Some(b("v")));
    }
}
