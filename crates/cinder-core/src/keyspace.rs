//! The keyspace: cinder's core key-value store.
//!
//! A `Keyspace` owns a flat `AHashMap<Bytes, Entry>` of string values
//! and handles get, set, delete, existence checks, TTL bookkeeping,
//! and key iteration. Expired entries are invisible the moment their
//! deadline passes and are physically removed lazily on access; the
//! timer tasks armed by [`crate::Store`] remove the remainder.
//!
//! Every mutation bumps the entry's timer generation. A timer fires
//! with the generation it was armed with, so a timer whose entry was
//! since overwritten, deleted, or re-expired is a no-op.

use ahash::AHashMap;
use bytes::Bytes;

use crate::glob::glob_match;
use crate::time::{self, NO_EXPIRY};

/// Result of a TTL query, mirroring the wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlResult {
    /// Key does not exist (wire: -2).
    NotFound,
    /// Key exists but carries no expiry (wire: -1).
    NoExpiry,
    /// Remaining time, rounded up to whole seconds.
    Seconds(u64),
}

/// One page of SCAN results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor to pass to the next SCAN call; 0 means the scan is done.
    pub next_cursor: u64,
    /// Keys in this page, after MATCH filtering.
    pub keys: Vec<Bytes>,
}

#[derive(Debug)]
struct Entry {
    value: Bytes,
    /// Absolute monotonic deadline in ms; `NO_EXPIRY` = none.
    expires_at_ms: u64,
    /// Bumped on every mutation; timers re-check this before removing.
    generation: u64,
}

impl Entry {
    fn is_expired(&self) -> bool {
        time::is_expired(self.expires_at_ms)
    }
}

/// The synchronous key → string-value map.
///
/// All methods take `&mut self`; concurrent access is serialized by
/// the caller (a single coarse lock in [`crate::Store`], which the
/// workload tolerates comfortably).
#[derive(Debug, Default)]
pub struct Keyspace {
    entries: AHashMap<Bytes, Entry>,
    /// Source for timer generations, shared across all entries.
    next_generation: u64,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Stores `value` under `key`, replacing any previous value and
    /// clearing any TTL.
    pub fn set(&mut self, key: Bytes, value: Bytes) {
        let generation = self.bump_generation();
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at_ms: NO_EXPIRY,
                generation,
            },
        );
    }

    /// Returns the live value for `key`, removing it first if its
    /// deadline has passed.
    pub fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        if self.purge_if_expired(key) {
            return None;
        }
        self.entries.get(key).map(|e| e.value.clone())
    }

    /// Deletes each present key; returns how many were actually
    /// removed. Expired-but-not-yet-purged entries don't count.
    pub fn del(&mut self, keys: &[Bytes]) -> usize {
        let mut removed = 0;
        for key in keys {
            let was_live = !self.purge_if_expired(key) && self.entries.contains_key(key.as_ref());
            if self.entries.remove(key.as_ref()).is_some() && was_live {
                removed += 1;
            }
        }
        removed
    }

    /// Counts present keys; duplicates in `keys` count multiply.
    pub fn exists(&mut self, keys: &[Bytes]) -> usize {
        keys.iter()
            .filter(|k| {
                !self.purge_if_expired(k) && self.entries.contains_key(k.as_ref())
            })
            .count()
    }

    /// Schedules expiry `seconds` from now (negative clamps to zero,
    /// i.e. the key is dead immediately).
    ///
    /// Returns the `(deadline_ms, generation)` pair the caller must arm
    /// a timer with, or `None` when the key is absent.
    pub fn expire(&mut self, key: &[u8], seconds: i64) -> Option<(u64, u64)> {
        if self.purge_if_expired(key) {
            return None;
        }
        let deadline = time::now_ms().saturating_add((seconds.max(0) as u64).saturating_mul(1000));
        let generation = self.bump_generation();
        let entry = self.entries.get_mut(key)?;
        entry.expires_at_ms = deadline;
        entry.generation = generation;
        Some((deadline, generation))
    }

    /// Remaining time-to-live for `key`.
    pub fn ttl(&mut self, key: &[u8]) -> TtlResult {
        if self.purge_if_expired(key) {
            return TtlResult::NotFound;
        }
        match self.entries.get(key) {
            None => TtlResult::NotFound,
            Some(e) => match time::remaining_ms(e.expires_at_ms) {
                None => TtlResult::NoExpiry,
                // round up so a key with 900ms left reports 1 second
                Some(ms) => TtlResult::Seconds(ms.div_ceil(1000)),
            },
        }
    }

    /// Clears the TTL on `key`. Returns true when a TTL was removed.
    pub fn persist(&mut self, key: &[u8]) -> bool {
        if self.purge_if_expired(key) {
            return false;
        }
        let generation = self.bump_generation();
        match self.entries.get_mut(key) {
            Some(e) if e.expires_at_ms != NO_EXPIRY => {
                e.expires_at_ms = NO_EXPIRY;
                e.generation = generation;
                true
            }
            _ => false,
        }
    }

    /// All live keys matching the glob `pattern`.
    pub fn keys(&mut self, pattern: &[u8]) -> Vec<Bytes> {
        self.purge_expired();
        self.entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect()
    }

    /// One page of a cursor scan.
    ///
    /// The cursor is an index into the keyspace sorted by raw bytes at
    /// the moment of the call; deliberately not a snapshot. Keys
    /// added or removed between pages may be skipped or repeated.
    /// `count` bounds the slice taken per page (default 10); MATCH
    /// filtering applies after slicing, so a page may return fewer
    /// keys than `count` without being the last.
    pub fn scan(&mut self, cursor: u64, pattern: Option<&[u8]>, count: Option<usize>) -> ScanPage {
        self.purge_expired();

        let mut sorted: Vec<&Bytes> = self.entries.keys().collect();
        sorted.sort_unstable();

        let count = count.unwrap_or(10).max(1);
        let start = (cursor as usize).min(sorted.len());
        let end = start.saturating_add(count).min(sorted.len());

        let keys = sorted[start..end]
            .iter()
            .filter(|k| pattern.is_none_or(|p| glob_match(p, k)))
            .map(|k| (*k).clone())
            .collect();

        let next_cursor = if end >= sorted.len() { 0 } else { end as u64 };
        ScanPage { next_cursor, keys }
    }

    /// Number of live keys.
    pub fn dbsize(&mut self) -> usize {
        self.purge_expired();
        self.entries.len()
    }

    /// Number of live keys carrying a TTL. Feeds the keyspace INFO line.
    pub fn expires_count(&mut self) -> usize {
        self.purge_expired();
        self.entries
            .values()
            .filter(|e| e.expires_at_ms != NO_EXPIRY)
            .count()
    }

    /// Value type name for TYPE: every live key is a string.
    pub fn type_of(&mut self, key: &[u8]) -> &'static str {
        if !self.purge_if_expired(key) && self.entries.contains_key(key) {
            "string"
        } else {
            "none"
        }
    }

    /// Timer-fire path: removes `key` only when the entry still
    /// carries the generation the timer was armed with. Returns true
    /// when the key was removed.
    pub fn remove_if_generation(&mut self, key: &[u8], generation: u64) -> bool {
        match self.entries.get(key) {
            Some(e) if e.generation == generation && e.expires_at_ms != NO_EXPIRY => {
                self.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Removes `key` if its deadline has passed. Returns true when the
    /// entry was expired (and is now gone).
    fn purge_if_expired(&mut self, key: &[u8]) -> bool {
        match self.entries.get(key) {
            Some(e) if e.is_expired() => {
                self.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Removes every expired entry. Used by whole-keyspace reads
    /// (KEYS, SCAN, DBSIZE) so they never observe dead keys.
    fn purge_expired(&mut self) {
        self.entries.retain(|_, e| !e.is_expired());
    }
}
