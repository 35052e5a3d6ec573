//! # In-Memory Keyspace
//!
//! Provide the string key/value store with per-key TTL deadlines and
//! race-safe one-shot expiry timers.
//!
//! ## Design Principles
//! 1. **Coarse Lock**: One `RwLock` guards the keyspace; every operation is
//!    pure map work, so the critical sections are short and never touch I/O.
//! 2. **Generation Guard**: Each entry carries a generation stamp. Expiry
//!    timers capture the stamp at schedule time and only remove the entry
//!    when it still matches, so a timer for a replaced key is a no-op.
//! 3. **Lazy Expiry**: Every read re-checks the deadline, so observable
//!    behavior never depends on timer latency.
//! 4. **Arc-backed Values**: Values are `Arc<[u8]>` so GET hands out a
//!    reference-counted view instead of copying the payload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::trace;

use crate::pattern::glob_match;

/// TTL state of a key, mirroring Redis `TTL` semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

#[derive(Debug)]
struct Entry {
    value: Arc<[u8]>,
    expires_at: Option<Instant>,
    /// Stamp compared by expiry timers; bumped on every mutation.
    generation: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

/// The in-memory keyspace.
///
/// All operations are synchronous map work; expiry timers are tokio tasks
/// scheduled through [`Store::schedule_expiry`].
#[derive(Debug)]
pub struct Store {
    entries: RwLock<HashMap<Vec<u8>, Entry, RandomState>>,
    generations: AtomicU64,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Store {
            entries: RwLock::new(HashMap::with_hasher(RandomState::new())),
            generations: AtomicU64::new(0),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Inserts or replaces a value and clears any TTL.
    pub fn set(&self, key: Vec<u8>, value: Vec<u8>) {
        let generation = self.next_generation();
        let mut entries = self.entries.write();
        entries.insert(
            key,
            Entry {
                value: Arc::from(value),
                expires_at: None,
                generation,
            },
        );
    }

    /// Returns the value for `key`, or `None` when absent or expired.
    pub fn get(&self, key: &[u8]) -> Option<Arc<[u8]>> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    return Some(Arc::clone(&entry.value))
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Expired under the read lock; re-check before removing because a
        // writer may have replaced the entry in between.
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            if entry.is_expired(Instant::now()) {
                entries.remove(key);
            } else {
                return Some(Arc::clone(&entry.value));
            }
        }
        None
    }

    /// Deletes `key`. Returns true when a live entry was removed.
    pub fn del(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write();
        match entries.remove(key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        }
    }

    /// Returns true when `key` is present and not expired.
    pub fn exists(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        let entries = self.entries.read();
        entries
            .get(key)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false)
    }

    /// Sets a TTL of `max(0, seconds)` on a live key.
    ///
    /// Returns the deadline and generation stamp to schedule a timer with,
    /// or `None` when the key is absent. Negative seconds clamp to zero,
    /// which expires the key on the next timer tick.
    pub fn expire(&self, key: &[u8], seconds: i64) -> Option<(Instant, u64)> {
        let now = Instant::now();
        let deadline = now + Duration::from_secs(seconds.max(0) as u64);
        let generation = self.next_generation();
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(deadline);
                entry.generation = generation;
                Some((deadline, generation))
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Clears the TTL of a live key. Returns true when a TTL was removed.
    pub fn persist(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        let generation = self.next_generation();
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) && entry.expires_at.is_some() => {
                entry.expires_at = None;
                entry.generation = generation;
                true
            }
            _ => false,
        }
    }

    /// Reports the TTL state of `key`.
    pub fn ttl(&self, key: &[u8]) -> Ttl {
        let now = Instant::now();
        let entries = self.entries.read();
        match entries.get(key) {
            None => Ttl::Missing,
            Some(entry) if entry.is_expired(now) => Ttl::Missing,
            Some(entry) => match entry.expires_at {
                None => Ttl::NoExpiry,
                Some(deadline) => Ttl::ExpiresIn(deadline - now),
            },
        }
    }

    /// Removes `key` if its generation stamp still matches.
    ///
    /// This is the expiry-timer callback: a key that was overwritten,
    /// deleted, persisted, or re-expired since the timer was scheduled
    /// carries a newer stamp and is left alone.
    pub fn expire_if_current(&self, key: &[u8], generation: u64) -> bool {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(entry) if entry.generation == generation => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Spawns the one-shot expiry timer for a deadline handed out by
    /// [`Store::expire`].
    pub fn schedule_expiry(self: &Arc<Self>, key: Vec<u8>, deadline: Instant, generation: u64) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if store.expire_if_current(&key, generation) {
                trace!(key = %String::from_utf8_lossy(&key), "key expired");
            }
        });
    }

    /// Returns every live key matching `pattern`.
    pub fn keys(&self, pattern: &[u8]) -> Vec<Vec<u8>> {
        let now = Instant::now();
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Cursor-based iteration over the keyspace.
    ///
    /// The cursor is an index into a freshly sorted snapshot of the live
    /// keys, so a scan is NOT a point-in-time view: keys inserted or
    /// removed between calls may be missed or repeated. `count` bounds the
    /// slice taken per call; the returned cursor is 0 once exhausted.
    pub fn scan(&self, cursor: u64, pattern: Option<&[u8]>, count: usize) -> (u64, Vec<Vec<u8>>) {
        let now = Instant::now();
        let mut live: Vec<Vec<u8>> = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter(|(_, entry)| !entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect()
        };
        live.sort_unstable();

        let start = (cursor as usize).min(live.len());
        let end = start.saturating_add(count.max(1)).min(live.len());
        let next_cursor = if end >= live.len() { 0 } else { end as u64 };

        let page = live
            .drain(start..end)
            .filter(|key| match pattern {
                Some(pattern) => glob_match(pattern, key),
                None => true,
            })
            .collect();
        (next_cursor, page)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read();
        entries.values().filter(|entry| !entry.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (live keys, live keys carrying a TTL) for keyspace reporting.
    pub fn ttl_stats(&self) -> (usize, usize) {
        let now = Instant::now();
        let entries = self.entries.read();
        let mut keys = 0;
        let mut expires = 0;
        for entry in entries.values() {
            if entry.is_expired(now) {
                continue;
            }
            keys += 1;
            if entry.expires_at.is_some() {
                expires += 1;
            }
        }
        (keys, expires)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_roundtrip() {
        let store = Store::new();
        store.set(b"alpha".to_vec(), b"value".to_vec());
        let value = store.get(b"alpha").expect("present");
        assert_eq!(&*value, b"value");
        assert_eq!(store.ttl(b"alpha"), Ttl::NoExpiry);
    }

    #[test]
    fn del_reports_live_entries_only() {
        let store = Store::new();
        store.set(b"alpha".to_vec(), b"1".to_vec());
        assert!(store.del(b"alpha"));
        assert!(!store.del(b"alpha"));
        assert!(store.get(b"alpha").is_none());
    }

    #[test]
    fn expire_missing_key_is_refused() {
        let store = Store::new();
        assert!(store.expire(b"missing", 10).is_none());
        assert_eq!(store.ttl(b"missing"), Ttl::Missing);
    }

    #[test]
    fn negative_seconds_expire_immediately() {
        let store = Store::new();
        store.set(b"alpha".to_vec(), b"1".to_vec());
        let scheduled = store.expire(b"alpha", -5);
        assert!(scheduled.is_some());
        // Deadline clamps to now, so the key is already unobservable.
        assert!(store.get(b"alpha").is_none());
        assert_eq!(store.ttl(b"alpha"), Ttl::Missing);
        assert!(!store.exists(b"alpha"));
    }

    #[test]
    fn set_clears_ttl() {
        let store = Store::new();
        store.set(b"alpha".to_vec(), b"1".to_vec());
        store.expire(b"alpha", 100);
        store.set(b"alpha".to_vec(), b"2".to_vec());
        assert_eq!(store.ttl(b"alpha"), Ttl::NoExpiry);
    }

    #[test]
    fn persist_clears_ttl_once() {
        let store = Store::new();
        store.set(b"alpha".to_vec(), b"1".to_vec());
        assert!(!store.persist(b"alpha"));
        store.expire(b"alpha", 100);
        assert!(store.persist(b"alpha"));
        assert!(!store.persist(b"alpha"));
        assert_eq!(store.ttl(b"alpha"), Ttl::NoExpiry);
    }

    #[test]
    fn stale_timer_generation_is_ignored() {
        let store = Store::new();
        store.set(b"alpha".to_vec(), b"1".to_vec());
        let (_, generation) = store.expire(b"alpha", 100).expect("scheduled");
        // Overwrite bumps the generation, so the old timer must not fire.
        store.set(b"alpha".to_vec(), b"2".to_vec());
        assert!(!store.expire_if_current(b"alpha", generation));
        let value = store.get(b"alpha").expect("still present");
        assert_eq!(&*value, b"2");
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_timer_removes_key() {
        let store = Arc::new(Store::new());
        store.set(b"alpha".to_vec(), b"1".to_vec());
        let (deadline, generation) = store.expire(b"alpha", 1).expect("scheduled");
        store.schedule_expiry(b"alpha".to_vec(), deadline, generation);

        tokio::time::advance(Duration::from_millis(1200)).await;
        tokio::task::yield_now().await;
        assert!(store.get(b"alpha").is_none());
        assert_eq!(store.ttl(b"alpha"), Ttl::Missing);
    }

    #[test]
    fn keys_filters_by_glob() {
        let store = Store::new();
        store.set(b"user:1".to_vec(), b"a".to_vec());
        store.set(b"user:2".to_vec(), b"b".to_vec());
        store.set(b"session:1".to_vec(), b"c".to_vec());

        let mut users = store.keys(b"user:*");
        users.sort();
        assert_eq!(users, vec![b"user:1".to_vec(), b"user:2".to_vec()]);
        assert_eq!(store.keys(b"*").len(), 3);
        assert!(store.keys(b"nothing*").is_empty());
    }

    #[test]
    fn scan_pages_through_sorted_keys() {
        let store = Store::new();
        for idx in 0..5u8 {
            store.set(vec![b'k', b'0' + idx], b"v".to_vec());
        }

        let (cursor, first) = store.scan(0, None, 2);
        assert_eq!(first, vec![b"k0".to_vec(), b"k1".to_vec()]);
        assert_eq!(cursor, 2);

        let (cursor, second) = store.scan(cursor, None, 2);
        assert_eq!(second, vec![b"k2".to_vec(), b"k3".to_vec()]);
        let (cursor, rest) = store.scan(cursor, None, 10);
        assert_eq!(rest, vec![b"k4".to_vec()]);
        assert_eq!(cursor, 0);
    }

    #[test]
    fn scan_applies_match_after_slicing() {
        let store = Store::new();
        store.set(b"a1".to_vec(), b"v".to_vec());
        store.set(b"b1".to_vec(), b"v".to_vec());
        let (cursor, page) = store.scan(0, Some(b"b*"), 10);
        assert_eq!(cursor, 0);
        assert_eq!(page, vec![b"b1".to_vec()]);
    }

    #[test]
    fn ttl_stats_counts_live_and_volatile() {
        let store = Store::new();
        store.set(b"a".to_vec(), b"v".to_vec());
        store.set(b"b".to_vec(), b"v".to_vec());
        store.expire(b"b", 100);
        assert_eq!(store.ttl_stats(), (2, 1));
        assert_eq!(store.len(), 2);
    }
}
