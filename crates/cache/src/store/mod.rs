//! Bounded key/entry store with strict LRU eviction and per-entry TTL
//!
//! Entries live in a slot arena (`Vec<Option<Slot>>` plus a free list). A
//! hash map resolves keys to slot indices and an intrusive doubly linked list
//! threaded through the slots keeps recency order: the head is the most
//! recently used entry, the tail is the next eviction victim. Touch, insert,
//! evict and delete are all O(1).
//!
//! The store owns the [`TagIndex`] so that every mutation reconciles tag
//! associations in the same call. It performs no locking of its own; the
//! coordinator wraps it, together with the in-flight registry, in one mutex.
//!
//! # Expiry
//!
//! Expiry is checked lazily on read: an entry is expired when
//! `now - created_at > ttl`. A zero or absent TTL never expires by time.
//! With `retain_stale` set, expired entries stay in the store (and keep their
//! recency slot) so the coordinator can serve them stale or fall back to them
//! on fetch failure.

pub mod tags;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error};

pub use self::tags::TagIndex;
use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, CacheResult};

/// Arena slot holding one live entry.
#[derive(Debug)]
struct Slot<V> {
    key: String,
    value: V,
    tags: BTreeSet<String>,
    created_at: Instant,
    ttl: Option<Duration>,
    last_accessed: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<V> Slot<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl.is_some_and(|ttl| now.saturating_duration_since(self.created_at) > ttl)
    }
}

/// Result of a recency-refreshing lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    /// Entry present and within its TTL
    Fresh(V),
    /// Entry present, past its TTL, retained for stale serving
    Stale(V),
    /// No entry
    Absent,
}

impl<V> Lookup<V> {
    /// The value, fresh or stale
    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Fresh(v) | Self::Stale(v) => Some(v),
            Self::Absent => None,
        }
    }

    /// Whether the lookup found a fresh entry
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }
}

/// Outcome of a bulk tag removal
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TagRemoval {
    /// Keys whose entries were removed
    pub removed: Vec<String>,
    /// Keys the tag index pointed at without a live entry behind them
    pub dangling: Vec<String>,
}

/// Bounded LRU + TTL entry store
pub struct CacheStore<V> {
    slots: Vec<Option<Slot<V>>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    tags: TagIndex,
    capacity: usize,
    retain_stale: bool,
    clock: Arc<dyn Clock>,
}

impl<V> std::fmt::Debug for CacheStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("len", &self.index.len())
            .field("capacity", &self.capacity)
            .field("retain_stale", &self.retain_stale)
            .field("tags", &self.tags.tag_count())
            .finish()
    }
}

const MAX_PREALLOCATED_SLOTS: usize = 4096;

impl<V: Clone> CacheStore<V> {
    /// Create a store holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize, retain_stale: bool, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(1);
        let prealloc = capacity.min(MAX_PREALLOCATED_SLOTS);
        Self {
            slots: Vec::with_capacity(prealloc),
            free: Vec::new(),
            index: HashMap::with_capacity(prealloc),
            head: None,
            tail: None,
            tags: TagIndex::new(),
            capacity,
            retain_stale,
            clock,
        }
    }

    /// Create a store on the system clock that drops expired entries on read
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(capacity, false, Arc::new(SystemClock))
    }

    /// Get a fresh value, refreshing its recency
    ///
    /// An expired entry is treated as absent and removed, together with its
    /// tag associations, regardless of `retain_stale`.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let idx = *self.index.get(key)?;
        let now = self.clock.now();
        let expired = self.slot(idx)?.is_expired(now);
        if expired {
            debug!(key = %key, "Expired entry removed on read");
            self.remove_at(idx);
            return None;
        }
        self.touch(idx, now);
        self.slot(idx).map(|slot| slot.value.clone())
    }

    /// Look up a value, distinguishing fresh from stale
    ///
    /// Refreshes recency on any hit, stale ones included, so a value being
    /// served while it revalidates is not the next eviction victim. Without
    /// `retain_stale`, an expired entry is removed and reported as
    /// [`Lookup::Absent`].
    ///
    /// # Example
    /// ```
    /// use std::collections::BTreeSet;
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// use adaptive_cache::{CacheStore, Lookup, MockClock};
    ///
    /// let clock = MockClock::new();
    /// let mut store = CacheStore::new(8, true, Arc::new(clock.clone()));
    /// store.set("k", 1, Some(Duration::from_secs(1)), BTreeSet::new());
    /// assert_eq!(store.lookup("k"), Lookup::Fresh(1));
    ///
    /// clock.advance(Duration::from_secs(2));
    /// assert_eq!(store.lookup("k"), Lookup::Stale(1));
    /// assert_eq!(store.lookup("other"), Lookup::Absent);
    /// ```
    pub fn lookup(&mut self, key: &str) -> Lookup<V> {
        let Some(&idx) = self.index.get(key) else {
            return Lookup::Absent;
        };
        let now = self.clock.now();
        let Some(expired) = self.slot(idx).map(|slot| slot.is_expired(now)) else {
            return Lookup::Absent;
        };
        if expired && !self.retain_stale {
            debug!(key = %key, "Expired entry removed on read");
            self.remove_at(idx);
            return Lookup::Absent;
        }
        self.touch(idx, now);
        match self.slot(idx) {
            Some(slot) if expired => Lookup::Stale(slot.value.clone()),
            Some(slot) => Lookup::Fresh(slot.value.clone()),
            None => Lookup::Absent,
        }
    }

    /// Insert or overwrite `key`
    ///
    /// An overwrite replaces the value, restarts the TTL and moves the entry
    /// to the front. Its tag set is replaced: tags no longer listed stop
    /// matching the key. Inserting a new key into a full store evicts the least
    /// recently used entry first and returns that entry's key. A zero `ttl`
    /// is stored as no expiry.
    ///
    /// # Example
    /// ```
    /// use std::collections::BTreeSet;
    ///
    /// use adaptive_cache::CacheStore;
    ///
    /// let mut store = CacheStore::with_capacity(2);
    /// store.set("a", 1, None, BTreeSet::from(["row".to_string()]));
    /// store.set("b", 2, None, BTreeSet::new());
    /// store.get("a");
    ///
    /// let evicted = store.set("c", 3, None, BTreeSet::new());
    /// assert_eq!(evicted.as_deref(), Some("b"));
    /// assert_eq!(store.keys_for_tags(["row"]), vec!["a".to_string()]);
    /// ```
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: V,
        ttl: Option<Duration>,
        tags: BTreeSet<String>,
    ) -> Option<String> {
        let key = key.into();
        let now = self.clock.now();
        let ttl = ttl.filter(|d| !d.is_zero());

        if let Some(&idx) = self.index.get(&key) {
            if let Some(slot) = self.slots.get_mut(idx).and_then(Option::as_mut) {
                let old_tags = std::mem::replace(&mut slot.tags, tags);
                self.tags.disassociate(&key, old_tags.difference(&slot.tags));
                self.tags.associate(&key, slot.tags.difference(&old_tags));
                slot.value = value;
                slot.created_at = now;
                slot.ttl = ttl;
                slot.last_accessed = now;
                self.move_to_front(idx);
                return None;
            }
            error!(key = %key, slot = idx, "Index points at an empty slot; dropping stale index entry");
            self.index.remove(&key);
        }

        let evicted = if self.index.len() >= self.capacity { self.evict_lru() } else { None };

        self.tags.associate(&key, &tags);
        let slot = Slot {
            key: key.clone(),
            value,
            tags,
            created_at: now,
            ttl,
            last_accessed: now,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                if let Some(cell) = self.slots.get_mut(idx) {
                    *cell = Some(slot);
                }
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);

        evicted
    }

    /// Remove `key` and its tag associations; idempotent
    pub fn delete(&mut self, key: &str) -> bool {
        match self.index.get(key) {
            Some(&idx) => self.remove_at(idx).is_some(),
            None => false,
        }
    }

    /// Whether a fresh entry exists, without touching recency
    pub fn contains_fresh(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.index
            .get(key)
            .and_then(|&idx| self.slot(idx))
            .is_some_and(|slot| !slot.is_expired(now))
    }

    /// Whether any entry (fresh or stale) exists, without touching recency
    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Number of stored entries, including retained stale ones
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.tags.clear();
        self.head = None;
        self.tail = None;
    }

    /// `(key, tags)` for every entry, most recently used first
    pub fn snapshot(&self) -> Vec<(String, BTreeSet<String>)> {
        self.iter_mru().map(|slot| (slot.key.clone(), slot.tags.clone())).collect()
    }

    /// Keys, most recently used first
    pub fn keys(&self) -> Vec<String> {
        self.iter_mru().map(|slot| slot.key.clone()).collect()
    }

    /// Keys carrying any of `tags`
    pub fn keys_for_tags<I, S>(&self, tags: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keys: Vec<String> = self.tags.keys_for_tags(tags).into_iter().collect();
        keys.sort();
        keys
    }

    /// Remove every entry carrying any of `tags`
    ///
    /// Index associations without a live entry are dropped and reported in
    /// [`TagRemoval::dangling`].
    pub fn remove_by_tags(&mut self, tags: &[String]) -> TagRemoval {
        let mut outcome = TagRemoval::default();
        for key in self.keys_for_tags(tags) {
            match self.index.get(&key).copied() {
                Some(idx) if self.remove_at(idx).is_some() => outcome.removed.push(key),
                _ => {
                    error!(key = %key, "Tag index references a key absent from the store");
                    self.tags.disassociate(&key, tags);
                    outcome.dangling.push(key);
                }
            }
        }
        outcome
    }

    /// Remove every expired entry, returning the removed keys
    pub fn purge_expired(&mut self) -> Vec<String> {
        let now = self.clock.now();
        let expired: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().filter(|s| s.is_expired(now)).map(|_| idx))
            .collect();

        expired.into_iter().filter_map(|idx| self.remove_at(idx)).map(|slot| slot.key).collect()
    }

    /// Check agreement between the key index, the recency list and the tag
    /// index
    pub fn verify_integrity(&self) -> CacheResult<()> {
        if self.index.len() > self.capacity {
            return Err(CacheError::corruption(
                "*",
                format!("{} entries exceed capacity {}", self.index.len(), self.capacity),
            ));
        }

        for (key, &idx) in &self.index {
            match self.slot(idx) {
                Some(slot) if slot.key == *key => {
                    for tag in &slot.tags {
                        if !self.tags.contains(tag, key) {
                            return Err(CacheError::corruption(
                                key.clone(),
                                format!("tag '{tag}' missing from tag index"),
                            ));
                        }
                    }
                }
                _ => {
                    return Err(CacheError::corruption(key.clone(), "index points at wrong slot"));
                }
            }
        }

        for (tag, key) in self.tags.pairs() {
            let listed = self
                .index
                .get(key)
                .and_then(|&idx| self.slot(idx))
                .is_some_and(|slot| slot.tags.contains(tag));
            if !listed {
                return Err(CacheError::corruption(
                    key,
                    format!("tag index lists '{tag}' for an entry that does not carry it"),
                ));
            }
        }

        let mut walked = 0usize;
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let Some(slot) = self.slot(idx) else {
                return Err(CacheError::corruption("*", format!("recency list hits empty slot {idx}")));
            };
            if slot.prev != prev {
                return Err(CacheError::corruption(slot.key.clone(), "broken recency back-link"));
            }
            walked += 1;
            if walked > self.index.len() {
                return Err(CacheError::corruption("*", "recency list longer than index"));
            }
            prev = Some(idx);
            cursor = slot.next;
        }
        if walked != self.index.len() || self.tail != prev {
            return Err(CacheError::corruption(
                "*",
                format!("recency list has {walked} nodes for {} entries", self.index.len()),
            ));
        }

        Ok(())
    }

    fn slot(&self, idx: usize) -> Option<&Slot<V>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, idx: usize) -> Option<&mut Slot<V>> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn iter_mru(&self) -> impl Iterator<Item = &Slot<V>> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let slot = self.slot(cursor?)?;
            cursor = slot.next;
            Some(slot)
        })
        .take(self.index.len())
    }

    fn touch(&mut self, idx: usize, now: Instant) {
        if let Some(slot) = self.slot_mut(idx) {
            slot.last_accessed = now;
        }
        self.move_to_front(idx);
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self.slot(idx).map(|slot| (slot.prev, slot.next)) else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(slot) = self.slot_mut(p) {
                    slot.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(slot) = self.slot_mut(n) {
                    slot.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(slot) = self.slot_mut(idx) {
            slot.prev = None;
            slot.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(slot) = self.slot_mut(idx) {
            slot.prev = None;
            slot.next = old_head;
        }
        match old_head {
            Some(h) => {
                if let Some(slot) = self.slot_mut(h) {
                    slot.prev = Some(idx);
                }
            }
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn remove_at(&mut self, idx: usize) -> Option<Slot<V>> {
        self.unlink(idx);
        let slot = self.slots.get_mut(idx)?.take()?;
        self.index.remove(&slot.key);
        self.tags.disassociate(&slot.key, &slot.tags);
        self.free.push(idx);
        Some(slot)
    }

    fn evict_lru(&mut self) -> Option<String> {
        let victim = self.tail?;
        let slot = self.remove_at(victim)?;
        debug!(
            key = %slot.key,
            idle_ms = self.clock.now().saturating_duration_since(slot.last_accessed).as_millis() as u64,
            "Evicted least recently used entry"
        );
        Some(slot.key)
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for store.
    use super::*;
    use crate::clock::MockClock;

    fn tags(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn store(capacity: usize, retain_stale: bool) -> (CacheStore<u32>, MockClock) {
        let clock = MockClock::new();
        (CacheStore::new(capacity, retain_stale, Arc::new(clock.clone())), clock)
    }

    /// Validates strict LRU ordering for the read-bumps-recency scenario.
    ///
    /// Assertions:
    /// - Reading `a` protects it from eviction.
    /// - Inserting `c` into a full store evicts `b`.
    #[test]
    fn test_lru_eviction_respects_reads() {
        let (mut store, _clock) = store(2, false);
        store.set("a", 1, None, BTreeSet::new());
        store.set("b", 2, None, BTreeSet::new());

        assert_eq!(store.get("a"), Some(1));
        let evicted = store.set("c", 3, None, BTreeSet::new());

        assert_eq!(evicted.as_deref(), Some("b"));
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("b"), None);
        assert_eq!(store.keys(), vec!["c".to_string(), "a".to_string()]);
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_eviction_ties_broken_by_insertion_order() {
        let (mut store, _clock) = store(3, false);
        for (i, key) in ["x", "y", "z"].iter().enumerate() {
            store.set(*key, i as u32, None, BTreeSet::new());
        }

        assert_eq!(store.set("w", 9, None, BTreeSet::new()).as_deref(), Some("x"));
        assert_eq!(store.set("v", 9, None, BTreeSet::new()).as_deref(), Some("y"));
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let (mut store, _clock) = store(2, false);
        store.set("a", 1, None, BTreeSet::new());
        store.set("b", 2, None, BTreeSet::new());

        assert_eq!(store.set("a", 10, None, BTreeSet::new()), None);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a"), Some(10));
        assert_eq!(store.keys()[0], "a");
    }

    #[test]
    fn test_capacity_one() {
        let (mut store, _clock) = store(0, false);
        assert_eq!(store.capacity(), 1);

        store.set("a", 1, None, BTreeSet::new());
        assert_eq!(store.set("b", 2, None, BTreeSet::new()).as_deref(), Some("a"));
        assert_eq!(store.keys(), vec!["b".to_string()]);
        store.verify_integrity().unwrap();
    }

    /// Validates lazy TTL expiry for the strict read path.
    ///
    /// Assertions:
    /// - Entry is readable up to and including its TTL boundary.
    /// - Past the TTL the entry is removed along with its tags.
    #[test]
    fn test_get_removes_expired_entry() {
        let (mut store, clock) = store(10, true);
        store.set("k", 7, Some(Duration::from_millis(100)), tags(&["t"]));

        clock.advance_millis(100);
        assert_eq!(store.get("k"), Some(7));

        clock.advance_millis(1);
        assert_eq!(store.get("k"), None);
        assert!(store.is_empty());
        assert!(store.keys_for_tags(["t"]).is_empty());
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let (mut store, clock) = store(10, false);
        store.set("k", 1, Some(Duration::ZERO), BTreeSet::new());

        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert_eq!(store.get("k"), Some(1));
    }

    #[test]
    fn test_lookup_retains_stale_when_allowed() {
        let (mut store, clock) = store(10, true);
        store.set("k", 1, Some(Duration::from_secs(1)), BTreeSet::new());

        assert_eq!(store.lookup("k"), Lookup::Fresh(1));
        clock.advance(Duration::from_secs(2));
        assert_eq!(store.lookup("k"), Lookup::Stale(1));
        assert!(store.contains_key("k"));
        assert!(!store.contains_fresh("k"));
    }

    #[test]
    fn test_lookup_drops_stale_when_not_allowed() {
        let (mut store, clock) = store(10, false);
        store.set("k", 1, Some(Duration::from_secs(1)), BTreeSet::new());

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.lookup("k"), Lookup::Absent);
        assert!(!store.contains_key("k"));
    }

    #[test]
    fn test_overwrite_resets_expiry() {
        let (mut store, clock) = store(10, true);
        store.set("k", 1, Some(Duration::from_secs(1)), BTreeSet::new());
        clock.advance(Duration::from_secs(2));

        store.set("k", 2, Some(Duration::from_secs(1)), BTreeSet::new());
        assert_eq!(store.lookup("k"), Lookup::Fresh(2));
    }

    /// Validates tag reconciliation for the overwrite scenario.
    ///
    /// Assertions:
    /// - Tags dropped by the new write no longer resolve to the key.
    /// - Tags added by the new write do.
    #[test]
    fn test_overwrite_reconciles_tags() {
        let (mut store, _clock) = store(10, false);
        store.set("k", 1, None, tags(&["old", "shared"]));
        store.set("k", 2, None, tags(&["shared", "new"]));

        assert!(store.keys_for_tags(["old"]).is_empty());
        assert_eq!(store.keys_for_tags(["shared"]), vec!["k".to_string()]);
        assert_eq!(store.keys_for_tags(["new"]), vec!["k".to_string()]);
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_remove_by_tags_partitions() {
        let (mut store, _clock) = store(10, false);
        store.set("p1", 1, None, tags(&["g1"]));
        store.set("p2", 2, None, tags(&["g1", "g2"]));

        let outcome = store.remove_by_tags(&["g2".to_string()]);

        assert_eq!(outcome.removed, vec!["p2".to_string()]);
        assert!(outcome.dangling.is_empty());
        assert_eq!(store.get("p1"), Some(1));
        assert_eq!(store.keys_for_tags(["g1"]), vec!["p1".to_string()]);
        store.verify_integrity().unwrap();
    }

    /// Validates removal across overlapping tags with key reuse afterwards.
    ///
    /// Assertions:
    /// - Every key under any requested tag is removed exactly once.
    /// - Freed slots are reused without corrupting the index.
    #[test]
    fn test_remove_by_overlapping_tags_frees_slots() {
        let (mut store, _clock) = store(4, false);
        store.set("a", 1, None, tags(&["x", "y"]));
        store.set("b", 2, None, tags(&["y"]));
        store.set("c", 3, None, tags(&["z"]));

        let mut outcome = store.remove_by_tags(&["x".to_string(), "y".to_string()]);
        outcome.removed.sort();

        assert_eq!(outcome.removed, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.keys(), vec!["c".to_string()]);

        store.set("d", 4, None, tags(&["y"]));
        store.set("e", 5, None, BTreeSet::new());
        assert_eq!(store.len(), 3);
        assert_eq!(store.keys_for_tags(["y"]), vec!["d".to_string()]);
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_eviction_clears_tags() {
        let (mut store, _clock) = store(1, false);
        store.set("a", 1, None, tags(&["t"]));
        store.set("b", 2, None, BTreeSet::new());

        assert!(store.keys_for_tags(["t"]).is_empty());
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (mut store, _clock) = store(10, false);
        store.set("k", 1, None, tags(&["t"]));

        assert!(store.delete("k"));
        assert!(!store.delete("k"));
        assert!(store.keys_for_tags(["t"]).is_empty());
    }

    #[test]
    fn test_slot_reuse_after_delete() {
        let (mut store, _clock) = store(3, false);
        store.set("a", 1, None, BTreeSet::new());
        store.set("b", 2, None, BTreeSet::new());
        store.delete("a");
        store.set("c", 3, None, BTreeSet::new());
        store.set("d", 4, None, BTreeSet::new());

        assert_eq!(store.len(), 3);
        assert_eq!(store.keys(), vec!["d".to_string(), "c".to_string(), "b".to_string()]);
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_purge_expired() {
        let (mut store, clock) = store(10, true);
        store.set("short", 1, Some(Duration::from_millis(10)), tags(&["t"]));
        store.set("long", 2, Some(Duration::from_secs(60)), BTreeSet::new());
        store.set("forever", 3, None, BTreeSet::new());

        clock.advance_millis(50);
        let purged = store.purge_expired();

        assert_eq!(purged, vec!["short".to_string()]);
        assert_eq!(store.len(), 2);
        assert!(store.keys_for_tags(["t"]).is_empty());
    }

    #[test]
    fn test_snapshot_lists_tags_in_recency_order() {
        let (mut store, _clock) = store(10, false);
        store.set("a", 1, None, tags(&["x"]));
        store.set("b", 2, None, BTreeSet::new());

        let snapshot = store.snapshot();
        assert_eq!(snapshot[0], ("b".to_string(), BTreeSet::new()));
        assert_eq!(snapshot[1], ("a".to_string(), tags(&["x"])));
    }

    #[test]
    fn test_clear() {
        let (mut store, _clock) = store(10, false);
        store.set("a", 1, None, tags(&["x"]));
        store.clear();

        assert!(store.is_empty());
        assert!(store.keys_for_tags(["x"]).is_empty());
        store.set("b", 2, None, BTreeSet::new());
        store.verify_integrity().unwrap();
    }
}
