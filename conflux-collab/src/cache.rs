//! Bounded, time-aware cache of live documents.
//!
//! Maps `(collection, doc_id)` to a value (the coordinator stores
//! `Arc<Mutex<CrdtDocument>>`) with least-recently-used eviction on overflow
//! and a TTL sweep for idle entries.
//!
//! The single most important property here: the cache never silently drops
//! an entry. Overflow eviction *returns* the evicted pair so the caller can
//! write it back to durable storage, and the TTL sweep is a two-step
//! list-then-remove ([`DocumentCache::idle_keys`], then
//! [`DocumentCache::remove_if_idle`] per key) so the caller decides each
//! entry's fate one at a time. A caller whose write-back failed can
//! [`DocumentCache::restore`] the entry and retry on the next sweep.
//!
//! Eviction scans all access times, O(n) per eviction. Capacity is small
//! relative to throughput, so the scan is cheaper than maintaining a
//! recency list; swap in a doubly-linked list if capacities grow.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Cache key: `(collection, document id)`.
pub type DocKey = (String, String);

struct CacheEntry<V> {
    value: V,
    last_access: Instant,
}

/// LRU + TTL cache with write-back hooks.
pub struct DocumentCache<V> {
    entries: HashMap<DocKey, CacheEntry<V>>,
    capacity: usize,
}

impl<V> DocumentCache<V> {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Look up an entry, refreshing its recency.
    pub fn get(&mut self, key: &DocKey) -> Option<&V> {
        let entry = self.entries.get_mut(key)?;
        entry.last_access = Instant::now();
        Some(&entry.value)
    }

    /// Whether a key is cached. Does not refresh recency.
    pub fn contains(&self, key: &DocKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert an entry, evicting the least recently used one if full.
    ///
    /// Returns the evicted `(key, value)`, which the caller must write back
    /// before letting it go. Replacing an existing key never evicts.
    pub fn insert(&mut self, key: DocKey, value: V) -> Option<(DocKey, V)> {
        let evicted = if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };

        self.entries.insert(
            key,
            CacheEntry {
                value,
                last_access: Instant::now(),
            },
        );
        evicted
    }

    /// Re-insert an entry whose write-back failed, bypassing the capacity
    /// check so nothing else gets displaced by the retry.
    pub fn restore(&mut self, key: DocKey, value: V) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                last_access: Instant::now(),
            },
        );
    }

    /// Keys idle longer than `ttl`, oldest first. Does not refresh recency.
    ///
    /// The list is a snapshot; entries may be touched (or removed) between
    /// listing and removal, so pair this with
    /// [`DocumentCache::remove_if_idle`], which re-checks.
    pub fn idle_keys(&self, ttl: Duration) -> Vec<DocKey> {
        let now = Instant::now();
        let mut idle: Vec<(&DocKey, Instant)> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_access) > ttl)
            .map(|(k, e)| (k, e.last_access))
            .collect();
        idle.sort_by_key(|(_, at)| *at);
        idle.into_iter().map(|(k, _)| k.clone()).collect()
    }

    /// Remove `key` only if it is still idle past `ttl`.
    ///
    /// Returns `None` when the entry is gone or has been touched since it
    /// was listed; the caller moves on to the next candidate.
    pub fn remove_if_idle(&mut self, key: &DocKey, ttl: Duration) -> Option<V> {
        let entry = self.entries.get(key)?;
        if entry.last_access.elapsed() <= ttl {
            return None;
        }
        self.entries.remove(key).map(|e| e.value)
    }

    /// Drain every entry, for shutdown write-back.
    pub fn drain(&mut self) -> Vec<(DocKey, V)> {
        self.entries
            .drain()
            .map(|(k, e)| (k, e.value))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evict_oldest(&mut self) -> Option<(DocKey, V)> {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_access)
            .map(|(k, _)| k.clone())?;
        let entry = self.entries.remove(&oldest)?;
        Some((oldest, entry.value))
    }
}
