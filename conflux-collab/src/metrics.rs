//! Monotonic counters for the sync engine, lock-free on the hot path.
//!
//! Counters live in atomics so broadcast and apply paths never take a lock
//! just to count. Instantaneous gauges (open connections, table sizes) are
//! filled in by the coordinator when it builds a [`MetricsSnapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counter block. One instance per coordinator.
#[derive(Debug, Default)]
pub struct Metrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_evictions: AtomicU64,
    pub writeback_failures: AtomicU64,

    pub ops_applied: AtomicU64,
    pub ops_duplicate: AtomicU64,
    pub lww_conflicts: AtomicU64,

    pub presence_joins: AtomicU64,
    pub presence_leaves: AtomicU64,

    pub undo_captures: AtomicU64,
    pub undos: AtomicU64,
    pub redos: AtomicU64,

    pub broadcasts: AtomicU64,
    pub messages_delivered: AtomicU64,
    pub sends_skipped: AtomicU64,

    pub connections_total: AtomicU64,
    pub connections_peak: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Raise the peak-connections watermark if `current` exceeds it.
    pub fn observe_connections(&self, current: u64) {
        self.connections_peak.fetch_max(current, Ordering::Relaxed);
    }
}

/// Read-only snapshot: monotonic counters plus instantaneous gauges.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub writeback_failures: u64,

    pub ops_applied: u64,
    pub ops_duplicate: u64,
    pub lww_conflicts: u64,

    pub presence_joins: u64,
    pub presence_leaves: u64,

    pub undo_captures: u64,
    pub undos: u64,
    pub redos: u64,

    pub broadcasts: u64,
    pub messages_delivered: u64,
    pub sends_skipped: u64,

    pub connections_total: u64,
    pub connections_peak: u64,

    // Gauges
    pub connections_open: u64,
    pub cached_documents: u64,
    pub presence_tables: u64,
    pub undo_tables: u64,
}

impl Metrics {
    /// Copy all counters into a snapshot; gauges start at zero and are
    /// filled in by the owner.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            writeback_failures: self.writeback_failures.load(Ordering::Relaxed),
            ops_applied: self.ops_applied.load(Ordering::Relaxed),
            ops_duplicate: self.ops_duplicate.load(Ordering::Relaxed),
            lww_conflicts: self.lww_conflicts.load(Ordering::Relaxed),
            presence_joins: self.presence_joins.load(Ordering::Relaxed),
            presence_leaves: self.presence_leaves.load(Ordering::Relaxed),
            undo_captures: self.undo_captures.load(Ordering::Relaxed),
            undos: self.undos.load(Ordering::Relaxed),
            redos: self.redos.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            sends_skipped: self.sends_skipped.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_peak: self.connections_peak.load(Ordering::Relaxed),
            connections_open: 0,
            cached_documents: 0,
            presence_tables: 0,
            undo_tables: 0,
        }
    }
}
