//! The replicated per-document state machine.
//!
//! A [`CrdtDocument`] owns a nested LWW structure, a vector clock recording
//! every operation it has absorbed, and a monotone `version` bumped on each
//! applied operation. Local edits go through [`CrdtDocument::set`], remote
//! batches through [`CrdtDocument::apply_remote_batch`]; both funnel into the
//! same LWW write path, so convergence is a property of the data structure
//! rather than of delivery order.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::clock::VectorClock;
use crate::lww::{LwwMap, PathSegment};

/// Milliseconds since the Unix epoch. LWW timestamps use wall-clock time;
/// the replica-id tie-break makes equal stamps deterministic anyway.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The atomic unit of change. Immutable once created; identity is
/// `(replica_id, counter)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub replica_id: String,
    pub counter: u64,
    pub path: Vec<PathSegment>,
    pub value: Value,
    pub timestamp: u64,
}

/// Outcome of applying a remote batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Operations actually applied (duplicates skipped).
    pub applied: usize,
    /// Applied operations whose write lost the LWW tie-break.
    pub conflicts: usize,
}

/// Serialized full state: everything needed to reconstruct an equivalent
/// document. This is what gets persisted and exchanged on cold start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState {
    pub root: LwwMap,
    pub clock: VectorClock,
    pub version: u64,
}

/// A replicated JSON-shaped document.
#[derive(Debug, Clone)]
pub struct CrdtDocument {
    replica_id: String,
    doc_id: String,
    root: LwwMap,
    clock: VectorClock,
    version: u64,
}

impl CrdtDocument {
    /// Create an empty document owned by `replica_id`.
    pub fn new(replica_id: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            replica_id: replica_id.into(),
            doc_id: doc_id.into(),
            root: LwwMap::new(),
            clock: VectorClock::new(),
            version: 0,
        }
    }

    /// Reconstruct a document from persisted state.
    pub fn from_state(
        replica_id: impl Into<String>,
        doc_id: impl Into<String>,
        state: DocumentState,
    ) -> Self {
        Self {
            replica_id: replica_id.into(),
            doc_id: doc_id.into(),
            root: state.root,
            clock: state.clock,
            version: state.version,
        }
    }

    /// Apply a local edit and return the operation to broadcast.
    ///
    /// Mutates in-memory state synchronously: stamps the op with the next
    /// local counter and the current wall clock, writes it through the LWW
    /// structure, and bumps `version`. The write itself can still lose the
    /// tie-break against an already-absorbed remote op with a later
    /// timestamp; the returned operation is broadcast regardless so other
    /// replicas run the same resolution.
    pub fn set(&mut self, path: Vec<PathSegment>, value: Value) -> Operation {
        let counter = self.clock.increment(&self.replica_id);
        let op = Operation {
            replica_id: self.replica_id.clone(),
            counter,
            path,
            value,
            timestamp: unix_millis(),
        };
        self.root
            .apply(&op.path, op.value.clone(), op.timestamp, &op.replica_id);
        self.version += 1;
        op
    }

    /// Apply a batch of remote operations, in any order.
    ///
    /// An operation already reflected in the clock (its counter ≤ the entry
    /// for its replica) is skipped — this is what makes re-delivery a no-op.
    /// Everything else goes through the LWW write path and advances both the
    /// clock and `version`.
    pub fn apply_remote_batch(&mut self, operations: &[Operation]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for op in operations {
            if op.counter <= self.clock.get(&op.replica_id) {
                continue;
            }
            let landed = self
                .root
                .apply(&op.path, op.value.clone(), op.timestamp, &op.replica_id);
            self.clock.observe(&op.replica_id, op.counter);
            self.version += 1;
            outcome.applied += 1;
            if !landed {
                outcome.conflicts += 1;
            }
        }
        outcome
    }

    /// Pure point read. `None` if the path does not resolve.
    pub fn get(&self, path: &[PathSegment]) -> Option<Value> {
        self.root.get(path)
    }

    /// Plain-value snapshot with no CRDT metadata.
    pub fn to_object(&self) -> Value {
        self.root.to_value()
    }

    /// Full-state snapshot for persistence. Round-trips losslessly through
    /// [`CrdtDocument::from_state`].
    pub fn state(&self) -> DocumentState {
        DocumentState {
            root: self.root.clone(),
            clock: self.clock.clone(),
            version: self.version,
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }
}
