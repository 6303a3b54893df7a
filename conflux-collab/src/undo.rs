//! Per-connection, per-document undo/redo history.
//!
//! Each history entry records an operation and the value the path held
//! before it (the pre-image). Undo never rolls back shared state: it emits
//! the pre-image as a *new forward edit*, which goes through the ordinary
//! LWW write path — so a concurrent remote edit with a later timestamp can
//! still win over the undo, which is the correct behavior for a convergent
//! system.
//!
//! Rapid edits to the same path inside the coalescing window collapse into
//! one history entry, keeping one semantic undo-step per burst rather than
//! one per keystroke. History depth is capped; the oldest entries drop
//! first (dropping history is fine — it is purely a local convenience).

use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use conflux_crdt::{same_path, Operation, PathSegment};

/// An inverse edit to apply as a new local operation.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoStep {
    pub path: Vec<PathSegment>,
    pub value: Value,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    path: Vec<PathSegment>,
    /// Value the operation wrote (what redo re-applies).
    value: Value,
    /// Value the path held before (what undo restores; Null if absent).
    previous: Value,
    captured_at: Instant,
}

/// Bounded, time-coalesced history for one (connection, document) pair.
pub struct UndoManager {
    history: VecDeque<HistoryEntry>,
    redo: Vec<HistoryEntry>,
    max_depth: usize,
    coalesce_window: Duration,
    last_activity: Instant,
}

impl UndoManager {
    pub fn new(max_depth: usize, coalesce_window: Duration) -> Self {
        Self {
            history: VecDeque::new(),
            redo: Vec::new(),
            max_depth: max_depth.max(1),
            coalesce_window,
            last_activity: Instant::now(),
        }
    }

    /// Record a local operation and its pre-image.
    ///
    /// Coalesces with the previous entry when it touched the same path
    /// within the coalescing window; the collapsed entry keeps the oldest
    /// pre-image and the newest value. Any capture invalidates the redo
    /// stack (standard branching-history rule).
    pub fn capture(&mut self, op: &Operation, previous: Value) {
        self.last_activity = Instant::now();
        self.redo.clear();

        if let Some(last) = self.history.back_mut() {
            if same_path(&last.path, &op.path)
                && last.captured_at.elapsed() < self.coalesce_window
            {
                last.value = op.value.clone();
                last.captured_at = Instant::now();
                return;
            }
        }

        if self.history.len() >= self.max_depth {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            path: op.path.clone(),
            value: op.value.clone(),
            previous,
            captured_at: Instant::now(),
        });
    }

    /// Pop the most recent entry, returning the inverse edit.
    /// `None` means nothing to undo — not an error.
    pub fn undo(&mut self) -> Option<UndoStep> {
        self.last_activity = Instant::now();
        let entry = self.history.pop_back()?;
        let step = UndoStep {
            path: entry.path.clone(),
            value: entry.previous.clone(),
        };
        self.redo.push(entry);
        Some(step)
    }

    /// Re-apply the most recently undone edit.
    pub fn redo(&mut self) -> Option<UndoStep> {
        self.last_activity = Instant::now();
        let entry = self.redo.pop()?;
        let step = UndoStep {
            path: entry.path.clone(),
            value: entry.value.clone(),
        };
        self.history.push_back(entry);
        Some(step)
    }

    /// How long since this history was touched (for idle expiry).
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn depth(&self) -> usize {
        self.history.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty() && self.redo.is_empty()
    }
}
