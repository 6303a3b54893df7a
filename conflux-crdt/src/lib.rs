//! # conflux-crdt — Replicated document model for Conflux
//!
//! The pure data-structure half of the sync engine: no I/O, no async, no
//! transport. Everything here is deterministic and order-independent so the
//! server layer can apply operations as they arrive.
//!
//! ```text
//! set(path, value) ──► Operation ──► broadcast
//!        │                              │
//!        ▼                              ▼
//! ┌──────────────┐   apply_remote   ┌──────────────┐
//! │ CrdtDocument │ ◄─────batch───── │ CrdtDocument │
//! │ (replica A)  │                  │ (replica B)  │
//! └──────┬───────┘                  └──────┬───────┘
//!        │  LwwMap + VectorClock          │
//!        └────────── converge ────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`clock`] — vector clocks and the causal partial order
//! - [`lww`] — nested last-writer-wins registers with deterministic tie-break
//! - [`document`] — the per-document state machine and its wire/persist forms

pub mod clock;
pub mod document;
pub mod lww;

pub use clock::{CausalOrder, VectorClock};
pub use document::{BatchOutcome, CrdtDocument, DocumentState, Operation, unix_millis};
pub use lww::{path, same_path, LwwEntry, LwwMap, PathSegment};
