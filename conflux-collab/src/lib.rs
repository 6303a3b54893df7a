//! # conflux-collab — Replicated document sync server and client
//!
//! WebSocket-based multi-replica document synchronization over the
//! conflict-free data model in `conflux-crdt`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer       │
//! │ (per user)  │    JSON protocol    │ (accept loop)    │
//! └─────────────┘                     └────────┬─────────┘
//!                                              │
//!                                     ┌────────┴─────────┐
//!                                     │ SyncCoordinator  │
//!                                     │  cache / router  │
//!                                     │  presence / undo │
//!                                     └────────┬─────────┘
//!                                              │
//!                                     ┌────────┴─────────┐
//!                                     │ DurableStore     │
//!                                     │ (RocksDB / mem)  │
//!                                     └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (tagged messages over text frames)
//! - [`coordinator`] — per-message orchestration of all engine state
//! - [`cache`] — bounded LRU + TTL document cache with write-back
//! - [`router`] — subscription tables and best-effort fan-out
//! - [`presence`] — ephemeral heartbeat-based presence
//! - [`undo`] — per-connection bounded undo/redo history
//! - [`storage`] — durable storage (RocksDB column families, in-memory)
//! - [`server`] — WebSocket accept loop and connection tasks
//! - [`client`] — WebSocket client with offline queue
//! - [`metrics`] — atomic counters and snapshots

pub mod cache;
pub mod client;
pub mod coordinator;
pub mod metrics;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod server;
pub mod storage;
pub mod undo;

// Re-exports for convenience
pub use cache::{DocKey, DocumentCache};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use coordinator::{SyncConfig, SyncCoordinator};
pub use metrics::{Metrics, MetricsSnapshot};
pub use presence::PresenceManager;
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use router::{BroadcastOutcome, ConnId, ConnectionRegistry, SendOutcome, SubscriptionRouter};
pub use server::{ServerConfig, SyncServer};
pub use storage::{
    DurableStore, MemoryStore, PersistedDocument, RocksStore, StoreConfig, StoreError,
};
pub use undo::{UndoManager, UndoStep};
