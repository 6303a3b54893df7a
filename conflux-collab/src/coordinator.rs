//! The sync coordinator: wires cache, router, presence, undo, and storage
//! together per inbound message.
//!
//! ```text
//! ClientMessage ──► SyncCoordinator::handle_message
//!                        │
//!         ┌──────────────┼───────────────┐
//!         ▼              ▼               ▼
//!   DocumentCache   SubscriptionRouter  PresenceManager / UndoManager
//!         │              │
//!         ▼              ▼
//!   DurableStore    ConnectionRegistry (best-effort fan-out)
//! ```
//!
//! All state is owned here and injected at construction — no ambient
//! singletons, so tests build isolated coordinators freely.
//!
//! Scheduling: each message is handled to completion. Documents are
//! independent, so each lives behind its own `Mutex` inside the cache. The
//! cache's own lock is held for map operations and, when an entry leaves
//! the cache, for that single entry's write-back: a key may only be absent
//! from the cache once its latest state is durable, or a concurrent lookup
//! could reload a stale predecessor from storage. The lock is never held
//! across more than one write-back. Persistence aside, broadcasts may run
//! before a save completes because the in-memory `version` has already
//! advanced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use conflux_crdt::{CrdtDocument, Operation, PathSegment};
use serde_json::Value;

use crate::cache::{DocKey, DocumentCache};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::presence::PresenceManager;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::router::{ConnId, ConnectionRegistry, SubscriptionRouter};
use crate::storage::{DurableStore, PersistedDocument, StoreError};
use crate::undo::UndoManager;

/// Tunables for the coordinator. All four resource ceilings from the
/// design live here: cache size/TTL, undo depth, presence timeout.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Replica id stamped on server-side operations.
    pub replica_id: String,
    /// Max live documents in the cache.
    pub cache_capacity: usize,
    /// Idle time before a cached document is swept (with write-back).
    pub cache_ttl: Duration,
    /// Heartbeat age after which an actor is no longer present.
    pub presence_timeout: Duration,
    /// Max undo history entries per (connection, document).
    pub undo_depth: usize,
    /// Edits to the same path inside this window coalesce into one undo step.
    pub undo_coalesce_window: Duration,
    /// Idle time before an unused undo history is dropped.
    pub undo_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            replica_id: format!("server-{}", uuid::Uuid::new_v4()),
            cache_capacity: 1024,
            cache_ttl: Duration::from_secs(300),
            presence_timeout: Duration::from_secs(30),
            undo_depth: 100,
            undo_coalesce_window: Duration::from_millis(1000),
            undo_ttl: Duration::from_secs(600),
        }
    }
}

type SharedDoc = Arc<Mutex<CrdtDocument>>;

/// Per-process sync engine state.
pub struct SyncCoordinator {
    config: SyncConfig,
    store: Arc<dyn DurableStore>,
    registry: Arc<ConnectionRegistry>,
    router: SubscriptionRouter,
    cache: Mutex<DocumentCache<SharedDoc>>,
    presence: Mutex<HashMap<DocKey, PresenceManager>>,
    /// Which (document, actor) pairs each connection announced, for
    /// presence cleanup on disconnect.
    presence_by_conn: Mutex<HashMap<ConnId, Vec<(DocKey, String)>>>,
    undo: Mutex<HashMap<(ConnId, DocKey), UndoManager>>,
    metrics: Metrics,
}

impl SyncCoordinator {
    pub fn new(config: SyncConfig, store: Arc<dyn DurableStore>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let cache_capacity = config.cache_capacity;
        Self {
            config,
            store,
            router: SubscriptionRouter::new(registry.clone()),
            registry,
            cache: Mutex::new(DocumentCache::new(cache_capacity)),
            presence: Mutex::new(HashMap::new()),
            presence_by_conn: Mutex::new(HashMap::new()),
            undo: Mutex::new(HashMap::new()),
            metrics: Metrics::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Register a new connection and its outbound sender.
    pub async fn connect(&self, conn: ConnId, sender: mpsc::Sender<Arc<str>>) {
        self.registry.register(conn, sender).await;
        Metrics::incr(&self.metrics.connections_total);
        self.metrics
            .observe_connections(self.registry.count().await as u64);
        log::debug!("Connection {conn} registered");
    }

    /// Tear down everything a connection owned: subscriptions, presence,
    /// undo histories. Already-broadcast operations are unaffected.
    pub async fn disconnect(&self, conn: ConnId) {
        self.registry.unregister(conn).await;
        self.router.disconnect(conn).await;

        let departed: Vec<(DocKey, String)> = {
            let mut by_conn = self.presence_by_conn.lock().await;
            match by_conn.remove(&conn) {
                // Another connection may still be heartbeating the same
                // actor on the same document (a second tab); the actor
                // departs only with the last of them.
                Some(pairs) => pairs
                    .into_iter()
                    .filter(|(key, actor)| {
                        !by_conn
                            .values()
                            .any(|rest| rest.iter().any(|(k, a)| k == key && a == actor))
                    })
                    .collect(),
                None => Vec::new(),
            }
        };
        if !departed.is_empty() {
            let mut presence = self.presence.lock().await;
            for (key, actor) in departed {
                let left = match presence.get_mut(&key) {
                    Some(mgr) => mgr.leave(&actor),
                    None => false,
                };
                if left {
                    Metrics::incr(&self.metrics.presence_leaves);
                    drop(presence);
                    self.broadcast_presence_left(&key, &actor, Some(conn)).await;
                    presence = self.presence.lock().await;
                }
            }
            presence.retain(|_, mgr| !mgr.is_empty());
        }

        self.undo.lock().await.retain(|(c, _), _| *c != conn);
        log::debug!("Connection {conn} cleaned up");
    }

    /// Handle one decoded message, returning direct replies for the
    /// originating connection. Broadcasts to other subscribers happen as a
    /// side effect.
    pub async fn handle_message(&self, conn: ConnId, msg: ClientMessage) -> Vec<ServerMessage> {
        match msg {
            ClientMessage::Subscribe { collection } => {
                self.router.subscribe(conn, &collection).await;
                vec![ServerMessage::Subscribed {
                    collection,
                    doc_id: None,
                }]
            }

            ClientMessage::Unsubscribe { collection } => {
                self.router.unsubscribe_collection(conn, &collection).await;
                Vec::new()
            }

            ClientMessage::SubscribeDoc { collection, doc_id } => {
                self.router.subscribe_doc(conn, &collection, &doc_id).await;
                let doc = self.resolve_document(&collection, &doc_id).await;
                let (data, version) = {
                    let doc = doc.lock().await;
                    (doc.to_object(), doc.version())
                };
                vec![
                    ServerMessage::Subscribed {
                        collection: collection.clone(),
                        doc_id: Some(doc_id.clone()),
                    },
                    ServerMessage::CrdtState {
                        collection,
                        doc_id,
                        data,
                        version,
                    },
                ]
            }

            ClientMessage::CrdtGet { collection, doc_id } => {
                let doc = self.resolve_document(&collection, &doc_id).await;
                let (data, version) = {
                    let doc = doc.lock().await;
                    (doc.to_object(), doc.version())
                };
                vec![ServerMessage::CrdtState {
                    collection,
                    doc_id,
                    data,
                    version,
                }]
            }

            ClientMessage::CrdtSet {
                collection,
                doc_id,
                path,
                value,
            } => self.handle_set(conn, collection, doc_id, path, value).await,

            ClientMessage::CrdtOps {
                collection,
                doc_id,
                operations,
            } => self.handle_ops(conn, collection, doc_id, operations).await,

            ClientMessage::Undo { collection, doc_id } => {
                self.handle_undo_redo(conn, collection, doc_id, true).await
            }

            ClientMessage::Redo { collection, doc_id } => {
                self.handle_undo_redo(conn, collection, doc_id, false).await
            }

            ClientMessage::Presence {
                collection,
                doc_id,
                node_id,
                presence,
            } => {
                self.handle_presence(conn, collection, doc_id, node_id, presence)
                    .await
            }

            ClientMessage::Ping { time } => vec![ServerMessage::Pong { time }],
        }
    }

    async fn handle_set(
        &self,
        conn: ConnId,
        collection: String,
        doc_id: String,
        path: Vec<PathSegment>,
        value: Value,
    ) -> Vec<ServerMessage> {
        let key = (collection.clone(), doc_id.clone());
        let doc = self.resolve_document(&collection, &doc_id).await;

        let (op, version, persisted) = {
            let mut doc = doc.lock().await;
            let previous = doc.get(&path).unwrap_or(Value::Null);
            let op = doc.set(path, value);
            Metrics::incr(&self.metrics.ops_applied);

            // Capture for undo before anything can fail.
            let mut undo = self.undo.lock().await;
            let mgr = undo.entry((conn, key.clone())).or_insert_with(|| {
                UndoManager::new(self.config.undo_depth, self.config.undo_coalesce_window)
            });
            mgr.capture(&op, previous);
            Metrics::incr(&self.metrics.undo_captures);
            drop(undo);

            (op, doc.version(), self.snapshot_for_store(&doc))
        };

        // Broadcast before persistence: the in-memory version has advanced.
        self.broadcast_sync(&key, std::slice::from_ref(&op), version, Some(conn))
            .await;

        match self.store.save(&collection, &doc_id, &persisted) {
            Ok(()) => vec![ServerMessage::CrdtSetOk {
                collection,
                doc_id,
                operation: op,
                version,
            }],
            Err(e) => {
                Metrics::incr(&self.metrics.writeback_failures);
                log::error!("Write-back failed for {collection}/{doc_id}: {e}");
                vec![ServerMessage::error(format!(
                    "crdt_set failed to persist {collection}/{doc_id}"
                ))]
            }
        }
    }

    async fn handle_ops(
        &self,
        conn: ConnId,
        collection: String,
        doc_id: String,
        operations: Vec<Operation>,
    ) -> Vec<ServerMessage> {
        let key = (collection.clone(), doc_id.clone());
        let doc = self.resolve_document(&collection, &doc_id).await;

        let total = operations.len();
        let (applied_ops, version, persisted, outcome) = {
            let mut doc = doc.lock().await;
            let mut seen = doc.clock().clone();
            let outcome = doc.apply_remote_batch(&operations);
            // Forward only the operations that were actually new, mirroring
            // the clock check apply_remote_batch runs.
            let applied_ops: Vec<Operation> = operations
                .into_iter()
                .filter(|op| {
                    if op.counter <= seen.get(&op.replica_id) {
                        return false;
                    }
                    seen.observe(&op.replica_id, op.counter);
                    true
                })
                .collect();
            (
                applied_ops,
                doc.version(),
                self.snapshot_for_store(&doc),
                outcome,
            )
        };

        Metrics::add(&self.metrics.ops_applied, outcome.applied as u64);
        Metrics::add(&self.metrics.lww_conflicts, outcome.conflicts as u64);
        Metrics::add(
            &self.metrics.ops_duplicate,
            (total - outcome.applied) as u64,
        );

        if !applied_ops.is_empty() {
            self.broadcast_sync(&key, &applied_ops, version, Some(conn))
                .await;
        }

        match self.store.save(&collection, &doc_id, &persisted) {
            Ok(()) => vec![ServerMessage::CrdtOpsOk {
                collection,
                doc_id,
                applied: outcome.applied,
                version,
            }],
            Err(e) => {
                Metrics::incr(&self.metrics.writeback_failures);
                log::error!("Write-back failed for {collection}/{doc_id}: {e}");
                vec![ServerMessage::error(format!(
                    "crdt_ops failed to persist {collection}/{doc_id}"
                ))]
            }
        }
    }

    async fn handle_undo_redo(
        &self,
        conn: ConnId,
        collection: String,
        doc_id: String,
        is_undo: bool,
    ) -> Vec<ServerMessage> {
        let key = (collection.clone(), doc_id.clone());

        let step = {
            let mut undo = self.undo.lock().await;
            match undo.get_mut(&(conn, key.clone())) {
                Some(mgr) => {
                    if is_undo {
                        mgr.undo()
                    } else {
                        mgr.redo()
                    }
                }
                None => None,
            }
        };

        let ack = |performed: bool, version: u64| {
            if is_undo {
                ServerMessage::UndoOk {
                    collection: collection.clone(),
                    doc_id: doc_id.clone(),
                    performed,
                    version,
                }
            } else {
                ServerMessage::RedoOk {
                    collection: collection.clone(),
                    doc_id: doc_id.clone(),
                    performed,
                    version,
                }
            }
        };

        let Some(step) = step else {
            // Empty history: not an error, just nothing to do.
            let doc = self.resolve_document(&collection, &doc_id).await;
            let version = doc.lock().await.version();
            return vec![ack(false, version)];
        };

        if is_undo {
            Metrics::incr(&self.metrics.undos);
        } else {
            Metrics::incr(&self.metrics.redos);
        }

        // The inverse is an ordinary forward edit, subject to LWW like
        // anything else. It is not captured into its own undo history.
        let doc = self.resolve_document(&collection, &doc_id).await;
        let (op, version, persisted) = {
            let mut doc = doc.lock().await;
            let op = doc.set(step.path, step.value);
            Metrics::incr(&self.metrics.ops_applied);
            (op, doc.version(), self.snapshot_for_store(&doc))
        };

        self.broadcast_sync(&key, std::slice::from_ref(&op), version, Some(conn))
            .await;

        match self.store.save(&collection, &doc_id, &persisted) {
            Ok(()) => vec![ack(true, version)],
            Err(e) => {
                Metrics::incr(&self.metrics.writeback_failures);
                log::error!("Write-back failed for {collection}/{doc_id}: {e}");
                vec![ServerMessage::error(format!(
                    "{} failed to persist {collection}/{doc_id}",
                    if is_undo { "undo" } else { "redo" }
                ))]
            }
        }
    }

    async fn handle_presence(
        &self,
        conn: ConnId,
        collection: String,
        doc_id: String,
        node_id: String,
        meta: Value,
    ) -> Vec<ServerMessage> {
        let key = (collection.clone(), doc_id.clone());

        let joined = {
            let mut presence = self.presence.lock().await;
            let mgr = presence
                .entry(key.clone())
                .or_insert_with(|| PresenceManager::new(self.config.presence_timeout));
            mgr.heartbeat(&node_id, meta.clone())
        };
        if joined {
            Metrics::incr(&self.metrics.presence_joins);
        }
        {
            // Record every heartbeating connection, not just the joining
            // one, so disconnect knows when the last claim on this actor
            // is gone.
            let mut by_conn = self.presence_by_conn.lock().await;
            let pairs = by_conn.entry(conn).or_default();
            if !pairs.iter().any(|(k, a)| k == &key && a == &node_id) {
                pairs.push((key.clone(), node_id.clone()));
            }
        }

        let event = ServerMessage::PresenceChanged {
            collection,
            doc_id,
            node_id,
            presence: meta,
        };
        let outcome = self
            .router
            .broadcast_to_doc(&key.0, &key.1, Some(conn), &event)
            .await;
        Metrics::incr(&self.metrics.broadcasts);
        Metrics::add(&self.metrics.messages_delivered, outcome.delivered as u64);
        Metrics::add(&self.metrics.sends_skipped, outcome.skipped as u64);

        Vec::new()
    }

    /// Periodic maintenance: cache TTL write-back, presence expiry, idle
    /// undo-history expiry. Call from a timer task.
    pub async fn sweep(&self) {
        // Cache: write back idle documents one at a time, reacquiring the
        // cache lock per document. Lookups of unrelated documents wait on
        // at most one write-back, and an entry only leaves the cache once
        // its state is durable.
        let ttl = self.config.cache_ttl;
        let mut evicted = 0usize;
        let stale = self.cache.lock().await.idle_keys(ttl);
        for key in stale {
            let mut cache = self.cache.lock().await;
            let Some(doc) = cache.remove_if_idle(&key, ttl) else {
                continue; // touched since we listed it
            };
            // A document currently being mutated is skipped this round.
            let Ok(guard) = doc.try_lock() else {
                cache.restore(key, doc);
                continue;
            };
            match self.persist(&key.0, &key.1, &guard) {
                Ok(()) => evicted += 1,
                Err(e) => {
                    Metrics::incr(&self.metrics.writeback_failures);
                    log::error!("Sweep write-back failed for {}/{}: {e}", key.0, key.1);
                    drop(guard);
                    cache.restore(key, doc);
                }
            }
        }
        Metrics::add(&self.metrics.cache_evictions, evicted as u64);

        // Presence: expire stale actors, broadcasting departures.
        let expired: Vec<(DocKey, String)> = {
            let mut presence = self.presence.lock().await;
            let mut expired = Vec::new();
            for (key, mgr) in presence.iter_mut() {
                for actor in mgr.cleanup() {
                    expired.push((key.clone(), actor));
                }
            }
            presence.retain(|_, mgr| !mgr.is_empty());
            expired
        };
        for (key, actor) in expired {
            Metrics::incr(&self.metrics.presence_leaves);
            self.broadcast_presence_left(&key, &actor, None).await;
        }

        // Undo: drop histories nobody has touched in a while.
        {
            let mut undo = self.undo.lock().await;
            let ttl = self.config.undo_ttl;
            undo.retain(|_, mgr| mgr.idle_for() < ttl);
        }

        if evicted > 0 {
            log::debug!("Sweep evicted {evicted} documents");
        }
    }

    /// Write every cached document back to storage. For shutdown.
    pub async fn flush_all(&self) -> usize {
        let entries = self.cache.lock().await.drain();
        let mut flushed = 0;
        for (key, doc) in entries {
            let result = {
                let guard = doc.lock().await;
                self.persist(&key.0, &key.1, &guard)
            };
            match result {
                Ok(()) => flushed += 1,
                Err(e) => {
                    Metrics::incr(&self.metrics.writeback_failures);
                    log::error!("Shutdown flush failed for {}/{}: {e}", key.0, key.1);
                    // Put it back so a retried flush can still find it.
                    self.cache.lock().await.restore(key, doc);
                }
            }
        }
        flushed
    }

    /// Metrics snapshot with gauges filled in.
    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        let mut snap = self.metrics.snapshot();
        snap.connections_open = self.registry.count().await as u64;
        snap.cached_documents = self.cache.lock().await.len() as u64;
        snap.presence_tables = self.presence.lock().await.len() as u64;
        snap.undo_tables = self.undo.lock().await.len() as u64;
        snap
    }

    /// Get the live document for a key: cache hit, else load from storage,
    /// else start empty. Handles overflow eviction write-back.
    async fn resolve_document(&self, collection: &str, doc_id: &str) -> SharedDoc {
        let key = (collection.to_string(), doc_id.to_string());

        {
            let mut cache = self.cache.lock().await;
            if let Some(doc) = cache.get(&key) {
                Metrics::incr(&self.metrics.cache_hits);
                return doc.clone();
            }
        }
        Metrics::incr(&self.metrics.cache_misses);

        let doc = match self.store.load(collection, doc_id) {
            Ok(Some(persisted)) => {
                CrdtDocument::from_state(&self.config.replica_id, doc_id, persisted.crdt_state)
            }
            Ok(None) => CrdtDocument::new(&self.config.replica_id, doc_id),
            Err(StoreError::Corrupt(e)) => {
                // Recoverable: corrupt persisted state means a fresh start,
                // never a dead document.
                log::warn!("Corrupt persisted state for {collection}/{doc_id}, starting fresh: {e}");
                CrdtDocument::new(&self.config.replica_id, doc_id)
            }
            Err(e) => {
                log::error!("Storage load failed for {collection}/{doc_id}, starting fresh: {e}");
                CrdtDocument::new(&self.config.replica_id, doc_id)
            }
        };
        let doc: SharedDoc = Arc::new(Mutex::new(doc));

        let mut cache = self.cache.lock().await;
        // Another task may have resolved the same key while we loaded.
        if let Some(existing) = cache.get(&key) {
            Metrics::incr(&self.metrics.cache_hits);
            return existing.clone();
        }

        // Write the displaced document back before releasing the cache
        // lock: once the lock drops, a lookup for the displaced key goes
        // to storage and must find this state there, not a predecessor.
        if let Some((evicted_key, evicted_doc)) = cache.insert(key, doc.clone()) {
            Metrics::incr(&self.metrics.cache_evictions);
            let droppable = match evicted_doc.try_lock() {
                Ok(guard) => match self.persist(&evicted_key.0, &evicted_key.1, &guard) {
                    Ok(()) => true,
                    Err(e) => {
                        Metrics::incr(&self.metrics.writeback_failures);
                        log::error!(
                            "Eviction write-back failed for {}/{}, keeping in cache: {e}",
                            evicted_key.0,
                            evicted_key.1
                        );
                        false
                    }
                },
                // Mid-mutation; keep it, the sweep retries later.
                Err(_) => false,
            };
            if !droppable {
                cache.restore(evicted_key, evicted_doc);
            }
        }

        doc
    }

    fn snapshot_for_store(&self, doc: &CrdtDocument) -> PersistedDocument {
        PersistedDocument {
            data: doc.to_object(),
            crdt_state: doc.state(),
            version: doc.version(),
        }
    }

    fn persist(&self, collection: &str, doc_id: &str, doc: &CrdtDocument) -> Result<(), StoreError> {
        self.store
            .save(collection, doc_id, &self.snapshot_for_store(doc))
    }

    async fn broadcast_sync(
        &self,
        key: &DocKey,
        operations: &[Operation],
        version: u64,
        exclude: Option<ConnId>,
    ) {
        let event = ServerMessage::CrdtSync {
            collection: key.0.clone(),
            doc_id: key.1.clone(),
            operations: operations.to_vec(),
            version,
        };
        let outcome = self
            .router
            .broadcast_to_doc(&key.0, &key.1, exclude, &event)
            .await;
        Metrics::incr(&self.metrics.broadcasts);
        Metrics::add(&self.metrics.messages_delivered, outcome.delivered as u64);
        Metrics::add(&self.metrics.sends_skipped, outcome.skipped as u64);
    }

    async fn broadcast_presence_left(&self, key: &DocKey, actor: &str, exclude: Option<ConnId>) {
        let event = ServerMessage::PresenceLeft {
            collection: key.0.clone(),
            doc_id: key.1.clone(),
            node_id: actor.to_string(),
        };
        let outcome = self
            .router
            .broadcast_to_doc(&key.0, &key.1, exclude, &event)
            .await;
        Metrics::incr(&self.metrics.broadcasts);
        Metrics::add(&self.metrics.messages_delivered, outcome.delivered as u64);
        Metrics::add(&self.metrics.sends_skipped, outcome.skipped as u64);
    }
}
