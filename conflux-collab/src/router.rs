//! Subscription routing and best-effort fan-out.
//!
//! Two interest levels: whole collections and single documents. Each
//! connection also keeps reverse sets so disconnect cleanup is O(k) in the
//! connection's own subscriptions, never O(total subscribers).
//!
//! Delivery goes through the [`ConnectionRegistry`]: a bounded mpsc sender
//! per connection, written with `try_send`. A connection whose channel is
//! full or closed is skipped — not retried, not queued — so one slow
//! subscriber can never stall the broadcast to the rest.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Connection identity, assigned at accept time.
pub type ConnId = Uuid;

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Channel full — the subscriber is too slow, message dropped for it.
    NotWritable,
    /// No such connection (already disconnected).
    Gone,
}

/// Per-connection outbound senders.
///
/// Owns nothing about subscriptions; it is purely "can I hand bytes to this
/// connection right now".
pub struct ConnectionRegistry {
    senders: RwLock<HashMap<ConnId, mpsc::Sender<Arc<str>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, conn: ConnId, sender: mpsc::Sender<Arc<str>>) {
        self.senders.write().await.insert(conn, sender);
    }

    pub async fn unregister(&self, conn: ConnId) {
        self.senders.write().await.remove(&conn);
    }

    /// Best-effort, non-blocking send.
    pub async fn send(&self, conn: ConnId, payload: Arc<str>) -> SendOutcome {
        let senders = self.senders.read().await;
        match senders.get(&conn) {
            None => SendOutcome::Gone,
            Some(tx) => match tx.try_send(payload) {
                Ok(()) => SendOutcome::Delivered,
                Err(_) => SendOutcome::NotWritable,
            },
        }
    }

    pub async fn count(&self) -> usize {
        self.senders.read().await.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct ConnSubscriptions {
    collections: HashSet<String>,
    documents: HashSet<(String, String)>,
}

#[derive(Default)]
struct RouterTables {
    /// collection → subscribers
    collections: HashMap<String, HashSet<ConnId>>,
    /// (collection, doc_id) → subscribers
    documents: HashMap<(String, String), HashSet<ConnId>>,
    /// reverse index for O(k) disconnect
    by_conn: HashMap<ConnId, ConnSubscriptions>,
}

/// Delivery counts for one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub skipped: usize,
}

/// Maintains interest sets and fans out serialized events.
pub struct SubscriptionRouter {
    registry: Arc<ConnectionRegistry>,
    tables: RwLock<RouterTables>,
}

impl SubscriptionRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            tables: RwLock::new(RouterTables::default()),
        }
    }

    /// Idempotent collection-level subscribe.
    pub async fn subscribe(&self, conn: ConnId, collection: &str) {
        let mut tables = self.tables.write().await;
        tables
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(conn);
        tables
            .by_conn
            .entry(conn)
            .or_default()
            .collections
            .insert(collection.to_string());
    }

    pub async fn unsubscribe_collection(&self, conn: ConnId, collection: &str) {
        let mut tables = self.tables.write().await;
        if let Some(set) = tables.collections.get_mut(collection) {
            set.remove(&conn);
            if set.is_empty() {
                tables.collections.remove(collection);
            }
        }
        if let Some(subs) = tables.by_conn.get_mut(&conn) {
            subs.collections.remove(collection);
        }
    }

    /// Idempotent document-level subscribe.
    pub async fn subscribe_doc(&self, conn: ConnId, collection: &str, doc_id: &str) {
        let key = (collection.to_string(), doc_id.to_string());
        let mut tables = self.tables.write().await;
        tables.documents.entry(key.clone()).or_default().insert(conn);
        tables.by_conn.entry(conn).or_default().documents.insert(key);
    }

    pub async fn unsubscribe_doc(&self, conn: ConnId, collection: &str, doc_id: &str) {
        let key = (collection.to_string(), doc_id.to_string());
        let mut tables = self.tables.write().await;
        if let Some(set) = tables.documents.get_mut(&key) {
            set.remove(&conn);
            if set.is_empty() {
                tables.documents.remove(&key);
            }
        }
        if let Some(subs) = tables.by_conn.get_mut(&conn) {
            subs.documents.remove(&key);
        }
    }

    /// Remove the connection from every interest set it belongs to.
    pub async fn disconnect(&self, conn: ConnId) {
        let mut tables = self.tables.write().await;
        let Some(subs) = tables.by_conn.remove(&conn) else {
            return;
        };
        for collection in subs.collections {
            if let Some(set) = tables.collections.get_mut(&collection) {
                set.remove(&conn);
                if set.is_empty() {
                    tables.collections.remove(&collection);
                }
            }
        }
        for key in subs.documents {
            if let Some(set) = tables.documents.get_mut(&key) {
                set.remove(&conn);
                if set.is_empty() {
                    tables.documents.remove(&key);
                }
            }
        }
    }

    /// Fan a message out to a collection's subscribers, minus the originator.
    pub async fn broadcast(
        &self,
        collection: &str,
        exclude: Option<ConnId>,
        message: &ServerMessage,
    ) -> BroadcastOutcome {
        let targets: Vec<ConnId> = {
            let tables = self.tables.read().await;
            match tables.collections.get(collection) {
                Some(set) => set.iter().copied().collect(),
                None => return BroadcastOutcome::default(),
            }
        };
        self.deliver(targets, exclude, message).await
    }

    /// Fan a message out to a document's subscribers, falling back to the
    /// collection-level set when nobody subscribed to the document itself.
    /// The fallback lets coarse-grained subscribers observe per-document
    /// churn without a second subscription.
    pub async fn broadcast_to_doc(
        &self,
        collection: &str,
        doc_id: &str,
        exclude: Option<ConnId>,
        message: &ServerMessage,
    ) -> BroadcastOutcome {
        let targets: Vec<ConnId> = {
            let tables = self.tables.read().await;
            let key = (collection.to_string(), doc_id.to_string());
            match tables.documents.get(&key) {
                Some(set) if !set.is_empty() => set.iter().copied().collect(),
                _ => match tables.collections.get(collection) {
                    Some(set) => set.iter().copied().collect(),
                    None => return BroadcastOutcome::default(),
                },
            }
        };
        self.deliver(targets, exclude, message).await
    }

    async fn deliver(
        &self,
        targets: Vec<ConnId>,
        exclude: Option<ConnId>,
        message: &ServerMessage,
    ) -> BroadcastOutcome {
        let payload: Arc<str> = match message.encode() {
            Ok(text) => Arc::from(text.as_str()),
            Err(e) => {
                log::error!("Failed to encode broadcast payload: {e}");
                return BroadcastOutcome::default();
            }
        };

        let mut outcome = BroadcastOutcome::default();
        for conn in targets {
            if Some(conn) == exclude {
                continue;
            }
            match self.registry.send(conn, payload.clone()).await {
                SendOutcome::Delivered => outcome.delivered += 1,
                SendOutcome::NotWritable | SendOutcome::Gone => outcome.skipped += 1,
            }
        }
        outcome
    }

    /// Number of subscriptions held by a connection (for tests/metrics).
    pub async fn subscription_count(&self, conn: ConnId) -> usize {
        let tables = self.tables.read().await;
        tables
            .by_conn
            .get(&conn)
            .map(|s| s.collections.len() + s.documents.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(registry: &ConnectionRegistry, capacity: usize) -> (ConnId, mpsc::Receiver<Arc<str>>) {
        let conn = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(capacity);
        registry.register(conn, tx).await;
        (conn, rx)
    }

    fn ping_reply() -> ServerMessage {
        ServerMessage::Pong { time: 1 }
    }

    #[tokio::test]
    async fn test_broadcast_excludes_originator() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = SubscriptionRouter::new(registry.clone());

        let (a, mut rx_a) = connected(&registry, 8).await;
        let (b, mut rx_b) = connected(&registry, 8).await;
        router.subscribe(a, "notes").await;
        router.subscribe(b, "notes").await;

        let outcome = router.broadcast("notes", Some(a), &ping_reply()).await;
        assert_eq!(outcome.delivered, 1);

        assert!(rx_b.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_idempotent() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = SubscriptionRouter::new(registry.clone());

        let (a, mut rx) = connected(&registry, 8).await;
        router.subscribe(a, "notes").await;
        router.subscribe(a, "notes").await;

        let outcome = router.broadcast("notes", None, &ping_reply()).await;
        assert_eq!(outcome.delivered, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_doc_level_preferred_over_collection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = SubscriptionRouter::new(registry.clone());

        let (coll_sub, mut rx_coll) = connected(&registry, 8).await;
        let (doc_sub, mut rx_doc) = connected(&registry, 8).await;
        router.subscribe(coll_sub, "notes").await;
        router.subscribe_doc(doc_sub, "notes", "n1").await;

        let outcome = router.broadcast_to_doc("notes", "n1", None, &ping_reply()).await;
        assert_eq!(outcome.delivered, 1);
        assert!(rx_doc.try_recv().is_ok());
        assert!(rx_coll.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_doc_broadcast_falls_back_to_collection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = SubscriptionRouter::new(registry.clone());

        let (coll_sub, mut rx_coll) = connected(&registry, 8).await;
        router.subscribe(coll_sub, "notes").await;

        let outcome = router
            .broadcast_to_doc("notes", "unwatched", None, &ping_reply())
            .await;
        assert_eq!(outcome.delivered, 1);
        assert!(rx_coll.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_isolated() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = SubscriptionRouter::new(registry.clone());

        // Slow subscriber with a single-slot channel, pre-filled.
        let (slow, _rx_slow) = connected(&registry, 1).await;
        registry.send(slow, Arc::from("stuck")).await;

        let (fast, mut rx_fast) = connected(&registry, 8).await;
        router.subscribe(slow, "notes").await;
        router.subscribe(fast, "notes").await;

        let outcome = router.broadcast("notes", None, &ping_reply()).await;
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.skipped, 1);
        assert!(rx_fast.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_removes_all_subscriptions() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = SubscriptionRouter::new(registry.clone());

        let (a, _rx) = connected(&registry, 8).await;
        router.subscribe(a, "notes").await;
        router.subscribe(a, "tasks").await;
        router.subscribe_doc(a, "notes", "n1").await;
        assert_eq!(router.subscription_count(a).await, 3);

        router.disconnect(a).await;
        registry.unregister(a).await;
        assert_eq!(router.subscription_count(a).await, 0);

        let outcome = router.broadcast("notes", None, &ping_reply()).await;
        assert_eq!(outcome.delivered, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_collection_keeps_doc_subscription() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = SubscriptionRouter::new(registry.clone());

        let (a, mut rx) = connected(&registry, 8).await;
        router.subscribe(a, "notes").await;
        router.subscribe_doc(a, "notes", "n1").await;
        router.unsubscribe_collection(a, "notes").await;

        let outcome = router.broadcast_to_doc("notes", "n1", None, &ping_reply()).await;
        assert_eq!(outcome.delivered, 1);
        assert!(rx.try_recv().is_ok());

        let outcome = router.broadcast("notes", None, &ping_reply()).await;
        assert_eq!(outcome.delivered, 0);
    }

    #[tokio::test]
    async fn test_send_to_gone_connection() {
        let registry = ConnectionRegistry::new();
        let outcome = registry.send(Uuid::new_v4(), Arc::from("x")).await;
        assert_eq!(outcome, SendOutcome::Gone);
    }
}
