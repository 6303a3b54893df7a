//! WebSocket client for the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Subscriptions, edits, undo/redo, presence heartbeats
//! - Offline queue for edits made while disconnected
//!
//! Incoming server messages surface to the application as [`SyncEvent`]s on
//! a channel; the client never interprets document contents itself.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};

use conflux_crdt::{unix_millis, Operation, PathSegment};

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted to the application.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Subscription acknowledged
    Subscribed {
        collection: String,
        doc_id: Option<String>,
    },
    /// Full document state (reply to subscribe_doc / crdt_get)
    State {
        collection: String,
        doc_id: String,
        data: Value,
        version: u64,
    },
    /// Operations applied by another replica
    RemoteSync {
        collection: String,
        doc_id: String,
        operations: Vec<Operation>,
        version: u64,
    },
    /// Another actor's presence changed
    PresenceChanged {
        doc_id: String,
        node_id: String,
        presence: Value,
    },
    /// An actor left (explicitly or by timeout)
    PresenceLeft { doc_id: String, node_id: String },
    /// Server-reported error
    ServerError(String),
}

/// Edits made while disconnected, replayed in order on reconnect.
pub struct OfflineQueue {
    queue: VecDeque<QueuedMessage>,
    max_size: usize,
}

struct QueuedMessage {
    message: ClientMessage,
    #[allow(dead_code)]
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a message for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, message: ClientMessage) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedMessage {
            message,
            queued_at: Instant::now(),
        });
        true
    }

    /// Drain all queued messages in FIFO order.
    pub fn drain(&mut self) -> Vec<ClientMessage> {
        self.queue.drain(..).map(|q| q.message).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// The sync client.
pub struct SyncClient {
    /// Replica identity announced in presence heartbeats
    replica_id: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
    /// Ping cadence once connected
    heartbeat_interval: Duration,
}

impl SyncClient {
    pub fn new(replica_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            replica_id: replica_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            heartbeat_interval: Duration::from_secs(15),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and spawn the reader, writer, and heartbeat tasks.
    ///
    /// Any offline-queued edits are replayed in order before new traffic.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.server_url)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        let (ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx.clone());

        // Writer task: forward outgoing frames to the socket. When every
        // sender is gone (client dropped or disconnected) it closes the
        // socket so the server observes the departure promptly.
        let writer = Arc::new(Mutex::new(ws_writer));
        let w = writer.clone();
        tokio::spawn(async move {
            use futures_util::SinkExt;
            while let Some(text) = out_rx.recv().await {
                let mut sink = w.lock().await;
                if sink
                    .send(tokio_tungstenite::tungstenite::Message::Text(text.into()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let mut sink = w.lock().await;
            let _ = sink
                .send(tokio_tungstenite::tungstenite::Message::Close(None))
                .await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Replay queued edits before anything new goes out.
        {
            let mut queue = self.offline_queue.lock().await;
            let queued = queue.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued messages", queued.len());
                for message in queued {
                    if let Ok(encoded) = message.encode() {
                        let _ = out_tx.send(encoded).await;
                    }
                }
            }
        }

        // Heartbeat task: periodic pings keep presence and the socket
        // alive. Holds only a weak sender so it never keeps a dropped
        // client's channel open.
        let heartbeat_tx = out_tx.downgrade();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                let Some(tx) = heartbeat_tx.upgrade() else {
                    break;
                };
                let ping = ClientMessage::Ping {
                    time: unix_millis(),
                };
                let Ok(encoded) = ping.encode() else { continue };
                if tx.send(encoded).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: decode server frames into events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                        match ServerMessage::decode(text.as_str()) {
                            Ok(server_msg) => {
                                if let Some(event) = Self::event_for(server_msg) {
                                    let _ = event_tx.send(event).await;
                                }
                            }
                            Err(e) => log::warn!("Undecodable server frame: {e}"),
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    fn event_for(msg: ServerMessage) -> Option<SyncEvent> {
        match msg {
            ServerMessage::Subscribed { collection, doc_id } => {
                Some(SyncEvent::Subscribed { collection, doc_id })
            }
            ServerMessage::CrdtState {
                collection,
                doc_id,
                data,
                version,
            } => Some(SyncEvent::State {
                collection,
                doc_id,
                data,
                version,
            }),
            ServerMessage::CrdtSync {
                collection,
                doc_id,
                operations,
                version,
            } => Some(SyncEvent::RemoteSync {
                collection,
                doc_id,
                operations,
                version,
            }),
            ServerMessage::PresenceChanged {
                doc_id,
                node_id,
                presence,
                ..
            } => Some(SyncEvent::PresenceChanged {
                doc_id,
                node_id,
                presence,
            }),
            ServerMessage::PresenceLeft {
                doc_id, node_id, ..
            } => Some(SyncEvent::PresenceLeft { doc_id, node_id }),
            ServerMessage::Error { message } => Some(SyncEvent::ServerError(message)),
            // Acks and pong carry nothing the application acts on.
            ServerMessage::CrdtSetOk { .. }
            | ServerMessage::CrdtOpsOk { .. }
            | ServerMessage::UndoOk { .. }
            | ServerMessage::RedoOk { .. }
            | ServerMessage::Pong { .. } => None,
        }
    }

    /// Subscribe to all events in a collection.
    pub async fn subscribe(&self, collection: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Subscribe {
            collection: collection.into(),
        })
        .await
    }

    /// Subscribe to one document; the server replies with its state.
    pub async fn subscribe_doc(
        &self,
        collection: impl Into<String>,
        doc_id: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.send(ClientMessage::SubscribeDoc {
            collection: collection.into(),
            doc_id: doc_id.into(),
        })
        .await
    }

    /// Set a value at a path. Queued for replay when disconnected.
    pub async fn set(
        &self,
        collection: impl Into<String>,
        doc_id: impl Into<String>,
        path: Vec<PathSegment>,
        value: Value,
    ) -> Result<(), ProtocolError> {
        let msg = ClientMessage::CrdtSet {
            collection: collection.into(),
            doc_id: doc_id.into(),
            path,
            value,
        };
        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(msg) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }
        self.send(msg).await
    }

    /// Undo this client's most recent edit on a document.
    pub async fn undo(
        &self,
        collection: impl Into<String>,
        doc_id: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Undo {
            collection: collection.into(),
            doc_id: doc_id.into(),
        })
        .await
    }

    /// Redo the most recently undone edit.
    pub async fn redo(
        &self,
        collection: impl Into<String>,
        doc_id: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Redo {
            collection: collection.into(),
            doc_id: doc_id.into(),
        })
        .await
    }

    /// Announce presence on a document. Silently dropped when offline;
    /// presence is ephemeral and replaying stale heartbeats is worse than
    /// losing them.
    pub async fn send_presence(
        &self,
        collection: impl Into<String>,
        doc_id: impl Into<String>,
        presence: Value,
    ) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send(ClientMessage::Presence {
            collection: collection.into(),
            doc_id: doc_id.into(),
            node_id: self.replica_id.clone(),
            presence,
        })
        .await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping {
            time: unix_millis(),
        })
        .await
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Drop the outgoing channel; the writer task then closes the socket.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}
