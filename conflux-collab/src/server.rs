//! WebSocket front end for the sync engine.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── accept loop ── per-connection task ── SyncCoordinator
//! Client B ──┘        │                  │                   │
//!                      │          outbound mpsc        DocumentCache
//!                      │          (Arc<str> frames)          │
//!                      ▼                  │             DurableStore
//!                 sweep timer             ▼             (RocksDB / memory)
//!                                    WebSocket sink
//! ```
//!
//! Each connection task owns its socket. Inbound frames are decoded and
//! handed to the coordinator; broadcasts arrive through the connection's
//! bounded mpsc channel and are written from the same task, so the sink is
//! never shared. Malformed frames get an `error` reply and the connection
//! stays open.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::coordinator::{SyncConfig, SyncCoordinator};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::storage::{DurableStore, MemoryStore, RocksStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frame buffer per connection; a full buffer drops broadcasts
    /// for that connection only
    pub outbound_capacity: usize,
    /// Interval between maintenance sweeps (cache TTL, presence expiry)
    pub sweep_interval: Duration,
    /// Persistence path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Coordinator tunables
    pub sync: SyncConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            sweep_interval: Duration::from_secs(10),
            storage_path: None,
            sync: SyncConfig::default(),
        }
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    coordinator: Arc<SyncCoordinator>,
}

impl SyncServer {
    /// Create a server, opening persistent storage if configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn DurableStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        let coordinator = Arc::new(SyncCoordinator::new(config.sync.clone(), store));
        Ok(Self {
            config,
            coordinator,
        })
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default()).expect("in-memory server cannot fail to open")
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Bind the configured address and run the accept loop.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Run the accept loop on an already-bound listener. Lets callers bind
    /// to port 0 and read the assigned address first.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        // Background maintenance: cache write-back, presence expiry. Holds
        // only a weak reference so a dropped server releases its storage.
        let sweeper = Arc::downgrade(&self.coordinator);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(coordinator) = sweeper.upgrade() else {
                    break;
                };
                coordinator.sweep().await;
            }
        });

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let coordinator = self.coordinator.clone();
            let capacity = self.config.outbound_capacity;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(coordinator, stream, addr, capacity).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Write every cached document back to storage. Call before shutdown.
    pub async fn flush(&self) -> usize {
        self.coordinator.flush_all().await
    }
}

async fn handle_connection(
    coordinator: Arc<SyncCoordinator>,
    stream: TcpStream,
    addr: SocketAddr,
    outbound_capacity: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let conn = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<Arc<str>>(outbound_capacity);
    coordinator.connect(conn, tx).await;
    log::info!("WebSocket connection {conn} established from {addr}");

    loop {
        tokio::select! {
            // Inbound frame from the client.
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let replies = match ClientMessage::decode(text.as_str()) {
                            Ok(client_msg) => coordinator.handle_message(conn, client_msg).await,
                            Err(e) => {
                                log::warn!("Undecodable frame from {conn}: {e}");
                                vec![ServerMessage::error(format!("invalid message: {e}"))]
                            }
                        };
                        for reply in replies {
                            let encoded = reply.encode()?;
                            ws_sender.send(Message::Text(encoded.into())).await?;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {conn} closed");
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error on {conn}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            // Broadcast destined for this connection.
            payload = rx.recv() => {
                match payload {
                    Some(frame) => {
                        ws_sender.send(Message::Text(frame.as_ref().into())).await?;
                    }
                    // Registry dropped our sender: we were disconnected
                    // server-side.
                    None => break,
                }
            }
        }
    }

    coordinator.disconnect(conn).await;
    Ok(())
}
