//! JSON wire protocol between clients and the sync server.
//!
//! Messages are tagged objects carried as WebSocket text frames:
//! ```text
//! {"type": "crdt_set", "collection": "notes", "docId": "n1",
//!  "path": ["title"], "value": "Groceries"}
//! ```
//!
//! The transport is deliberately dumb: it decodes a frame into a
//! [`ClientMessage`], hands it to the coordinator, and serializes whatever
//! [`ServerMessage`]s come back. Unknown or malformed frames produce a typed
//! `error` reply and never close the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use conflux_crdt::{Operation, PathSegment};

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to every event in a collection.
    Subscribe { collection: String },
    /// Drop a collection subscription.
    Unsubscribe { collection: String },
    /// Subscribe to one document; replies with its current state.
    SubscribeDoc {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
    },
    /// Point read of a document's current value.
    CrdtGet {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
    },
    /// Local edit: set `value` at `path`.
    CrdtSet {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        path: Vec<PathSegment>,
        value: Value,
    },
    /// Batch of remote operations from another replica.
    CrdtOps {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        operations: Vec<Operation>,
    },
    /// Undo this connection's most recent edit on a document.
    Undo {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
    },
    /// Redo the most recently undone edit.
    Redo {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
    },
    /// Presence heartbeat with arbitrary metadata (cursor, name, ...).
    Presence {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(default)]
        presence: Value,
    },
    /// Heartbeat; echoed back as `pong`.
    Ping {
        #[serde(default)]
        time: u64,
    },
}

/// Messages the server sends, as direct replies or broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledges `subscribe` / `subscribe_doc`.
    Subscribed {
        collection: String,
        #[serde(rename = "docId", skip_serializing_if = "Option::is_none")]
        doc_id: Option<String>,
    },
    /// Current document value (reply to `crdt_get` / `subscribe_doc`).
    CrdtState {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        data: Value,
        version: u64,
    },
    /// Acknowledges a `crdt_set`; carries the operation for local undo/merge.
    CrdtSetOk {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        operation: Operation,
        version: u64,
    },
    /// Acknowledges a `crdt_ops` batch.
    CrdtOpsOk {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        applied: usize,
        version: u64,
    },
    /// Broadcast of operations applied by someone else.
    CrdtSync {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        operations: Vec<Operation>,
        version: u64,
    },
    /// Acknowledges an `undo`; `performed` is false when history was empty.
    UndoOk {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        performed: bool,
        version: u64,
    },
    /// Acknowledges a `redo`.
    RedoOk {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        performed: bool,
        version: u64,
    },
    /// Broadcast: an actor's presence metadata changed.
    PresenceChanged {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        #[serde(rename = "nodeId")]
        node_id: String,
        presence: Value,
    },
    /// Broadcast: an actor left (explicitly or by heartbeat timeout).
    PresenceLeft {
        collection: String,
        #[serde(rename = "docId")]
        doc_id: String,
        #[serde(rename = "nodeId")]
        node_id: String,
    },
    /// Heartbeat echo.
    Pong { time: u64 },
    /// Typed error identifying the failed request; the connection stays open.
    Error { message: String },
}

impl ClientMessage {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

impl ServerMessage {
    /// Serialize for the wire.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode a text frame (client side).
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Shorthand for an error reply.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Encode error: {e}"),
            Self::Decode(e) => write!(f, "Decode error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
