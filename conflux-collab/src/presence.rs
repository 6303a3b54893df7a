//! Per-document presence tracking.
//!
//! Actors announce themselves with heartbeats carrying arbitrary metadata
//! (cursor position, display name — the engine doesn't care). An actor is
//! present while its last heartbeat is younger than the timeout; stale
//! actors are removed lazily by the periodic sweep, never polled.
//!
//! Presence is ephemeral by design: it is broadcast to document subscribers
//! but never persisted.

use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct PresenceEntry {
    last_heartbeat: Instant,
    meta: Value,
}

/// Tracks which actors are currently viewing/editing one document.
pub struct PresenceManager {
    actors: HashMap<String, PresenceEntry>,
    timeout: Duration,
}

impl PresenceManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            actors: HashMap::new(),
            timeout,
        }
    }

    /// Upsert an actor's heartbeat. Returns `true` if this is a join
    /// (the actor was not present before).
    pub fn heartbeat(&mut self, actor_id: &str, meta: Value) -> bool {
        let joined = !self.actors.contains_key(actor_id);
        self.actors.insert(
            actor_id.to_string(),
            PresenceEntry {
                last_heartbeat: Instant::now(),
                meta,
            },
        );
        joined
    }

    /// Explicit removal on graceful disconnect. Returns `true` if the actor
    /// was present.
    pub fn leave(&mut self, actor_id: &str) -> bool {
        self.actors.remove(actor_id).is_some()
    }

    /// Remove actors whose heartbeat has aged out; returns their ids so the
    /// caller can broadcast the departures.
    pub fn cleanup(&mut self) -> Vec<String> {
        let now = Instant::now();
        let timeout = self.timeout;
        let stale: Vec<String> = self
            .actors
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_heartbeat) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.actors.remove(id);
        }
        stale
    }

    pub fn is_present(&self, actor_id: &str) -> bool {
        match self.actors.get(actor_id) {
            Some(e) => e.last_heartbeat.elapsed() < self.timeout,
            None => false,
        }
    }

    /// Snapshot of present actors and their metadata.
    pub fn actors(&self) -> HashMap<String, Value> {
        self.actors
            .iter()
            .map(|(id, e)| (id.clone(), e.meta.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}
