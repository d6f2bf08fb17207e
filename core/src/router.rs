//! Message Router — direct delivery over a live link, store-and-forward otherwise
//!
//! The decision reads only the in-memory connection snapshot, so routing never
//! waits on the store. Persisting the fallback copy is the coordinator's job.

use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionKey, ConnectionTracker};
use crate::store::Record;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub id: String,
    pub target_peer: String,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub created_at: u64,
}

impl PendingMessage {
    pub fn new(target_peer: &str, message_type: &str, payload: serde_json::Value, now: u64) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            target_peer: target_peer.to_string(),
            message_type: message_type.to_string(),
            payload,
            created_at: now,
        }
    }
}

impl Record for PendingMessage {
    const COLLECTION: &'static str = "messages";

    fn record_id(&self) -> String {
        self.id.clone()
    }

    fn timestamp(&self) -> u64 {
        self.created_at
    }

    fn index_entries(&self) -> Vec<(&'static str, String)> {
        vec![("target", self.target_peer.clone())]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RouteOutcome {
    /// Handed to the application layer for the live link
    Delivered { message_id: String, via: ConnectionKey },
    /// Persisted until a link to the target comes up
    Queued { message_id: String },
}

/// Delivery counters; routing decisions themselves are stateless.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRouter {
    pub delivered: u64,
    pub queued: u64,
    pub replayed: u64,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The link a message for `target` should take right now, if any.
    pub fn select_link<'a>(&self, tracker: &'a ConnectionTracker, target: &str) -> Option<&'a ConnectionKey> {
        tracker.connected_link(target).map(|entry| &entry.key)
    }

    pub fn record_delivered(&mut self) {
        self.delivered += 1;
    }

    pub fn record_queued(&mut self) {
        self.queued += 1;
    }

    pub fn record_replayed(&mut self, count: usize) {
        self.replayed += count as u64;
    }
}
