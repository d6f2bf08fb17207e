//! Connection State Tracker — one lifecycle entry per unordered peer pair
//!
//! The tracker holds the in-memory snapshot the topology optimizer and the
//! message router read from. Persistence and notifications are driven by the
//! coordinator; this module only owns the map and the transition rules.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::store::Record;
use crate::CoordinatorError;

/// Canonical, order-independent identifier for a peer pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    low: String,
    high: String,
}

impl ConnectionKey {
    /// Build the key for `a` and `b` in either order.
    pub fn new(a: &str, b: &str) -> Result<Self, CoordinatorError> {
        if a.is_empty() || b.is_empty() {
            return Err(CoordinatorError::InvalidPeer);
        }
        if a == b {
            return Err(CoordinatorError::SelfConnection(a.to_string()));
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self {
            low: low.to_string(),
            high: high.to_string(),
        })
    }

    pub fn peers(&self) -> (&str, &str) {
        (&self.low, &self.high)
    }

    /// Store id for the pair. Each side is hex-encoded so ids containing
    /// `:` cannot collide.
    pub fn record_id(&self) -> String {
        format!("{}:{}", hex::encode(&self.low), hex::encode(&self.high))
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.low == peer_id || self.high == peer_id
    }

    /// The other side of the pair, if `peer_id` is part of it.
    pub fn other(&self, peer_id: &str) -> Option<&str> {
        if self.low == peer_id {
            Some(&self.high)
        } else if self.high == peer_id {
            Some(&self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Discovering,
    Initiating,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Discovering => "discovering",
            ConnectionState::Initiating => "initiating",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        }
    }

    /// Whether `self -> next` is a legal direct transition.
    ///
    /// Re-reporting the current state is accepted as an activity refresh.
    /// `Discovering` is never re-entered; only a fresh entry starts there.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Discovering, Initiating)
                | (Discovering, Failed)
                | (Initiating, Connecting)
                | (Initiating, Failed)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Disconnected)
                | (Disconnected, Initiating)
                | (Failed, Initiating)
        )
    }

    /// States from which a later pass may start a new attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ConnectionState::Discovering | ConnectionState::Disconnected | ConnectionState::Failed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    /// Peer that drives the offer side of the negotiation
    pub initiator: Option<String>,
    /// Negotiated config as reported by the application layer
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEntry {
    pub key: ConnectionKey,
    pub state: ConnectionState,
    pub metadata: ConnectionMetadata,
    pub created_at: u64,
    pub last_activity: u64,
}

impl ConnectionEntry {
    pub fn new(key: ConnectionKey, now: u64) -> Self {
        Self {
            key,
            state: ConnectionState::Discovering,
            metadata: ConnectionMetadata::default(),
            created_at: now,
            last_activity: now,
        }
    }
}

impl Record for ConnectionEntry {
    const COLLECTION: &'static str = "connections";

    fn record_id(&self) -> String {
        self.key.record_id()
    }

    fn timestamp(&self) -> u64 {
        self.last_activity
    }

    fn index_entries(&self) -> Vec<(&'static str, String)> {
        let (low, high) = self.key.peers();
        vec![
            ("state", self.state.as_str().to_string()),
            ("peer", low.to_string()),
            ("peer", high.to_string()),
        ]
    }
}

/// Result of applying a transition to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub previous: Option<ConnectionState>,
    pub entry: ConnectionEntry,
}

#[derive(Debug, Default)]
pub struct ConnectionTracker {
    entries: HashMap<ConnectionKey, ConnectionEntry>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<&ConnectionEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Adopt an entry loaded from the store, unless a live one is already held.
    pub fn hydrate(&mut self, entry: ConnectionEntry) {
        self.entries.entry(entry.key.clone()).or_insert(entry);
    }

    /// Apply `next` to the entry for `key`, creating it in `discovering` first
    /// when absent. Metadata fields that are set replace the stored ones.
    pub fn transition(
        &mut self,
        key: &ConnectionKey,
        next: ConnectionState,
        metadata: Option<ConnectionMetadata>,
        now: u64,
    ) -> Result<Transition, CoordinatorError> {
        let existing = self.entries.get(key);
        let previous = existing.map(|e| e.state);
        let current = previous.unwrap_or(ConnectionState::Discovering);

        if !current.can_transition_to(next) {
            return Err(CoordinatorError::IllegalTransition {
                from: current,
                to: next,
            });
        }

        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| ConnectionEntry::new(key.clone(), now));
        entry.state = next;
        entry.last_activity = now;
        if let Some(metadata) = metadata {
            if metadata.initiator.is_some() {
                entry.metadata.initiator = metadata.initiator;
            }
            if !metadata.config.is_null() {
                entry.metadata.config = metadata.config;
            }
        }

        Ok(Transition {
            previous,
            entry: entry.clone(),
        })
    }

    pub fn remove(&mut self, key: &ConnectionKey) -> Option<ConnectionEntry> {
        self.entries.remove(key)
    }

    /// Remove every entry whose key contains `peer_id`.
    pub fn remove_touching(&mut self, peer_id: &str) -> Vec<ConnectionEntry> {
        let keys: Vec<_> = self
            .entries
            .keys()
            .filter(|k| k.contains(peer_id))
            .cloned()
            .collect();
        keys.iter().filter_map(|k| self.entries.remove(k)).collect()
    }

    pub fn touching(&self, peer_id: &str) -> Vec<&ConnectionEntry> {
        self.entries
            .values()
            .filter(|e| e.key.contains(peer_id))
            .collect()
    }

    pub fn has_any_entry(&self, peer_id: &str) -> bool {
        self.entries.keys().any(|k| k.contains(peer_id))
    }

    /// A connected link touching `peer_id`, most recently active first.
    pub fn connected_link(&self, peer_id: &str) -> Option<&ConnectionEntry> {
        self.entries
            .values()
            .filter(|e| e.state == ConnectionState::Connected && e.key.contains(peer_id))
            .max_by_key(|e| e.last_activity)
    }

    pub fn count_in(&self, state: ConnectionState) -> usize {
        self.entries.values().filter(|e| e.state == state).count()
    }

    /// Entries that have sat in `connecting` since before `cutoff`.
    pub fn stalled_connecting(&self, cutoff: u64) -> Vec<ConnectionKey> {
        self.entries
            .values()
            .filter(|e| e.state == ConnectionState::Connecting && e.last_activity < cutoff)
            .map(|e| e.key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
