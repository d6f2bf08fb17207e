//! Peer Registry — in-memory authoritative view of known peers
//!
//! Records are cached here and mirrored into the store by the coordinator.
//! After a restart the map starts empty and repopulates as peers are touched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::connection::ConnectionState;
use crate::store::Record;
use crate::CoordinatorError;

/// Identity fields consulted in order when registering a peer.
const IDENTITY_FIELDS: [&str; 3] = ["peer_id", "peerId", "id"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    /// Capability/vector metadata supplied by the application
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub first_seen: u64,
    pub last_seen: u64,
    /// Mirror of the most recent connection entry touching this peer
    pub connection_state: ConnectionState,
}

impl PeerRecord {
    pub fn new(peer_id: String, now: u64) -> Self {
        Self {
            peer_id,
            metadata: Map::new(),
            first_seen: now,
            last_seen: now,
            connection_state: ConnectionState::Discovering,
        }
    }
}

impl Record for PeerRecord {
    const COLLECTION: &'static str = "peers";

    fn record_id(&self) -> String {
        self.peer_id.clone()
    }

    fn timestamp(&self) -> u64 {
        self.last_seen
    }

    fn index_entries(&self) -> Vec<(&'static str, String)> {
        vec![("state", self.connection_state.as_str().to_string())]
    }
}

/// Derive a peer identity from application-supplied data.
///
/// Returns the identity and the remaining fields as metadata.
pub fn split_identity(data: &Value) -> Result<(String, Map<String, Value>), CoordinatorError> {
    let Value::Object(fields) = data else {
        return Err(CoordinatorError::InvalidPeer);
    };

    let peer_id = IDENTITY_FIELDS
        .iter()
        .filter_map(|field| fields.get(*field))
        .find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or(CoordinatorError::InvalidPeer)?;

    let metadata = fields
        .iter()
        .filter(|(k, _)| !IDENTITY_FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok((peer_id, metadata))
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a peer from registration data. Registration resets the
    /// mirrored connection state to `discovering`.
    pub fn register(&mut self, data: &Value, now: u64) -> Result<(PeerRecord, bool), CoordinatorError> {
        let (peer_id, metadata) = split_identity(data)?;
        let is_new = !self.peers.contains_key(&peer_id);

        let record = self
            .peers
            .entry(peer_id.clone())
            .or_insert_with(|| PeerRecord::new(peer_id, now));
        record.metadata.extend(metadata);
        record.last_seen = now;
        record.connection_state = ConnectionState::Discovering;

        Ok((record.clone(), is_new))
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    /// Adopt a record loaded from the store, unless one is already cached.
    pub fn hydrate(&mut self, record: PeerRecord) {
        self.peers.entry(record.peer_id.clone()).or_insert(record);
    }

    /// Refresh `last_seen`, creating a bare record on first mention.
    pub fn touch(&mut self, peer_id: &str, now: u64) -> PeerRecord {
        let record = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerRecord::new(peer_id.to_string(), now));
        record.last_seen = record.last_seen.max(now);
        record.clone()
    }

    pub fn set_connection_state(&mut self, peer_id: &str, state: ConnectionState) -> Option<PeerRecord> {
        let record = self.peers.get_mut(peer_id)?;
        record.connection_state = state;
        Some(record.clone())
    }

    /// Peers seen within `max_age_ms`, most recent first, bounded by `limit`.
    pub fn list_active(&self, now: u64, max_age_ms: u64, limit: usize) -> Vec<PeerRecord> {
        let mut active: Vec<_> = self
            .peers
            .values()
            .filter(|p| now.saturating_sub(p.last_seen) <= max_age_ms)
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        active.truncate(limit);
        active
    }

    /// Ids of peers last seen before `cutoff`.
    pub fn stale_ids(&self, cutoff: u64) -> Vec<String> {
        let mut stale: Vec<_> = self
            .peers
            .values()
            .filter(|p| p.last_seen < cutoff)
            .map(|p| p.peer_id.clone())
            .collect();
        stale.sort();
        stale
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.remove(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
