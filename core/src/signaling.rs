//! Signaling Relay — store-and-notify shim for connection setup payloads
//!
//! Offers, answers and candidates are recorded verbatim and forwarded to the
//! application layer. Payloads are never interpreted. Candidates are also held
//! in per-pair queues until the pair's link is usable.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::connection::ConnectionKey;
use crate::store::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Offer,
    Answer,
    Candidate,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalType::Offer => write!(f, "offer"),
            SignalType::Answer => write!(f, "answer"),
            SignalType::Candidate => write!(f, "candidate"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: String,
    pub source_peer: String,
    pub target_peer: String,
    pub signal_type: SignalType,
    pub payload: serde_json::Value,
    pub created_at: u64,
    pub processed: bool,
}

impl SignalRecord {
    pub fn new(
        source_peer: &str,
        target_peer: &str,
        signal_type: SignalType,
        payload: serde_json::Value,
        now: u64,
    ) -> Self {
        Self {
            id: format!("sig-{}", uuid::Uuid::new_v4()),
            source_peer: source_peer.to_string(),
            target_peer: target_peer.to_string(),
            signal_type,
            payload,
            created_at: now,
            processed: false,
        }
    }
}

impl Record for SignalRecord {
    const COLLECTION: &'static str = "signals";

    fn record_id(&self) -> String {
        self.id.clone()
    }

    fn timestamp(&self) -> u64 {
        self.created_at
    }

    fn index_entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("target", self.target_peer.clone()),
            ("source", self.source_peer.clone()),
        ]
    }
}

/// Where a candidate waits until its link is usable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKey {
    Pair(ConnectionKey),
    /// Used when the pair cannot be canonicalised (missing or identical source)
    Peer(String),
}

impl QueueKey {
    pub fn for_pair(source: &str, target: &str) -> Self {
        match ConnectionKey::new(source, target) {
            Ok(key) => QueueKey::Pair(key),
            Err(_) => QueueKey::Peer(target.to_string()),
        }
    }

    pub fn references(&self, peer_id: &str) -> bool {
        match self {
            QueueKey::Pair(key) => key.contains(peer_id),
            QueueKey::Peer(peer) => peer == peer_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub id: String,
    pub source_peer: String,
    pub target_peer: String,
    pub candidate: serde_json::Value,
    pub queue: QueueKey,
    pub created_at: u64,
    pub processed: bool,
}

impl CandidateRecord {
    pub fn new(source_peer: &str, target_peer: &str, candidate: serde_json::Value, now: u64) -> Self {
        Self {
            id: format!("cand-{}", uuid::Uuid::new_v4()),
            source_peer: source_peer.to_string(),
            target_peer: target_peer.to_string(),
            candidate,
            queue: QueueKey::for_pair(source_peer, target_peer),
            created_at: now,
            processed: false,
        }
    }
}

impl Record for CandidateRecord {
    const COLLECTION: &'static str = "candidates";

    fn record_id(&self) -> String {
        self.id.clone()
    }

    fn timestamp(&self) -> u64 {
        self.created_at
    }

    fn index_entries(&self) -> Vec<(&'static str, String)> {
        let mut entries = vec![("target", self.target_peer.clone())];
        if !self.source_peer.is_empty() {
            entries.push(("source", self.source_peer.clone()));
        }
        entries
    }
}

/// In-memory candidate queues keyed by pair (or by target alone).
#[derive(Debug)]
pub struct SignalingRelay {
    queues: HashMap<QueueKey, VecDeque<CandidateRecord>>,
    max_per_queue: usize,
}

impl SignalingRelay {
    pub fn new(max_per_queue: usize) -> Self {
        Self {
            queues: HashMap::new(),
            max_per_queue: max_per_queue.max(1),
        }
    }

    /// Queue a candidate. When the queue is full the oldest entries are
    /// trimmed and returned so their persisted copies can be dropped.
    pub fn enqueue(&mut self, candidate: CandidateRecord) -> Vec<CandidateRecord> {
        let queue = self.queues.entry(candidate.queue.clone()).or_default();
        queue.push_back(candidate);
        let mut trimmed = Vec::new();
        while queue.len() > self.max_per_queue {
            if let Some(oldest) = queue.pop_front() {
                trimmed.push(oldest);
            }
        }
        trimmed
    }

    /// Take every queued candidate that becomes deliverable once `key` is
    /// connected: the pair queue plus the bare queues of either peer.
    pub fn release(&mut self, key: &ConnectionKey) -> Vec<CandidateRecord> {
        let (low, high) = key.peers();
        let queue_keys = [
            QueueKey::Pair(key.clone()),
            QueueKey::Peer(low.to_string()),
            QueueKey::Peer(high.to_string()),
        ];
        let mut released: Vec<_> = queue_keys
            .iter()
            .filter_map(|k| self.queues.remove(k))
            .flatten()
            .collect();
        released.sort_by_key(|c| c.created_at);
        released
    }

    /// Drop every queue referencing `peer_id`.
    pub fn drop_peer(&mut self, peer_id: &str) -> Vec<CandidateRecord> {
        let keys: Vec<_> = self
            .queues
            .keys()
            .filter(|k| k.references(peer_id))
            .cloned()
            .collect();
        keys.iter()
            .filter_map(|k| self.queues.remove(k))
            .flatten()
            .collect()
    }

    /// Drop queued candidates older than `cutoff`, oldest first.
    pub fn expire(&mut self, cutoff: u64) -> usize {
        let mut expired = 0;
        for queue in self.queues.values_mut() {
            while queue.front().is_some_and(|c| c.created_at < cutoff) {
                queue.pop_front();
                expired += 1;
            }
        }
        self.queues.retain(|_, q| !q.is_empty());
        expired
    }

    pub fn queued_total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Whether any queued candidate is addressed to or from `peer_id`.
    pub fn references(&self, peer_id: &str) -> bool {
        self.queues.values().flatten().any(|c| {
            c.source_peer == peer_id || c.target_peer == peer_id
        })
    }
}
