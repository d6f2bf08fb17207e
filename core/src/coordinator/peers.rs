// Peer lifecycle: registration, liveness, listing and the eviction cascade.

use serde_json::Value;
use tracing::{debug, info};

use super::Coordinator;
use crate::connection::ConnectionEntry;
use crate::notify::Notification;
use crate::peer::{split_identity, PeerRecord};
use crate::signaling::{CandidateRecord, SignalRecord};
use crate::topology;
use crate::CoordinatorError;

impl Coordinator {
    /// Register (or refresh) a peer and announce it to recently seen peers.
    pub async fn register_peer(&mut self, data: &Value) -> Result<PeerRecord, CoordinatorError> {
        let (peer_id, _) = split_identity(data)?;
        self.hydrate_peer(&peer_id).await;

        let now = self.now();
        let (record, is_new) = self.registry.register(data, now)?;
        if is_new {
            info!("Registered peer {}", record.peer_id);
        } else {
            debug!("Refreshed peer {}", record.peer_id);
        }
        self.persist("register peer", &record).await;
        self.announce(&record);
        Ok(record)
    }

    /// Refresh a peer's liveness, creating a bare record on first mention.
    pub async fn touch_peer(&mut self, peer_id: &str) -> Result<PeerRecord, CoordinatorError> {
        let peer_id = peer_id.trim();
        if peer_id.is_empty() {
            return Err(CoordinatorError::InvalidPeer);
        }
        self.hydrate_peer(peer_id).await;
        let record = self.registry.touch(peer_id, self.now());
        self.persist("touch peer", &record).await;
        Ok(record)
    }

    /// Peers seen within `max_age_ms`, most recent first.
    pub fn list_active_peers(&self, max_age_ms: u64, limit: usize) -> Vec<PeerRecord> {
        self.registry.list_active(self.now(), max_age_ms, limit)
    }

    /// Persisted peers newest first; falls back to the in-memory view when
    /// the store cannot be read.
    pub(super) async fn peers_snapshot(&mut self, limit: usize) -> Vec<PeerRecord> {
        let stored = self.store.all::<PeerRecord>(Some(limit)).await;
        match self.note_store("list peers", stored) {
            Ok(peers) => peers,
            Err(_) => self.registry.list_active(self.now(), u64::MAX, limit),
        }
    }

    /// Evict every peer idle for longer than `max_age_ms`, including persisted
    /// peers that have not been touched since a restart.
    pub async fn evict_stale(&mut self, max_age_ms: u64) -> Vec<String> {
        let cutoff = self.now().saturating_sub(max_age_ms);
        self.evict_seen_before(cutoff).await
    }

    /// Eviction pass with the configured maximum peer age.
    pub(super) async fn evict_expired_peers(&mut self) -> Vec<String> {
        let cutoff = self.scheduler.stale_cutoff(self.now());
        self.evict_seen_before(cutoff).await
    }

    async fn evict_seen_before(&mut self, cutoff: u64) -> Vec<String> {
        let mut stale = self.registry.stale_ids(cutoff);

        let persisted = self.store.ids_older_than::<PeerRecord>(cutoff).await;
        if let Ok(ids) = self.note_store("scan stale peers", persisted) {
            for id in ids {
                // a cached record is fresher than its stored copy
                if !self.registry.contains(&id) && !stale.contains(&id) {
                    stale.push(id);
                }
            }
        }

        for peer_id in &stale {
            self.evict_peer(peer_id).await;
        }
        if !stale.is_empty() {
            info!("Evicted {} stale peers", stale.len());
        }
        stale
    }

    /// Remove a peer with everything that references it.
    pub(super) async fn evict_peer(&mut self, peer_id: &str) {
        self.registry.remove(peer_id);
        self.forget::<PeerRecord>("evict peer", peer_id).await;

        let mut entry_ids: Vec<String> = self
            .tracker
            .remove_touching(peer_id)
            .iter()
            .map(|e| e.key.record_id())
            .collect();
        let persisted = self.store.find_by::<ConnectionEntry>("peer", peer_id).await;
        if let Ok(entries) = self.note_store("find peer connections", persisted) {
            entry_ids.extend(entries.iter().map(|e| e.key.record_id()));
        }
        entry_ids.sort();
        entry_ids.dedup();
        for id in &entry_ids {
            self.forget::<ConnectionEntry>("evict connection", id).await;
        }

        let mut candidate_ids: Vec<String> = self
            .relay
            .drop_peer(peer_id)
            .into_iter()
            .map(|c| c.id)
            .collect();
        let mut signal_ids = Vec::new();
        for field in ["source", "target"] {
            let candidates = self.store.find_by::<CandidateRecord>(field, peer_id).await;
            if let Ok(found) = self.note_store("find peer candidates", candidates) {
                candidate_ids.extend(found.into_iter().map(|c| c.id));
            }
            let signals = self.store.find_by::<SignalRecord>(field, peer_id).await;
            if let Ok(found) = self.note_store("find peer signals", signals) {
                signal_ids.extend(found.into_iter().map(|s| s.id));
            }
        }
        candidate_ids.sort();
        candidate_ids.dedup();
        signal_ids.sort();
        signal_ids.dedup();
        for id in &candidate_ids {
            self.forget::<CandidateRecord>("evict candidate", id).await;
        }
        for id in &signal_ids {
            self.forget::<SignalRecord>("evict signal", id).await;
        }

        self.deferred
            .retain(|a| a.initiator != peer_id && a.responder != peer_id);

        debug!(
            "Evicted peer {} ({} connections, {} candidates, {} signals)",
            peer_id,
            entry_ids.len(),
            candidate_ids.len(),
            signal_ids.len()
        );
        self.publish(Notification::PeerEvicted {
            peer_id: peer_id.to_string(),
        });
    }

    /// Load a persisted peer into the registry if it is not cached yet.
    pub(super) async fn hydrate_peer(&mut self, peer_id: &str) {
        if self.registry.contains(peer_id) {
            return;
        }
        let loaded = self.store.get::<PeerRecord>(peer_id).await;
        if let Ok(Some(record)) = self.note_store("load peer", loaded) {
            debug!("Rehydrated peer {}", peer_id);
            self.registry.hydrate(record);
        }
    }

    /// Queue jittered pairings between `peer` and recently seen peers.
    fn announce(&mut self, peer: &PeerRecord) {
        let now = self.now();
        let recent: Vec<String> = self
            .registry
            .list_active(now, self.config.topology.active_window_ms, usize::MAX)
            .into_iter()
            .map(|p| p.peer_id)
            .collect();
        let attempts = topology::announcement_attempts(
            &peer.peer_id,
            &recent,
            &self.tracker,
            &self.config.topology,
            now,
            &mut self.rng,
        );

        for attempt in &attempts {
            self.deferred.retain(|queued| {
                !(same_pair(&queued.initiator, &queued.responder, &attempt.initiator, &attempt.responder))
            });
            self.deferred.push(attempt.clone());
        }
        debug!(
            "Announced {} to {} peers",
            peer.peer_id,
            attempts.len()
        );
        self.publish(Notification::PeerAnnouncement {
            peer: peer.clone(),
            attempts,
        });
    }
}

fn same_pair(a1: &str, b1: &str, a2: &str, b2: &str) -> bool {
    (a1 == a2 && b1 == b2) || (a1 == b2 && b1 == a2)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::connection::ConnectionState;
    use crate::notify::Notification;
    use crate::store::MemoryStorage;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_register_requires_identity() {
        let mut h = Harness::new();
        for bad in [json!({"name": "x"}), json!({"id": "  "}), json!("alice"), json!(null)] {
            assert!(h.coordinator.register_peer(&bad).await.is_err());
        }
        assert_eq!(h.coordinator.peer_count(), 0);
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn test_register_resets_state_and_keeps_first_seen() {
        let mut h = Harness::new();
        let first = h
            .coordinator
            .register_peer(&json!({"peerId": "a", "role": "relay"}))
            .await
            .unwrap();
        h.clock.advance(1_000);
        let again = h
            .coordinator
            .register_peer(&json!({"peer_id": "a", "battery": 80}))
            .await
            .unwrap();

        assert_eq!(again.first_seen, first.first_seen);
        assert_eq!(again.last_seen, T0 + 1_000);
        assert_eq!(again.connection_state, ConnectionState::Discovering);
        assert_eq!(again.metadata["role"], "relay");
        assert_eq!(again.metadata["battery"], 80);
    }

    #[tokio::test]
    async fn test_registration_announces_to_recent_peers() {
        let mut h = Harness::new();
        h.coordinator.register_peer(&json!({"id": "b"})).await.unwrap();
        h.drain();
        h.coordinator.register_peer(&json!({"id": "a"})).await.unwrap();

        let attempts = match h.drain().pop() {
            Some(Notification::PeerAnnouncement { peer, attempts }) => {
                assert_eq!(peer.peer_id, "a");
                attempts
            }
            other => panic!("expected announcement, got {other:?}"),
        };
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].initiator, "a");
        assert_eq!(attempts[0].responder, "b");
        assert!(attempts[0].jitter_ms <= 3_000);
        assert_eq!(h.coordinator.deferred_attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_repeat_announcements_do_not_stack() {
        let mut h = Harness::new();
        h.coordinator.register_peer(&json!({"id": "b"})).await.unwrap();
        h.coordinator.register_peer(&json!({"id": "a"})).await.unwrap();
        h.coordinator.register_peer(&json!({"id": "a"})).await.unwrap();
        h.coordinator.register_peer(&json!({"id": "b"})).await.unwrap();
        assert_eq!(h.coordinator.deferred_attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_touch_creates_and_refreshes() {
        let mut h = Harness::new();
        let created = h.coordinator.touch_peer("c").await.unwrap();
        assert_eq!(created.first_seen, T0);
        h.clock.advance(500);
        let touched = h.coordinator.touch_peer("c").await.unwrap();
        assert_eq!(touched.last_seen, T0 + 500);
        assert!(h.coordinator.touch_peer("").await.is_err());
    }

    #[tokio::test]
    async fn test_list_active_is_bounded_and_recent_first() {
        let mut h = Harness::new();
        for id in ["a", "b", "c"] {
            h.coordinator.register_peer(&json!({ "id": id })).await.unwrap();
            h.clock.advance(10);
        }
        let listed: Vec<_> = h
            .coordinator
            .list_active_peers(60_000, 2)
            .into_iter()
            .map(|p| p.peer_id)
            .collect();
        assert_eq!(listed, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_cleanup_uses_configured_peer_age() {
        let mut config = quiet_config();
        config.maintenance.peer_max_age_ms = 5_000;
        let mut h = Harness::with_backend(config, Arc::new(MemoryStorage::new()));
        h.coordinator.register_peer(&json!({"id": "a"})).await.unwrap();
        h.clock.advance(5_000);
        assert!(h.coordinator.cleanup().await.0.is_empty());

        h.clock.advance(1);
        let (evicted, _) = h.coordinator.cleanup().await;
        assert_eq!(evicted, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_evict_stale_spares_fresh_peers() {
        let mut h = Harness::new();
        h.coordinator.register_peer(&json!({"id": "old"})).await.unwrap();
        h.clock.advance(9 * 60 * 1000);
        h.coordinator.register_peer(&json!({"id": "new"})).await.unwrap();
        h.clock.advance(2 * 60 * 1000);
        h.drain();

        let evicted = h.coordinator.evict_stale(10 * 60 * 1000).await;
        assert_eq!(evicted, vec!["old".to_string()]);
        assert!(h.coordinator.peer("new").is_some());
        assert!(h.coordinator.deferred_attempts().is_empty());
        assert!(h
            .drain()
            .iter()
            .any(|n| matches!(n, Notification::PeerEvicted { peer_id } if peer_id == "old")));
    }
}
