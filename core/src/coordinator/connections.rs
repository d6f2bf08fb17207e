// Connection lifecycle handlers and the link-up cascade.

use tracing::{debug, info, warn};

use super::Coordinator;
use crate::connection::{ConnectionEntry, ConnectionKey, ConnectionMetadata, ConnectionState};
use crate::notify::Notification;
use crate::peer::PeerRecord;
use crate::router::PendingMessage;
use crate::signaling::CandidateRecord;
use crate::CoordinatorError;

impl Coordinator {
    /// Apply a lifecycle report from the application.
    ///
    /// With `remote_peer_id` the named pair is updated. Without it, every
    /// entry touching `peer_id` for which the move is legal is updated.
    pub async fn update_connection_state(
        &mut self,
        peer_id: &str,
        remote_peer_id: Option<&str>,
        state: ConnectionState,
        metadata: Option<ConnectionMetadata>,
    ) -> Result<Vec<ConnectionEntry>, CoordinatorError> {
        if let Some(remote) = remote_peer_id.map(str::trim).filter(|r| !r.is_empty()) {
            let key = ConnectionKey::new(peer_id, remote)?;
            self.hydrate_connection(&key).await;
            let current = self
                .tracker
                .get(&key)
                .map_or(ConnectionState::Discovering, |e| e.state);
            if !current.can_transition_to(state) {
                return Err(CoordinatorError::IllegalTransition {
                    from: current,
                    to: state,
                });
            }
            self.touch_peer(peer_id).await?;
            self.touch_peer(remote).await?;
            let entry = self.apply_transition(&key, state, metadata).await?;
            return Ok(vec![entry]);
        }

        // entries stored before a restart are not cached until touched
        let persisted = self.store.find_by::<ConnectionEntry>("peer", peer_id).await;
        if let Ok(entries) = self.note_store("find peer connections", persisted) {
            for entry in entries {
                if !self.tracker.contains(&entry.key) {
                    debug!("Rehydrated connection {} ({})", entry.key, entry.state);
                    self.tracker.hydrate(entry);
                }
            }
        }

        let keys: Vec<ConnectionKey> = self
            .tracker
            .touching(peer_id)
            .into_iter()
            .map(|e| e.key.clone())
            .collect();
        if keys.is_empty() {
            return Err(CoordinatorError::UnknownConnection(peer_id.to_string()));
        }
        self.touch_peer(peer_id).await?;

        let mut updated = Vec::new();
        let mut first_error = None;
        for key in keys {
            match self.apply_transition(&key, state, metadata.clone()).await {
                Ok(entry) => updated.push(entry),
                Err(e) => {
                    debug!("Skipping {}: {}", key, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if updated.is_empty() => Err(e),
            _ => Ok(updated),
        }
    }

    /// Start negotiation between two peers, or reuse an attempt already in
    /// flight. Both sides are told to create their end of the link.
    pub async fn initiate_connection(
        &mut self,
        source_peer_id: &str,
        target_peer_id: &str,
        initiator_id: Option<&str>,
    ) -> Result<ConnectionEntry, CoordinatorError> {
        let key = ConnectionKey::new(source_peer_id, target_peer_id)?;
        let initiator = initiator_id.unwrap_or(source_peer_id).to_string();
        let responder = key
            .other(&initiator)
            .ok_or(CoordinatorError::InvalidPeer)?
            .to_string();

        self.touch_peer(source_peer_id).await?;
        self.touch_peer(target_peer_id).await?;
        self.hydrate_connection(&key).await;

        if let Some(entry) = self.tracker.get(&key) {
            if !entry.state.is_retryable() && entry.state != ConnectionState::Initiating {
                debug!("Connection {} already {}", key, entry.state);
                return Ok(entry.clone());
            }
        }

        let metadata = ConnectionMetadata {
            initiator: Some(initiator.clone()),
            config: self.config.negotiation.clone(),
        };
        let entry = self
            .apply_transition(&key, ConnectionState::Initiating, Some(metadata))
            .await?;

        info!("Initiating connection {} (initiator {})", key, initiator);
        for (peer_id, remote_peer_id, is_initiator) in [
            (&initiator, &responder, true),
            (&responder, &initiator, false),
        ] {
            self.publish(Notification::CreateConnection {
                connection_key: key.clone(),
                peer_id: peer_id.clone(),
                remote_peer_id: remote_peer_id.clone(),
                initiator: is_initiator,
                config: self.config.negotiation.clone(),
            });
        }
        Ok(entry)
    }

    /// Explicitly remove the entry for a pair and drop its queued candidates.
    pub async fn teardown_connection(
        &mut self,
        peer_id: &str,
        remote_peer_id: &str,
    ) -> Result<ConnectionEntry, CoordinatorError> {
        let key = ConnectionKey::new(peer_id, remote_peer_id)?;
        self.hydrate_connection(&key).await;
        let entry = self
            .tracker
            .remove(&key)
            .ok_or_else(|| CoordinatorError::UnknownConnection(key.to_string()))?;
        self.forget::<ConnectionEntry>("teardown connection", &key.record_id())
            .await;

        for candidate in self.relay.release(&key) {
            self.forget::<CandidateRecord>("drop candidate", &candidate.id)
                .await;
        }
        let (low, high) = key.peers();
        for peer in [low.to_string(), high.to_string()] {
            self.mirror_state(&peer, ConnectionState::Disconnected).await;
        }

        info!("Tore down connection {}", key);
        self.publish(Notification::ConnectionStateChanged {
            connection_key: key,
            previous: Some(entry.state),
            state: ConnectionState::Disconnected,
            metadata: entry.metadata.clone(),
        });
        Ok(entry)
    }

    /// Transition one entry and run everything that hangs off the change.
    pub(super) async fn apply_transition(
        &mut self,
        key: &ConnectionKey,
        state: ConnectionState,
        metadata: Option<ConnectionMetadata>,
    ) -> Result<ConnectionEntry, CoordinatorError> {
        let transition = self.tracker.transition(key, state, metadata, self.now())?;
        self.persist("store connection", &transition.entry).await;

        let (low, high) = key.peers();
        for peer in [low.to_string(), high.to_string()] {
            self.mirror_state(&peer, state).await;
        }

        if transition.previous != Some(state) {
            debug!(
                "Connection {}: {:?} -> {}",
                key, transition.previous, state
            );
        }
        self.publish(Notification::ConnectionStateChanged {
            connection_key: key.clone(),
            previous: transition.previous,
            state,
            metadata: transition.entry.metadata.clone(),
        });

        if state == ConnectionState::Connected && transition.previous != Some(state) {
            self.on_link_up(key).await;
        }
        Ok(transition.entry)
    }

    /// Release queued candidates and replay stored messages for a new link.
    async fn on_link_up(&mut self, key: &ConnectionKey) {
        let released = self.relay.release(key);
        if !released.is_empty() {
            for candidate in &released {
                self.forget::<CandidateRecord>("release candidate", &candidate.id)
                    .await;
            }
            debug!("Released {} candidates for {}", released.len(), key);
            self.publish(Notification::CandidatesReleased {
                connection_key: key.clone(),
                candidates: released,
            });
        }

        let (low, high) = key.peers();
        let mut replayed = 0;
        for peer in [low.to_string(), high.to_string()] {
            let found = self.store.find_by::<PendingMessage>("target", &peer).await;
            let Ok(mut pending) = self.note_store("find pending messages", found) else {
                continue;
            };
            // oldest first so the application sees them in send order
            pending.reverse();
            for message in pending {
                self.publish(Notification::SendMessage {
                    message_id: message.id.clone(),
                    target_peer: message.target_peer.clone(),
                    via: key.clone(),
                    message_type: message.message_type.clone(),
                    payload: message.payload.clone(),
                    replayed: true,
                });
                self.forget::<PendingMessage>("drop replayed message", &message.id)
                    .await;
                replayed += 1;
            }
        }
        if replayed > 0 {
            info!("Replayed {} stored messages over {}", replayed, key);
            self.router.record_replayed(replayed);
        }
    }

    /// Fail every `connecting` entry that has not progressed in time.
    pub(super) async fn fail_stalled_connections(&mut self) -> usize {
        let cutoff = self.scheduler.connecting_cutoff(self.now());
        let stalled = self.tracker.stalled_connecting(cutoff);
        let mut failed = 0;
        for key in stalled {
            match self.apply_transition(&key, ConnectionState::Failed, None).await {
                Ok(_) => failed += 1,
                Err(e) => warn!("Could not fail stalled connection {}: {}", key, e),
            }
        }
        failed
    }

    async fn mirror_state(&mut self, peer_id: &str, state: ConnectionState) {
        if let Some(record) = self.registry.set_connection_state(peer_id, state) {
            self.persist("mirror peer state", &record).await;
        }
    }

    /// Load a persisted entry into the tracker if it is not cached yet.
    pub(super) async fn hydrate_connection(&mut self, key: &ConnectionKey) {
        if self.tracker.contains(key) {
            return;
        }
        let loaded = self.store.get::<ConnectionEntry>(&key.record_id()).await;
        if let Ok(Some(entry)) = self.note_store("load connection", loaded) {
            debug!("Rehydrated connection {} ({})", key, entry.state);
            self.tracker.hydrate(entry);
        }
    }

    /// Peer record as currently mirrored, loading it if needed.
    pub async fn peer_record(&mut self, peer_id: &str) -> Option<PeerRecord> {
        self.hydrate_peer(peer_id).await;
        self.registry.get(peer_id).cloned()
    }
}
