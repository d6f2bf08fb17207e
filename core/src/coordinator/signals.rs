// Signaling relay handlers: offers, answers and candidates.

use serde_json::Value;
use tracing::{debug, info};

use super::Coordinator;
use crate::connection::{ConnectionKey, ConnectionMetadata, ConnectionState};
use crate::notify::Notification;
use crate::signaling::{CandidateRecord, QueueKey, SignalRecord, SignalType};
use crate::CoordinatorError;

fn present(peer: Option<&str>) -> Option<&str> {
    peer.map(str::trim).filter(|p| !p.is_empty())
}

impl Coordinator {
    /// Record an offer and move the pair to `initiating`.
    pub async fn relay_offer(
        &mut self,
        from: Option<&str>,
        to: Option<&str>,
        payload: Value,
    ) -> Result<SignalRecord, CoordinatorError> {
        self.relay_signal(SignalType::Offer, from, to, payload).await
    }

    /// Record an answer and move an `initiating` pair to `connecting`.
    pub async fn relay_answer(
        &mut self,
        from: Option<&str>,
        to: Option<&str>,
        payload: Value,
    ) -> Result<SignalRecord, CoordinatorError> {
        self.relay_signal(SignalType::Answer, from, to, payload).await
    }

    async fn relay_signal(
        &mut self,
        signal_type: SignalType,
        from: Option<&str>,
        to: Option<&str>,
        payload: Value,
    ) -> Result<SignalRecord, CoordinatorError> {
        let to = present(to).ok_or(CoordinatorError::MissingTarget)?;
        let from = present(from).ok_or(CoordinatorError::InvalidPeer)?;
        let key = ConnectionKey::new(from, to)?;

        self.touch_peer(from).await?;
        self.touch_peer(to).await?;

        let signal = SignalRecord::new(from, to, signal_type, payload, self.now());
        self.persist("store signal", &signal).await;
        self.hydrate_connection(&key).await;

        let state = self.tracker.get(&key).map(|e| e.state);
        match signal_type {
            SignalType::Offer => {
                if state.map_or(true, ConnectionState::is_retryable) {
                    let metadata = ConnectionMetadata {
                        initiator: Some(from.to_string()),
                        ..Default::default()
                    };
                    self.apply_transition(&key, ConnectionState::Initiating, Some(metadata))
                        .await?;
                }
            }
            SignalType::Answer => {
                if state == Some(ConnectionState::Initiating) {
                    self.apply_transition(&key, ConnectionState::Connecting, None)
                        .await?;
                }
            }
            SignalType::Candidate => {}
        }

        info!("Relayed {} {} -> {}", signal_type, from, to);
        self.publish(Notification::SignalReceived {
            signal: signal.clone(),
        });
        Ok(signal)
    }

    /// Record a candidate and hold it until the pair's link is usable.
    ///
    /// A missing or self-addressed source queues the candidate under the
    /// target alone.
    pub async fn relay_candidate(
        &mut self,
        from: Option<&str>,
        to: Option<&str>,
        candidate: Value,
    ) -> Result<CandidateRecord, CoordinatorError> {
        let to = present(to).ok_or(CoordinatorError::MissingTarget)?;
        let from = present(from).unwrap_or("");

        if !from.is_empty() {
            self.touch_peer(from).await?;
        }
        self.touch_peer(to).await?;

        let mut record = CandidateRecord::new(from, to, candidate, self.now());
        let link_up = match &record.queue {
            QueueKey::Pair(key) => {
                self.hydrate_connection(key).await;
                self.tracker
                    .get(key)
                    .is_some_and(|e| e.state == ConnectionState::Connected)
            }
            QueueKey::Peer(_) => false,
        };

        if link_up {
            record.processed = true;
            self.persist("store candidate", &record).await;
        } else {
            self.persist("store candidate", &record).await;
            let trimmed = self.relay.enqueue(record.clone());
            for old in &trimmed {
                self.forget::<CandidateRecord>("trim candidate", &old.id).await;
            }
            if !trimmed.is_empty() {
                debug!("Trimmed {} queued candidates for {}", trimmed.len(), to);
            }
        }

        self.publish(Notification::CandidateReceived {
            candidate: record.clone(),
        });
        Ok(record)
    }

    /// Signals for the application: unprocessed signals addressed to
    /// `peer_id` when given, otherwise every stored signal. Newest first.
    pub(super) async fn signals_snapshot(
        &mut self,
        peer_id: Option<&str>,
        limit: usize,
        mark_processed: bool,
    ) -> Result<Vec<SignalRecord>, CoordinatorError> {
        let Some(peer_id) = present(peer_id) else {
            let all = self.store.all::<SignalRecord>(Some(limit)).await;
            return self.note_store("list signals", all);
        };

        let mut pending = self.pending_signals(peer_id, limit).await?;
        if mark_processed {
            for signal in pending.iter_mut() {
                signal.processed = true;
                self.persist("mark signal processed", &*signal).await;
            }
        }
        Ok(pending)
    }

    /// Unprocessed signals addressed to `peer_id`, newest first.
    pub async fn pending_signals(
        &mut self,
        peer_id: &str,
        limit: usize,
    ) -> Result<Vec<SignalRecord>, CoordinatorError> {
        let found = self.store.find_by::<SignalRecord>("target", peer_id).await;
        let signals = self.note_store("find signals", found)?;
        Ok(signals
            .into_iter()
            .filter(|s| !s.processed)
            .take(limit)
            .collect())
    }
}
