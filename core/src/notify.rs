//! Notifications pushed to the application layer
//!
//! Publishing is fire-and-forget over every registered listener. A listener
//! that fails is logged and skipped; the rest still receive the event.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::connection::{ConnectionKey, ConnectionMetadata, ConnectionState};
use crate::data::DataRecord;
use crate::maintenance::CycleReport;
use crate::peer::PeerRecord;
use crate::signaling::{CandidateRecord, SignalRecord};
use crate::topology::ScheduledAttempt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
    /// A peer registered and is being introduced to recently seen peers
    PeerAnnouncement {
        peer: PeerRecord,
        attempts: Vec<ScheduledAttempt>,
    },
    /// An offer or answer to forward over the transport
    SignalReceived { signal: SignalRecord },
    CandidateReceived { candidate: CandidateRecord },
    /// Queued candidates for a pair whose link just came up
    CandidatesReleased {
        connection_key: ConnectionKey,
        candidates: Vec<CandidateRecord>,
    },
    ConnectionStateChanged {
        connection_key: ConnectionKey,
        previous: Option<ConnectionState>,
        state: ConnectionState,
        metadata: ConnectionMetadata,
    },
    /// Instructs `peer_id` to begin (initiator) or accept a negotiation
    CreateConnection {
        connection_key: ConnectionKey,
        peer_id: String,
        remote_peer_id: String,
        initiator: bool,
        config: serde_json::Value,
    },
    /// Instructs the app to push a payload over an established link
    SendMessage {
        message_id: String,
        target_peer: String,
        via: ConnectionKey,
        message_type: String,
        payload: serde_json::Value,
        replayed: bool,
    },
    DataBroadcast { record: DataRecord },
    PeerEvicted { peer_id: String },
    MaintenanceCompleted { report: CycleReport },
    /// A durable write or read failed; the in-memory effect still applied
    StoreFailure { operation: String, error: String },
    /// A command was refused; the coordinator keeps running
    CommandRejected { command: String, error: String },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::PeerAnnouncement { .. } => "peer-announcement",
            Notification::SignalReceived { .. } => "signal-received",
            Notification::CandidateReceived { .. } => "candidate-received",
            Notification::CandidatesReleased { .. } => "candidates-released",
            Notification::ConnectionStateChanged { .. } => "connection-state-changed",
            Notification::CreateConnection { .. } => "create-connection",
            Notification::SendMessage { .. } => "send-message",
            Notification::DataBroadcast { .. } => "data-broadcast",
            Notification::PeerEvicted { .. } => "peer-evicted",
            Notification::MaintenanceCompleted { .. } => "maintenance-completed",
            Notification::StoreFailure { .. } => "store-failure",
            Notification::CommandRejected { .. } => "command-rejected",
        }
    }
}

/// Callback interface for application-layer listeners
pub trait NotificationListener: Send + Sync {
    fn on_notification(&self, notification: &Notification) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct NotificationHub {
    listeners: Vec<(ListenerId, Arc<dyn NotificationListener>)>,
    next_id: u64,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: Arc<dyn NotificationListener>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    /// Deliver to every listener; returns how many accepted it.
    pub fn publish(&self, notification: Notification) -> usize {
        let mut delivered = 0;
        for (id, listener) in &self.listeners {
            match listener.on_notification(&notification) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "Listener {:?} failed on {}: {}",
                    id,
                    notification.kind(),
                    e
                ),
            }
        }
        delivered
    }
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Forwards notifications into an unbounded channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelListener {
    pub fn new(tx: mpsc::UnboundedSender<Notification>) -> Self {
        Self { tx }
    }

    /// Listener plus the receiving end of its channel.
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(tx)), rx)
    }
}

impl NotificationListener for ChannelListener {
    fn on_notification(&self, notification: &Notification) -> Result<(), String> {
        self.tx
            .send(notification.clone())
            .map_err(|_| "notification channel closed".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Failing;

    impl NotificationListener for Failing {
        fn on_notification(&self, _: &Notification) -> Result<(), String> {
            Err("boom".into())
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl NotificationListener for Recording {
        fn on_notification(&self, n: &Notification) -> Result<(), String> {
            self.0.lock().push(n.kind().to_string());
            Ok(())
        }
    }

    fn evicted(id: &str) -> Notification {
        Notification::PeerEvicted {
            peer_id: id.to_string(),
        }
    }

    #[test]
    fn test_failing_listener_does_not_abort_broadcast() {
        let mut hub = NotificationHub::new();
        let recorder = Arc::new(Recording::default());
        hub.subscribe(Arc::new(Failing));
        hub.subscribe(recorder.clone());

        assert_eq!(hub.publish(evicted("a")), 1);
        assert_eq!(*recorder.0.lock(), vec!["peer-evicted".to_string()]);
    }

    #[test]
    fn test_unsubscribe() {
        let mut hub = NotificationHub::new();
        let id = hub.subscribe(Arc::new(Recording::default()));
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        assert_eq!(hub.publish(evicted("a")), 0);
    }

    #[test]
    fn test_channel_listener_reports_closed_channel() {
        let (listener, rx) = ChannelListener::pair();
        drop(rx);
        assert!(listener.on_notification(&evicted("a")).is_err());
    }

    #[test]
    fn test_wire_tag_matches_kind() {
        let json = serde_json::to_value(evicted("a")).unwrap();
        assert_eq!(json["type"], "peer-evicted");
    }
}
