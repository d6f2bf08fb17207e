// PeerMesh Core — node-local mesh coordinator
//
// Tracks known peers, relays connection-setup signaling between them, keeps
// one lifecycle entry per peer pair, nudges the mesh toward a bounded degree
// and routes application messages with store-and-forward fallback.

pub mod clock;
pub mod command;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod data;
pub mod maintenance;
pub mod notify;
pub mod peer;
pub mod router;
pub mod signaling;
pub mod store;
pub mod topology;

use thiserror::Error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{Command, Reply, StatusSnapshot};
pub use config::CoordinatorConfig;
pub use connection::{ConnectionEntry, ConnectionKey, ConnectionMetadata, ConnectionState};
pub use coordinator::{Coordinator, CoordinatorHandle};
pub use notify::{ChannelListener, Notification, NotificationListener};
pub use peer::PeerRecord;
pub use router::{PendingMessage, RouteOutcome};
pub use signaling::{CandidateRecord, SignalRecord, SignalType};
pub use store::{MemoryStorage, RecordStore, SledStorage, StorageBackend, StoreError};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoordinatorError {
    #[error("no peer identity could be derived")]
    InvalidPeer,
    #[error("signaling has no target peer")]
    MissingTarget,
    #[error("peer {0} cannot connect to itself")]
    SelfConnection(String),
    #[error("illegal connection transition {from} -> {to}")]
    IllegalTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("no connection entry for {0}")]
    UnknownConnection(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("malformed command: {0}")]
    MalformedCommand(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("coordinator stopped")]
    Stopped,
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        CoordinatorError::StoreUnavailable(err.to_string())
    }
}
