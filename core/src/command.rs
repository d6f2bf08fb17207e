//! Command surface consumed by the coordinator
//!
//! Commands arrive as a closed enumeration. On the JSON wire they use the
//! `{"type": "...", "data": ...}` envelope; unrecognised types are rejected
//! with `CoordinatorError::UnknownCommand` instead of being dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::{ConnectionMetadata, ConnectionState};
use crate::data::DataRecord;
use crate::peer::PeerRecord;
use crate::router::PendingMessage;
use crate::signaling::SignalRecord;
use crate::CoordinatorError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Command {
    /// Peer data carrying an identity (`peer_id`, `peerId` or `id`)
    RegisterPeer(Value),
    TouchPeer {
        peer_id: String,
    },
    RelayOffer {
        from: Option<String>,
        to: Option<String>,
        #[serde(default)]
        payload: Value,
    },
    RelayAnswer {
        from: Option<String>,
        to: Option<String>,
        #[serde(default)]
        payload: Value,
    },
    RelayCandidate {
        from: Option<String>,
        to: Option<String>,
        #[serde(default)]
        candidate: Value,
    },
    UpdateConnectionState {
        peer_id: String,
        /// Other side of the pair; without it every entry touching `peer_id` is updated
        #[serde(default)]
        remote_peer_id: Option<String>,
        state: ConnectionState,
        #[serde(default)]
        metadata: Option<ConnectionMetadata>,
    },
    SendMessage {
        target_peer_id: String,
        #[serde(default = "default_message_type")]
        message_type: String,
        #[serde(default)]
        payload: Value,
    },
    InitiateConnection {
        source_peer_id: String,
        target_peer_id: String,
        #[serde(default)]
        initiator_id: Option<String>,
    },
    TeardownConnection {
        peer_id: String,
        remote_peer_id: String,
    },
    /// Application record to keep and broadcast
    StoreData(Value),
    GetStatus,
    GetSignals {
        /// Restrict to unprocessed signals addressed to this peer
        #[serde(default)]
        peer_id: Option<String>,
        #[serde(default)]
        limit: Option<usize>,
        /// Flag returned signals as processed
        #[serde(default)]
        mark_processed: bool,
    },
    GetPeers {
        #[serde(default)]
        limit: Option<usize>,
    },
    GetMessages {
        #[serde(default)]
        target_peer_id: Option<String>,
        #[serde(default)]
        limit: Option<usize>,
    },
    GetData {
        #[serde(default)]
        limit: Option<usize>,
    },
    Cleanup,
    OptimizeTopology,
    /// Synthetic maintenance tick
    Discover,
}

fn default_message_type() -> String {
    "message".to_string()
}

impl Command {
    pub const NAMES: [&'static str; 18] = [
        "register-peer",
        "touch-peer",
        "relay-offer",
        "relay-answer",
        "relay-candidate",
        "update-connection-state",
        "send-message",
        "initiate-connection",
        "teardown-connection",
        "store-data",
        "get-status",
        "get-signals",
        "get-peers",
        "get-messages",
        "get-data",
        "cleanup",
        "optimize-topology",
        "discover",
    ];

    /// Query commands whose `data` may be omitted entirely.
    const OPTIONAL_DATA: [&'static str; 4] = ["get-signals", "get-peers", "get-messages", "get-data"];

    pub fn name(&self) -> &'static str {
        match self {
            Command::RegisterPeer(_) => "register-peer",
            Command::TouchPeer { .. } => "touch-peer",
            Command::RelayOffer { .. } => "relay-offer",
            Command::RelayAnswer { .. } => "relay-answer",
            Command::RelayCandidate { .. } => "relay-candidate",
            Command::UpdateConnectionState { .. } => "update-connection-state",
            Command::SendMessage { .. } => "send-message",
            Command::InitiateConnection { .. } => "initiate-connection",
            Command::TeardownConnection { .. } => "teardown-connection",
            Command::StoreData(_) => "store-data",
            Command::GetStatus => "get-status",
            Command::GetSignals { .. } => "get-signals",
            Command::GetPeers { .. } => "get-peers",
            Command::GetMessages { .. } => "get-messages",
            Command::GetData { .. } => "get-data",
            Command::Cleanup => "cleanup",
            Command::OptimizeTopology => "optimize-topology",
            Command::Discover => "discover",
        }
    }

    /// Parse a JSON envelope into a command.
    pub fn from_json(text: &str) -> Result<Self, CoordinatorError> {
        let mut envelope: Value = serde_json::from_str(text)
            .map_err(|e| CoordinatorError::MalformedCommand(e.to_string()))?;

        let name = envelope
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CoordinatorError::MalformedCommand("missing command type".into()))?
            .to_string();
        if !Self::NAMES.contains(&name.as_str()) {
            return Err(CoordinatorError::UnknownCommand(name));
        }

        if Self::OPTIONAL_DATA.contains(&name.as_str()) {
            if let Some(fields) = envelope.as_object_mut() {
                fields
                    .entry("data")
                    .or_insert_with(|| Value::Object(Default::default()));
            }
        }

        serde_json::from_value(envelope)
            .map_err(|e| CoordinatorError::MalformedCommand(format!("{}: {}", name, e)))
    }
}

/// Aggregate counters returned by `get-status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub peers: usize,
    pub active_peers: usize,
    pub connections: usize,
    pub connected: usize,
    pub pending_signals: usize,
    pub queued_candidates: usize,
    pub pending_messages: usize,
    pub online: bool,
    pub uptime_ms: u64,
    pub store_ready: bool,
    pub maintenance_cycles: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Reply {
    Status(StatusSnapshot),
    Signals(Vec<SignalRecord>),
    Peers(Vec<PeerRecord>),
    Messages(Vec<PendingMessage>),
    Data(Vec<DataRecord>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_register_with_raw_peer_data() {
        let cmd = Command::from_json(r#"{"type":"register-peer","data":{"id":"alice","caps":1}}"#)
            .unwrap();
        assert_eq!(cmd, Command::RegisterPeer(json!({"id": "alice", "caps": 1})));
    }

    #[test]
    fn test_parse_unit_and_defaulted_commands() {
        assert_eq!(
            Command::from_json(r#"{"type":"get-status"}"#).unwrap(),
            Command::GetStatus
        );
        assert_eq!(
            Command::from_json(r#"{"type":"get-peers"}"#).unwrap(),
            Command::GetPeers { limit: None }
        );
        assert_eq!(
            Command::from_json(r#"{"type":"send-message","data":{"target_peer_id":"b"}}"#).unwrap(),
            Command::SendMessage {
                target_peer_id: "b".into(),
                message_type: "message".into(),
                payload: Value::Null,
            }
        );
    }

    #[test]
    fn test_parse_relay_without_target() {
        let cmd = Command::from_json(r#"{"type":"relay-offer","data":{"from":"a","payload":{}}}"#)
            .unwrap();
        assert!(matches!(cmd, Command::RelayOffer { to: None, .. }));
    }

    #[test]
    fn test_unknown_command_is_typed() {
        let err = Command::from_json(r#"{"type":"STORE_PRAYER","data":{}}"#).unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownCommand(name) if name == "STORE_PRAYER"));
    }

    #[test]
    fn test_malformed_command() {
        assert!(matches!(
            Command::from_json("not json"),
            Err(CoordinatorError::MalformedCommand(_))
        ));
        assert!(matches!(
            Command::from_json(r#"{"type":"update-connection-state","data":{"peer_id":"a","state":"exploded"}}"#),
            Err(CoordinatorError::MalformedCommand(_))
        ));
    }

    #[test]
    fn test_every_command_name_is_listed() {
        let samples = [
            Command::GetStatus,
            Command::Cleanup,
            Command::OptimizeTopology,
            Command::Discover,
            Command::StoreData(Value::Null),
            Command::GetData { limit: None },
        ];
        for cmd in samples {
            assert!(Command::NAMES.contains(&cmd.name()));
            let wire = serde_json::to_value(&cmd).unwrap();
            assert_eq!(wire["type"], cmd.name());
        }
    }
}
