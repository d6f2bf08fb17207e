// Coordinator configuration
//
// Every field has a design default; hosts override individual values via
// serde (the CLI persists this as JSON).

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Maintenance timings and probabilities
    pub maintenance: MaintenanceConfig,
    /// Topology optimizer bounds
    pub topology: TopologyConfig,
    /// Retention windows for transient and application records
    pub retention: RetentionConfig,
    /// Default list bounds for snapshot commands
    pub limits: ListLimits,
    /// Opaque negotiation config handed to the app in create-connection
    pub negotiation: serde_json::Value,
    /// Fixed RNG seed; `None` seeds from OS entropy
    pub rng_seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Interval between maintenance cycles (milliseconds)
    pub interval_ms: u64,
    /// Peers idle longer than this are evicted (milliseconds)
    pub peer_max_age_ms: u64,
    /// Probability that a cycle runs the topology optimizer
    pub topology_probability: f64,
    /// Probability that a cycle runs bulk retention cleanup
    pub retention_probability: f64,
    /// Entries stuck in `connecting` longer than this are failed (milliseconds)
    pub connecting_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Peers seen within this window count as active (milliseconds)
    pub active_window_ms: u64,
    pub min_degree: usize,
    pub max_degree: usize,
    /// How many recent peers a newly announced peer is paired with
    pub announce_fanout: usize,
    /// Upper bound of the random delay before an announcement pairing (milliseconds)
    pub announce_jitter_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Signal and candidate records older than this are purged (milliseconds)
    pub signal_ttl_ms: u64,
    /// Application data and pending messages older than this are purged (milliseconds)
    pub data_ttl_ms: u64,
    /// Candidates held per queue before the oldest are trimmed
    pub max_queued_candidates: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListLimits {
    pub peers: usize,
    pub signals: usize,
    pub messages: usize,
    pub data: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            maintenance: MaintenanceConfig::default(),
            topology: TopologyConfig::default(),
            retention: RetentionConfig::default(),
            limits: ListLimits::default(),
            negotiation: serde_json::json!({
                "ice_servers": ["stun:stun.l.google.com:19302"],
            }),
            rng_seed: None,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2 * 60 * 1000,      // 2 minutes
            peer_max_age_ms: 10 * 60 * 1000, // 10 minutes
            topology_probability: 0.2,
            retention_probability: 0.1,
            connecting_timeout_ms: 60 * 1000,
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            active_window_ms: 2 * 60 * 1000,
            min_degree: 3,
            max_degree: 6,
            announce_fanout: 3,
            announce_jitter_ms: 3000,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            signal_ttl_ms: 60 * 60 * 1000,        // 1 hour
            data_ttl_ms: 7 * 24 * 60 * 60 * 1000, // 7 days
            max_queued_candidates: 64,
        }
    }
}

impl Default for ListLimits {
    fn default() -> Self {
        Self {
            peers: 20,
            signals: 50,
            messages: 50,
            data: 50,
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_design_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.maintenance.interval_ms, 120_000);
        assert_eq!(config.maintenance.peer_max_age_ms, 600_000);
        assert_eq!(config.topology.active_window_ms, 120_000);
        assert_eq!(config.topology.announce_jitter_ms, 3000);
        assert_eq!(config.retention.signal_ttl_ms, 3_600_000);
        assert_eq!(config.retention.data_ttl_ms, 604_800_000);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"maintenance": {"topology_probability": 1.0}}"#).unwrap();
        assert_eq!(config.maintenance.topology_probability, 1.0);
        assert_eq!(config.maintenance.retention_probability, 0.1);
        assert_eq!(config.topology.max_degree, 6);
    }
}
