//! Maintenance Scheduler — periodic eviction, status and probabilistic upkeep
//!
//! Each cycle always evicts stale peers and recomputes online status. The
//! optimizer and bulk retention run only on a fraction of cycles so their cost
//! is spread out over time.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::MaintenanceConfig;

/// What a single maintenance cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub evicted_peers: Vec<String>,
    pub timed_out: usize,
    pub online: bool,
    pub ran_topology: bool,
    pub proposals: usize,
    pub ran_retention: bool,
    pub retention: RetentionReport,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub signals: usize,
    pub candidates: usize,
    pub messages: usize,
    pub data: usize,
}

impl RetentionReport {
    pub fn total(&self) -> usize {
        self.signals + self.candidates + self.messages + self.data
    }
}

/// Which optional steps a cycle should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclePlan {
    pub cycle: u64,
    pub run_topology: bool,
    pub run_retention: bool,
}

#[derive(Debug, Clone)]
pub struct MaintenanceScheduler {
    config: MaintenanceConfig,
    cycles: u64,
    last_run_at: Option<u64>,
    online: bool,
}

/// Bernoulli trial that tolerates out-of-range probabilities.
fn roll<R: Rng + ?Sized>(rng: &mut R, probability: f64) -> bool {
    if probability.is_nan() || probability <= 0.0 {
        false
    } else if probability >= 1.0 {
        true
    } else {
        rng.gen_bool(probability)
    }
}

impl MaintenanceScheduler {
    pub fn new(config: MaintenanceConfig) -> Self {
        Self {
            config,
            cycles: 0,
            last_run_at: None,
            online: false,
        }
    }

    /// Start a cycle and decide its optional steps.
    pub fn begin_cycle<R: Rng + ?Sized>(&mut self, now: u64, rng: &mut R) -> CyclePlan {
        self.cycles += 1;
        self.last_run_at = Some(now);
        CyclePlan {
            cycle: self.cycles,
            run_topology: roll(rng, self.config.topology_probability),
            run_retention: roll(rng, self.config.retention_probability),
        }
    }

    /// Online status from local counts only.
    pub fn update_online(&mut self, known_peers: usize, connected_links: usize) -> bool {
        self.online = known_peers > 0 || connected_links > 0;
        self.online
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn last_run_at(&self) -> Option<u64> {
        self.last_run_at
    }

    /// Cutoff before which peers count as stale.
    pub fn stale_cutoff(&self, now: u64) -> u64 {
        now.saturating_sub(self.config.peer_max_age_ms)
    }

    /// Cutoff before which `connecting` entries are treated as failed.
    pub fn connecting_cutoff(&self, now: u64) -> u64 {
        now.saturating_sub(self.config.connecting_timeout_ms)
    }
}
