//! Topology Optimizer — nudges the local view of the mesh toward a target degree
//!
//! Planning is pure: it reads the registry's active set and the tracker's
//! snapshot and returns proposals. The coordinator turns proposals into
//! connection attempts. Randomness is injected so tests can pin outcomes.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::TopologyConfig;
use crate::connection::{ConnectionKey, ConnectionState, ConnectionTracker};

/// `clamp(floor(sqrt(active)), min, max)`.
pub fn target_degree(active: usize, min_degree: usize, max_degree: usize) -> usize {
    let root = (active as f64).sqrt().floor() as usize;
    root.clamp(min_degree, max_degree.max(min_degree))
}

/// A pair the optimizer wants connected, `initiator` driving the offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub initiator: String,
    pub responder: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyPlan {
    pub active_peers: usize,
    pub target_degree: usize,
    pub connected: usize,
    pub deficit: usize,
    pub proposals: Vec<Proposal>,
}

/// A deferred announcement pairing, due after a jitter delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledAttempt {
    pub initiator: String,
    pub responder: String,
    pub jitter_ms: u64,
    pub due_at: u64,
}

/// Plan one optimization pass.
///
/// Each deficit slot is assigned to an active peer that has no connection
/// entry yet; that peer is paired with another active peer it has no entry
/// with, and the partner initiates. Slots without an eligible partner are
/// skipped.
pub fn plan<R: Rng + ?Sized>(
    active: &[String],
    tracker: &ConnectionTracker,
    config: &TopologyConfig,
    rng: &mut R,
) -> TopologyPlan {
    let target = target_degree(active.len(), config.min_degree, config.max_degree);
    let connected = tracker.count_in(ConnectionState::Connected);
    let deficit = target.saturating_sub(connected);

    let mut plan = TopologyPlan {
        active_peers: active.len(),
        target_degree: target,
        connected,
        deficit,
        proposals: Vec::new(),
    };
    if deficit == 0 || active.len() < 2 {
        return plan;
    }

    let mut unattached: Vec<&String> = active
        .iter()
        .filter(|p| !tracker.has_any_entry(p))
        .collect();
    unattached.shuffle(rng);

    let mut proposed: HashSet<ConnectionKey> = HashSet::new();
    for peer in unattached.into_iter().take(deficit) {
        let partners: Vec<&String> = active
            .iter()
            .filter(|other| *other != peer)
            .filter(|other| match ConnectionKey::new(peer, other) {
                Ok(key) => !tracker.contains(&key) && !proposed.contains(&key),
                Err(_) => false,
            })
            .collect();

        let Some(partner) = partners.choose(rng) else {
            continue;
        };
        if let Ok(key) = ConnectionKey::new(peer, partner) {
            proposed.insert(key);
        }
        plan.proposals.push(Proposal {
            initiator: (*partner).clone(),
            responder: peer.clone(),
        });
    }

    plan
}

/// Pick recently seen peers for a newly announced peer to connect to, each
/// with its own random delay so simultaneous discoveries do not stampede.
///
/// `recent` must be ordered most recent first.
pub fn announcement_attempts<R: Rng + ?Sized>(
    announcer: &str,
    recent: &[String],
    tracker: &ConnectionTracker,
    config: &TopologyConfig,
    now: u64,
    rng: &mut R,
) -> Vec<ScheduledAttempt> {
    recent
        .iter()
        .filter(|peer| peer.as_str() != announcer)
        .filter(|peer| match ConnectionKey::new(announcer, peer) {
            Ok(key) => tracker.get(&key).map_or(true, |e| e.state.is_retryable()),
            Err(_) => false,
        })
        .take(config.announce_fanout)
        .map(|peer| {
            let jitter_ms = rng.gen_range(0..=config.announce_jitter_ms);
            ScheduledAttempt {
                initiator: announcer.to_string(),
                responder: peer.clone(),
                jitter_ms,
                due_at: now + jitter_ms,
            }
        })
        .collect()
}
