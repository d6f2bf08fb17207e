// Maintenance: the periodic cycle, topology passes, deferred announcement
// pairings and retention.

use std::time::Duration;
use tracing::{debug, info, warn};

use super::Coordinator;
use crate::connection::ConnectionState;
use crate::data::DataRecord;
use crate::maintenance::{CycleReport, RetentionReport};
use crate::notify::Notification;
use crate::router::PendingMessage;
use crate::signaling::{CandidateRecord, SignalRecord};
use crate::topology::{self, TopologyPlan};

impl Coordinator {
    /// Run one maintenance cycle. Eviction, the connecting timeout and the
    /// online check always run; topology and retention are probabilistic.
    pub async fn run_maintenance_cycle(&mut self) -> CycleReport {
        let now = self.now();
        let plan = self.scheduler.begin_cycle(now, &mut self.rng);
        debug!("Maintenance cycle {} starting", plan.cycle);

        let evicted_peers = self.evict_expired_peers().await;
        let timed_out = self.fail_stalled_connections().await;
        let online = self.scheduler.update_online(
            self.registry.len(),
            self.tracker.count_in(ConnectionState::Connected),
        );

        let proposals = if plan.run_topology {
            self.optimize_topology().await.proposals.len()
        } else {
            0
        };
        let retention = if plan.run_retention {
            self.purge_expired().await
        } else {
            RetentionReport::default()
        };

        let report = CycleReport {
            cycle: plan.cycle,
            evicted_peers,
            timed_out,
            online,
            ran_topology: plan.run_topology,
            proposals,
            ran_retention: plan.run_retention,
            retention,
        };
        info!(
            "Maintenance cycle {}: {} evicted, {} timed out, online={}",
            report.cycle,
            report.evicted_peers.len(),
            report.timed_out,
            report.online
        );
        self.publish(Notification::MaintenanceCompleted {
            report: report.clone(),
        });
        report
    }

    /// Application-requested cleanup: stale peers and expired records.
    pub async fn cleanup(&mut self) -> (Vec<String>, RetentionReport) {
        let evicted = self.evict_expired_peers().await;
        let retention = self.purge_expired().await;
        (evicted, retention)
    }

    /// Plan a topology pass and start a connection for every proposal.
    pub async fn optimize_topology(&mut self) -> TopologyPlan {
        let now = self.now();
        let active: Vec<String> = self
            .registry
            .list_active(now, self.config.topology.active_window_ms, usize::MAX)
            .into_iter()
            .map(|p| p.peer_id)
            .collect();
        let plan = topology::plan(&active, &self.tracker, &self.config.topology, &mut self.rng);

        for proposal in &plan.proposals {
            if let Err(e) = self
                .initiate_connection(&proposal.initiator, &proposal.responder, None)
                .await
            {
                warn!(
                    "Topology proposal {} -> {} failed: {}",
                    proposal.initiator, proposal.responder, e
                );
            }
        }
        info!(
            "Topology pass: {} active, degree target {}, {} proposals",
            plan.active_peers,
            plan.target_degree,
            plan.proposals.len()
        );
        plan
    }

    /// Start every announcement pairing whose jitter has elapsed.
    pub async fn run_deferred(&mut self) -> usize {
        let now = self.now();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|a| a.due_at <= now);
        self.deferred = waiting;

        let mut started = 0;
        for attempt in due {
            if !self.registry.contains(&attempt.initiator) || !self.registry.contains(&attempt.responder) {
                continue;
            }
            match self
                .initiate_connection(&attempt.initiator, &attempt.responder, None)
                .await
            {
                Ok(_) => started += 1,
                Err(e) => debug!(
                    "Announcement pairing {} -> {} skipped: {}",
                    attempt.initiator, attempt.responder, e
                ),
            }
        }
        started
    }

    /// Time until the next deferred pairing is due.
    pub fn next_deferred_delay(&self) -> Option<Duration> {
        let now = self.now();
        self.deferred
            .iter()
            .map(|a| a.due_at)
            .min()
            .map(|due| Duration::from_millis(due.saturating_sub(now)))
    }

    /// Drop records past their retention window.
    pub async fn purge_expired(&mut self) -> RetentionReport {
        let now = self.now();
        let signal_cutoff = now.saturating_sub(self.config.retention.signal_ttl_ms);
        let data_cutoff = now.saturating_sub(self.config.retention.data_ttl_ms);

        let expired_queued = self.relay.expire(signal_cutoff);
        if expired_queued > 0 {
            debug!("Expired {} queued candidates", expired_queued);
        }

        let signals = self.store.purge_older_than::<SignalRecord>(signal_cutoff).await;
        let candidates = self
            .store
            .purge_older_than::<CandidateRecord>(signal_cutoff)
            .await;
        let messages = self
            .store
            .purge_older_than::<PendingMessage>(data_cutoff)
            .await;
        let data = self.store.purge_older_than::<DataRecord>(data_cutoff).await;

        let report = RetentionReport {
            signals: self.note_store("purge signals", signals).unwrap_or(0),
            candidates: self.note_store("purge candidates", candidates).unwrap_or(0),
            messages: self.note_store("purge messages", messages).unwrap_or(0),
            data: self.note_store("purge data", data).unwrap_or(0),
        };
        if report.total() > 0 {
            info!("Retention removed {} records", report.total());
        }
        report
    }
}
