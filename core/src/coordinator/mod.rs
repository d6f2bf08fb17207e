//! Coordinator — single owner of the registry, tracker and candidate queues
//!
//! Every inbound event (application command, relayed signaling, maintenance
//! tick) is handled by `&mut self` on one task, so in-memory mutations never
//! race. Store calls are awaited inside a handler; a failed store call is
//! reported as a `StoreFailure` notification and the in-memory effect stands.

mod connections;
mod handle;
mod peers;
mod routing;
mod signals;
mod upkeep;

pub use handle::CoordinatorHandle;

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::command::{Command, Reply, StatusSnapshot};
use crate::config::CoordinatorConfig;
use crate::connection::{ConnectionEntry, ConnectionKey, ConnectionState, ConnectionTracker};
use crate::maintenance::MaintenanceScheduler;
use crate::notify::{ListenerId, Notification, NotificationHub, NotificationListener};
use crate::peer::{PeerRecord, PeerRegistry};
use crate::router::{MessageRouter, PendingMessage};
use crate::signaling::{SignalRecord, SignalingRelay};
use crate::store::{Record, RecordStore, StorageBackend, StoreError};
use crate::topology::ScheduledAttempt;
use crate::CoordinatorError;

pub struct Coordinator {
    config: CoordinatorConfig,
    store: RecordStore,
    clock: Arc<dyn Clock>,
    rng: StdRng,
    registry: PeerRegistry,
    relay: SignalingRelay,
    tracker: ConnectionTracker,
    router: MessageRouter,
    scheduler: MaintenanceScheduler,
    hub: NotificationHub,
    /// Announcement pairings waiting out their jitter
    deferred: Vec<ScheduledAttempt>,
    started_at: u64,
    store_ready: bool,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, backend: Arc<dyn StorageBackend>) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let started_at = clock.now_ms();

        Self {
            relay: SignalingRelay::new(config.retention.max_queued_candidates),
            scheduler: MaintenanceScheduler::new(config.maintenance.clone()),
            store: RecordStore::new(backend),
            clock,
            rng,
            registry: PeerRegistry::new(),
            tracker: ConnectionTracker::new(),
            router: MessageRouter::new(),
            hub: NotificationHub::new(),
            deferred: Vec::new(),
            started_at,
            store_ready: true,
            config,
        }
    }

    /// Replace the time source; uptime restarts from the new clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.started_at = clock.now_ms();
        self.clock = clock;
        self
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn subscribe(&mut self, listener: Arc<dyn NotificationListener>) -> ListenerId {
        self.hub.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.hub.unsubscribe(id)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn peer(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.registry.get(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    /// In-memory entry for the pair, in either argument order.
    pub fn connection(&self, a: &str, b: &str) -> Option<&ConnectionEntry> {
        let key = ConnectionKey::new(a, b).ok()?;
        self.tracker.get(&key)
    }

    pub fn connections_touching(&self, peer_id: &str) -> Vec<&ConnectionEntry> {
        self.tracker.touching(peer_id)
    }

    pub fn queued_candidate_count(&self) -> usize {
        self.relay.queued_total()
    }

    /// Whether any queued candidate is addressed to or from `peer_id`.
    pub fn has_queued_candidates_for(&self, peer_id: &str) -> bool {
        self.relay.references(peer_id)
    }

    pub fn deferred_attempts(&self) -> &[ScheduledAttempt] {
        &self.deferred
    }

    pub fn router_stats(&self) -> MessageRouter {
        self.router
    }

    pub fn is_online(&self) -> bool {
        self.scheduler.is_online()
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Handle one command. Store failures are reported through notifications;
    /// only validation failures and failed reads come back as errors.
    pub async fn handle(&mut self, command: Command) -> Result<Option<Reply>, CoordinatorError> {
        match command {
            Command::RegisterPeer(data) => {
                self.register_peer(&data).await?;
                Ok(None)
            }
            Command::TouchPeer { peer_id } => {
                self.touch_peer(&peer_id).await?;
                Ok(None)
            }
            Command::RelayOffer { from, to, payload } => {
                self.relay_offer(from.as_deref(), to.as_deref(), payload).await?;
                Ok(None)
            }
            Command::RelayAnswer { from, to, payload } => {
                self.relay_answer(from.as_deref(), to.as_deref(), payload).await?;
                Ok(None)
            }
            Command::RelayCandidate { from, to, candidate } => {
                self.relay_candidate(from.as_deref(), to.as_deref(), candidate).await?;
                Ok(None)
            }
            Command::UpdateConnectionState {
                peer_id,
                remote_peer_id,
                state,
                metadata,
            } => {
                self.update_connection_state(&peer_id, remote_peer_id.as_deref(), state, metadata)
                    .await?;
                Ok(None)
            }
            Command::SendMessage {
                target_peer_id,
                message_type,
                payload,
            } => {
                self.route(&target_peer_id, &message_type, payload).await?;
                Ok(None)
            }
            Command::InitiateConnection {
                source_peer_id,
                target_peer_id,
                initiator_id,
            } => {
                self.initiate_connection(&source_peer_id, &target_peer_id, initiator_id.as_deref())
                    .await?;
                Ok(None)
            }
            Command::TeardownConnection {
                peer_id,
                remote_peer_id,
            } => {
                self.teardown_connection(&peer_id, &remote_peer_id).await?;
                Ok(None)
            }
            Command::StoreData(input) => {
                self.store_data(input).await;
                Ok(None)
            }
            Command::GetStatus => Ok(Some(Reply::Status(self.status().await))),
            Command::GetSignals {
                peer_id,
                limit,
                mark_processed,
            } => {
                let limit = limit.unwrap_or(self.config.limits.signals);
                let signals = self
                    .signals_snapshot(peer_id.as_deref(), limit, mark_processed)
                    .await?;
                Ok(Some(Reply::Signals(signals)))
            }
            Command::GetPeers { limit } => {
                let limit = limit.unwrap_or(self.config.limits.peers);
                Ok(Some(Reply::Peers(self.peers_snapshot(limit).await)))
            }
            Command::GetMessages {
                target_peer_id,
                limit,
            } => {
                let limit = limit.unwrap_or(self.config.limits.messages);
                let messages = self
                    .pending_messages(target_peer_id.as_deref(), limit)
                    .await?;
                Ok(Some(Reply::Messages(messages)))
            }
            Command::GetData { limit } => {
                let limit = limit.unwrap_or(self.config.limits.data);
                Ok(Some(Reply::Data(self.list_data(limit).await?)))
            }
            Command::Cleanup => {
                self.cleanup().await;
                Ok(None)
            }
            Command::OptimizeTopology => {
                self.optimize_topology().await;
                Ok(None)
            }
            Command::Discover => {
                self.run_maintenance_cycle().await;
                Ok(None)
            }
        }
    }

    /// Handle a command, turning any error into a `CommandRejected`
    /// notification. Used by the event loop so one bad event never stops it.
    pub async fn dispatch(&mut self, command: Command) -> Result<Option<Reply>, CoordinatorError> {
        let name = command.name();
        let result = self.handle(command).await;
        if let Err(e) = &result {
            self.reject(name, e);
        }
        result
    }

    /// Parse and dispatch a JSON command envelope.
    pub async fn dispatch_json(&mut self, text: &str) -> Result<Option<Reply>, CoordinatorError> {
        match Command::from_json(text) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => {
                let name = match &e {
                    CoordinatorError::UnknownCommand(name) => name.clone(),
                    _ => "unparsed".to_string(),
                };
                self.reject(&name, &e);
                Err(e)
            }
        }
    }

    fn reject(&self, command: &str, error: &CoordinatorError) {
        warn!("Rejected {} command: {}", command, error);
        self.publish(Notification::CommandRejected {
            command: command.to_string(),
            error: error.to_string(),
        });
    }

    fn publish(&self, notification: Notification) {
        debug!("Publishing {}", notification.kind());
        self.hub.publish(notification);
    }

    /// Record the outcome of a store call, surfacing failures as events.
    fn note_store<T>(&mut self, operation: &str, result: Result<T, StoreError>) -> Result<T, CoordinatorError> {
        match result {
            Ok(value) => {
                self.store_ready = true;
                Ok(value)
            }
            Err(e) => {
                self.store_ready = false;
                warn!("Store operation '{}' failed: {}", operation, e);
                self.publish(Notification::StoreFailure {
                    operation: operation.to_string(),
                    error: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    async fn persist<R: Record>(&mut self, operation: &str, record: &R) -> bool {
        let result = self.store.put(record).await;
        self.note_store(operation, result).is_ok()
    }

    async fn forget<R: Record>(&mut self, operation: &str, id: &str) -> bool {
        let result = self.store.remove::<R>(id).await;
        self.note_store(operation, result).unwrap_or(false)
    }

    pub async fn status(&mut self) -> StatusSnapshot {
        let now = self.now();
        let signals = self.store.all::<SignalRecord>(None).await;
        let pending_signals = self
            .note_store("count signals", signals)
            .map(|all| all.iter().filter(|s| !s.processed).count())
            .unwrap_or(0);
        let messages = self.store.count::<PendingMessage>().await;
        let pending_messages = self.note_store("count messages", messages).unwrap_or(0);

        StatusSnapshot {
            peers: self.registry.len(),
            active_peers: self
                .registry
                .list_active(now, self.config.topology.active_window_ms, usize::MAX)
                .len(),
            connections: self.tracker.len(),
            connected: self.tracker.count_in(ConnectionState::Connected),
            pending_signals,
            queued_candidates: self.relay.queued_total(),
            pending_messages,
            online: self.scheduler.is_online(),
            uptime_ms: now.saturating_sub(self.started_at),
            store_ready: self.store_ready,
            maintenance_cycles: self.scheduler.cycles(),
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("peers", &self.registry.len())
            .field("connections", &self.tracker.len())
            .field("queued_candidates", &self.relay.queued_total())
            .field("store_ready", &self.store_ready)
            .finish()
    }
}
