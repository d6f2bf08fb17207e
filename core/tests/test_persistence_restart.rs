use peermesh_core::{
    ChannelListener, ConnectionState, Coordinator, CoordinatorConfig, ManualClock, Notification,
    PeerRecord, SledStorage, StorageBackend,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use std::sync::Arc;

const T0: u64 = 1_700_000_000_000;

// Both instances share one sled handle; reopening the path can race the old
// handle's flusher for the file lock.
fn sled_backend(dir: &tempfile::TempDir) -> Arc<dyn StorageBackend> {
    Arc::new(SledStorage::open(dir.path().to_str().unwrap()).unwrap())
}

fn open(backend: &Arc<dyn StorageBackend>, clock: &ManualClock) -> Coordinator {
    let mut config = CoordinatorConfig::default();
    config.maintenance.topology_probability = 0.0;
    config.maintenance.retention_probability = 0.0;
    Coordinator::new(config, backend.clone())
        .with_clock(Arc::new(clock.clone()))
        .with_rng(StdRng::seed_from_u64(3))
}

#[tokio::test]
async fn test_state_is_rebuilt_lazily_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let backend = sled_backend(&dir);
    let clock = ManualClock::new(T0);

    // First instance: two peers mid-negotiation and one stored message
    {
        let mut node = open(&backend, &clock);
        node.register_peer(&json!({"id": "A", "nickname": "alice"}))
            .await
            .unwrap();
        node.register_peer(&json!({"id": "B"})).await.unwrap();
        node.relay_offer(Some("A"), Some("B"), json!({"sdp": "o"}))
            .await
            .unwrap();
        node.relay_answer(Some("B"), Some("A"), json!({"sdp": "a"}))
            .await
            .unwrap();
        node.route("B", "chat", json!("kept")).await.unwrap();
        node.store().flush().await.unwrap();
    }
    // node dropped here; only the store survives

    // Second instance: nothing cached until touched
    clock.advance(1_000);
    let mut node = open(&backend, &clock);
    let (listener, mut events) = ChannelListener::pair();
    node.subscribe(listener);
    assert_eq!(node.peer_count(), 0);
    assert!(node.connection("A", "B").is_none());

    let a = node.peer_record("A").await.unwrap();
    assert_eq!(a.first_seen, T0);
    assert_eq!(a.metadata["nickname"], "alice");

    // the stored entry is still `connecting`, so `connected` is legal
    node.update_connection_state("A", Some("B"), ConnectionState::Connected, None)
        .await
        .unwrap();
    let replayed: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|n| match n {
            Notification::SendMessage {
                payload,
                replayed: true,
                ..
            } => Some(payload),
            _ => None,
        })
        .collect();
    assert_eq!(replayed, vec![json!("kept")]);

    let pending = node.pending_signals("B", 10).await.unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn test_persisted_stale_peers_are_evicted_without_being_touched() {
    let dir = tempfile::tempdir().unwrap();
    let backend = sled_backend(&dir);
    let clock = ManualClock::new(T0);

    {
        let mut node = open(&backend, &clock);
        node.register_peer(&json!({"id": "ghost"})).await.unwrap();
        node.store().flush().await.unwrap();
    }

    clock.advance(11 * 60 * 1000);
    let mut node = open(&backend, &clock);
    let report = node.run_maintenance_cycle().await;
    assert_eq!(report.evicted_peers, vec!["ghost".to_string()]);
    assert!(node
        .store()
        .get::<PeerRecord>("ghost")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_reregistration_after_restart_keeps_first_seen() {
    let dir = tempfile::tempdir().unwrap();
    let backend = sled_backend(&dir);
    let clock = ManualClock::new(T0);

    {
        let mut node = open(&backend, &clock);
        node.register_peer(&json!({"id": "A"})).await.unwrap();
        node.store().flush().await.unwrap();
    }

    clock.advance(5_000);
    let mut node = open(&backend, &clock);
    let again = node.register_peer(&json!({"id": "A"})).await.unwrap();
    assert_eq!(again.first_seen, T0);
    assert_eq!(again.last_seen, T0 + 5_000);

    let stored = node.store().count::<PeerRecord>().await.unwrap();
    assert_eq!(stored, 1);
}

#[tokio::test]
async fn test_state_update_without_remote_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let backend = sled_backend(&dir);
    let clock = ManualClock::new(T0);

    {
        let mut node = open(&backend, &clock);
        node.initiate_connection("A", "B", None).await.unwrap();
        node.update_connection_state("A", Some("B"), ConnectionState::Connecting, None)
            .await
            .unwrap();
        node.store().flush().await.unwrap();
    }

    clock.advance(1_000);
    let mut node = open(&backend, &clock);
    assert!(node.connection("A", "B").is_none());

    let updated = node
        .update_connection_state("B", None, ConnectionState::Connected, None)
        .await
        .unwrap();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].key.peers(), ("A", "B"));
    assert_eq!(
        node.connection("A", "B").unwrap().state,
        ConnectionState::Connected
    );
}
