use peermesh_core::{
    ConnectionState, Coordinator, CoordinatorConfig, ManualClock, MemoryStorage, RouteOutcome,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use std::sync::Arc;

const T0: u64 = 1_700_000_000_000;
const HOUR: u64 = 60 * 60 * 1000;

fn node(clock: &ManualClock) -> Coordinator {
    let mut config = CoordinatorConfig::default();
    config.maintenance.topology_probability = 0.0;
    config.maintenance.retention_probability = 0.0;
    Coordinator::new(config, Arc::new(MemoryStorage::new()))
        .with_clock(Arc::new(clock.clone()))
        .with_rng(StdRng::seed_from_u64(9))
}

async fn bring_up(node: &mut Coordinator, a: &str, b: &str) {
    node.initiate_connection(a, b, None).await.unwrap();
    for state in [ConnectionState::Connecting, ConnectionState::Connected] {
        node.update_connection_state(b, Some(a), state, None)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_messages_wait_for_a_link() {
    let clock = ManualClock::new(T0);
    let mut node = node(&clock);

    for n in 0..3 {
        let outcome = node.route("B", "chat", json!({ "n": n })).await.unwrap();
        assert!(matches!(outcome, RouteOutcome::Queued { .. }));
        clock.advance(10);
    }
    let stored = node.pending_messages(Some("B"), 2).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].payload["n"], 2);

    bring_up(&mut node, "A", "B").await;
    assert!(node.pending_messages(Some("B"), 10).await.unwrap().is_empty());
    assert_eq!(node.router_stats().replayed, 3);

    let outcome = node.route("B", "chat", json!({"n": 3})).await.unwrap();
    let RouteOutcome::Delivered { via, .. } = outcome else {
        panic!("expected direct delivery");
    };
    assert!(via.contains("A") && via.contains("B"));
}

#[tokio::test]
async fn test_link_down_falls_back_to_storage() {
    let clock = ManualClock::new(T0);
    let mut node = node(&clock);
    bring_up(&mut node, "A", "B").await;
    node.update_connection_state("A", Some("B"), ConnectionState::Disconnected, None)
        .await
        .unwrap();

    let outcome = node.route("B", "chat", json!("after drop")).await.unwrap();
    assert!(matches!(outcome, RouteOutcome::Queued { .. }));
}

#[tokio::test]
async fn test_messages_for_other_peers_stay_queued() {
    let clock = ManualClock::new(T0);
    let mut node = node(&clock);
    node.route("C", "chat", json!("for c")).await.unwrap();
    bring_up(&mut node, "A", "B").await;

    let left = node.pending_messages(None, 10).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].target_peer, "C");
}

#[tokio::test]
async fn test_signal_retention_window() {
    let clock = ManualClock::new(T0);
    let mut node = node(&clock);
    node.relay_offer(Some("A"), Some("B"), json!({"age": "old"}))
        .await
        .unwrap();
    clock.advance(HOUR / 2);
    node.relay_offer(Some("C"), Some("B"), json!({"age": "young"}))
        .await
        .unwrap();
    clock.advance(HOUR / 2 + 1);

    let retention = node.purge_expired().await;
    assert_eq!(retention.signals, 1);

    let pending = node.pending_signals("B", 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload["age"], "young");
}

#[tokio::test]
async fn test_stored_messages_expire_after_long_retention() {
    let clock = ManualClock::new(T0);
    let mut node = node(&clock);
    node.route("B", "chat", json!("stale")).await.unwrap();
    clock.advance(7 * 24 * HOUR + 1);

    let retention = node.purge_expired().await;
    assert_eq!(retention.messages, 1);
    assert!(node.pending_messages(None, 10).await.unwrap().is_empty());
}
