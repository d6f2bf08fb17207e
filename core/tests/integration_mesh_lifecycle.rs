//! End-to-end walk through a two-peer mesh: registration, announcement,
//! offer/answer relay, link-up and direct delivery.

use peermesh_core::command::Reply;
use peermesh_core::{
    ChannelListener, Command, ConnectionState, Coordinator, CoordinatorConfig, ManualClock,
    MemoryStorage, Notification, RouteOutcome,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

const T0: u64 = 1_700_000_000_000;

fn setup() -> (Coordinator, ManualClock, UnboundedReceiver<Notification>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut config = CoordinatorConfig::default();
    config.maintenance.topology_probability = 0.0;
    config.maintenance.retention_probability = 0.0;

    let clock = ManualClock::new(T0);
    let mut coordinator = Coordinator::new(config, Arc::new(MemoryStorage::new()))
        .with_clock(Arc::new(clock.clone()))
        .with_rng(StdRng::seed_from_u64(2024));
    let (listener, events) = ChannelListener::pair();
    coordinator.subscribe(listener);
    (coordinator, clock, events)
}

fn drain(events: &mut UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(n) = events.try_recv() {
        out.push(n);
    }
    out
}

#[tokio::test]
async fn test_two_peer_lifecycle() {
    let (mut node, clock, mut events) = setup();

    // B was seen recently
    node.register_peer(&json!({"id": "B", "transport": "webrtc"}))
        .await
        .unwrap();
    clock.advance(5_000);
    drain(&mut events);

    // A registers and is announced to B with bounded jitter
    node.register_peer(&json!({"peerId": "A"})).await.unwrap();
    let attempts = drain(&mut events)
        .into_iter()
        .find_map(|n| match n {
            Notification::PeerAnnouncement { peer, attempts } if peer.peer_id == "A" => {
                Some(attempts)
            }
            _ => None,
        })
        .expect("announcement for A");
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].responder, "B");
    assert!(attempts[0].jitter_ms <= 3_000);

    // jitter elapses, the pairing starts
    clock.advance(3_000);
    assert_eq!(node.run_deferred().await, 1);
    let creates = drain(&mut events)
        .into_iter()
        .filter(|n| matches!(n, Notification::CreateConnection { .. }))
        .count();
    assert_eq!(creates, 2);

    // A offers, B answers
    let offer = node
        .relay_offer(Some("A"), Some("B"), json!({"sdp": "offer"}))
        .await
        .unwrap();
    assert_eq!(
        node.connection("A", "B").unwrap().state,
        ConnectionState::Initiating
    );
    let pending = node.pending_signals("B", 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, offer.id);

    node.relay_answer(Some("B"), Some("A"), json!({"sdp": "answer"}))
        .await
        .unwrap();
    assert_eq!(
        node.connection("B", "A").unwrap().state,
        ConnectionState::Connecting
    );

    // before the link is up, messages are stored
    let early = node.route("B", "chat", json!("early")).await.unwrap();
    assert!(matches!(early, RouteOutcome::Queued { .. }));

    node.update_connection_state("A", Some("B"), ConnectionState::Connected, None)
        .await
        .unwrap();
    let replayed = drain(&mut events)
        .into_iter()
        .filter(|n| matches!(n, Notification::SendMessage { replayed: true, .. }))
        .count();
    assert_eq!(replayed, 1);

    // now delivery is direct
    let late = node.route("B", "chat", json!("late")).await.unwrap();
    assert!(matches!(late, RouteOutcome::Delivered { .. }));
    assert!(node.pending_messages(Some("B"), 10).await.unwrap().is_empty());

    let Some(Reply::Status(status)) = node.handle(Command::GetStatus).await.unwrap() else {
        panic!("expected status");
    };
    assert_eq!(status.peers, 2);
    assert_eq!(status.connected, 1);
    assert_eq!(status.pending_messages, 0);
}

#[tokio::test]
async fn test_json_commands_drive_the_same_flow() {
    let (mut node, _clock, mut events) = setup();

    for line in [
        r#"{"type":"register-peer","data":{"id":"A"}}"#,
        r#"{"type":"register-peer","data":{"id":"B"}}"#,
        r#"{"type":"initiate-connection","data":{"source_peer_id":"A","target_peer_id":"B"}}"#,
        r#"{"type":"update-connection-state","data":{"peer_id":"B","remote_peer_id":"A","state":"connecting"}}"#,
        r#"{"type":"update-connection-state","data":{"peer_id":"B","remote_peer_id":"A","state":"connected"}}"#,
        r#"{"type":"send-message","data":{"target_peer_id":"A","payload":{"n":1}}}"#,
    ] {
        node.dispatch_json(line).await.unwrap();
    }

    let delivered = drain(&mut events).into_iter().any(|n| {
        matches!(n, Notification::SendMessage { target_peer, replayed: false, .. } if target_peer == "A")
    });
    assert!(delivered);

    let reply = node
        .dispatch_json(r#"{"type":"get-peers","data":{"limit":1}}"#)
        .await
        .unwrap();
    let Some(Reply::Peers(peers)) = reply else {
        panic!("expected peers");
    };
    assert_eq!(peers.len(), 1);
}

#[tokio::test]
async fn test_entry_states_never_return_to_discovering() {
    let (mut node, _clock, _events) = setup();
    node.initiate_connection("A", "B", None).await.unwrap();
    node.update_connection_state("A", Some("B"), ConnectionState::Failed, None)
        .await
        .unwrap();

    assert!(node
        .update_connection_state("A", Some("B"), ConnectionState::Discovering, None)
        .await
        .is_err());

    // a failed pair can be retried
    let retried = node.initiate_connection("B", "A", None).await.unwrap();
    assert_eq!(retried.state, ConnectionState::Initiating);
    assert_eq!(retried.metadata.initiator.as_deref(), Some("B"));
}
