//! Presence flows over real connections: joins, metadata updates,
//! heartbeat expiry, and departure on disconnect.

use conflux_collab::client::{SyncClient, SyncEvent};
use conflux_collab::coordinator::SyncConfig;
use conflux_collab::server::{ServerConfig, SyncServer};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;

async fn start_test_server(presence_timeout: Duration) -> (Arc<SyncServer>, String) {
    let config = ServerConfig {
        sync: SyncConfig {
            replica_id: "server-test".into(),
            presence_timeout,
            ..SyncConfig::default()
        },
        sweep_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(config).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let srv = server.clone();
    tokio::spawn(async move {
        let _ = srv.serve(listener).await;
    });

    (server, format!("ws://{addr}"))
}

async fn connected_client(url: &str, replica: &str) -> (SyncClient, tokio::sync::mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(replica, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::Connected)) => {}
        other => panic!("expected Connected, got {other:?}"),
    }
    (client, events)
}

async fn next_event(events: &mut tokio::sync::mpsc::Receiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_presence_broadcast_to_doc_subscribers() {
    let (_server, url) = start_test_server(Duration::from_secs(30)).await;
    let (alice, _alice_events) = connected_client(&url, "client-alice").await;
    let (bob, mut bob_events) = connected_client(&url, "client-bob").await;

    bob.subscribe_doc("notes", "n1").await.unwrap();
    next_event(&mut bob_events).await; // Subscribed
    next_event(&mut bob_events).await; // State

    alice
        .send_presence("notes", "n1", json!({"cursor": {"line": 4, "col": 2}}))
        .await
        .unwrap();

    match next_event(&mut bob_events).await {
        SyncEvent::PresenceChanged {
            doc_id,
            node_id,
            presence,
        } => {
            assert_eq!(doc_id, "n1");
            assert_eq!(node_id, "client-alice");
            assert_eq!(presence, json!({"cursor": {"line": 4, "col": 2}}));
        }
        other => panic!("expected PresenceChanged, got {other:?}"),
    }
}

#[tokio::test]
async fn test_presence_metadata_updates_rebroadcast() {
    let (_server, url) = start_test_server(Duration::from_secs(30)).await;
    let (alice, _alice_events) = connected_client(&url, "client-alice").await;
    let (bob, mut bob_events) = connected_client(&url, "client-bob").await;

    bob.subscribe_doc("notes", "n1").await.unwrap();
    next_event(&mut bob_events).await;
    next_event(&mut bob_events).await;

    alice
        .send_presence("notes", "n1", json!({"cursor": 1}))
        .await
        .unwrap();
    next_event(&mut bob_events).await;

    // A second heartbeat with new metadata is a change, not a join.
    alice
        .send_presence("notes", "n1", json!({"cursor": 9}))
        .await
        .unwrap();
    match next_event(&mut bob_events).await {
        SyncEvent::PresenceChanged { presence, .. } => {
            assert_eq!(presence, json!({"cursor": 9}));
        }
        other => panic!("expected PresenceChanged, got {other:?}"),
    }
}

#[tokio::test]
async fn test_presence_expires_without_heartbeat() {
    // Short timeout plus a fast sweep: silence means departure.
    let (_server, url) = start_test_server(Duration::from_millis(150)).await;
    let (alice, _alice_events) = connected_client(&url, "client-alice").await;
    let (bob, mut bob_events) = connected_client(&url, "client-bob").await;

    bob.subscribe_doc("notes", "n1").await.unwrap();
    next_event(&mut bob_events).await;
    next_event(&mut bob_events).await;

    alice
        .send_presence("notes", "n1", json!({"here": true}))
        .await
        .unwrap();
    match next_event(&mut bob_events).await {
        SyncEvent::PresenceChanged { node_id, .. } => assert_eq!(node_id, "client-alice"),
        other => panic!("expected PresenceChanged, got {other:?}"),
    }

    // No more heartbeats from Alice; the sweep broadcasts her departure.
    match next_event(&mut bob_events).await {
        SyncEvent::PresenceLeft { doc_id, node_id } => {
            assert_eq!(doc_id, "n1");
            assert_eq!(node_id, "client-alice");
        }
        other => panic!("expected PresenceLeft, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_broadcasts_departure() {
    let (_server, url) = start_test_server(Duration::from_secs(30)).await;
    let (alice, _alice_events) = connected_client(&url, "client-alice").await;
    let (bob, mut bob_events) = connected_client(&url, "client-bob").await;

    bob.subscribe_doc("notes", "n1").await.unwrap();
    next_event(&mut bob_events).await;
    next_event(&mut bob_events).await;

    alice
        .send_presence("notes", "n1", json!({"here": true}))
        .await
        .unwrap();
    next_event(&mut bob_events).await; // PresenceChanged

    drop(alice); // closes the socket

    match next_event(&mut bob_events).await {
        SyncEvent::PresenceLeft { node_id, .. } => assert_eq!(node_id, "client-alice"),
        other => panic!("expected PresenceLeft, got {other:?}"),
    }
}

#[tokio::test]
async fn test_presence_isolated_per_document() {
    let (_server, url) = start_test_server(Duration::from_secs(30)).await;
    let (alice, _alice_events) = connected_client(&url, "client-alice").await;
    let (bob, mut bob_events) = connected_client(&url, "client-bob").await;

    // Bob watches n2; Alice announces on n1.
    bob.subscribe_doc("notes", "n2").await.unwrap();
    next_event(&mut bob_events).await;
    next_event(&mut bob_events).await;

    alice
        .send_presence("notes", "n1", json!({"here": true}))
        .await
        .unwrap();

    let got = timeout(Duration::from_millis(300), bob_events.recv()).await;
    assert!(got.is_err(), "presence must not leak across documents: {got:?}");
}
