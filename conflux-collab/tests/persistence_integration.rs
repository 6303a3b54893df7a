//! Durability tests: documents must survive cache eviction, coordinator
//! shutdown, and full server restarts backed by RocksDB.

use conflux_collab::client::{SyncClient, SyncEvent};
use conflux_collab::coordinator::{SyncConfig, SyncCoordinator};
use conflux_collab::protocol::{ClientMessage, ServerMessage};
use conflux_collab::server::{ServerConfig, SyncServer};
use conflux_collab::storage::{RocksStore, StoreConfig};
use conflux_crdt::path;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

fn test_sync_config() -> SyncConfig {
    SyncConfig {
        replica_id: "server-test".into(),
        cache_capacity: 2,
        ..SyncConfig::default()
    }
}

async fn attach(coord: &SyncCoordinator) -> uuid::Uuid {
    let conn = Uuid::new_v4();
    let (tx, _rx) = mpsc::channel(32);
    coord.connect(conn, tx).await;
    conn
}

#[tokio::test]
async fn test_coordinator_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");

    {
        let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&db_path)).unwrap());
        let coord = SyncCoordinator::new(test_sync_config(), store);
        let conn = attach(&coord).await;

        for i in 0..5 {
            let replies = coord
                .handle_message(
                    conn,
                    ClientMessage::CrdtSet {
                        collection: "notes".into(),
                        doc_id: format!("d{i}"),
                        path: path(&["value"]),
                        value: json!(i),
                    },
                )
                .await;
            assert!(matches!(replies[0], ServerMessage::CrdtSetOk { .. }));
        }
        coord.flush_all().await;
    }

    // Reopen: every document is there, clock history intact.
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&db_path)).unwrap());
    let coord = SyncCoordinator::new(test_sync_config(), store);
    let conn = attach(&coord).await;

    for i in 0..5 {
        let replies = coord
            .handle_message(
                conn,
                ClientMessage::CrdtGet {
                    collection: "notes".into(),
                    doc_id: format!("d{i}"),
                },
            )
            .await;
        match &replies[..] {
            [ServerMessage::CrdtState { data, version, .. }] => {
                assert_eq!(*data, json!({"value": i}));
                assert_eq!(*version, 1);
            }
            other => panic!("unexpected replies: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_eviction_write_back_preserves_documents() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let coord = SyncCoordinator::new(test_sync_config(), store.clone());
    let conn = attach(&coord).await;

    // Cache capacity is 2; ten documents force constant eviction churn.
    for i in 0..10 {
        coord
            .handle_message(
                conn,
                ClientMessage::CrdtSet {
                    collection: "notes".into(),
                    doc_id: format!("d{i}"),
                    path: path(&["n"]),
                    value: json!(i),
                },
            )
            .await;
    }

    let snap = coord.metrics_snapshot().await;
    assert_eq!(snap.cached_documents, 2);
    assert!(snap.cache_evictions >= 8);
    assert_eq!(snap.writeback_failures, 0);

    use conflux_collab::storage::DurableStore;
    for i in 0..10 {
        let loaded = store.load("notes", &format!("d{i}")).unwrap().unwrap();
        assert_eq!(loaded.data, json!({"n": i}));
    }
}

#[tokio::test]
async fn test_duplicate_suppression_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");

    let op = conflux_crdt::Operation {
        replica_id: "client-a".into(),
        counter: 1,
        path: path(&["x"]),
        value: json!("original"),
        timestamp: 100,
    };

    {
        let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&db_path)).unwrap());
        let coord = SyncCoordinator::new(test_sync_config(), store);
        let conn = attach(&coord).await;
        coord
            .handle_message(
                conn,
                ClientMessage::CrdtOps {
                    collection: "notes".into(),
                    doc_id: "d1".into(),
                    operations: vec![op.clone()],
                },
            )
            .await;
        coord.flush_all().await;
    }

    // After reload, re-delivering the same op (with a different value, as a
    // malicious or confused replica might) is still a no-op.
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&db_path)).unwrap());
    let coord = SyncCoordinator::new(test_sync_config(), store);
    let conn = attach(&coord).await;

    let replayed = conflux_crdt::Operation {
        value: json!("tampered"),
        ..op
    };
    let replies = coord
        .handle_message(
            conn,
            ClientMessage::CrdtOps {
                collection: "notes".into(),
                doc_id: "d1".into(),
                operations: vec![replayed],
            },
        )
        .await;
    match &replies[..] {
        [ServerMessage::CrdtOpsOk { applied, .. }] => assert_eq!(*applied, 0),
        other => panic!("unexpected replies: {other:?}"),
    }

    let replies = coord
        .handle_message(
            conn,
            ClientMessage::CrdtGet {
                collection: "notes".into(),
                doc_id: "d1".into(),
            },
        )
        .await;
    match &replies[..] {
        [ServerMessage::CrdtState { data, .. }] => {
            assert_eq!(*data, json!({"x": "original"}));
        }
        other => panic!("unexpected replies: {other:?}"),
    }
}

#[tokio::test]
async fn test_full_server_restart_preserves_edits() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");

    let start = |path: std::path::PathBuf| async move {
        let config = ServerConfig {
            storage_path: Some(path),
            sweep_interval: Duration::from_secs(60),
            ..ServerConfig::default()
        };
        let server = Arc::new(SyncServer::new(config).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = server.clone();
        let task = tokio::spawn(async move {
            let _ = srv.serve(listener).await;
        });
        (server, task, format!("ws://{addr}"))
    };

    // First life: write an edit and flush.
    {
        let (server, task, url) = start(db_path.clone()).await;

        let mut client = SyncClient::new("client-a", &url);
        let mut events = client.take_event_rx().unwrap();
        client.connect().await.unwrap();
        assert!(matches!(
            timeout(Duration::from_secs(2), events.recv()).await,
            Ok(Some(SyncEvent::Connected))
        ));

        client
            .set("notes", "persistent", path(&["title"]), json!("survives"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        server.flush().await;
        drop(client);
        task.abort();
        drop(server);
        // Let connection tasks unwind and release the store.
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    // Second life: a fresh client reads the persisted document.
    let (_server, _task, url) = start(db_path).await;
    let mut client = SyncClient::new("client-b", &url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    assert!(matches!(
        timeout(Duration::from_secs(2), events.recv()).await,
        Ok(Some(SyncEvent::Connected))
    ));

    client.subscribe_doc("notes", "persistent").await.unwrap();
    // Subscribed ack first, then state.
    let _ = timeout(Duration::from_secs(2), events.recv()).await;
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::State { data, version, .. })) => {
            assert_eq!(data, json!({"title": "survives"}));
            assert_eq!(version, 1);
        }
        other => panic!("expected State, got {other:?}"),
    }
}
