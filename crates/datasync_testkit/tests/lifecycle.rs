//! Server lifecycle, leader election and failure handling.

use datasync_engine::{Metrics, Queue, QueueOptions, SystemClock};
use datasync_server::{DatasetOptions, ServerConfig, ServerError, ACK_QUEUE, PENDING_QUEUE};
use datasync_store::{DocumentStore, Filter, InMemoryStore};
use datasync_testkit::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn queued(store: &Arc<dyn DocumentStore>, queue: &str) -> u64 {
    store.count(queue, &Filter::All).await.unwrap()
}

/// Syncs once and waits for the dataset client to be recorded.
async fn register(server: &TestServer, dataset_id: &str, cuid: &str) {
    server.sync(dataset_id, SyncRequest::new(cuid)).await.unwrap();
    let recorded = wait_until(TIMEOUT, move || async move {
        let clients = server
            .storage()
            .list_dataset_clients(Some(dataset_id), true)
            .await
            .unwrap();
        clients.iter().any(|c| c.cuids.iter().any(|id| id == cuid))
    })
    .await;
    assert!(recorded);
}

#[tokio::test]
async fn stopped_dataset_rejects_sync_without_queueing() {
    let server = &TestServer::memory();
    register(server, "todos", "c1").await;
    register(server, "notes", "c1").await;
    server.stop("todos").await.unwrap();

    let acks = queued(&server.store, ACK_QUEUE).await;
    let pending = queued(&server.store, PENDING_QUEUE).await;
    let request = SyncRequest::new("c1")
        .with_acknowledgement("a1")
        .with_pending(sample_create("todos", "p1", "tmp", json!({"n": 1})));
    let err = server.sync("todos", request).await.unwrap_err();
    assert!(matches!(err, ServerError::SyncStopped { .. }));
    assert_eq!(err.to_string(), "sync stopped for dataset todos");
    assert_eq!(queued(&server.store, ACK_QUEUE).await, acks);
    assert_eq!(queued(&server.store, PENDING_QUEUE).await, pending);

    // Other datasets are unaffected.
    server.sync("notes", SyncRequest::new("c1")).await.unwrap();

    server.init("todos", DatasetOptions::default()).await.unwrap();
    server.sync("todos", SyncRequest::new("c1")).await.unwrap();
    server.stop_all().await.unwrap();
}

#[tokio::test]
async fn stop_all_stops_everything_and_restarts() {
    let server = &TestServer::memory();
    register(server, "todos", "c1").await;
    register(server, "notes", "c1").await;

    server.stop_all().await.unwrap();
    assert!(!server.is_started().await);
    assert!(!server.scheduler().is_running());
    for dataset_id in ["todos", "notes"] {
        let err = server.sync(dataset_id, SyncRequest::new("c1")).await.unwrap_err();
        assert!(err.is_client_error());
    }

    server.init("notes", DatasetOptions::default()).await.unwrap();
    server.sync("notes", SyncRequest::new("c1")).await.unwrap();
    server.stop_all().await.unwrap();
}

#[tokio::test]
async fn one_leader_across_servers() {
    let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore::new());
    let first = &TestServer::sharing(store.clone());
    let second = &TestServer::sharing(store);
    first.start().await.unwrap();
    second.start().await.unwrap();

    let elected = wait_until(TIMEOUT, move || async move {
        first.scheduler().is_leader() || second.scheduler().is_leader()
    })
    .await;
    assert!(elected);
    for _ in 0..20 {
        assert!(!(first.scheduler().is_leader() && second.scheduler().is_leader()));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Stopping the leader releases the lock; the other takes over.
    let (leader, follower) = if first.scheduler().is_leader() {
        (first, second)
    } else {
        (second, first)
    };
    leader.stop_all().await.unwrap();
    let took_over = wait_until(TIMEOUT, move || async move { follower.scheduler().is_leader() }).await;
    assert!(took_over);
    follower.stop_all().await.unwrap();
}

#[tokio::test]
async fn transient_store_failures_are_retried() {
    let flaky = Arc::new(FlakyStore::new(Arc::new(InMemoryStore::new())));
    let store: Arc<dyn DocumentStore> = flaky.clone();
    let server = &TestServer::with_config(store, fast_config().with_worker_lease(Duration::from_millis(200)));
    server.start().await.unwrap();

    flaky.fail_next(5);
    let change = sample_create("todos", "p1", "tmp-1", json!({"n": 1}));
    let submitted = wait_until(TIMEOUT, move || {
        let change = change.clone();
        async move { server.sync("todos", SyncRequest::new("c1").with_pending(change)).await.is_ok() }
    })
    .await;
    assert!(submitted);

    let applied = wait_until(TIMEOUT, move || async move {
        match server.sync("todos", SyncRequest::new("c1")).await {
            Ok(response) => response.updates.hashes.contains_key("p1"),
            Err(_) => false,
        }
    })
    .await;
    assert!(applied);
    assert_eq!(flaky.remaining_failures(), 0);
    server.stop_all().await.unwrap();
}

#[tokio::test]
async fn concurrent_clients_all_get_their_changes_applied() {
    let server = Arc::new(TestServer::memory().server);
    let config = StressConfig {
        clients: 4,
        rounds: 5,
        changes_per_round: 2,
    };
    let result = stress_concurrent_syncs(server.clone(), "todos", &config).await;
    assert_eq!(result.failed_ops, 0);
    assert_eq!(result.successful_ops, 20);

    let expected = config.rounds * config.changes_per_round;
    for client in 0..config.clients {
        let cuid = format!("client-{client}");
        let storage = server.storage().clone();
        let done = wait_until(TIMEOUT, move || {
            let storage = storage.clone();
            let cuid = cuid.clone();
            async move {
                let updates = storage.list_updates("todos", &cuid).await.unwrap();
                updates.iter().filter(|u| u.update_type == UpdateType::Applied).count() == expected
            }
        })
        .await;
        assert!(done, "client-{client} changes not applied");
    }
    server.stop_all().await.unwrap();
}

#[tokio::test]
async fn queue_claims_are_exclusive_under_load() {
    let clock = Arc::new(SystemClock);
    let queue = Arc::new(Queue::new(
        "stress",
        Arc::new(InMemoryStore::new()),
        clock.clone(),
        Arc::new(Metrics::new(10, clock)),
        QueueOptions::default(),
    ));
    queue.create().await.unwrap();
    let (result, duplicated) = stress_queue_claims(queue.clone(), 200, 8).await;
    assert!(!duplicated);
    assert_eq!(result.successful_ops, 200);
    assert_eq!(result.failed_ops, 0);
    assert_eq!(queue.size().await.unwrap(), 0);
}

#[test]
fn config_round_trips_through_json() {
    let config = ServerConfig::new().with_scheduler_lock_name("custom");
    let value = serde_json::to_value(&config).unwrap();
    let back: ServerConfig = serde_json::from_value(value).unwrap();
    assert_eq!(back.scheduler_lock_name, "custom");
    assert_eq!(back.worker_lease, config.worker_lease);
}
