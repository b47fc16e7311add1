//! Test fixtures and server helpers.
//!
//! Provides servers with fast poll intervals, sample client changes and a
//! store wrapper that injects backend failures.

use async_trait::async_trait;
use datasync_protocol::{HashProvider, PendingChange, Sha256HashProvider};
use datasync_server::{ServerConfig, SyncServer};
use datasync_store::{
    Document, DocumentStore, Filter, InMemoryStore, IndexSpec, Patch, Sort, StoreError, StoreResult, UpdateOptions,
};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configuration with millisecond poll intervals so tests converge quickly.
pub fn fast_config() -> ServerConfig {
    ServerConfig::new()
        .with_worker_interval(Duration::from_millis(5))
        .with_scheduler_interval(Duration::from_millis(5))
        .with_worker_lease(Duration::from_secs(5))
}

/// A sync server over an in-memory store.
pub struct TestServer {
    /// The server.
    pub server: SyncServer,
    /// The store, for inspection or for sharing with another server.
    pub store: Arc<dyn DocumentStore>,
}

impl TestServer {
    /// Creates a server on a fresh in-memory store.
    pub fn memory() -> Self {
        Self::sharing(Arc::new(InMemoryStore::new()))
    }

    /// Creates a server on an existing store.
    pub fn sharing(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_config(store, fast_config())
    }

    /// Creates a server on an existing store with a specific configuration.
    pub fn with_config(store: Arc<dyn DocumentStore>, config: ServerConfig) -> Self {
        Self {
            server: SyncServer::new(store.clone(), config),
            store,
        }
    }
}

impl std::ops::Deref for TestServer {
    type Target = SyncServer;

    fn deref(&self) -> &Self::Target {
        &self.server
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Record hash as the server computes it.
pub fn record_hash(dataset_id: &str, record: &Value) -> String {
    Sha256HashProvider.record_hash(dataset_id, record)
}

/// A client-side create of `record` under a temporary uid.
pub fn sample_create(dataset_id: &str, hash: &str, temp_uid: &str, record: Value) -> PendingChange {
    let post_hash = record_hash(dataset_id, &record);
    PendingChange::create(hash, temp_uid, record, post_hash)
}

/// A client-side update of `uid` from `pre` to `post`.
pub fn sample_update(dataset_id: &str, hash: &str, uid: &str, pre: Value, post: Value) -> PendingChange {
    let pre_hash = record_hash(dataset_id, &pre);
    let post_hash = record_hash(dataset_id, &post);
    PendingChange::update(hash, uid, pre, pre_hash, post, post_hash)
}

/// A client-side delete of `uid`, last seen as `pre`.
pub fn sample_delete(dataset_id: &str, hash: &str, uid: &str, pre: Value) -> PendingChange {
    let pre_hash = record_hash(dataset_id, &pre);
    PendingChange::delete(hash, uid, pre, pre_hash)
}

/// A store whose next operations fail with a transient backend error.
pub struct FlakyStore {
    inner: Arc<dyn DocumentStore>,
    failures: AtomicUsize,
}

impl FlakyStore {
    /// Wraps a store. No failures are armed.
    pub fn new(inner: Arc<dyn DocumentStore>) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` operations fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Failures still armed.
    pub fn remaining_failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn check(&self, operation: &str) -> StoreResult<()> {
        let armed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            Err(StoreError::transient(format!("injected failure in {operation}")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn create_collection(&self, collection: &str, indexes: &[IndexSpec]) -> StoreResult<()> {
        self.check("create_collection")?;
        self.inner.create_collection(collection, indexes).await
    }

    async fn insert_one(&self, collection: &str, doc: Document) -> StoreResult<String> {
        self.check("insert_one")?;
        self.inner.insert_one(collection, doc).await
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> StoreResult<Vec<String>> {
        self.check("insert_many")?;
        self.inner.insert_many(collection, docs).await
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Document>> {
        self.check("find")?;
        self.inner.find(collection, filter, sort, limit).await
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        patch: &Patch,
        options: UpdateOptions,
    ) -> StoreResult<Option<Document>> {
        self.check("find_one_and_update")?;
        self.inner
            .find_one_and_update(collection, filter, sort, patch, options)
            .await
    }

    async fn update_many(&self, collection: &str, filter: &Filter, patch: &Patch) -> StoreResult<u64> {
        self.check("update_many")?;
        self.inner.update_many(collection, filter, patch).await
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        self.check("delete_many")?;
        self.inner.delete_many(collection, filter).await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        self.check("count")?;
        self.inner.count(collection, filter).await
    }
}
