//! Store wrapper injecting a single targeted failure.

use async_trait::async_trait;
use datasync_store::{
    Document, DocumentStore, Filter, IndexSpec, Patch, Sort, StoreError, StoreResult, UpdateOptions,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Delegates to an inner store, failing one armed `(operation, collection)`
/// pair once with a transient error.
pub(crate) struct FailOnce {
    inner: Arc<dyn DocumentStore>,
    armed: Mutex<Option<(&'static str, String)>>,
}

impl FailOnce {
    pub(crate) fn new(inner: Arc<dyn DocumentStore>) -> Self {
        Self {
            inner,
            armed: Mutex::new(None),
        }
    }

    /// Fails the next `operation` on `collection`.
    pub(crate) fn arm(&self, operation: &'static str, collection: &str) {
        *self.armed.lock() = Some((operation, collection.to_string()));
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed.lock().is_some()
    }

    fn check(&self, operation: &str, collection: &str) -> StoreResult<()> {
        let mut armed = self.armed.lock();
        if armed
            .as_ref()
            .is_some_and(|(op, c)| *op == operation && c == collection)
        {
            *armed = None;
            return Err(StoreError::transient(format!(
                "injected failure in {operation} on {collection}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FailOnce {
    async fn create_collection(&self, collection: &str, indexes: &[IndexSpec]) -> StoreResult<()> {
        self.inner.create_collection(collection, indexes).await
    }

    async fn insert_one(&self, collection: &str, doc: Document) -> StoreResult<String> {
        self.check("insert_one", collection)?;
        self.inner.insert_one(collection, doc).await
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> StoreResult<Vec<String>> {
        self.check("insert_many", collection)?;
        self.inner.insert_many(collection, docs).await
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Document>> {
        self.check("find", collection)?;
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
        self.check("find_one_and_update", collection)?;
        self.inner
            .find_one_and_update(collection, filter, sort, patch, options)
            .await
    }

    async fn update_many(&self, collection: &str, filter: &Filter, patch: &Patch) -> StoreResult<u64> {
        self.check("update_many", collection)?;
        self.inner.update_many(collection, filter, patch).await
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        self.check("delete_many", collection)?;
        self.inner.delete_many(collection, filter).await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        self.check("count", collection)?;
        self.inner.count(collection, filter).await
    }
}
