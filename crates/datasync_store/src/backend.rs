//! Document store trait definition.

use crate::error::StoreResult;
use crate::query::{Document, Filter, Patch, Sort};
use async_trait::async_trait;

/// An index to provision on a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// Indexed fields, in order.
    pub fields: Vec<String>,
    /// Whether the combination of field values must be unique.
    pub unique: bool,
}

impl IndexSpec {
    /// Creates a non-unique index over the given fields.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Marks the index as unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Options for [`DocumentStore::find_one_and_update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Create the document when nothing matches.
    ///
    /// The new document is seeded with the filter's equality fields. If that
    /// collides with an existing `_id` or unique index the call fails with
    /// [`crate::StoreError::DuplicateKey`].
    pub upsert: bool,
}

impl UpdateOptions {
    /// Options with upsert enabled.
    pub fn upsert() -> Self {
        Self { upsert: true }
    }
}

/// A shared mutable document store.
///
/// # Invariants
///
/// - Every document has a unique string `_id`; inserts without one get a
///   generated id
/// - `find_one_and_update` selects, modifies and returns a single document
///   atomically: two concurrent calls never both observe the document in
///   its pre-update state
/// - Reading a collection that was never written yields no documents
/// - Implementations must be `Send + Sync`; one store handle is shared by
///   every queue, worker, lock and API in a process
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For tests and single-process deployments
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Idempotently provisions a collection and its indexes.
    async fn create_collection(&self, collection: &str, indexes: &[IndexSpec]) -> StoreResult<()>;

    /// Inserts a document and returns its `_id`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::DuplicateKey`] if the `_id` or a unique
    /// index value is already taken.
    async fn insert_one(&self, collection: &str, doc: Document) -> StoreResult<String>;

    /// Inserts a batch of documents and returns their ids in order.
    ///
    /// The batch is all-or-nothing.
    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> StoreResult<Vec<String>>;

    /// Returns matching documents, optionally sorted and limited.
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Document>>;

    /// Returns the first matching document.
    async fn find_one(&self, collection: &str, filter: &Filter) -> StoreResult<Option<Document>> {
        Ok(self
            .find(collection, filter, None, Some(1))
            .await?
            .into_iter()
            .next())
    }

    /// Atomically updates the first matching document (in `sort` order) and
    /// returns it as it is after the update.
    ///
    /// Returns `None` when nothing matched and `upsert` is off.
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        patch: &Patch,
        options: UpdateOptions,
    ) -> StoreResult<Option<Document>>;

    /// Updates every matching document and returns how many matched.
    async fn update_many(&self, collection: &str, filter: &Filter, patch: &Patch) -> StoreResult<u64>;

    /// Deletes every matching document and returns how many were removed.
    async fn delete_many(&self, collection: &str, filter: &Filter) -> StoreResult<u64>;

    /// Counts matching documents.
    async fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64>;
}
