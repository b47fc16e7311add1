//! In-memory document store.

use crate::backend::{DocumentStore, IndexSpec, UpdateOptions};
use crate::error::{StoreError, StoreResult};
use crate::query::{Document, Filter, Patch, Sort, ID_FIELD};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Collection {
    docs: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

impl Collection {
    /// Index of the first matching document in `sort` order.
    fn position(&self, filter: &Filter, sort: Option<&Sort>) -> Option<usize> {
        let mut matching = self
            .docs
            .iter()
            .enumerate()
            .filter(|(_, doc)| filter.matches(doc));
        match sort {
            None => matching.next().map(|(i, _)| i),
            Some(sort) => matching
                .min_by(|(_, a), (_, b)| sort.compare(a, b))
                .map(|(i, _)| i),
        }
    }

    /// Rejects `candidate` if it collides with another document's `_id` or
    /// unique index key. `skip` is the candidate's own slot when updating.
    fn check_unique(&self, name: &str, candidate: &Document, skip: Option<usize>) -> StoreResult<()> {
        let others = self
            .docs
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != skip)
            .map(|(_, doc)| doc);

        for other in others {
            if other.get(ID_FIELD) == candidate.get(ID_FIELD) {
                return Err(StoreError::DuplicateKey {
                    collection: name.to_string(),
                    key: id_of(candidate).unwrap_or_default(),
                });
            }
            for index in self.indexes.iter().filter(|index| index.unique) {
                let key = index_key(index, candidate);
                if key == index_key(index, other) {
                    return Err(StoreError::DuplicateKey {
                        collection: name.to_string(),
                        key: Value::Array(key).to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn index_key(index: &IndexSpec, doc: &Document) -> Vec<Value> {
    index
        .fields
        .iter()
        .map(|field| doc.get(field).cloned().unwrap_or(Value::Null))
        .collect()
}

fn id_of(doc: &Document) -> Option<String> {
    doc.get(ID_FIELD).and_then(Value::as_str).map(str::to_string)
}

/// Gives the document an `_id` if it has none and returns it.
fn ensure_id(doc: &mut Document) -> StoreResult<String> {
    match doc.get(ID_FIELD) {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(other) => Err(StoreError::InvalidDocument(format!(
            "_id must be a string, got {other}"
        ))),
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
            Ok(id)
        }
    }
}

/// An in-memory document store.
///
/// This store keeps all collections in memory and is suitable for:
/// - Unit and integration tests
/// - Single-process deployments where sync state may be lost on restart
///
/// # Thread Safety
///
/// Each operation holds the store lock for its whole duration, which makes
/// every call (including `find_one_and_update`) atomic with respect to all
/// other calls. Handles are shared as `Arc<InMemoryStore>` between the
/// simulated "processes" of a test cluster.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the names of all collections.
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the indexes provisioned on a collection.
    pub fn indexes(&self, collection: &str) -> Vec<IndexSpec> {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.indexes.clone())
            .unwrap_or_default()
    }

    /// Returns a copy of every document in a collection.
    pub fn dump(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.docs.clone())
            .unwrap_or_default()
    }

    /// Removes all collections.
    pub fn clear(&self) {
        self.collections.write().clear();
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn create_collection(&self, collection: &str, indexes: &[IndexSpec]) -> StoreResult<()> {
        let mut collections = self.collections.write();
        let coll = collections.entry(collection.to_string()).or_default();
        for index in indexes {
            if !coll.indexes.contains(index) {
                coll.indexes.push(index.clone());
            }
        }
        Ok(())
    }

    async fn insert_one(&self, collection: &str, mut doc: Document) -> StoreResult<String> {
        let id = ensure_id(&mut doc)?;
        let mut collections = self.collections.write();
        let coll = collections.entry(collection.to_string()).or_default();
        coll.check_unique(collection, &doc, None)?;
        coll.docs.push(doc);
        Ok(id)
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> StoreResult<Vec<String>> {
        let mut collections = self.collections.write();
        let coll = collections.entry(collection.to_string()).or_default();
        let committed = coll.docs.len();
        let mut ids = Vec::with_capacity(docs.len());

        for mut doc in docs {
            let checked = ensure_id(&mut doc).and_then(|id| {
                coll.check_unique(collection, &doc, None)?;
                Ok(id)
            });
            match checked {
                Ok(id) => {
                    coll.docs.push(doc);
                    ids.push(id);
                }
                Err(e) => {
                    coll.docs.truncate(committed);
                    return Err(e);
                }
            }
        }
        Ok(ids)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Document>> {
        let collections = self.collections.read();
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut found: Vec<Document> = coll
            .docs
            .iter()
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect();
        if let Some(sort) = sort {
            found.sort_by(|a, b| sort.compare(a, b));
        }
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        patch: &Patch,
        options: UpdateOptions,
    ) -> StoreResult<Option<Document>> {
        let mut collections = self.collections.write();
        let coll = collections.entry(collection.to_string()).or_default();

        match coll.position(filter, sort) {
            Some(i) => {
                let mut updated = coll.docs[i].clone();
                patch.apply(&mut updated, false);
                // The primary key is immutable.
                if let Some(id) = coll.docs[i].get(ID_FIELD) {
                    updated.insert(ID_FIELD.to_string(), id.clone());
                }
                coll.check_unique(collection, &updated, Some(i))?;
                coll.docs[i] = updated.clone();
                Ok(Some(updated))
            }
            None if options.upsert => {
                let mut created = filter.equality_fields();
                patch.apply(&mut created, true);
                ensure_id(&mut created)?;
                coll.check_unique(collection, &created, None)?;
                coll.docs.push(created.clone());
                Ok(Some(created))
            }
            None => Ok(None),
        }
    }

    async fn update_many(&self, collection: &str, filter: &Filter, patch: &Patch) -> StoreResult<u64> {
        let mut collections = self.collections.write();
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(0);
        };

        let mut staged = Vec::new();
        for (i, doc) in coll.docs.iter().enumerate() {
            if filter.matches(doc) {
                let mut updated = doc.clone();
                patch.apply(&mut updated, false);
                if let Some(id) = doc.get(ID_FIELD) {
                    updated.insert(ID_FIELD.to_string(), id.clone());
                }
                coll.check_unique(collection, &updated, Some(i))?;
                staged.push((i, updated));
            }
        }

        let matched = staged.len() as u64;
        for (i, updated) in staged {
            coll.docs[i] = updated;
        }
        Ok(matched)
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        let mut collections = self.collections.write();
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = coll.docs.len();
        coll.docs.retain(|doc| !filter.matches(doc));
        Ok((before - coll.docs.len()) as u64)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .map(|c| c.docs.iter().filter(|doc| filter.matches(doc)).count() as u64)
            .unwrap_or(0))
    }
}
