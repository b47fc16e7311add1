//! Data handlers: the CRUD boundary between sync and the system of record.
//!
//! The engine never touches dataset records directly. Every read and write
//! goes through a [`DataHandler`], chosen per dataset from
//! [`DataHandlers`]. [`StoreDataHandler`] is the default and keeps records
//! in the shared document store, one collection per dataset.

use crate::error::{HandlerError, HandlerResult};
use async_trait::async_trait;
use datasync_protocol::Sha256HashProvider;
use datasync_store::{document, DocumentStore, Filter, Patch, UpdateOptions, ID_FIELD};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// A record created by [`DataHandler::create`].
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedRecord {
    /// Server-assigned uid.
    pub uid: String,
    /// Record as stored.
    pub data: Value,
}

/// A change that could not be applied because the server record moved on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollisionRecord {
    /// Hash of the pending change.
    pub hash: String,
    /// Record uid.
    pub uid: String,
    /// Dataset id.
    pub dataset_id: String,
    /// Client connection that submitted the change.
    #[serde(default)]
    pub cuid: String,
    /// Action of the pending change.
    pub action: String,
    /// Record as the client last saw it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre: Option<Value>,
    /// Record as the client wanted it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<Value>,
    /// Record as the server has it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_record: Option<Value>,
    /// Detection time (ms).
    pub timestamp: i64,
}

/// CRUD operations on a dataset's records.
///
/// Errors marked permanent are reported to the client as `failed`; other
/// errors leave the change queued for retry.
#[async_trait]
pub trait DataHandler: Send + Sync {
    /// Lists the records visible to a client, keyed by uid.
    async fn list(
        &self,
        dataset_id: &str,
        query_params: &Value,
        meta_data: &Value,
    ) -> HandlerResult<BTreeMap<String, Value>>;

    /// Creates a record and returns its uid.
    async fn create(&self, dataset_id: &str, data: &Value, meta_data: &Value) -> HandlerResult<CreatedRecord>;

    /// Creates the record of one pending change, identified by `key`.
    ///
    /// A repeated call with the same key should return the record created
    /// the first time. The default delegates to [`DataHandler::create`] and
    /// relies on the pending processor remembering the created uid.
    async fn create_for_change(
        &self,
        dataset_id: &str,
        _key: &str,
        data: &Value,
        meta_data: &Value,
    ) -> HandlerResult<CreatedRecord> {
        self.create(dataset_id, data, meta_data).await
    }

    /// Reads a record.
    async fn read(&self, dataset_id: &str, uid: &str, meta_data: &Value) -> HandlerResult<Option<Value>>;

    /// Replaces a record and returns it as stored. Fails permanently if the
    /// record does not exist.
    async fn update(&self, dataset_id: &str, uid: &str, data: &Value, meta_data: &Value) -> HandlerResult<Value>;

    /// Deletes a record. Deleting a missing record succeeds.
    async fn delete(&self, dataset_id: &str, uid: &str, meta_data: &Value) -> HandlerResult<()>;

    /// Records a collision for later inspection.
    async fn handle_collision(
        &self,
        dataset_id: &str,
        collision: &CollisionRecord,
        meta_data: &Value,
    ) -> HandlerResult<()>;

    /// Lists recorded collisions.
    async fn list_collisions(&self, dataset_id: &str, meta_data: &Value) -> HandlerResult<Vec<CollisionRecord>>;

    /// Removes a recorded collision. Returns false if there was none.
    async fn remove_collision(&self, dataset_id: &str, hash: &str, meta_data: &Value) -> HandlerResult<bool>;
}

/// Default handler keeping records in the document store.
///
/// Records of dataset `d` live in collection `d` (stored with their uid as
/// `_id`); collisions live in `d_collision`, keyed by change hash. Records
/// created for a pending change get a uid derived from the change key, so
/// creating twice finds the first record.
pub struct StoreDataHandler {
    store: Arc<dyn DocumentStore>,
}

impl StoreDataHandler {
    /// Creates a handler over a shared store.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    fn collision_collection(dataset_id: &str) -> String {
        format!("{dataset_id}_collision")
    }

    fn record_fields(data: &Value) -> HandlerResult<Map<String, Value>> {
        match data {
            Value::Object(fields) => {
                let mut fields = fields.clone();
                fields.remove(ID_FIELD);
                Ok(fields)
            }
            other => Err(HandlerError::permanent(format!(
                "record must be a JSON object, got {other}"
            ))),
        }
    }

    fn strip_id(mut doc: Map<String, Value>) -> (String, Value) {
        let uid = match doc.remove(ID_FIELD) {
            Some(Value::String(uid)) => uid,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        (uid, Value::Object(doc))
    }
}

#[async_trait]
impl DataHandler for StoreDataHandler {
    async fn list(
        &self,
        dataset_id: &str,
        query_params: &Value,
        _meta_data: &Value,
    ) -> HandlerResult<BTreeMap<String, Value>> {
        let filter = match query_params {
            Value::Object(params) => params
                .iter()
                .fold(Filter::All, |f, (k, v)| f.and(Filter::eq(k.as_str(), v.clone()))),
            _ => Filter::All,
        };
        let docs = self.store.find(dataset_id, &filter, None, None).await?;
        Ok(docs.into_iter().map(Self::strip_id).collect())
    }

    async fn create(&self, dataset_id: &str, data: &Value, _meta_data: &Value) -> HandlerResult<CreatedRecord> {
        let mut fields = Self::record_fields(data)?;
        let uid = uuid::Uuid::new_v4().to_string();
        fields.insert(ID_FIELD.to_string(), Value::String(uid.clone()));
        self.store.insert_one(dataset_id, fields).await?;
        Ok(CreatedRecord {
            uid,
            data: data.clone(),
        })
    }

    async fn create_for_change(
        &self,
        dataset_id: &str,
        key: &str,
        data: &Value,
        _meta_data: &Value,
    ) -> HandlerResult<CreatedRecord> {
        let mut fields = Self::record_fields(data)?;
        let uid = Sha256HashProvider::digest(key);
        fields.insert(ID_FIELD.to_string(), Value::String(uid.clone()));
        match self.store.insert_one(dataset_id, fields).await {
            Ok(_) => Ok(CreatedRecord {
                uid,
                data: data.clone(),
            }),
            Err(e) if e.is_duplicate_key() => {
                let Some(existing) = self.store.find_one(dataset_id, &Filter::id(uid.as_str())).await? else {
                    return Err(e.into());
                };
                debug!(dataset_id = %dataset_id, uid = %uid, "record already created for change");
                Ok(CreatedRecord {
                    uid,
                    data: Self::strip_id(existing).1,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, dataset_id: &str, uid: &str, _meta_data: &Value) -> HandlerResult<Option<Value>> {
        let doc = self.store.find_one(dataset_id, &Filter::id(uid)).await?;
        Ok(doc.map(|d| Self::strip_id(d).1))
    }

    async fn update(&self, dataset_id: &str, uid: &str, data: &Value, _meta_data: &Value) -> HandlerResult<Value> {
        let fields = Self::record_fields(data)?;
        let stored = self
            .store
            .find_one_and_update(
                dataset_id,
                &Filter::id(uid),
                None,
                &Patch::replace(fields),
                UpdateOptions::default(),
            )
            .await?;
        match stored {
            Some(doc) => Ok(Self::strip_id(doc).1),
            None => Err(HandlerError::permanent(format!("record {uid} does not exist"))),
        }
    }

    async fn delete(&self, dataset_id: &str, uid: &str, _meta_data: &Value) -> HandlerResult<()> {
        self.store.delete_many(dataset_id, &Filter::id(uid)).await?;
        Ok(())
    }

    async fn handle_collision(
        &self,
        dataset_id: &str,
        collision: &CollisionRecord,
        _meta_data: &Value,
    ) -> HandlerResult<()> {
        let collection = Self::collision_collection(dataset_id);
        let doc = document(serde_json::to_value(collision).map_err(|e| HandlerError::permanent(e.to_string()))?);
        self.store
            .find_one_and_update(
                &collection,
                &Filter::id(collision.hash.as_str()),
                None,
                &Patch::replace(doc),
                UpdateOptions::upsert(),
            )
            .await?;
        Ok(())
    }

    async fn list_collisions(&self, dataset_id: &str, _meta_data: &Value) -> HandlerResult<Vec<CollisionRecord>> {
        let docs = self
            .store
            .find(&Self::collision_collection(dataset_id), &Filter::All, None, None)
            .await?;
        docs.into_iter()
            .map(|d| {
                serde_json::from_value(Self::strip_id(d).1).map_err(|e| HandlerError::permanent(e.to_string()))
            })
            .collect()
    }

    async fn remove_collision(&self, dataset_id: &str, hash: &str, _meta_data: &Value) -> HandlerResult<bool> {
        let removed = self
            .store
            .delete_many(&Self::collision_collection(dataset_id), &Filter::id(hash))
            .await?;
        Ok(removed > 0)
    }
}

/// Data handlers by dataset, with a global default.
pub struct DataHandlers {
    default: Arc<dyn DataHandler>,
    global: RwLock<Arc<dyn DataHandler>>,
    datasets: RwLock<HashMap<String, Arc<dyn DataHandler>>>,
}

impl DataHandlers {
    /// Creates a registry whose global handler is `default`.
    pub fn new(default: Arc<dyn DataHandler>) -> Self {
        Self {
            global: RwLock::new(Arc::clone(&default)),
            default,
            datasets: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces the handler used by datasets without an override.
    pub fn set_global(&self, handler: Arc<dyn DataHandler>) {
        *self.global.write() = handler;
    }

    /// Overrides the handler of one dataset.
    pub fn set_for_dataset(&self, dataset_id: impl Into<String>, handler: Arc<dyn DataHandler>) {
        self.datasets.write().insert(dataset_id.into(), handler);
    }

    /// The handler serving `dataset_id`.
    pub fn for_dataset(&self, dataset_id: &str) -> Arc<dyn DataHandler> {
        if let Some(handler) = self.datasets.read().get(dataset_id) {
            return Arc::clone(handler);
        }
        self.global.read().clone()
    }

    /// Drops every override and restores the default handler.
    pub fn restore(&self) {
        self.datasets.write().clear();
        *self.global.write() = Arc::clone(&self.default);
    }
}
