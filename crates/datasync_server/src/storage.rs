//! Sync state persisted in the document store.
//!
//! Three collections hold everything the processors and the sync API share:
//!
//! - dataset clients, keyed by the client's content-derived id
//! - updates, unique per `(datasetId, cuid, hash)`
//! - pending change lifecycle records, unique per `(datasetId, cuid, hash)`
//!
//! Writes that may be repeated by a redelivered job are upserts, so
//! replaying a job never duplicates state.

use datasync_engine::metrics::{self, Metrics, Timer};
use datasync_engine::Clock;
use datasync_protocol::{Acknowledgement, DatasetClient, PendingChange, PendingStatus, Update};
use datasync_store::{
    document, Document, DocumentStore, Filter, IndexSpec, Patch, Sort, StoreError, StoreResult,
    UpdateOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Collection of dataset clients.
pub const DATASET_CLIENTS_COLLECTION: &str = "datasync_dataset_clients";
/// Collection of updates awaiting acknowledgement.
pub const UPDATES_COLLECTION: &str = "datasync_updates";
/// Collection of pending change lifecycle records.
pub const PENDING_COLLECTION: &str = "datasync_pending_changes";

/// Fields written on every sync request for a dataset client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientAccess {
    /// Dataset id.
    pub dataset_id: String,
    /// Client query parameters.
    pub query_params: Value,
    /// Client meta data.
    pub meta_data: Value,
    /// Connection that made the request.
    pub cuid: String,
    /// Access time (ms).
    pub accessed_at: i64,
}

/// Lifecycle record of a pending change.
///
/// Records outlive the acknowledgement of their update so a redelivered
/// change is still recognised as processed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecord {
    /// Current status.
    pub status: PendingStatus,
    /// Meta data the change was submitted with.
    #[serde(default, rename = "meta_data")]
    pub meta_data: Value,
    /// Uid assigned by the data handler to a created record.
    #[serde(default)]
    pub created_uid: Option<String>,
    /// Record returned by the data handler on create.
    #[serde(default)]
    pub created_record: Option<Value>,
    /// When the client acknowledged the resulting update (ms).
    #[serde(default)]
    pub acknowledged_at: Option<i64>,
}

/// Typed access to the sync collections.
pub struct SyncStorage {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for SyncStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStorage").finish_non_exhaustive()
    }
}

impl SyncStorage {
    /// Creates storage over a shared store.
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, metrics: Arc<Metrics>) -> Self {
        Self { store, clock, metrics }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Provisions the sync collections. Idempotent.
    pub async fn create(&self) -> StoreResult<()> {
        let by_change = IndexSpec::new(["datasetId", "cuid", "hash"]).unique();
        self.store
            .create_collection(
                DATASET_CLIENTS_COLLECTION,
                &[IndexSpec::new(["datasetId", "stopped"])],
            )
            .await?;
        self.store
            .create_collection(UPDATES_COLLECTION, &[by_change.clone()])
            .await?;
        self.store
            .create_collection(PENDING_COLLECTION, &[by_change])
            .await
    }

    // ---- dataset clients ----

    /// Reads a dataset client by id.
    pub async fn read_dataset_client(&self, id: &str) -> StoreResult<Option<DatasetClient>> {
        let timer = Timer::start();
        let doc = self
            .store
            .find_one(DATASET_CLIENTS_COLLECTION, &Filter::id(id))
            .await?;
        self.record(DATASET_CLIENTS_COLLECTION, "read", timer);
        doc.map(decode).transpose()
    }

    /// Records a client access, creating the dataset client if needed.
    pub async fn upsert_dataset_client(&self, access: &ClientAccess) -> StoreResult<DatasetClient> {
        let timer = Timer::start();
        let id = DatasetClient::compute_id(&access.dataset_id, &access.query_params, &access.meta_data);
        let patch = Patch::new()
            .set("datasetId", access.dataset_id.as_str())
            .set("queryParams", access.query_params.clone())
            .set("metaData", access.meta_data.clone())
            .set("lastAccessed", access.accessed_at)
            .set_on_insert("stopped", false)
            .add_to_set("cuids", access.cuid.as_str());
        let doc = self
            .store
            .find_one_and_update(
                DATASET_CLIENTS_COLLECTION,
                &Filter::id(id.as_str()),
                None,
                &patch,
                UpdateOptions::upsert(),
            )
            .await?
            .ok_or_else(|| StoreError::InvalidDocument(format!("upsert of dataset client {id} returned nothing")))?;
        self.record(DATASET_CLIENTS_COLLECTION, "upsert", timer);
        decode(doc)
    }

    /// Lists dataset clients, optionally restricted to one dataset and to
    /// clients that are not stopped.
    pub async fn list_dataset_clients(
        &self,
        dataset_id: Option<&str>,
        include_stopped: bool,
    ) -> StoreResult<Vec<DatasetClient>> {
        let timer = Timer::start();
        let mut filter = Filter::All;
        if let Some(dataset_id) = dataset_id {
            filter = filter.and(Filter::eq("datasetId", dataset_id));
        }
        if !include_stopped {
            filter = filter.and(Filter::ne("stopped", true));
        }
        let docs = self
            .store
            .find(DATASET_CLIENTS_COLLECTION, &filter, None, None)
            .await?;
        self.record(DATASET_CLIENTS_COLLECTION, "list", timer);
        docs.into_iter().map(decode).collect()
    }

    /// Sets `stopped` on every client of a dataset, or of all datasets.
    pub async fn set_dataset_clients_stopped(&self, dataset_id: Option<&str>, stopped: bool) -> StoreResult<u64> {
        let timer = Timer::start();
        let filter = match dataset_id {
            Some(dataset_id) => Filter::eq("datasetId", dataset_id),
            None => Filter::All,
        };
        let count = self
            .store
            .update_many(DATASET_CLIENTS_COLLECTION, &filter, &Patch::new().set("stopped", stopped))
            .await?;
        self.record(DATASET_CLIENTS_COLLECTION, "update_many", timer);
        debug!(dataset_id = ?dataset_id, stopped, count, "dataset clients updated");
        Ok(count)
    }

    /// Marks a client as scheduled unless it was scheduled after `not_after`.
    ///
    /// Returns false if another scheduler got there first.
    pub async fn mark_sync_scheduled(&self, id: &str, not_after: i64) -> StoreResult<bool> {
        let timer = Timer::start();
        let filter = Filter::id(id).and(
            Filter::exists("syncScheduled", false).or(Filter::lte("syncScheduled", not_after)),
        );
        let patch = Patch::new().set("syncScheduled", self.clock.now_ms());
        let updated = self
            .store
            .find_one_and_update(DATASET_CLIENTS_COLLECTION, &filter, None, &patch, UpdateOptions::default())
            .await?;
        self.record(DATASET_CLIENTS_COLLECTION, "schedule", timer);
        Ok(updated.is_some())
    }

    /// Clears the scheduling mark of a client so the next pass picks it up.
    pub async fn clear_sync_scheduled(&self, id: &str) -> StoreResult<()> {
        let timer = Timer::start();
        self.store
            .update_many(DATASET_CLIENTS_COLLECTION, &Filter::id(id), &Patch::new().unset("syncScheduled"))
            .await?;
        self.record(DATASET_CLIENTS_COLLECTION, "unschedule", timer);
        Ok(())
    }

    /// Records the outcome of a sync pass.
    ///
    /// `state` carries the new global hash and record hashes when the
    /// dataset changed.
    pub async fn mark_sync_completed(
        &self,
        id: &str,
        state: Option<(&str, &BTreeMap<String, String>)>,
    ) -> StoreResult<()> {
        let timer = Timer::start();
        let mut patch = Patch::new().set("syncCompleted", self.clock.now_ms());
        if let Some((global_hash, records)) = state {
            patch = patch
                .set("globalHash", global_hash)
                .set("records", serde_json::to_value(records)?);
        }
        self.store
            .update_many(DATASET_CLIENTS_COLLECTION, &Filter::id(id), &patch)
            .await?;
        self.record(DATASET_CLIENTS_COLLECTION, "complete", timer);
        Ok(())
    }

    // ---- updates ----

    /// Saves an update, replacing any with the same `(datasetId, cuid, hash)`.
    pub async fn save_update(&self, update: &Update) -> StoreResult<()> {
        let timer = Timer::start();
        let filter = change_key(&update.dataset_id, &update.cuid, &update.hash);
        let fields = encode(update)?;
        self.store
            .find_one_and_update(
                UPDATES_COLLECTION,
                &filter,
                None,
                &Patch::new().set_all(fields),
                UpdateOptions::upsert(),
            )
            .await?;
        self.record(UPDATES_COLLECTION, "upsert", timer);
        Ok(())
    }

    /// Lists updates for one client connection, oldest first.
    pub async fn list_updates(&self, dataset_id: &str, cuid: &str) -> StoreResult<Vec<Update>> {
        let timer = Timer::start();
        let filter = Filter::eq("datasetId", dataset_id).and(Filter::eq("cuid", cuid));
        let docs = self
            .store
            .find(UPDATES_COLLECTION, &filter, Some(&Sort::asc("timestamp")), None)
            .await?;
        self.record(UPDATES_COLLECTION, "list", timer);
        docs.into_iter().map(decode).collect()
    }

    /// Reads the update an acknowledgement refers to.
    pub async fn find_update(&self, ack: &Acknowledgement) -> StoreResult<Option<Update>> {
        let timer = Timer::start();
        let doc = self
            .store
            .find_one(UPDATES_COLLECTION, &change_key(&ack.dataset_id, &ack.cuid, &ack.hash))
            .await?;
        self.record(UPDATES_COLLECTION, "read", timer);
        doc.map(decode).transpose()
    }

    /// Removes the update an acknowledgement refers to.
    pub async fn remove_update(&self, ack: &Acknowledgement) -> StoreResult<u64> {
        let timer = Timer::start();
        let removed = self
            .store
            .delete_many(UPDATES_COLLECTION, &change_key(&ack.dataset_id, &ack.cuid, &ack.hash))
            .await?;
        self.record(UPDATES_COLLECTION, "delete", timer);
        Ok(removed)
    }

    // ---- pending change lifecycle ----

    /// Lifecycle record of a pending change, if it has been seen before.
    pub async fn pending_record(&self, change: &PendingChange) -> StoreResult<Option<PendingRecord>> {
        self.read_pending(&change_key(&change.dataset_id, &change.cuid, &change.hash))
            .await
    }

    /// Lifecycle record of the change an acknowledgement refers to.
    pub async fn acknowledged_record(&self, ack: &Acknowledgement) -> StoreResult<Option<PendingRecord>> {
        self.read_pending(&change_key(&ack.dataset_id, &ack.cuid, &ack.hash))
            .await
    }

    /// Status of a pending change, if it has been seen before.
    pub async fn pending_status(&self, change: &PendingChange) -> StoreResult<Option<PendingStatus>> {
        Ok(self.pending_record(change).await?.map(|r| r.status))
    }

    /// Saves a pending change with the given status.
    pub async fn save_pending(&self, change: &PendingChange, status: PendingStatus) -> StoreResult<()> {
        let timer = Timer::start();
        let mut fields = encode(change)?;
        fields.insert("status".to_string(), Value::from(status.as_str()));
        self.store
            .find_one_and_update(
                PENDING_COLLECTION,
                &change_key(&change.dataset_id, &change.cuid, &change.hash),
                None,
                &Patch::new().set_all(fields),
                UpdateOptions::upsert(),
            )
            .await?;
        self.record(PENDING_COLLECTION, "upsert", timer);
        Ok(())
    }

    /// Remembers the record a data handler created for a pending change.
    ///
    /// A retried create reuses it instead of creating the record again.
    pub async fn save_created(&self, change: &PendingChange, uid: &str, record: &Value) -> StoreResult<()> {
        let timer = Timer::start();
        let patch = Patch::new()
            .set("createdUid", uid)
            .set("createdRecord", record.clone());
        self.store
            .update_many(
                PENDING_COLLECTION,
                &change_key(&change.dataset_id, &change.cuid, &change.hash),
                &patch,
            )
            .await?;
        self.record(PENDING_COLLECTION, "created", timer);
        Ok(())
    }

    /// Stamps the lifecycle record an acknowledgement refers to.
    pub async fn acknowledge_pending(&self, ack: &Acknowledgement) -> StoreResult<u64> {
        let timer = Timer::start();
        let stamped = self
            .store
            .update_many(
                PENDING_COLLECTION,
                &change_key(&ack.dataset_id, &ack.cuid, &ack.hash),
                &Patch::new().set("acknowledgedAt", self.clock.now_ms()),
            )
            .await?;
        self.record(PENDING_COLLECTION, "acknowledge", timer);
        Ok(stamped)
    }

    async fn read_pending(&self, key: &Filter) -> StoreResult<Option<PendingRecord>> {
        let timer = Timer::start();
        let doc = self.store.find_one(PENDING_COLLECTION, key).await?;
        self.record(PENDING_COLLECTION, "read", timer);
        doc.map(decode).transpose()
    }

    fn record(&self, collection: &str, operation: &str, timer: Timer) {
        let tags = metrics::tags([("collection", collection), ("operation", operation)]);
        self.metrics.record_time(metrics::STORE_OPERATION_TIME, &tags, timer);
    }
}

fn change_key(dataset_id: &str, cuid: &str, hash: &str) -> Filter {
    Filter::eq("datasetId", dataset_id)
        .and(Filter::eq("cuid", cuid))
        .and(Filter::eq("hash", hash))
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Document> {
    match serde_json::to_value(value)? {
        Value::Object(fields) => Ok(fields),
        other => Ok(document(other)),
    }
}

fn decode<T: DeserializeOwned>(doc: Document) -> StoreResult<T> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}
