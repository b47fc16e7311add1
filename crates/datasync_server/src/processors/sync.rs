use super::store_failure;
use crate::handlers::DataHandlers;
use crate::storage::SyncStorage;
use async_trait::async_trait;
use datasync_engine::metrics::{self, Metrics, Timer};
use datasync_engine::{Clock, ProcessError, Processor, QueueMessage};
use datasync_protocol::{DatasetClient, HashProvider, Update, UpdateType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Payload of a sync queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    /// Dataset id.
    pub dataset_id: String,
    /// Dataset client to sync.
    pub dataset_client_id: String,
}

/// Recomputes a dataset client's view and emits record-level updates.
pub struct SyncProcessor {
    storage: Arc<SyncStorage>,
    handlers: Arc<DataHandlers>,
    hasher: Arc<dyn HashProvider>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
}

impl SyncProcessor {
    /// Creates the processor.
    pub fn new(
        storage: Arc<SyncStorage>,
        handlers: Arc<DataHandlers>,
        hasher: Arc<dyn HashProvider>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            handlers,
            hasher,
            metrics,
            clock,
        }
    }

    /// Updates taking one client connection from the records it was last
    /// sent to `current` (uid to record hash).
    fn diff(
        &self,
        client: &DatasetClient,
        cuid: &str,
        records: &BTreeMap<String, Value>,
        current: &BTreeMap<String, String>,
        now: i64,
    ) -> Vec<Update> {
        let previous = &client.records;
        let mut updates = Vec::new();
        for (uid, hash) in current {
            let update_type = match previous.get(uid) {
                None => UpdateType::Create,
                Some(old) if old != hash => UpdateType::Update,
                Some(_) => continue,
            };
            let update = self
                .record_update(client, cuid, uid, update_type, hash, now)
                .with_record(records.get(uid).cloned().unwrap_or(Value::Null));
            updates.push(update);
        }
        for (uid, hash) in previous {
            if !current.contains_key(uid) {
                updates.push(self.record_update(client, cuid, uid, UpdateType::Delete, hash, now));
            }
        }
        updates
    }

    fn record_update(
        &self,
        client: &DatasetClient,
        cuid: &str,
        uid: &str,
        update_type: UpdateType,
        record_hash: &str,
        now: i64,
    ) -> Update {
        let identity = json!({"uid": uid, "type": update_type.as_str(), "hash": record_hash});
        let hash = self.hasher.record_hash(&client.dataset_id, &identity);
        Update::new(&client.dataset_id, cuid, hash, update_type, uid).at(now)
    }
}

#[async_trait]
impl Processor for SyncProcessor {
    async fn process(&self, message: &QueueMessage) -> Result<(), ProcessError> {
        let timer = Timer::start();
        let job: SyncJob = message.payload_as()?;
        let Some(client) = self
            .storage
            .read_dataset_client(&job.dataset_client_id)
            .await
            .map_err(store_failure)?
        else {
            debug!(dataset_id = %job.dataset_id, client = %job.dataset_client_id, "dataset client gone");
            return Ok(());
        };
        if client.stopped {
            debug!(dataset_id = %client.dataset_id, client = %client.id, "dataset client stopped");
            return Ok(());
        }

        let handler = self.handlers.for_dataset(&client.dataset_id);
        let list_timer = Timer::start();
        let listed = handler
            .list(&client.dataset_id, &client.query_params, &client.meta_data)
            .await;
        let tags = metrics::tags([("operation", "list"), ("dataset_id", client.dataset_id.as_str())]);
        self.metrics
            .record_time(metrics::SYNC_HANDLER_OPERATION_TIME, &tags, list_timer);
        let records = match listed {
            Ok(records) => records,
            Err(e) if e.is_permanent() => return Err(ProcessError::Discard(e.to_string())),
            Err(e) => return Err(ProcessError::Retry(e.to_string())),
        };

        let hashes: BTreeMap<String, String> = records
            .iter()
            .map(|(uid, record)| (uid.clone(), self.hasher.record_hash(&client.dataset_id, record)))
            .collect();
        let record_hashes: Vec<String> = hashes.values().cloned().collect();
        let global_hash = self.hasher.global_hash(&client.dataset_id, &record_hashes);

        if client.global_hash.as_deref() == Some(global_hash.as_str()) {
            self.storage
                .mark_sync_completed(&client.id, None)
                .await
                .map_err(store_failure)?;
        } else {
            let now = self.clock.now_ms();
            let mut emitted = 0;
            for cuid in &client.cuids {
                for update in self.diff(&client, cuid, &records, &hashes, now) {
                    self.storage.save_update(&update).await.map_err(store_failure)?;
                    emitted += 1;
                }
            }
            self.storage
                .mark_sync_completed(&client.id, Some((global_hash.as_str(), &hashes)))
                .await
                .map_err(store_failure)?;
            info!(
                dataset_id = %client.dataset_id,
                client = %client.id,
                records = hashes.len(),
                emitted,
                "dataset changed"
            );
        }

        let tags = metrics::tags([("dataset_id", client.dataset_id.as_str())]);
        self.metrics
            .record_time(metrics::SYNC_REQUEST_TOTAL_PROCESS_TIME, &tags, timer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{DataHandler, StoreDataHandler};
    use crate::storage::ClientAccess;
    use datasync_engine::{ManualClock, MessageState};
    use datasync_protocol::Sha256HashProvider;
    use datasync_store::{DocumentStore, InMemoryStore};

    struct Fixture {
        storage: Arc<SyncStorage>,
        handler: Arc<StoreDataHandler>,
        processor: SyncProcessor,
        client: DatasetClient,
    }

    async fn fixture(cuids: &[&str]) -> Fixture {
        let clock = Arc::new(ManualClock::new(5_000));
        let metrics = Arc::new(Metrics::new(10, clock.clone()));
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore::new());
        let storage = Arc::new(SyncStorage::new(store.clone(), clock.clone(), metrics.clone()));
        storage.create().await.unwrap();
        let mut client = None;
        for cuid in cuids {
            let access = ClientAccess {
                dataset_id: "todos".into(),
                query_params: json!({}),
                meta_data: json!({}),
                cuid: cuid.to_string(),
                accessed_at: 1,
            };
            client = Some(storage.upsert_dataset_client(&access).await.unwrap());
        }
        let handler = Arc::new(StoreDataHandler::new(store));
        let processor = SyncProcessor::new(
            storage.clone(),
            Arc::new(DataHandlers::new(handler.clone())),
            Arc::new(Sha256HashProvider),
            metrics,
            clock,
        );
        Fixture {
            storage,
            handler,
            processor,
            client: client.unwrap(),
        }
    }

    fn job(client: &DatasetClient) -> QueueMessage {
        let job = SyncJob {
            dataset_id: client.dataset_id.clone(),
            dataset_client_id: client.id.clone(),
        };
        QueueMessage {
            id: "m".into(),
            payload: serde_json::to_value(job).unwrap(),
            state: MessageState::InFlight,
            visible_at: 0,
            created_at: 0,
            acked_at: None,
            tries: 1,
            ack: Some("a".into()),
        }
    }

    fn types(updates: &[Update]) -> BTreeMap<String, UpdateType> {
        updates.iter().map(|u| (u.uid.clone(), u.update_type)).collect()
    }

    #[tokio::test]
    async fn emits_record_changes_per_cuid() {
        let f = fixture(&["c1", "c2"]).await;
        let md = Value::Null;
        let keep = f.handler.create("todos", &json!({"n": 1}), &md).await.unwrap();
        let edit = f.handler.create("todos", &json!({"n": 2}), &md).await.unwrap();
        let gone = f.handler.create("todos", &json!({"n": 3}), &md).await.unwrap();

        f.processor.process(&job(&f.client)).await.unwrap();
        let first = f.storage.list_updates("todos", "c1").await.unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|u| u.update_type == UpdateType::Create));
        assert_eq!(f.storage.list_updates("todos", "c2").await.unwrap().len(), 3);

        let client = f.storage.read_dataset_client(&f.client.id).await.unwrap().unwrap();
        assert!(client.global_hash.is_some());
        assert_eq!(client.records.len(), 3);
        assert_eq!(client.sync_completed, Some(5_000));

        f.handler.update("todos", &edit.uid, &json!({"n": 20}), &md).await.unwrap();
        f.handler.delete("todos", &gone.uid, &md).await.unwrap();
        let added = f.handler.create("todos", &json!({"n": 4}), &md).await.unwrap();
        f.processor.process(&job(&client)).await.unwrap();

        let all = f.storage.list_updates("todos", "c1").await.unwrap();
        let second: Vec<Update> = all.into_iter().filter(|u| !first.contains(u)).collect();
        let by_uid = types(&second);
        assert_eq!(by_uid.len(), 3);
        assert_eq!(by_uid[&edit.uid], UpdateType::Update);
        assert_eq!(by_uid[&gone.uid], UpdateType::Delete);
        assert_eq!(by_uid[&added.uid], UpdateType::Create);
        assert!(!by_uid.contains_key(&keep.uid));
        let update = second.iter().find(|u| u.uid == edit.uid).unwrap();
        assert_eq!(update.record_data, Some(json!({"n": 20})));
    }

    #[tokio::test]
    async fn unchanged_dataset_only_marks_completion() {
        let f = fixture(&["c1"]).await;
        f.handler.create("todos", &json!({"n": 1}), &Value::Null).await.unwrap();
        f.processor.process(&job(&f.client)).await.unwrap();
        let before = f.storage.list_updates("todos", "c1").await.unwrap();

        f.processor.process(&job(&f.client)).await.unwrap();
        assert_eq!(f.storage.list_updates("todos", "c1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn repeated_job_does_not_duplicate_updates() {
        let f = fixture(&["c1"]).await;
        f.handler.create("todos", &json!({"n": 1}), &Value::Null).await.unwrap();
        // Same stale client snapshot twice, as after a redelivery.
        let stale = job(&f.client);
        f.processor.process(&stale).await.unwrap();
        f.storage
            .mark_sync_completed(&f.client.id, Some(("reset", &BTreeMap::new())))
            .await
            .unwrap();
        f.processor.process(&stale).await.unwrap();
        assert_eq!(f.storage.list_updates("todos", "c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stopped_or_missing_clients_are_skipped() {
        let f = fixture(&["c1"]).await;
        f.handler.create("todos", &json!({"n": 1}), &Value::Null).await.unwrap();
        f.storage.set_dataset_clients_stopped(Some("todos"), true).await.unwrap();
        f.processor.process(&job(&f.client)).await.unwrap();
        assert!(f.storage.list_updates("todos", "c1").await.unwrap().is_empty());

        let mut ghost = f.client.clone();
        ghost.id = "missing".into();
        f.processor.process(&job(&ghost)).await.unwrap();
    }
}
