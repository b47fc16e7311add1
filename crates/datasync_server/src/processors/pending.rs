use super::store_failure;
use crate::error::HandlerError;
use crate::handlers::{CollisionRecord, CreatedRecord, DataHandler, DataHandlers};
use crate::storage::SyncStorage;
use async_trait::async_trait;
use datasync_engine::metrics::{self, Metrics, Timer};
use datasync_engine::{Clock, ProcessError, Processor, QueueMessage};
use datasync_protocol::{HashProvider, PendingAction, PendingChange, PendingStatus, Update, UpdateType};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a pending change ended.
enum Resolution {
    Applied { uid: String, old_uid: Option<String>, record: Option<Value> },
    Failed(String),
    Collision { server_record: Value },
}

/// Applies client changes through the dataset's data handler.
///
/// A change is identified by `(datasetId, cuid, hash)`. Once it reaches a
/// terminal status, redeliveries are ignored. A create that succeeded in
/// the handler is remembered on the lifecycle record before its update is
/// written, so a retry reports the same record instead of creating another.
pub struct PendingProcessor {
    storage: Arc<SyncStorage>,
    handlers: Arc<DataHandlers>,
    hasher: Arc<dyn HashProvider>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
}

impl PendingProcessor {
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

    async fn resolve(
        &self,
        handler: &dyn DataHandler,
        change: &PendingChange,
        earlier: Option<CreatedRecord>,
    ) -> Result<Resolution, HandlerError> {
        if let Err(e) = change.validate() {
            return Ok(Resolution::Failed(e.to_string()));
        }
        let ds = change.dataset_id.as_str();
        let md = &change.meta_data;
        match change.action {
            PendingAction::Create => {
                let created = match earlier {
                    Some(created) => {
                        debug!(dataset_id = %ds, uid = %created.uid, "reusing record created by an earlier attempt");
                        created
                    }
                    None => {
                        let post = change.post.clone().unwrap_or(Value::Null);
                        let key = format!("{}:{}:{}", ds, change.cuid, change.hash);
                        let created = self
                            .timed("create", ds, handler.create_for_change(ds, &key, &post, md))
                            .await?;
                        self.storage
                            .save_created(change, &created.uid, &created.data)
                            .await?;
                        created
                    }
                };
                Ok(Resolution::Applied {
                    uid: created.uid,
                    old_uid: Some(change.uid.clone()),
                    record: Some(created.data),
                })
            }
            PendingAction::Update => {
                let Some(current) = self.timed("read", ds, handler.read(ds, &change.uid, md)).await? else {
                    return Ok(Resolution::Failed(format!("record {} does not exist", change.uid)));
                };
                let current_hash = self.hasher.record_hash(ds, &current);
                if change.post_hash.as_deref() == Some(current_hash.as_str()) {
                    debug!(dataset_id = %ds, uid = %change.uid, "update already applied");
                    return Ok(Resolution::Applied {
                        uid: change.uid.clone(),
                        old_uid: None,
                        record: Some(current),
                    });
                }
                if change.pre_hash.as_deref() != Some(current_hash.as_str()) {
                    return self.collide(handler, change, current).await;
                }
                let post = change.post.clone().unwrap_or(Value::Null);
                let stored = self
                    .timed("update", ds, handler.update(ds, &change.uid, &post, md))
                    .await?;
                Ok(Resolution::Applied {
                    uid: change.uid.clone(),
                    old_uid: None,
                    record: Some(stored),
                })
            }
            PendingAction::Delete => {
                let Some(current) = self.timed("read", ds, handler.read(ds, &change.uid, md)).await? else {
                    return Ok(Resolution::Applied {
                        uid: change.uid.clone(),
                        old_uid: None,
                        record: None,
                    });
                };
                let current_hash = self.hasher.record_hash(ds, &current);
                if change.pre_hash.as_deref() != Some(current_hash.as_str()) {
                    return self.collide(handler, change, current).await;
                }
                self.timed("delete", ds, handler.delete(ds, &change.uid, md)).await?;
                Ok(Resolution::Applied {
                    uid: change.uid.clone(),
                    old_uid: None,
                    record: None,
                })
            }
        }
    }

    async fn collide(
        &self,
        handler: &dyn DataHandler,
        change: &PendingChange,
        server_record: Value,
    ) -> Result<Resolution, HandlerError> {
        let ds = change.dataset_id.as_str();
        let collision = CollisionRecord {
            hash: change.hash.clone(),
            uid: change.uid.clone(),
            dataset_id: change.dataset_id.clone(),
            cuid: change.cuid.clone(),
            action: change.action.as_str().to_string(),
            pre: change.pre.clone(),
            post: change.post.clone(),
            server_record: Some(server_record.clone()),
            timestamp: self.clock.now_ms(),
        };
        self.timed(
            "handle_collision",
            ds,
            handler.handle_collision(ds, &collision, &change.meta_data),
        )
        .await?;
        info!(dataset_id = %ds, uid = %change.uid, hash = %change.hash, "collision detected");
        Ok(Resolution::Collision { server_record })
    }

    async fn timed<T>(
        &self,
        operation: &str,
        dataset_id: &str,
        call: impl std::future::Future<Output = Result<T, HandlerError>>,
    ) -> Result<T, HandlerError> {
        let timer = Timer::start();
        let result = call.await;
        let tags = metrics::tags([("operation", operation), ("dataset_id", dataset_id)]);
        self.metrics
            .record_time(metrics::SYNC_HANDLER_OPERATION_TIME, &tags, timer);
        result
    }

    async fn finish(&self, change: &PendingChange, resolution: Resolution) -> Result<(), ProcessError> {
        let now = self.clock.now_ms();
        let (status, update) = match resolution {
            Resolution::Applied { uid, old_uid, record } => {
                let mut update = Update::new(&change.dataset_id, &change.cuid, &change.hash, UpdateType::Applied, uid);
                update.old_uid = old_uid;
                update.record_data = record;
                (PendingStatus::Applied, update)
            }
            Resolution::Failed(reason) => {
                warn!(
                    dataset_id = %change.dataset_id,
                    cuid = %change.cuid,
                    hash = %change.hash,
                    %reason,
                    "pending change failed"
                );
                let update = Update::new(
                    &change.dataset_id,
                    &change.cuid,
                    &change.hash,
                    UpdateType::Failed,
                    &change.uid,
                )
                .with_message(reason);
                (PendingStatus::Failed, update)
            }
            Resolution::Collision { server_record } => {
                let update = Update::new(
                    &change.dataset_id,
                    &change.cuid,
                    &change.hash,
                    UpdateType::Collision,
                    &change.uid,
                )
                .with_record(server_record);
                (PendingStatus::Collision, update)
            }
        };
        self.storage
            .save_update(&update.at(now))
            .await
            .map_err(store_failure)?;
        self.storage
            .save_pending(change, status)
            .await
            .map_err(store_failure)?;
        debug!(
            dataset_id = %change.dataset_id,
            cuid = %change.cuid,
            hash = %change.hash,
            status = status.as_str(),
            "pending change processed"
        );
        Ok(())
    }
}

#[async_trait]
impl Processor for PendingProcessor {
    async fn process(&self, message: &QueueMessage) -> Result<(), ProcessError> {
        let timer = Timer::start();
        let change: PendingChange = message.payload_as()?;

        let record = self.storage.pending_record(&change).await.map_err(store_failure)?;
        if record.as_ref().is_some_and(|r| r.status.is_terminal()) {
            debug!(dataset_id = %change.dataset_id, hash = %change.hash, "pending change already processed");
            return Ok(());
        }
        let earlier = record.and_then(|r| {
            r.created_uid.map(|uid| CreatedRecord {
                uid,
                data: r.created_record.unwrap_or(Value::Null),
            })
        });
        self.storage
            .save_pending(&change, PendingStatus::Inflight)
            .await
            .map_err(store_failure)?;

        let handler = self.handlers.for_dataset(&change.dataset_id);
        let resolution = match self.resolve(handler.as_ref(), &change, earlier).await {
            Ok(resolution) => resolution,
            Err(e) if e.is_permanent() => Resolution::Failed(e.to_string()),
            Err(e) => return Err(ProcessError::Retry(e.to_string())),
        };
        let result = self.finish(&change, resolution).await;

        let tags = metrics::tags([("dataset_id", change.dataset_id.as_str()), ("action", change.action.as_str())]);
        self.metrics
            .record_time(metrics::PENDING_CHANGE_PROCESS_TIME, &tags, timer);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::StoreDataHandler;
    use crate::processors::AckProcessor;
    use crate::storage::UPDATES_COLLECTION;
    use crate::testing::FailOnce;
    use datasync_engine::ManualClock;
    use datasync_protocol::{Acknowledgement, Sha256HashProvider};
    use datasync_store::{DocumentStore, InMemoryStore};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Fixture {
        store: Arc<FailOnce>,
        storage: Arc<SyncStorage>,
        handler: Arc<StoreDataHandler>,
        handlers: Arc<DataHandlers>,
        processor: PendingProcessor,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(5_000));
        let metrics = Arc::new(Metrics::new(10, clock.clone()));
        let store = Arc::new(FailOnce::new(Arc::new(InMemoryStore::new())));
        let shared: Arc<dyn DocumentStore> = store.clone();
        let storage = Arc::new(SyncStorage::new(shared.clone(), clock.clone(), metrics.clone()));
        storage.create().await.unwrap();
        let handler = Arc::new(StoreDataHandler::new(shared));
        let handlers = Arc::new(DataHandlers::new(handler.clone()));
        let processor = PendingProcessor::new(
            storage.clone(),
            handlers.clone(),
            Arc::new(Sha256HashProvider),
            metrics,
            clock,
        );
        Fixture {
            store,
            storage,
            handler,
            handlers,
            processor,
        }
    }

    fn message(change: &PendingChange) -> QueueMessage {
        QueueMessage {
            id: "m1".into(),
            payload: serde_json::to_value(change).unwrap(),
            state: datasync_engine::MessageState::InFlight,
            visible_at: 0,
            created_at: 0,
            acked_at: None,
            tries: 1,
            ack: Some("a".into()),
        }
    }

    fn ack_message(ack: &Acknowledgement) -> QueueMessage {
        QueueMessage {
            payload: serde_json::to_value(ack).unwrap(),
            ..message(&scoped(PendingChange::create("x", "x", json!({}), "x")))
        }
    }

    fn scoped(mut change: PendingChange) -> PendingChange {
        change.dataset_id = "todos".into();
        change.cuid = "c1".into();
        change
    }

    fn hash(record: &Value) -> String {
        Sha256HashProvider.record_hash("todos", record)
    }

    async fn only_update(f: &Fixture) -> Update {
        let mut updates = f.storage.list_updates("todos", "c1").await.unwrap();
        assert_eq!(updates.len(), 1);
        updates.remove(0)
    }

    #[tokio::test]
    async fn create_reports_new_uid() {
        let f = fixture().await;
        let post = json!({"name": "milk"});
        let change = scoped(PendingChange::create("p1", "tmp-1", post.clone(), hash(&post)));
        f.processor.process(&message(&change)).await.unwrap();

        let update = only_update(&f).await;
        assert_eq!(update.update_type, UpdateType::Applied);
        assert_eq!(update.hash, "p1");
        assert_eq!(update.old_uid.as_deref(), Some("tmp-1"));
        assert_ne!(update.uid, "tmp-1");
        assert_eq!(update.timestamp, 5_000);
        let stored = f.handler.read("todos", &update.uid, &Value::Null).await.unwrap();
        assert_eq!(stored, Some(post));
        assert_eq!(
            f.storage.pending_status(&change).await.unwrap(),
            Some(PendingStatus::Applied)
        );
    }

    #[tokio::test]
    async fn redelivered_change_is_applied_once() {
        let f = fixture().await;
        let post = json!({"name": "milk"});
        let change = scoped(PendingChange::create("p1", "tmp-1", post.clone(), hash(&post)));
        f.processor.process(&message(&change)).await.unwrap();
        f.processor.process(&message(&change)).await.unwrap();

        let all = f.handler.list("todos", &json!({}), &Value::Null).await.unwrap();
        assert_eq!(all.len(), 1);
        only_update(&f).await;
    }

    #[tokio::test]
    async fn create_retried_after_update_write_failure_is_applied_once() {
        let f = fixture().await;
        let post = json!({"name": "milk"});
        let change = scoped(PendingChange::create("p1", "tmp-1", post.clone(), hash(&post)));

        f.store.arm("find_one_and_update", UPDATES_COLLECTION);
        let err = f.processor.process(&message(&change)).await.unwrap_err();
        assert!(matches!(err, ProcessError::Retry(_)));
        assert!(!f.store.is_armed());
        let record = f.storage.pending_record(&change).await.unwrap().unwrap();
        assert_eq!(record.status, PendingStatus::Inflight);
        let created_uid = record.created_uid.unwrap();

        f.processor.process(&message(&change)).await.unwrap();
        let all = f.handler.list("todos", &json!({}), &Value::Null).await.unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec![&created_uid]);
        let update = only_update(&f).await;
        assert_eq!(update.update_type, UpdateType::Applied);
        assert_eq!(update.uid, created_uid);
        assert_eq!(update.record_data, Some(post));
    }

    #[tokio::test]
    async fn create_redelivered_after_ack_is_not_reapplied() {
        let f = fixture().await;
        let post = json!({"name": "milk"});
        let change = scoped(PendingChange::create("p1", "tmp-1", post.clone(), hash(&post)));
        f.processor.process(&message(&change)).await.unwrap();

        let mut ack = Acknowledgement::new("p1");
        ack.dataset_id = "todos".into();
        ack.cuid = "c1".into();
        let acks = AckProcessor::new(f.storage.clone(), f.handlers.clone());
        acks.process(&ack_message(&ack)).await.unwrap();
        assert!(f.storage.list_updates("todos", "c1").await.unwrap().is_empty());

        f.processor.process(&message(&change)).await.unwrap();
        assert_eq!(f.handler.list("todos", &json!({}), &Value::Null).await.unwrap().len(), 1);
        assert!(f.storage.list_updates("todos", "c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_retried_after_store_failure_keeps_record() {
        let f = fixture().await;
        let pre = json!({"name": "milk"});
        let created = f.handler.create("todos", &pre, &Value::Null).await.unwrap();
        let post = json!({"name": "oat milk"});
        let change = scoped(PendingChange::update("p2", &created.uid, pre.clone(), hash(&pre), post.clone(), hash(&post)));

        f.store.arm("find_one_and_update", "todos");
        let err = f.processor.process(&message(&change)).await.unwrap_err();
        assert!(matches!(err, ProcessError::Retry(_)));
        assert_eq!(f.handler.read("todos", &created.uid, &Value::Null).await.unwrap(), Some(pre));
        assert!(f.storage.list_updates("todos", "c1").await.unwrap().is_empty());

        f.processor.process(&message(&change)).await.unwrap();
        assert_eq!(only_update(&f).await.update_type, UpdateType::Applied);
        assert_eq!(f.handler.read("todos", &created.uid, &Value::Null).await.unwrap(), Some(post));
    }

    #[tokio::test]
    async fn update_with_matching_base_is_applied() {
        let f = fixture().await;
        let pre = json!({"name": "milk"});
        let created = f.handler.create("todos", &pre, &Value::Null).await.unwrap();
        let post = json!({"name": "oat milk"});
        let change = scoped(PendingChange::update("p2", &created.uid, pre.clone(), hash(&pre), post.clone(), hash(&post)));
        f.processor.process(&message(&change)).await.unwrap();

        let update = only_update(&f).await;
        assert_eq!(update.update_type, UpdateType::Applied);
        assert_eq!(update.uid, created.uid);
        assert_eq!(f.handler.read("todos", &created.uid, &Value::Null).await.unwrap(), Some(post));
    }

    #[tokio::test]
    async fn update_already_at_post_state_is_applied() {
        let f = fixture().await;
        let post = json!({"name": "oat milk"});
        let created = f.handler.create("todos", &post, &Value::Null).await.unwrap();
        let pre = json!({"name": "milk"});
        let change = scoped(PendingChange::update("p2", &created.uid, pre.clone(), hash(&pre), post.clone(), hash(&post)));
        f.processor.process(&message(&change)).await.unwrap();
        assert_eq!(only_update(&f).await.update_type, UpdateType::Applied);
    }

    #[tokio::test]
    async fn update_of_moved_record_collides() {
        let f = fixture().await;
        let server = json!({"name": "soy milk"});
        let created = f.handler.create("todos", &server, &Value::Null).await.unwrap();
        let pre = json!({"name": "milk"});
        let post = json!({"name": "oat milk"});
        let change = scoped(PendingChange::update("p3", &created.uid, pre.clone(), hash(&pre), post.clone(), hash(&post)));
        f.processor.process(&message(&change)).await.unwrap();

        let update = only_update(&f).await;
        assert_eq!(update.update_type, UpdateType::Collision);
        assert_eq!(update.record_data, Some(server.clone()));
        // Server record untouched, collision recorded.
        assert_eq!(f.handler.read("todos", &created.uid, &Value::Null).await.unwrap(), Some(server));
        let collisions = f.handler.list_collisions("todos", &Value::Null).await.unwrap();
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].hash, "p3");
        assert_eq!(
            f.storage.pending_status(&change).await.unwrap(),
            Some(PendingStatus::Collision)
        );
    }

    #[tokio::test]
    async fn update_of_missing_record_fails() {
        let f = fixture().await;
        let pre = json!({"name": "milk"});
        let change = scoped(PendingChange::update("p4", "gone", pre.clone(), hash(&pre), json!({}), "x"));
        f.processor.process(&message(&change)).await.unwrap();
        let update = only_update(&f).await;
        assert_eq!(update.update_type, UpdateType::Failed);
        assert!(update.message.unwrap().contains("gone"));
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_checks_base() {
        let f = fixture().await;
        let record = json!({"name": "milk"});
        let created = f.handler.create("todos", &record, &Value::Null).await.unwrap();

        let stale = json!({"name": "old"});
        let collide = scoped(PendingChange::delete("d1", &created.uid, stale.clone(), hash(&stale)));
        f.processor.process(&message(&collide)).await.unwrap();
        assert!(f.handler.read("todos", &created.uid, &Value::Null).await.unwrap().is_some());

        let delete = scoped(PendingChange::delete("d2", &created.uid, record.clone(), hash(&record)));
        f.processor.process(&message(&delete)).await.unwrap();
        assert!(f.handler.read("todos", &created.uid, &Value::Null).await.unwrap().is_none());

        let again = scoped(PendingChange::delete("d3", &created.uid, record.clone(), hash(&record)));
        f.processor.process(&message(&again)).await.unwrap();

        let types: BTreeMap<String, UpdateType> = f
            .storage
            .list_updates("todos", "c1")
            .await
            .unwrap()
            .into_iter()
            .map(|u| (u.hash, u.update_type))
            .collect();
        assert_eq!(types["d1"], UpdateType::Collision);
        assert_eq!(types["d2"], UpdateType::Applied);
        assert_eq!(types["d3"], UpdateType::Applied);
    }

    #[tokio::test]
    async fn invalid_change_fails() {
        let f = fixture().await;
        let mut change = scoped(PendingChange::update("p5", "r", json!({}), "h", json!({}), "h2"));
        change.pre_hash = None;
        f.processor.process(&message(&change)).await.unwrap();
        assert_eq!(only_update(&f).await.update_type, UpdateType::Failed);
    }

    /// Fails every call; transient until `permanent` is set.
    struct Broken {
        permanent: AtomicBool,
    }

    impl Broken {
        fn error(&self) -> HandlerError {
            if self.permanent.load(Ordering::SeqCst) {
                HandlerError::permanent("read-only dataset")
            } else {
                HandlerError::transient("backend unavailable")
            }
        }
    }

    #[async_trait]
    impl DataHandler for Broken {
        async fn list(&self, _: &str, _: &Value, _: &Value) -> Result<BTreeMap<String, Value>, HandlerError> {
            Err(self.error())
        }
        async fn create(&self, _: &str, _: &Value, _: &Value) -> Result<CreatedRecord, HandlerError> {
            Err(self.error())
        }
        async fn read(&self, _: &str, _: &str, _: &Value) -> Result<Option<Value>, HandlerError> {
            Err(self.error())
        }
        async fn update(&self, _: &str, _: &str, _: &Value, _: &Value) -> Result<Value, HandlerError> {
            Err(self.error())
        }
        async fn delete(&self, _: &str, _: &str, _: &Value) -> Result<(), HandlerError> {
            Err(self.error())
        }
        async fn handle_collision(&self, _: &str, _: &CollisionRecord, _: &Value) -> Result<(), HandlerError> {
            Err(self.error())
        }
        async fn list_collisions(&self, _: &str, _: &Value) -> Result<Vec<CollisionRecord>, HandlerError> {
            Err(self.error())
        }
        async fn remove_collision(&self, _: &str, _: &str, _: &Value) -> Result<bool, HandlerError> {
            Err(self.error())
        }
    }

    #[tokio::test]
    async fn handler_errors_follow_retry_policy() {
        let f = fixture().await;
        let broken = Arc::new(Broken {
            permanent: AtomicBool::new(false),
        });
        f.processor.handlers.set_for_dataset("todos", broken.clone());
        let post = json!({"name": "milk"});
        let change = scoped(PendingChange::create("p6", "tmp", post.clone(), hash(&post)));

        let err = f.processor.process(&message(&change)).await.unwrap_err();
        assert!(matches!(err, ProcessError::Retry(_)));
        assert_eq!(
            f.storage.pending_status(&change).await.unwrap(),
            Some(PendingStatus::Inflight)
        );
        assert!(f.storage.list_updates("todos", "c1").await.unwrap().is_empty());

        broken.permanent.store(true, Ordering::SeqCst);
        f.processor.process(&message(&change)).await.unwrap();
        let update = only_update(&f).await;
        assert_eq!(update.update_type, UpdateType::Failed);
        assert_eq!(update.message.as_deref(), Some("read-only dataset"));
    }

    /// Store-backed handler without keyed creates, counting create calls.
    struct PlainCreate {
        inner: StoreDataHandler,
        creates: AtomicUsize,
    }

    #[async_trait]
    impl DataHandler for PlainCreate {
        async fn list(&self, ds: &str, q: &Value, md: &Value) -> Result<BTreeMap<String, Value>, HandlerError> {
            self.inner.list(ds, q, md).await
        }
        async fn create(&self, ds: &str, data: &Value, md: &Value) -> Result<CreatedRecord, HandlerError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.inner.create(ds, data, md).await
        }
        async fn read(&self, ds: &str, uid: &str, md: &Value) -> Result<Option<Value>, HandlerError> {
            self.inner.read(ds, uid, md).await
        }
        async fn update(&self, ds: &str, uid: &str, data: &Value, md: &Value) -> Result<Value, HandlerError> {
            self.inner.update(ds, uid, data, md).await
        }
        async fn delete(&self, ds: &str, uid: &str, md: &Value) -> Result<(), HandlerError> {
            self.inner.delete(ds, uid, md).await
        }
        async fn handle_collision(&self, ds: &str, c: &CollisionRecord, md: &Value) -> Result<(), HandlerError> {
            self.inner.handle_collision(ds, c, md).await
        }
        async fn list_collisions(&self, ds: &str, md: &Value) -> Result<Vec<CollisionRecord>, HandlerError> {
            self.inner.list_collisions(ds, md).await
        }
        async fn remove_collision(&self, ds: &str, hash: &str, md: &Value) -> Result<bool, HandlerError> {
            self.inner.remove_collision(ds, hash, md).await
        }
    }

    #[tokio::test]
    async fn remembered_create_is_reused_by_handlers_without_keys() {
        let f = fixture().await;
        let plain = Arc::new(PlainCreate {
            inner: StoreDataHandler::new(f.store.clone()),
            creates: AtomicUsize::new(0),
        });
        f.handlers.set_for_dataset("todos", plain.clone());
        let post = json!({"name": "milk"});
        let change = scoped(PendingChange::create("p7", "tmp", post.clone(), hash(&post)));

        f.store.arm("find_one_and_update", UPDATES_COLLECTION);
        assert!(f.processor.process(&message(&change)).await.is_err());
        f.processor.process(&message(&change)).await.unwrap();

        assert_eq!(plain.creates.load(Ordering::SeqCst), 1);
        assert_eq!(f.handler.list("todos", &json!({}), &Value::Null).await.unwrap().len(), 1);
        assert_eq!(only_update(&f).await.update_type, UpdateType::Applied);
    }
}
