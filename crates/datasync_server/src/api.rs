//! Client-facing sync calls.
//!
//! A sync call never applies anything itself. It queues the client's
//! acknowledgements and pending changes for the workers, records the
//! client's access in the background, and answers with the updates already
//! waiting for the client connection.

use crate::error::{ServerError, ServerResult};
use crate::handlers::DataHandlers;
use crate::interceptors::{InterceptContext, Interceptors};
use crate::storage::{ClientAccess, SyncStorage};
use datasync_engine::metrics::{self, Metrics, Timer};
use datasync_engine::{Clock, Queue};
use datasync_protocol::{
    diff_records, format_updates, remove_acknowledged, Acknowledgement, DatasetClient, HashProvider, PendingChange,
    SyncRecordsRequest, SyncRecordsResponse, SyncRequest, SyncResponse,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Background dataset client upserts with bounded concurrency.
///
/// Sync calls do not wait for their upsert. Failures are logged; the next
/// sync from the same client records the access again.
pub struct ClientUpdateQueue {
    storage: Arc<SyncStorage>,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
}

impl ClientUpdateQueue {
    /// Creates a queue running at most `concurrency` upserts at once.
    pub fn new(storage: Arc<SyncStorage>, concurrency: usize) -> Self {
        Self {
            storage,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Queues an upsert.
    pub fn push(&self, access: ClientAccess) {
        let storage = Arc::clone(&self.storage);
        let permits = Arc::clone(&self.permits);
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = storage.upsert_dataset_client(&access).await {
                warn!(
                    dataset_id = %access.dataset_id,
                    cuid = %access.cuid,
                    error = %e,
                    "dataset client update failed"
                );
            }
        });
    }

    /// Number of upserts not yet reaped.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Returns true if no upserts are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for every queued upsert to finish.
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "dataset client update task ended abnormally");
            }
        }
    }
}

/// The sync entry points.
pub struct SyncApi {
    storage: Arc<SyncStorage>,
    ack_queue: Arc<Queue>,
    pending_queue: Arc<Queue>,
    handlers: Arc<DataHandlers>,
    interceptors: Arc<Interceptors>,
    client_updates: Arc<ClientUpdateQueue>,
    hasher: Arc<dyn HashProvider>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
}

impl SyncApi {
    /// Wires the API to its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<SyncStorage>,
        ack_queue: Arc<Queue>,
        pending_queue: Arc<Queue>,
        handlers: Arc<DataHandlers>,
        interceptors: Arc<Interceptors>,
        client_updates: Arc<ClientUpdateQueue>,
        hasher: Arc<dyn HashProvider>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            ack_queue,
            pending_queue,
            handlers,
            interceptors,
            client_updates,
            hasher,
            metrics,
            clock,
        }
    }

    /// Handles a sync request for one client connection.
    ///
    /// Returns the dataset's last computed global hash and the updates
    /// still outstanding for the connection, minus those acknowledged in
    /// this very request.
    pub async fn sync(&self, dataset_id: &str, request: SyncRequest) -> ServerResult<SyncResponse> {
        let timer = Timer::start();
        let cuid = request
            .cuid()
            .ok_or_else(|| ServerError::InvalidRequest("missing client id (_fh.cuid)".into()))?
            .to_string();

        let context = InterceptContext {
            dataset_id,
            query_params: &request.query_params,
            meta_data: &request.meta_data,
            cuid: Some(&cuid),
        };
        self.interceptors
            .intercept_request(&context)
            .await
            .map_err(ServerError::InterceptorRejected)?;

        let client = self
            .check_not_stopped(dataset_id, &request.query_params, &request.meta_data)
            .await?;

        self.client_updates.push(ClientAccess {
            dataset_id: dataset_id.to_string(),
            query_params: request.query_params.clone(),
            meta_data: request.meta_data.clone(),
            cuid: cuid.clone(),
            accessed_at: self.clock.now_ms(),
        });

        let acks: Vec<Acknowledgement> = request
            .acknowledgements
            .iter()
            .map(|ack| Acknowledgement {
                hash: ack.hash.clone(),
                dataset_id: dataset_id.to_string(),
                cuid: cuid.clone(),
            })
            .collect();
        let pending: Vec<PendingChange> = request
            .pending
            .iter()
            .map(|change| PendingChange {
                dataset_id: dataset_id.to_string(),
                cuid: cuid.clone(),
                meta_data: request.meta_data.clone(),
                ..change.clone()
            })
            .collect();

        let (_, _, updates) = tokio::try_join!(
            async { self.ack_queue.add_many(&acks).await.map_err(ServerError::from) },
            async { self.pending_queue.add_many(&pending).await.map_err(ServerError::from) },
            async { self.storage.list_updates(dataset_id, &cuid).await.map_err(ServerError::from) },
        )?;
        let updates = remove_acknowledged(updates, &request.acknowledgements);

        let context = InterceptContext {
            dataset_id,
            query_params: &request.query_params,
            meta_data: &request.meta_data,
            cuid: Some(&cuid),
        };
        self.interceptors
            .intercept_response(&context)
            .await
            .map_err(ServerError::InterceptorRejected)?;

        debug!(
            dataset_id,
            cuid = %cuid,
            acks = acks.len(),
            pending = pending.len(),
            updates = updates.len(),
            "sync handled"
        );
        let tags = metrics::tags([("dataset_id", dataset_id)]);
        self.metrics.record_time(metrics::SYNC_API_PROCESS_TIME, &tags, timer);

        Ok(SyncResponse {
            hash: client.and_then(|c| c.global_hash),
            updates: format_updates(updates),
        })
    }

    /// Compares the client's records with the dataset as it is now.
    pub async fn sync_records(&self, dataset_id: &str, request: SyncRecordsRequest) -> ServerResult<SyncRecordsResponse> {
        let context = InterceptContext {
            dataset_id,
            query_params: &request.query_params,
            meta_data: &request.meta_data,
            cuid: request.client.cuid.as_deref(),
        };
        self.interceptors
            .intercept_request(&context)
            .await
            .map_err(ServerError::InterceptorRejected)?;
        self.check_not_stopped(dataset_id, &request.query_params, &request.meta_data)
            .await?;

        let handler = self.handlers.for_dataset(dataset_id);
        let timer = Timer::start();
        let records = handler
            .list(dataset_id, &request.query_params, &request.meta_data)
            .await;
        let tags = metrics::tags([("operation", "list"), ("dataset_id", dataset_id)]);
        self.metrics
            .record_time(metrics::SYNC_HANDLER_OPERATION_TIME, &tags, timer);

        let server: BTreeMap<String, (Value, String)> = records?
            .into_iter()
            .map(|(uid, record)| {
                let hash = self.hasher.record_hash(dataset_id, &record);
                (uid, (record, hash))
            })
            .collect();
        let hashes: Vec<String> = server.values().map(|(_, hash)| hash.clone()).collect();
        let global_hash = self.hasher.global_hash(dataset_id, &hashes);
        let diff = diff_records(&server, &request.client_recs);

        self.interceptors
            .intercept_response(&context)
            .await
            .map_err(ServerError::InterceptorRejected)?;

        Ok(SyncRecordsResponse {
            hash: Some(global_hash),
            create: diff.create,
            update: diff.update,
            delete: diff.delete,
        })
    }

    async fn check_not_stopped(
        &self,
        dataset_id: &str,
        query_params: &Value,
        meta_data: &Value,
    ) -> ServerResult<Option<DatasetClient>> {
        let id = DatasetClient::compute_id(dataset_id, query_params, meta_data);
        match self.storage.read_dataset_client(&id).await? {
            Some(client) if client.stopped => Err(ServerError::SyncStopped {
                dataset_id: dataset_id.to_string(),
            }),
            client => Ok(client),
        }
    }
}
