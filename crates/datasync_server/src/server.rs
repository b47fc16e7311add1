//! The server context tying queues, workers and the scheduler together.

use crate::api::{ClientUpdateQueue, SyncApi};
use crate::config::{DatasetOptions, DatasetRegistry, ServerConfig};
use crate::error::ServerResult;
use crate::handlers::{CollisionRecord, DataHandler, DataHandlers, StoreDataHandler};
use crate::interceptors::{Interceptor, Interceptors};
use crate::processors::{AckProcessor, PendingProcessor, SyncProcessor};
use crate::scheduler::SyncScheduler;
use crate::storage::SyncStorage;
use datasync_engine::{
    Clock, DistributedLock, MetricStats, Metrics, Processor, Queue, QueueOptions, SystemClock, Worker, WorkerOptions,
};
use datasync_protocol::{HashProvider, Sha256HashProvider, SyncRecordsRequest, SyncRecordsResponse, SyncRequest, SyncResponse};
use datasync_store::DocumentStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Ack queue name.
pub const ACK_QUEUE: &str = "datasync_ack_queue";
/// Pending change queue name.
pub const PENDING_QUEUE: &str = "datasync_pending_queue";
/// Sync job queue name.
pub const SYNC_QUEUE: &str = "datasync_sync_queue";

/// A sync server over one document store.
///
/// Any number of servers may share a store; they cooperate through the
/// store alone. Background work starts lazily on the first sync call, or
/// explicitly through [`SyncServer::start`] or [`SyncServer::init`].
pub struct SyncServer {
    config: ServerConfig,
    storage: Arc<SyncStorage>,
    ack_queue: Arc<Queue>,
    pending_queue: Arc<Queue>,
    sync_queue: Arc<Queue>,
    ack_worker: Arc<Worker>,
    pending_worker: Arc<Worker>,
    sync_worker: Arc<Worker>,
    scheduler: Arc<SyncScheduler>,
    api: SyncApi,
    client_updates: Arc<ClientUpdateQueue>,
    handlers: Arc<DataHandlers>,
    interceptors: Arc<Interceptors>,
    datasets: Arc<DatasetRegistry>,
    metrics: Arc<Metrics>,
    started: tokio::sync::Mutex<bool>,
}

impl SyncServer {
    /// Creates a server on the system clock with SHA-256 record hashes.
    pub fn new(store: Arc<dyn DocumentStore>, config: ServerConfig) -> Self {
        Self::with_components(store, config, Arc::new(SystemClock), Arc::new(Sha256HashProvider))
    }

    /// Creates a server with an explicit clock and hash provider.
    pub fn with_components(
        store: Arc<dyn DocumentStore>,
        config: ServerConfig,
        clock: Arc<dyn Clock>,
        hasher: Arc<dyn HashProvider>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new(config.stats_records_to_keep, clock.clone()));
        let storage = Arc::new(SyncStorage::new(store.clone(), clock.clone(), metrics.clone()));
        let queue_options = QueueOptions::new()
            .with_messages_to_keep(config.queue_messages_to_keep)
            .with_prune_frequency(config.queue_prune_frequency);
        let queue = |name: &str| {
            Arc::new(Queue::new(
                name,
                store.clone(),
                clock.clone(),
                metrics.clone(),
                queue_options.clone(),
            ))
        };
        let ack_queue = queue(ACK_QUEUE);
        let pending_queue = queue(PENDING_QUEUE);
        let sync_queue = queue(SYNC_QUEUE);

        let handlers = Arc::new(DataHandlers::new(Arc::new(StoreDataHandler::new(store.clone()))));
        let interceptors = Arc::new(Interceptors::new());
        let datasets = Arc::new(DatasetRegistry::new());

        let worker = |queue: &Arc<Queue>, processor: Arc<dyn Processor>, name: &str, interval: Duration| {
            let options = WorkerOptions::new(name)
                .with_interval(interval)
                .with_lease(config.worker_lease);
            Arc::new(Worker::new(queue.clone(), processor, metrics.clone(), options))
        };
        let ack_worker = worker(
            &ack_queue,
            Arc::new(AckProcessor::new(storage.clone(), handlers.clone())),
            "ack_worker",
            config.ack_worker_interval,
        );
        let pending_worker = worker(
            &pending_queue,
            Arc::new(PendingProcessor::new(
                storage.clone(),
                handlers.clone(),
                hasher.clone(),
                metrics.clone(),
                clock.clone(),
            )),
            "pending_worker",
            config.pending_worker_interval,
        );
        let sync_worker = worker(
            &sync_queue,
            Arc::new(SyncProcessor::new(
                storage.clone(),
                handlers.clone(),
                hasher.clone(),
                metrics.clone(),
                clock.clone(),
            )),
            "sync_worker",
            config.sync_worker_interval,
        );

        let scheduler = Arc::new(SyncScheduler::new(
            &config,
            DistributedLock::new(store, clock.clone()),
            storage.clone(),
            sync_queue.clone(),
            datasets.clone(),
            metrics.clone(),
            clock.clone(),
        ));

        let client_updates = Arc::new(ClientUpdateQueue::new(
            storage.clone(),
            config.dataset_client_update_concurrency,
        ));
        let api = SyncApi::new(
            storage.clone(),
            ack_queue.clone(),
            pending_queue.clone(),
            handlers.clone(),
            interceptors.clone(),
            client_updates.clone(),
            hasher,
            metrics.clone(),
            clock,
        );

        Self {
            config,
            storage,
            ack_queue,
            pending_queue,
            sync_queue,
            ack_worker,
            pending_worker,
            sync_worker,
            scheduler,
            api,
            client_updates,
            handlers,
            interceptors,
            datasets,
            metrics,
            started: tokio::sync::Mutex::new(false),
        }
    }

    /// The configuration the server was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Sync storage shared by all components.
    pub fn storage(&self) -> &Arc<SyncStorage> {
        &self.storage
    }

    /// Metrics shared by all components.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// The leader scheduler.
    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    fn queues(&self) -> [&Arc<Queue>; 3] {
        [&self.ack_queue, &self.pending_queue, &self.sync_queue]
    }

    fn workers(&self) -> [&Arc<Worker>; 3] {
        [&self.ack_worker, &self.pending_worker, &self.sync_worker]
    }

    /// Returns true once background work is running.
    pub async fn is_started(&self) -> bool {
        *self.started.lock().await
    }

    /// Provisions storage and starts workers, prune jobs and the scheduler.
    ///
    /// Idempotent. Concurrent callers wait for the first to finish.
    pub async fn start(&self) -> ServerResult<()> {
        let mut started = self.started.lock().await;
        if *started {
            return Ok(());
        }
        self.storage.create().await?;
        self.scheduler.create().await?;
        for queue in self.queues() {
            queue.create().await?;
        }
        for queue in self.queues() {
            queue.start_prune_job(true);
        }
        for worker in self.workers() {
            worker.work();
        }
        self.scheduler.start();
        *started = true;
        info!(holder = %self.scheduler.holder_id(), "sync server started");
        Ok(())
    }

    /// Registers a dataset's options and (re)enables sync for its clients.
    pub async fn init(&self, dataset_id: &str, options: DatasetOptions) -> ServerResult<()> {
        self.datasets.set(dataset_id, options);
        self.start().await?;
        let resumed = self
            .storage
            .set_dataset_clients_stopped(Some(dataset_id), false)
            .await?;
        info!(dataset_id, resumed, "dataset initialised");
        Ok(())
    }

    /// Handles a sync request. Starts the server if needed.
    pub async fn sync(&self, dataset_id: &str, request: SyncRequest) -> ServerResult<SyncResponse> {
        self.start().await?;
        self.api.sync(dataset_id, request).await
    }

    /// Handles a sync-records request. Starts the server if needed.
    pub async fn sync_records(&self, dataset_id: &str, request: SyncRecordsRequest) -> ServerResult<SyncRecordsResponse> {
        self.start().await?;
        self.api.sync_records(dataset_id, request).await
    }

    /// Stops sync for every client of a dataset.
    ///
    /// Subsequent sync calls for those clients fail until the dataset is
    /// initialised again. No-op if the server has not started.
    pub async fn stop(&self, dataset_id: &str) -> ServerResult<()> {
        if !self.is_started().await {
            return Ok(());
        }
        let stopped = self
            .storage
            .set_dataset_clients_stopped(Some(dataset_id), true)
            .await?;
        info!(dataset_id, stopped, "dataset sync stopped");
        Ok(())
    }

    /// Stops all background work and every dataset client.
    ///
    /// In-flight jobs finish first and the scheduler lock is released.
    /// Data handlers and interceptors revert to the defaults. The server
    /// can be started again afterwards.
    pub async fn stop_all(&self) -> ServerResult<()> {
        let mut started = self.started.lock().await;
        for queue in self.queues() {
            queue.stop_prune_job();
        }
        self.client_updates.drain().await;
        let (stopped, (), (), (), scheduler) = tokio::join!(
            self.storage.set_dataset_clients_stopped(None, true),
            self.ack_worker.stop(),
            self.pending_worker.stop(),
            self.sync_worker.stop(),
            self.scheduler.stop(),
        );
        self.handlers.restore();
        self.interceptors.restore();
        *started = false;
        let stopped = stopped?;
        scheduler?;
        info!(stopped, "sync server stopped");
        Ok(())
    }

    /// Sets the request interceptor for datasets without their own.
    pub fn set_global_request_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.set_global_request(interceptor);
    }

    /// Sets the response interceptor for datasets without their own.
    pub fn set_global_response_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.set_global_response(interceptor);
    }

    /// Sets a dataset's request interceptor.
    pub fn set_request_interceptor(&self, dataset_id: &str, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.set_request(dataset_id, interceptor);
    }

    /// Sets a dataset's response interceptor.
    pub fn set_response_interceptor(&self, dataset_id: &str, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.set_response(dataset_id, interceptor);
    }

    /// Replaces the data handler used by datasets without their own.
    pub fn set_global_data_handler(&self, handler: Arc<dyn DataHandler>) {
        self.handlers.set_global(handler);
    }

    /// Sets a dataset's data handler.
    pub fn set_data_handler(&self, dataset_id: &str, handler: Arc<dyn DataHandler>) {
        self.handlers.set_for_dataset(dataset_id, handler);
    }

    /// Lists the collisions recorded for a dataset.
    pub async fn list_collisions(&self, dataset_id: &str, meta_data: &Value) -> ServerResult<Vec<CollisionRecord>> {
        let handler = self.handlers.for_dataset(dataset_id);
        Ok(handler.list_collisions(dataset_id, meta_data).await?)
    }

    /// Removes a recorded collision. Returns false if there was none.
    pub async fn remove_collision(&self, dataset_id: &str, hash: &str, meta_data: &Value) -> ServerResult<bool> {
        let handler = self.handlers.for_dataset(dataset_id);
        Ok(handler.remove_collision(dataset_id, hash, meta_data).await?)
    }

    /// Aggregated metrics for every recorded key.
    pub fn stats(&self) -> Vec<MetricStats> {
        self.metrics.stats()
    }
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
