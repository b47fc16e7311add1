//! Single-leader sync scheduler.
//!
//! Every process runs a scheduler, but only the holder of the scheduler
//! lock does anything: on each tick it finds the dataset clients that are
//! due for a sync pass and puts one job per client on the sync queue. The
//! lock TTL bounds how long a crashed leader blocks the others.

use crate::config::{DatasetRegistry, ServerConfig};
use crate::error::ServerResult;
use crate::processors::SyncJob;
use crate::storage::SyncStorage;
use datasync_engine::metrics::{self, Metrics, Timer};
use datasync_engine::{duration_ms, Clock, DistributedLock, Queue};
use datasync_protocol::DatasetClient;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Elects a leader and schedules sync jobs for due dataset clients.
pub struct SyncScheduler {
    holder_id: String,
    lock_name: String,
    lock_ttl: Duration,
    interval: Duration,
    lock: DistributedLock,
    storage: Arc<SyncStorage>,
    queue: Arc<Queue>,
    datasets: Arc<DatasetRegistry>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    leader: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("holder_id", &self.holder_id)
            .field("lock_name", &self.lock_name)
            .field("leader", &self.is_leader())
            .finish_non_exhaustive()
    }
}

impl SyncScheduler {
    /// Creates a stopped scheduler with a fresh holder id.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ServerConfig,
        lock: DistributedLock,
        storage: Arc<SyncStorage>,
        queue: Arc<Queue>,
        datasets: Arc<DatasetRegistry>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            holder_id: uuid::Uuid::new_v4().to_string(),
            lock_name: config.scheduler_lock_name.clone(),
            lock_ttl: config.scheduler_lock_max_time,
            interval: config.scheduler_interval,
            lock,
            storage,
            queue,
            datasets,
            metrics,
            clock,
            leader: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    /// Provisions the lock collection. Idempotent.
    pub async fn create(&self) -> ServerResult<()> {
        self.lock.create().await?;
        Ok(())
    }

    /// This scheduler's lock holder id.
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Returns true if the last tick held the lock.
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Returns true while the loop is running.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Starts the scheduling loop. Returns false if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                if let Err(e) = scheduler.tick().await {
                    warn!(holder = %scheduler.holder_id, error = %e, "scheduler tick failed");
                    scheduler.leader.store(false, Ordering::SeqCst);
                }
                tokio::select! {
                    _ = tokio::time::sleep(scheduler.interval) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        *running = Some(Running { stop_tx, handle });
        info!(holder = %self.holder_id, lock = %self.lock_name, "sync scheduler started");
        true
    }

    /// Stops the loop and releases the lock if held.
    pub async fn stop(&self) -> ServerResult<()> {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.stop_tx.send(true);
            if let Err(e) = running.handle.await {
                warn!(holder = %self.holder_id, error = %e, "scheduler task ended abnormally");
            }
        }
        if self.leader.swap(false, Ordering::SeqCst) {
            self.lock.release(&self.lock_name, &self.holder_id).await?;
            info!(holder = %self.holder_id, "released scheduler lock");
        }
        Ok(())
    }

    /// Runs one scheduling pass and returns how many jobs it queued.
    ///
    /// Renews the lock when this scheduler believes it leads, otherwise
    /// tries to acquire it. Followers queue nothing.
    pub async fn tick(&self) -> ServerResult<usize> {
        let timer = Timer::start();
        let was_leader = self.is_leader();
        let leading = if was_leader {
            self.lock.renew(&self.lock_name, &self.holder_id, self.lock_ttl).await?
        } else {
            self.lock.acquire(&self.lock_name, &self.holder_id, self.lock_ttl).await?
        };
        self.leader.store(leading, Ordering::SeqCst);
        match (was_leader, leading) {
            (false, true) => info!(holder = %self.holder_id, "acquired scheduler lock"),
            (true, false) => info!(holder = %self.holder_id, "lost scheduler lock"),
            _ => {}
        }
        if !leading {
            return Ok(0);
        }

        let now = self.clock.now_ms();
        let clients = self.storage.list_dataset_clients(None, false).await?;
        let mut scheduled = 0;
        for client in clients {
            let options = self.datasets.get(&client.dataset_id);
            if !is_due(&client, now, options.sync_frequency, options.client_sync_timeout) {
                continue;
            }
            let not_after = now.saturating_sub(duration_ms(options.sync_frequency));
            if !self.storage.mark_sync_scheduled(&client.id, not_after).await? {
                continue;
            }
            let job = SyncJob {
                dataset_id: client.dataset_id.clone(),
                dataset_client_id: client.id.clone(),
            };
            if let Err(e) = self.queue.add(&job).await {
                // Unmark the client so the next pass retries it.
                if let Err(clear) = self.storage.clear_sync_scheduled(&client.id).await {
                    warn!(client = %client.id, error = %clear, "failed to clear schedule mark");
                }
                return Err(e.into());
            }
            debug!(dataset_id = %client.dataset_id, client = %client.id, "sync job scheduled");
            scheduled += 1;
        }

        let tags = metrics::tags([("holder", self.holder_id.as_str())]);
        self.metrics
            .record_time(metrics::SYNC_SCHEDULER_CHECK_TIME, &tags, timer);
        Ok(scheduled)
    }
}

/// A client is due when it is active, was seen within `timeout`, and was
/// not scheduled within the last `frequency`.
fn is_due(client: &DatasetClient, now: i64, frequency: Duration, timeout: Duration) -> bool {
    if client.stopped || client.last_accessed < now.saturating_sub(duration_ms(timeout)) {
        return false;
    }
    match client.sync_scheduled {
        None => true,
        Some(at) => at <= now.saturating_sub(duration_ms(frequency)),
    }
}
