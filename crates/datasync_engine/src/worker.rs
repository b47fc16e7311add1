//! Queue worker.
//!
//! A [`Worker`] repeatedly claims one message from its queue and hands it to
//! a [`Processor`]. The processor's result decides the message's fate:
//!
//! | result                        | message                               |
//! |-------------------------------|---------------------------------------|
//! | `Ok(())`                      | acked                                 |
//! | `Err(ProcessError::Retry)`    | left claimed; redelivered after lease |
//! | `Err(ProcessError::Requeue)`  | made visible again immediately        |
//! | `Err(ProcessError::Discard)`  | acked and logged as an error          |
//!
//! Processing is bounded by the claim lease; a job that outlives it is
//! abandoned and treated as `Retry`.

use crate::config::WorkerOptions;
use crate::error::ProcessError;
use crate::metrics::{self, Metrics, Tags, Timer};
use crate::queue::{Queue, QueueMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handles the messages of one queue.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Processes one claimed message.
    async fn process(&self, message: &QueueMessage) -> Result<(), ProcessError>;
}

/// What one iteration of a worker did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Nothing was claimable.
    Idle,
    /// Claiming failed.
    ClaimFailed,
    /// Processed and acked.
    Completed,
    /// Left for redelivery after the lease.
    Retried,
    /// Returned to the queue for immediate redelivery.
    Requeued,
    /// Dropped after a permanent failure.
    Discarded,
}

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Drains one queue through one processor.
pub struct Worker {
    queue: Arc<Queue>,
    processor: Arc<dyn Processor>,
    metrics: Arc<Metrics>,
    options: WorkerOptions,
    tags: Tags,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.options.name)
            .field("queue", &self.queue.name())
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Creates a stopped worker.
    pub fn new(
        queue: Arc<Queue>,
        processor: Arc<dyn Processor>,
        metrics: Arc<Metrics>,
        options: WorkerOptions,
    ) -> Self {
        let tags = metrics::tags([("worker", options.name.as_str()), ("queue", queue.name())]);
        Self {
            queue,
            processor,
            metrics,
            options,
            tags,
            running: Mutex::new(None),
        }
    }

    /// Worker name.
    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Returns true while the poll loop is running.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Starts the poll loop.
    ///
    /// Returns false (and does nothing) if the worker is already running.
    pub fn work(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move { worker.run(stop_rx).await });
        *running = Some(Running { stop_tx, handle });
        info!(worker = %self.options.name, queue = %self.queue.name(), "worker started");
        true
    }

    /// Stops the poll loop, letting the in-flight job finish first.
    ///
    /// No-op if the worker is not running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        let _ = running.stop_tx.send(true);
        if let Err(e) = running.handle.await {
            warn!(worker = %self.options.name, error = %e, "worker task ended abnormally");
        }
        info!(worker = %self.options.name, "worker stopped");
    }

    async fn run(&self, mut stop_rx: watch::Receiver<bool>) {
        loop {
            if *stop_rx.borrow() {
                break;
            }
            match self.run_once().await {
                JobOutcome::Idle | JobOutcome::ClaimFailed => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.interval) => {}
                        changed = stop_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Claims and processes at most one message.
    pub async fn run_once(&self) -> JobOutcome {
        let message = match self.queue.claim(self.options.lease).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                self.record_queue_size().await;
                return JobOutcome::Idle;
            }
            Err(e) => {
                warn!(worker = %self.options.name, error = %e, "failed to claim job");
                self.metrics.inc(metrics::WORKER_GET_JOB_ERROR_COUNT, &self.tags);
                return JobOutcome::ClaimFailed;
            }
        };
        self.metrics.inc(metrics::WORKER_JOB_COUNT, &self.tags);
        debug!(worker = %self.options.name, id = %message.id, tries = message.tries, "processing job");

        let timer = Timer::start();
        let result = match tokio::time::timeout(self.options.lease, self.processor.process(&message)).await {
            Ok(result) => result,
            Err(_) => Err(ProcessError::Retry(format!(
                "processing exceeded lease of {:?}",
                self.options.lease
            ))),
        };
        self.metrics
            .record_time(metrics::WORKER_JOB_PROCESS_TIME, &self.tags, timer);

        let outcome = match result {
            Ok(()) => {
                self.metrics.inc(metrics::WORKER_JOB_SUCCESS_COUNT, &self.tags);
                self.ack(&message).await;
                JobOutcome::Completed
            }
            Err(ProcessError::Retry(reason)) => {
                self.metrics.inc(metrics::WORKER_JOB_FAILURE_COUNT, &self.tags);
                warn!(worker = %self.options.name, id = %message.id, %reason, "job will be retried");
                JobOutcome::Retried
            }
            Err(ProcessError::Requeue(reason)) => {
                self.metrics.inc(metrics::WORKER_JOB_FAILURE_COUNT, &self.tags);
                warn!(worker = %self.options.name, id = %message.id, %reason, "job requeued");
                if let Err(e) = self.queue.fail(&message).await {
                    warn!(worker = %self.options.name, id = %message.id, error = %e, "failed to requeue job");
                }
                JobOutcome::Requeued
            }
            Err(ProcessError::Discard(reason)) => {
                self.metrics.inc(metrics::WORKER_JOB_FAILURE_COUNT, &self.tags);
                error!(worker = %self.options.name, id = %message.id, %reason, "job discarded");
                self.ack(&message).await;
                JobOutcome::Discarded
            }
        };
        self.record_queue_size().await;
        outcome
    }

    async fn ack(&self, message: &QueueMessage) {
        if let Err(e) = self.queue.ack(message).await {
            warn!(worker = %self.options.name, id = %message.id, error = %e, "failed to ack job");
        }
    }

    async fn record_queue_size(&self) {
        if let Ok(size) = self.queue.size().await {
            self.metrics
                .gauge(metrics::WORKER_QUEUE_SIZE, &self.tags, size as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::QueueOptions;
    use datasync_store::InMemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails with the given error for the first `failures` calls.
    struct Scripted {
        failures: usize,
        error: ProcessError,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Processor for Scripted {
        async fn process(&self, _message: &QueueMessage) -> Result<(), ProcessError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl Processor for Slow {
        async fn process(&self, _message: &QueueMessage) -> Result<(), ProcessError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn worker(processor: Arc<dyn Processor>, lease: Duration) -> (Arc<ManualClock>, Arc<Queue>, Arc<Worker>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(InMemoryStore::new());
        let metrics = Arc::new(Metrics::new(100, clock.clone()));
        let queue = Arc::new(Queue::new(
            "jobs",
            store,
            clock.clone(),
            metrics.clone(),
            QueueOptions::default(),
        ));
        let options = WorkerOptions::new("test_worker")
            .with_interval(Duration::from_millis(10))
            .with_lease(lease);
        let worker = Arc::new(Worker::new(queue.clone(), processor, metrics, options));
        (clock, queue, worker)
    }

    fn scripted(failures: usize, error: ProcessError) -> Arc<Scripted> {
        Arc::new(Scripted {
            failures,
            error,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn success_acks() {
        let (_, queue, worker) = worker(scripted(0, ProcessError::Retry(String::new())), Duration::from_secs(30));
        queue.add(&json!(1)).await.unwrap();
        assert_eq!(worker.run_once().await, JobOutcome::Completed);
        assert_eq!(worker.run_once().await, JobOutcome::Idle);
        assert_eq!(queue.in_flight().await.unwrap(), 0);
        assert_eq!(worker.metrics.counter(metrics::WORKER_JOB_SUCCESS_COUNT), 1);
    }

    #[tokio::test]
    async fn retry_waits_for_lease_expiry() {
        let lease = Duration::from_secs(30);
        let (clock, queue, worker) = worker(scripted(1, ProcessError::Retry("flaky".into())), lease);
        queue.add(&json!(1)).await.unwrap();

        assert_eq!(worker.run_once().await, JobOutcome::Retried);
        assert_eq!(worker.run_once().await, JobOutcome::Idle);

        clock.advance(lease + Duration::from_millis(1));
        assert_eq!(worker.run_once().await, JobOutcome::Completed);
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn requeue_redelivers_immediately() {
        let (_, queue, worker) = worker(scripted(1, ProcessError::Requeue("busy".into())), Duration::from_secs(30));
        queue.add(&json!(1)).await.unwrap();
        assert_eq!(worker.run_once().await, JobOutcome::Requeued);
        assert_eq!(worker.run_once().await, JobOutcome::Completed);
    }

    #[tokio::test]
    async fn discard_acks_without_redelivery() {
        let (clock, queue, worker) = worker(scripted(1, ProcessError::Discard("bad".into())), Duration::from_secs(30));
        queue.add(&json!(1)).await.unwrap();
        assert_eq!(worker.run_once().await, JobOutcome::Discarded);
        clock.advance(Duration::from_secs(60));
        assert_eq!(worker.run_once().await, JobOutcome::Idle);
        assert_eq!(worker.metrics.counter(metrics::WORKER_JOB_FAILURE_COUNT), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn processing_is_bounded_by_lease() {
        let (_, queue, worker) = worker(Arc::new(Slow), Duration::from_secs(1));
        queue.add(&json!(1)).await.unwrap();
        assert_eq!(worker.run_once().await, JobOutcome::Retried);
    }

    #[tokio::test]
    async fn work_drains_queue_and_stops() {
        let processor = scripted(0, ProcessError::Retry(String::new()));
        let (_, queue, worker) = worker(processor.clone(), Duration::from_secs(30));
        queue.add_many(&[1, 2, 3]).await.unwrap();

        assert!(worker.work());
        assert!(!worker.work());
        for _ in 0..100 {
            if processor.calls.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.stop().await;
        assert!(!worker.is_running());
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.size().await.unwrap(), 0);

        // Stopped workers can be restarted.
        assert!(worker.work());
        worker.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_in_flight_job() {
        struct Gate {
            started: tokio::sync::Notify,
            finished: AtomicUsize,
        }

        #[async_trait]
        impl Processor for Gate {
            async fn process(&self, _message: &QueueMessage) -> Result<(), ProcessError> {
                self.started.notify_one();
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let gate = Arc::new(Gate {
            started: tokio::sync::Notify::new(),
            finished: AtomicUsize::new(0),
        });
        let (_, queue, worker) = worker(gate.clone(), Duration::from_secs(30));
        queue.add(&json!(1)).await.unwrap();
        worker.work();
        gate.started.notified().await;
        worker.stop().await;

        assert_eq!(gate.finished.load(Ordering::SeqCst), 1);
        assert_eq!(queue.in_flight().await.unwrap(), 0);
        assert_eq!(queue.size().await.unwrap(), 0);
    }
}
