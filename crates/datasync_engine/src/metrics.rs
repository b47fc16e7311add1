//! Per-key samples with aggregated stats.
//!
//! Every component records into a shared [`Metrics`]. Each key keeps a
//! bounded ring of recent samples; [`Metrics::stats`] summarizes them.
//! Samples are also emitted as `trace` events under the
//! `datasync::metrics` target so they can be shipped by whatever
//! subscriber the process installs.

use crate::clock::Clock;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

/// Failed attempts to claim a job.
pub const WORKER_GET_JOB_ERROR_COUNT: &str = "worker-get-job-error-count";
/// Jobs claimed.
pub const WORKER_JOB_COUNT: &str = "worker-job-count";
/// Jobs that failed.
pub const WORKER_JOB_FAILURE_COUNT: &str = "worker-job-failure-count";
/// Jobs that succeeded.
pub const WORKER_JOB_SUCCESS_COUNT: &str = "worker-job-success-count";
/// Time to process a job.
pub const WORKER_JOB_PROCESS_TIME: &str = "worker-job-process-time";
/// Visible messages in a worker's queue.
pub const WORKER_QUEUE_SIZE: &str = "worker-queue-size";
/// Time taken by a queue operation.
pub const QUEUE_OPERATION_TIME: &str = "queue-operation-time";
/// Time taken by a data handler call.
pub const SYNC_HANDLER_OPERATION_TIME: &str = "sync-handler-operation-time";
/// Time taken by one scheduler pass.
pub const SYNC_SCHEDULER_CHECK_TIME: &str = "sync-scheduler-check-time";
/// Time taken by a sync job.
pub const SYNC_REQUEST_TOTAL_PROCESS_TIME: &str = "sync-request-total-process-time";
/// Time taken by a pending change.
pub const PENDING_CHANGE_PROCESS_TIME: &str = "pending-change-process-time";
/// Time taken by a client sync call.
pub const SYNC_API_PROCESS_TIME: &str = "sync-api-process-time";
/// Time taken by a store operation.
pub const STORE_OPERATION_TIME: &str = "store-operation-time";

/// Tags attached to a sample.
pub type Tags = BTreeMap<String, String>;

/// Builds a tag map from pairs.
pub fn tags<'a, I>(pairs: I) -> Tags
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Debug, Clone)]
struct Sample {
    value: f64,
    at: i64,
}

/// Aggregated view of one key's recent samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricStats {
    /// Metric key.
    pub name: String,
    /// Timestamp of the oldest retained sample (ms).
    pub from: i64,
    /// Timestamp of the newest retained sample (ms).
    pub end: i64,
    /// `"ms"` for timings, empty otherwise.
    pub unit: String,
    /// Retained sample count.
    pub number_of_records: usize,
    /// Largest retained value.
    pub max: f64,
    /// Smallest retained value.
    pub min: f64,
    /// Mean of retained values.
    pub mean: f64,
    /// Most recent value.
    pub current: f64,
}

/// Shared metric registry.
#[derive(Debug)]
pub struct Metrics {
    records_to_keep: usize,
    clock: Arc<dyn Clock>,
    series: Mutex<HashMap<String, VecDeque<Sample>>>,
    counters: Mutex<HashMap<String, u64>>,
}

impl Metrics {
    /// Creates a registry keeping the last `records_to_keep` samples per key.
    pub fn new(records_to_keep: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            records_to_keep: records_to_keep.max(1),
            clock,
            series: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Records a sample.
    pub fn gauge(&self, key: &str, tags: &Tags, value: f64) {
        tracing::trace!(target: "datasync::metrics", key, ?tags, value, "sample");
        let sample = Sample {
            value,
            at: self.clock.now_ms(),
        };
        let mut series = self.series.lock();
        let ring = series.entry(key.to_string()).or_default();
        ring.push_back(sample);
        while ring.len() > self.records_to_keep {
            ring.pop_front();
        }
    }

    /// Increments a counter and records its new value as a sample.
    pub fn inc(&self, key: &str, tags: &Tags) {
        let value = {
            let mut counters = self.counters.lock();
            let counter = counters.entry(key.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        self.gauge(key, tags, value as f64);
    }

    /// Records the elapsed time of `timer` in milliseconds.
    pub fn record_time(&self, key: &str, tags: &Tags, timer: Timer) {
        self.gauge(key, tags, timer.elapsed_ms());
    }

    /// Current value of a counter.
    pub fn counter(&self, key: &str) -> u64 {
        self.counters.lock().get(key).copied().unwrap_or(0)
    }

    /// Stats for a single key, if it has samples.
    pub fn stat(&self, key: &str) -> Option<MetricStats> {
        let series = self.series.lock();
        series.get(key).and_then(|ring| summarize(key, ring))
    }

    /// Stats for every key with samples, sorted by key.
    pub fn stats(&self) -> Vec<MetricStats> {
        let series = self.series.lock();
        let mut out: Vec<MetricStats> = series
            .iter()
            .filter_map(|(key, ring)| summarize(key, ring))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

fn summarize(key: &str, ring: &VecDeque<Sample>) -> Option<MetricStats> {
    let first = ring.front()?;
    let last = ring.back()?;
    let mut max = f64::MIN;
    let mut min = f64::MAX;
    let mut sum = 0.0;
    for sample in ring {
        max = max.max(sample.value);
        min = min.min(sample.value);
        sum += sample.value;
    }
    Some(MetricStats {
        name: key.to_string(),
        from: first.at,
        end: last.at,
        unit: if key.ends_with("-time") { "ms" } else { "" }.to_string(),
        number_of_records: ring.len(),
        max,
        min,
        mean: sum / ring.len() as f64,
        current: last.value,
    })
}

/// Measures elapsed time for a timing sample.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    started: Instant,
}

impl Timer {
    /// Starts a timer.
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Milliseconds since the timer started.
    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}
