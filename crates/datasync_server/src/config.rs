//! Server and per-dataset configuration.
//!
//! Durations are (de)serialized as integer milliseconds so a config can be
//! loaded from the same JSON shape the client SDK settings use.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for a [`crate::SyncServer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Idle poll interval of the pending worker.
    #[serde(with = "millis")]
    pub pending_worker_interval: Duration,
    /// Idle poll interval of the ack worker.
    #[serde(with = "millis")]
    pub ack_worker_interval: Duration,
    /// Idle poll interval of the sync worker.
    #[serde(with = "millis")]
    pub sync_worker_interval: Duration,
    /// Time between scheduler passes.
    #[serde(with = "millis")]
    pub scheduler_interval: Duration,
    /// Scheduler lock TTL; bounds failover time after a crash.
    #[serde(with = "millis")]
    pub scheduler_lock_max_time: Duration,
    /// Name of the scheduler lock.
    pub scheduler_lock_name: String,
    /// Maximum concurrent dataset client upserts.
    pub dataset_client_update_concurrency: usize,
    /// How long acked queue messages are kept.
    #[serde(with = "millis")]
    pub queue_messages_to_keep: Duration,
    /// How often queues are pruned.
    #[serde(with = "millis")]
    pub queue_prune_frequency: Duration,
    /// Lease taken by workers on each job.
    #[serde(with = "millis")]
    pub worker_lease: Duration,
    /// Samples kept per metric key.
    pub stats_records_to_keep: usize,
}

impl ServerConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            pending_worker_interval: Duration::from_millis(500),
            ack_worker_interval: Duration::from_millis(500),
            sync_worker_interval: Duration::from_millis(500),
            scheduler_interval: Duration::from_millis(500),
            scheduler_lock_max_time: Duration::from_secs(20),
            scheduler_lock_name: "locks:sync:SyncScheduler".to_string(),
            dataset_client_update_concurrency: 10,
            queue_messages_to_keep: Duration::from_secs(24 * 60 * 60),
            queue_prune_frequency: Duration::from_secs(60 * 60),
            worker_lease: Duration::from_secs(30),
            stats_records_to_keep: 1000,
        }
    }

    /// Sets the idle poll interval of all three workers.
    pub fn with_worker_interval(mut self, interval: Duration) -> Self {
        self.pending_worker_interval = interval;
        self.ack_worker_interval = interval;
        self.sync_worker_interval = interval;
        self
    }

    /// Sets the time between scheduler passes.
    pub fn with_scheduler_interval(mut self, interval: Duration) -> Self {
        self.scheduler_interval = interval;
        self
    }

    /// Sets the scheduler lock TTL.
    pub fn with_scheduler_lock_max_time(mut self, ttl: Duration) -> Self {
        self.scheduler_lock_max_time = ttl;
        self
    }

    /// Sets the scheduler lock name.
    pub fn with_scheduler_lock_name(mut self, name: impl Into<String>) -> Self {
        self.scheduler_lock_name = name.into();
        self
    }

    /// Sets the maximum concurrent dataset client upserts.
    pub fn with_dataset_client_update_concurrency(mut self, concurrency: usize) -> Self {
        self.dataset_client_update_concurrency = concurrency;
        self
    }

    /// Sets queue retention and prune frequency.
    pub fn with_queue_retention(mut self, keep: Duration, prune_frequency: Duration) -> Self {
        self.queue_messages_to_keep = keep;
        self.queue_prune_frequency = prune_frequency;
        self
    }

    /// Sets the worker lease.
    pub fn with_worker_lease(mut self, lease: Duration) -> Self {
        self.worker_lease = lease;
        self
    }

    /// Sets the samples kept per metric key.
    pub fn with_stats_records_to_keep(mut self, records: usize) -> Self {
        self.stats_records_to_keep = records;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-dataset sync settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetOptions {
    /// Minimum time between two sync passes of a dataset client.
    #[serde(with = "millis")]
    pub sync_frequency: Duration,
    /// Clients not seen for this long are no longer synced.
    #[serde(with = "millis")]
    pub client_sync_timeout: Duration,
}

impl DatasetOptions {
    /// Syncs every 10s; clients idle for 15 minutes are skipped.
    pub fn new() -> Self {
        Self {
            sync_frequency: Duration::from_secs(10),
            client_sync_timeout: Duration::from_secs(15 * 60),
        }
    }

    /// Sets the sync frequency.
    pub fn with_sync_frequency(mut self, frequency: Duration) -> Self {
        self.sync_frequency = frequency;
        self
    }

    /// Sets the client sync timeout.
    pub fn with_client_sync_timeout(mut self, timeout: Duration) -> Self {
        self.client_sync_timeout = timeout;
        self
    }
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Options registered per dataset, falling back to defaults.
#[derive(Debug, Default)]
pub struct DatasetRegistry {
    datasets: RwLock<HashMap<String, DatasetOptions>>,
}

impl DatasetRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a dataset's options.
    pub fn set(&self, dataset_id: impl Into<String>, options: DatasetOptions) {
        self.datasets.write().insert(dataset_id.into(), options);
    }

    /// Options for a dataset.
    pub fn get(&self, dataset_id: &str) -> DatasetOptions {
        self.datasets
            .read()
            .get(dataset_id)
            .copied()
            .unwrap_or_default()
    }

    /// Forgets every registration.
    pub fn clear(&self) {
        self.datasets.write().clear();
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.scheduler_interval, Duration::from_millis(500));
        assert_eq!(config.scheduler_lock_max_time, Duration::from_secs(20));
        assert_eq!(config.scheduler_lock_name, "locks:sync:SyncScheduler");
        assert_eq!(config.dataset_client_update_concurrency, 10);
        assert_eq!(config.stats_records_to_keep, 1000);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_worker_interval(Duration::from_millis(10))
            .with_scheduler_lock_name("locks:test")
            .with_worker_lease(Duration::from_secs(5));
        assert_eq!(config.ack_worker_interval, Duration::from_millis(10));
        assert_eq!(config.sync_worker_interval, Duration::from_millis(10));
        assert_eq!(config.scheduler_lock_name, "locks:test");
        assert_eq!(config.worker_lease, Duration::from_secs(5));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: ServerConfig = serde_json::from_value(json!({
            "scheduler_interval": 250,
            "dataset_client_update_concurrency": 4
        }))
        .unwrap();
        assert_eq!(config.scheduler_interval, Duration::from_millis(250));
        assert_eq!(config.dataset_client_update_concurrency, 4);
        assert_eq!(config.worker_lease, Duration::from_secs(30));

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["scheduler_lock_max_time"], 20_000);
    }

    #[test]
    fn registry_falls_back_to_defaults() {
        let registry = DatasetRegistry::new();
        let fast = DatasetOptions::new().with_sync_frequency(Duration::from_secs(1));
        registry.set("todos", fast);
        assert_eq!(registry.get("todos"), fast);
        assert_eq!(registry.get("notes"), DatasetOptions::default());
        registry.clear();
        assert_eq!(registry.get("todos"), DatasetOptions::default());
    }
}
