//! Configuration for queues and workers.

use std::time::Duration;

/// Configuration for a [`crate::Queue`].
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// How long acked messages are kept before pruning.
    pub messages_to_keep: Duration,
    /// How often the prune job runs.
    pub prune_frequency: Duration,
}

impl QueueOptions {
    /// Creates queue options with the default retention (24h, pruned hourly).
    pub fn new() -> Self {
        Self {
            messages_to_keep: Duration::from_secs(24 * 60 * 60),
            prune_frequency: Duration::from_secs(60 * 60),
        }
    }

    /// Sets how long acked messages are kept.
    pub fn with_messages_to_keep(mut self, keep: Duration) -> Self {
        self.messages_to_keep = keep;
        self
    }

    /// Sets how often the prune job runs.
    pub fn with_prune_frequency(mut self, frequency: Duration) -> Self {
        self.prune_frequency = frequency;
        self
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a [`crate::Worker`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Worker name (used in logs and metrics).
    pub name: String,
    /// Wait between claim attempts while the queue is empty.
    pub interval: Duration,
    /// Lease taken on each claimed message; bounds processing time.
    pub lease: Duration,
}

impl WorkerOptions {
    /// Creates worker options polling every 500ms with a 30s lease.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interval: Duration::from_millis(500),
            lease: Duration::from_secs(30),
        }
    }

    /// Sets the idle poll interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the claim lease.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}
