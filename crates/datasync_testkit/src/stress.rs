//! Load helpers for concurrent sync traffic.

use crate::fixtures::sample_create;
use datasync_engine::Queue;
use datasync_protocol::SyncRequest;
use datasync_server::SyncServer;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };
        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Shape of a stress run.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Concurrent client connections.
    pub clients: usize,
    /// Sync calls per client.
    pub rounds: usize,
    /// Pending creates submitted per sync call.
    pub changes_per_round: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            clients: 8,
            rounds: 20,
            changes_per_round: 2,
        }
    }
}

/// Runs concurrent sync calls, each submitting fresh pending creates.
///
/// Returns per-call success counts. Change hashes are unique per client,
/// round and index.
pub async fn stress_concurrent_syncs(server: Arc<SyncServer>, dataset_id: &str, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut tasks = JoinSet::new();
    for client in 0..config.clients {
        let server = Arc::clone(&server);
        let dataset_id = dataset_id.to_string();
        let config = config.clone();
        tasks.spawn(async move {
            let cuid = format!("client-{client}");
            let (mut ok, mut failed) = (0usize, 0usize);
            for round in 0..config.rounds {
                let mut request = SyncRequest::new(cuid.as_str());
                for i in 0..config.changes_per_round {
                    let hash = format!("{cuid}-{round}-{i}");
                    let record = json!({"client": client, "round": round, "i": i});
                    request = request.with_pending(sample_create(&dataset_id, &hash, &hash, record));
                }
                match server.sync(&dataset_id, request).await {
                    Ok(_) => ok += 1,
                    Err(_) => failed += 1,
                }
            }
            (ok, failed)
        });
    }
    let (mut successful, mut failed) = (0, 0);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((ok, err)) => {
                successful += ok;
                failed += err;
            }
            Err(_) => failed += config.rounds,
        }
    }
    StressTestResult::new(successful, failed, start.elapsed())
}

/// Fills a queue with `messages` jobs and drains it with `claimers`
/// concurrent tasks.
///
/// Returns the result and whether any message was claimed twice.
pub async fn stress_queue_claims(queue: Arc<Queue>, messages: usize, claimers: usize) -> (StressTestResult, bool) {
    let payloads: Vec<_> = (0..messages).map(|i| json!({ "n": i })).collect();
    let _ = queue.add_many(&payloads).await;

    let start = Instant::now();
    let mut tasks = JoinSet::new();
    for _ in 0..claimers {
        let queue = Arc::clone(&queue);
        tasks.spawn(async move {
            let mut claimed = Vec::new();
            let mut failed = 0usize;
            loop {
                match queue.claim(Duration::from_secs(60)).await {
                    Ok(Some(message)) => {
                        if queue.ack(&message).await.is_err() {
                            failed += 1;
                        }
                        claimed.push(message.id);
                    }
                    Ok(None) => break,
                    Err(_) => failed += 1,
                }
            }
            (claimed, failed)
        });
    }

    let mut seen = HashSet::new();
    let mut duplicated = false;
    let (mut successful, mut failed) = (0, 0);
    while let Some(joined) = tasks.join_next().await {
        let Ok((claimed, errors)) = joined else {
            failed += 1;
            continue;
        };
        failed += errors;
        for id in claimed {
            successful += 1;
            duplicated |= !seen.insert(id);
        }
    }
    (StressTestResult::new(successful, failed, start.elapsed()), duplicated)
}
