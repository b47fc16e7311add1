//! Simulate command implementation.

use datasync_engine::MetricStats;
use datasync_protocol::{HashProvider, PendingChange, Sha256HashProvider, SyncRequest, UpdateType};
use datasync_server::{DatasetOptions, ServerConfig, SyncServer};
use datasync_store::{DocumentStore, InMemoryStore};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// What the simulated clients do.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Dataset the clients sync.
    pub dataset: String,
    /// Concurrent clients.
    pub clients: usize,
    /// Sync calls per client.
    pub rounds: usize,
    /// Pending creates per sync call.
    pub changes: usize,
}

/// Simulation outcome.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// Sync calls made.
    pub syncs: usize,
    /// Sync calls that failed.
    pub failed_syncs: usize,
    /// Pending changes submitted.
    pub submitted: usize,
    /// Applied updates the clients never acknowledged.
    pub unacknowledged: usize,
    /// Wall-clock time in milliseconds.
    pub elapsed_ms: u128,
    /// Server metrics at the end of the run.
    pub stats: Vec<MetricStats>,
}

#[derive(Default)]
struct ClientTally {
    syncs: usize,
    failed: usize,
}

async fn drive_client(server: Arc<SyncServer>, plan: Plan, client: usize) -> ClientTally {
    let hasher = Sha256HashProvider;
    let cuid = format!("sim-{client}");
    let mut tally = ClientTally::default();
    let mut to_ack: Vec<String> = Vec::new();
    for round in 0..plan.rounds {
        let mut request = SyncRequest::new(cuid.as_str()).with_meta_data(json!({"client": client}));
        for i in 0..plan.changes {
            let record = json!({"client": client, "round": round, "seq": i});
            let post_hash = hasher.record_hash(&plan.dataset, &record);
            let hash = Sha256HashProvider::digest(&format!("{cuid}:{round}:{i}"));
            request = request.with_pending(PendingChange::create(hash, format!("tmp-{round}-{i}"), record, post_hash));
        }
        for hash in to_ack.drain(..) {
            request = request.with_acknowledgement(hash);
        }
        tally.syncs += 1;
        match server.sync(&plan.dataset, request).await {
            Ok(response) => to_ack.extend(response.updates.hashes.into_keys()),
            Err(e) => {
                tally.failed += 1;
                warn!(cuid = %cuid, error = %e, "simulated sync failed");
            }
        }
    }
    tally
}

async fn count_unacknowledged(server: &SyncServer, plan: &Plan) -> usize {
    let mut unacknowledged = 0;
    for client in 0..plan.clients {
        let cuid = format!("sim-{client}");
        if let Ok(updates) = server.storage().list_updates(&plan.dataset, &cuid).await {
            unacknowledged += updates
                .iter()
                .filter(|u| u.update_type == UpdateType::Applied)
                .count();
        }
    }
    unacknowledged
}

/// Runs the simulation and prints a report.
pub async fn run(config: ServerConfig, plan: &Plan, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore::new());
    let server = Arc::new(SyncServer::new(store, config));
    server.init(&plan.dataset, DatasetOptions::default()).await?;

    let start = Instant::now();
    let mut tasks = JoinSet::new();
    for client in 0..plan.clients {
        tasks.spawn(drive_client(Arc::clone(&server), plan.clone(), client));
    }
    let mut syncs = 0;
    let mut failed_syncs = 0;
    while let Some(joined) = tasks.join_next().await {
        let tally = joined?;
        syncs += tally.syncs;
        failed_syncs += tally.failed;
    }

    // Let the pending worker drain its queue. The final round's updates
    // arrive after the last sync, so they stay unacknowledged.
    let submitted = plan.clients * plan.rounds * plan.changes;
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut in_flight = u64::MAX;
    while in_flight > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
        in_flight = server
            .storage()
            .store()
            .count(datasync_server::PENDING_QUEUE, &datasync_store::Filter::ne("state", "acked"))
            .await?;
        debug!(in_flight, "waiting for pending changes");
    }
    let unacknowledged = count_unacknowledged(&server, plan).await;

    let report = SimulationReport {
        syncs,
        failed_syncs,
        submitted,
        unacknowledged,
        elapsed_ms: start.elapsed().as_millis(),
        stats: server.stats(),
    };
    server.stop_all().await?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => {
            println!("Syncs:      {} ({} failed)", report.syncs, report.failed_syncs);
            println!("Submitted:  {}", report.submitted);
            println!("Unacked:    {}", report.unacknowledged);
            println!("Elapsed:    {} ms", report.elapsed_ms);
            println!();
            super::print_stats_table(&report.stats);
        }
    }
    Ok(())
}
