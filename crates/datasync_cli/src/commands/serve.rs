//! Serve command implementation.

use datasync_server::{DatasetOptions, ServerConfig, SyncServer};
use datasync_store::{DocumentStore, InMemoryStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Runs a server over an in-memory store until Ctrl-C.
///
/// With `stats_interval`, aggregated metrics are logged periodically.
pub async fn run(
    config: ServerConfig,
    datasets: &[String],
    stats_interval: Option<Duration>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore::new());
    let server = SyncServer::new(store, config);
    server.start().await?;
    for dataset_id in datasets {
        server.init(dataset_id, DatasetOptions::default()).await?;
    }
    info!(datasets = ?datasets, holder = %server.scheduler().holder_id(), "serving");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    match stats_interval {
        Some(every) => {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    signal = &mut shutdown => {
                        signal?;
                        break;
                    }
                    _ = ticker.tick() => {
                        for stat in server.stats() {
                            info!(
                                metric = %stat.name,
                                records = stat.number_of_records,
                                mean = stat.mean,
                                max = stat.max,
                                "stats"
                            );
                        }
                    }
                }
            }
        }
        None => shutdown.await?,
    }

    info!("shutting down");
    server.stop_all().await?;
    Ok(())
}
