//! DataSync CLI
//!
//! Command-line tools for running and exercising a DataSync server.
//!
//! # Commands
//!
//! - `serve` - Run a sync server in-process until Ctrl-C
//! - `simulate` - Drive synthetic clients against an in-process server
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use datasync_server::ServerConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// DataSync command-line tools.
#[derive(Parser)]
#[command(name = "datasync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Server configuration file (JSON, missing fields use defaults)
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sync server until interrupted
    Serve {
        /// Datasets to initialise at startup
        #[arg(short, long)]
        dataset: Vec<String>,

        /// Seconds between stats reports (0 disables them)
        #[arg(short, long, default_value = "60")]
        stats_interval: u64,
    },

    /// Drive synthetic clients and report the resulting stats
    Simulate {
        /// Dataset the clients sync
        #[arg(short, long, default_value = "simulation")]
        dataset: String,

        /// Number of concurrent clients
        #[arg(long, default_value = "8")]
        clients: usize,

        /// Sync calls per client
        #[arg(short, long, default_value = "20")]
        rounds: usize,

        /// Pending changes per sync call
        #[arg(long, default_value = "2")]
        changes: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn load_config(path: Option<&PathBuf>) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read config {}: {e}", path.display()))?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(ServerConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            dataset,
            stats_interval,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let interval = (stats_interval > 0).then(|| Duration::from_secs(stats_interval));
            commands::serve::run(config, &dataset, interval).await?;
        }
        Commands::Simulate {
            dataset,
            clients,
            rounds,
            changes,
            format,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let plan = commands::simulate::Plan {
                dataset,
                clients,
                rounds,
                changes,
            };
            commands::simulate::run(config, &plan, &format).await?;
        }
        Commands::Version => {
            println!("DataSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
