//! gridscaled — the Grid Engine autoscaling daemon.
//!
//! Watches the queue backlog and launches or retires additional cloud
//! workers for it:
//! - Queue client (`qstat`, `qconf`, `qmod`, `qdel`)
//! - Compute control API and `pipe` launcher
//! - Host registry (in-memory or file-backed)
//! - Instance selection
//! - Autoscaler and worker validator
//!
//! # Usage
//!
//! ```text
//! gridscaled run --config /etc/gridscale/gridscale.toml
//! gridscaled hosts --config /etc/gridscale/gridscale.toml
//! ```

mod assemble;
mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gridscale_core::SystemClock;

use crate::config::DaemonConfig;

const DEFAULT_LOG_FILTER: &str = "info,gridscale=debug";

#[derive(Parser)]
#[command(name = "gridscaled", about = "Grid Engine autoscaling daemon")]
struct Cli {
    /// Log as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the autoscaling loop until interrupted.
    Run {
        /// Configuration file.
        #[arg(long, short)]
        config: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },
    /// List the additional hosts in the registry and their last activity.
    Hosts {
        /// Configuration file.
        #[arg(long, short)]
        config: PathBuf,
    },
}

/// Command line values taking precedence over the configuration file.
#[derive(Args)]
struct Overrides {
    /// Maximum number of additional hosts.
    #[arg(long)]
    max_additional_hosts: Option<usize>,

    /// Workers launched per scale-up.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Sleep between cycles, e.g. "10s".
    #[arg(long)]
    polling_timeout: Option<String>,

    /// Persistent host registry file.
    #[arg(long)]
    host_storage: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, config: &mut DaemonConfig) {
        if let Some(max) = self.max_additional_hosts {
            config.scaling.max_additional_hosts = max;
        }
        if let Some(batch_size) = self.batch_size {
            config.scaling.batch_size = batch_size;
        }
        if let Some(timeout) = self.polling_timeout {
            config.scaling.polling_timeout = timeout;
        }
        if let Some(path) = self.host_storage {
            config.paths.host_storage = Some(path);
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config, overrides } => {
            let mut config = DaemonConfig::from_file(&config)?;
            overrides.apply(&mut config);
            config.validate()?;
            run(config).await
        }
        Command::Hosts { config } => list_hosts(&DaemonConfig::from_file(&config)?),
    }
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!(
        queue = %config.queue.name,
        max_additional_hosts = config.scaling.max_additional_hosts,
        batch_size = config.scaling.batch_size,
        polling_timeout = %config.scaling.polling_timeout,
        "gridscale daemon starting"
    );
    let daemon = assemble::daemon(&config).await?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(daemon.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, finishing the current cycle");
    let _ = shutdown_tx.send(true);
    handle.await?;

    info!("gridscale daemon stopped");
    Ok(())
}

fn list_hosts(config: &DaemonConfig) -> anyhow::Result<()> {
    let registry = assemble::host_registry(config, Arc::new(SystemClock))?;
    let hosts = registry.load_hosts();
    let activity = registry.get_hosts_activity(&hosts)?;
    for host in &hosts {
        if let Some(last) = activity.get(host) {
            println!("{host}\t{last}");
        }
    }
    Ok(())
}
