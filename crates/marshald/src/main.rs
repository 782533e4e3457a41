//! marshald — the Marshal daemon.
//!
//! Runs the rolling update engine and the host drain coordinator over a
//! redb store, with a simulated cluster as the task operator.
//!
//! # Usage
//!
//! ```text
//! marshald run --data-dir /var/lib/marshal --hosts h1,h2,h3
//! marshald hosts --state draining
//! marshald updates --job web
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use marshal_core::MarshalConfig;
use marshal_state::{HostState, StateStore};
use marshald::Marshal;

#[derive(Parser)]
#[command(name = "marshald", about = "Marshal rolling update and host maintenance daemon")]
struct Cli {
    /// Path to marshal.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for persistent state.
    #[arg(long, global = true, default_value = "/var/lib/marshal")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the update engine and drain loops until Ctrl-C.
    Run {
        /// Hosts to register in UP before starting.
        #[arg(long, value_delimiter = ',')]
        hosts: Vec<String>,
    },
    /// List hosts, optionally filtered by state.
    Hosts {
        #[arg(long)]
        state: Option<HostState>,
    },
    /// List updates, optionally for one job.
    Updates {
        #[arg(long)]
        job: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => MarshalConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => MarshalConfig::default(),
    };
    init_tracing(&config);

    match cli.command {
        Command::Run { hosts } => run(&config, &cli.data_dir, &hosts).await,
        Command::Hosts { state } => {
            let store = open_store(&config, &cli.data_dir)?;
            let marshal = Marshal::new(store, &config);
            let states: Vec<HostState> = state.into_iter().collect();
            for host in marshal.drain.query_hosts(&states)? {
                println!("{}", serde_json::to_string(&host)?);
            }
            Ok(())
        }
        Command::Updates { job } => {
            let store = open_store(&config, &cli.data_dir)?;
            let marshal = Marshal::new(store, &config);
            for update in marshal.updates.list_updates(job.as_deref())? {
                println!("{}", serde_json::to_string(&update)?);
            }
            Ok(())
        }
    }
}

/// `RUST_LOG` wins; otherwise the filter from the config file.
fn init_tracing(config: &MarshalConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json() {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_store(config: &MarshalConfig, data_dir: &Path) -> anyhow::Result<StateStore> {
    let path = config.store_path(data_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = StateStore::open(&path)
        .with_context(|| format!("failed to open store {}", path.display()))?;
    info!(path = ?path, "state store opened");
    Ok(store)
}

async fn run(config: &MarshalConfig, data_dir: &Path, hosts: &[String]) -> anyhow::Result<()> {
    info!("Marshal daemon starting");

    let store = open_store(config, data_dir)?;
    let marshal = Marshal::new(store, config);
    marshal.bootstrap(hosts)?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            return;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    marshal.run(shutdown_rx).await;

    info!("Marshal daemon stopped");
    Ok(())
}
