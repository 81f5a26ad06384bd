mod server;
mod source;

use clap::{Parser, Subcommand};
use pkg_cluster::ClusterRegistry;
use pkg_constants::quota::RESERVATION_SWEEP_INTERVAL_SECS;
use pkg_constants::server::{DEFAULT_CONFIG_PATH, DEFAULT_DATA_DIR, DEFAULT_METRICS_PORT};
use pkg_metrics::MetricsRegistry;
use pkg_quota::{QuotaEngine, QuotaLedger, ReservationExpiryController};
use pkg_state::{KvStore, MemoryStore, RetryPolicy, StateStore};
use pkg_types::config::{ServerConfigFile, load_config_file};
use pkg_types::context::RequestContext;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::server::AppState;
use crate::source::LedgerUsageSource;

#[derive(Parser, Debug)]
#[command(name = "quota-server", about = "Quota reservation ledger and cluster registry")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Directory for SlateDB state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Keep all state in memory (lost on exit)
    #[arg(long)]
    ephemeral: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the expiry sweep and serve /healthz, /metrics and read-only views
    Serve {
        /// Port for the HTTP endpoints
        #[arg(long)]
        metrics_port: Option<u16>,

        /// Seconds between reservation expiry sweeps
        #[arg(long)]
        sweep_interval_secs: Option<u64>,
    },
    /// Expire stale reservations once and exit
    Expire,
    /// Print a project's effective limits and usage as JSON
    Usage {
        #[arg(long)]
        project: String,
    },
}

fn init_logging(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().flatten_event(true))
            .init();
    } else {
        tracing_subscriber::registry().with(env_filter).with(fmt::layer()).init();
    }
}

/// The opened backing store. SlateDB needs an explicit close to flush.
enum Backend {
    Slate(StateStore),
    Memory(MemoryStore),
}

impl Backend {
    fn kv(&self) -> Arc<dyn KvStore> {
        match self {
            Backend::Slate(s) => Arc::new(s.clone()),
            Backend::Memory(m) => Arc::new(m.clone()),
        }
    }

    async fn close(self) -> anyhow::Result<()> {
        match self {
            Backend::Slate(s) => s.close().await,
            Backend::Memory(_) => Ok(()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    // Load config file (returns defaults if file not found)
    let file_cfg: ServerConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let data_dir = cli
        .data_dir
        .or(file_cfg.data_dir.clone())
        .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
    let quota_cfg = file_cfg.quota.clone().unwrap_or_default();
    let cluster_cfg = file_cfg.cluster.clone().unwrap_or_default();
    let retry: RetryPolicy = file_cfg.retry.clone().unwrap_or_default().into();

    let backend = if cli.ephemeral {
        warn!("Running with in-memory state; nothing will be persisted");
        Backend::Memory(MemoryStore::new())
    } else {
        Backend::Slate(StateStore::new(&data_dir).await?)
    };
    let store = backend.kv();

    let metrics = Arc::new(MetricsRegistry::new());
    let ledger = Arc::new(QuotaLedger::new(store.clone(), retry, metrics.clone()));
    let source = Arc::new(LedgerUsageSource::new(ledger.clone()));
    let engine = Arc::new(QuotaEngine::new(ledger.clone(), source, quota_cfg));
    let ctx = RequestContext::admin();

    match cli.command {
        Command::Serve {
            metrics_port,
            sweep_interval_secs,
        } => {
            let port = metrics_port
                .or(file_cfg.metrics_port)
                .unwrap_or(DEFAULT_METRICS_PORT);
            let sweep = sweep_interval_secs
                .or(file_cfg.sweep_interval_secs)
                .unwrap_or(RESERVATION_SWEEP_INTERVAL_SECS)
                .max(1);

            info!("Starting quota-server");
            info!("  Port:      {}", port);
            info!("  Data dir:  {}", data_dir);
            info!("  Sweep:     {}s", sweep);

            let outstanding = ledger.count_outstanding().await?;
            info!("{} reservations outstanding at startup", outstanding);

            let clusters = Arc::new(ClusterRegistry::new(store, &cluster_cfg, retry));
            let sweeper =
                ReservationExpiryController::new(ledger.clone(), Duration::from_secs(sweep)).start();

            let state = AppState {
                engine,
                clusters,
                metrics,
            };
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let result = server::serve(addr, state).await;
            sweeper.abort();
            result?;
        }
        Command::Expire => {
            let reclaimed = engine.expire(&ctx).await?;
            info!("Expired {} reservations", reclaimed);
        }
        Command::Usage { project } => {
            let quotas = engine.get_project_quotas(&ctx, &project, true).await?;
            println!("{}", serde_json::to_string_pretty(&quotas)?);
        }
    }

    backend.close().await?;
    Ok(())
}
