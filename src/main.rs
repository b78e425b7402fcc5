// float_cmp: only in tests where assert_eq! on f64 is intentional.
#![cfg_attr(test, allow(clippy::float_cmp))]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tickstore::clock::{Clock, SystemClock};
use tickstore::config::ConfigStore;
use tickstore::daemon::{
    install_signal_handlers, read_symbols_file, DaemonLoop, MaintenanceCadence, RunLock,
};
use tickstore::data::paths::PathBuilder;
use tickstore::data::{PartitionedStore, StorageRouter};
use tickstore::fetch::provider::{HttpBarFetcher, HttpTradeFetcher, PROVIDER_URL_VAR};
use tickstore::fetch::{BarFetcher, TradeFetcher};
use tickstore::hours::{TradingHoursGate, EXTENDED_HOURS, REGULAR_HOURS};
use tickstore::limiter::{RateLimiter, TokenBucket};
use tickstore::registry::{RegistryHorizons, SymbolRegistry};
use tickstore::scheduler::IntervalScheduler;
use tickstore::trades::TradeIngestor;
use tickstore::types::StorageBackend;

#[derive(Parser)]
#[command(name = "tickstore", about = "Incremental market-data ingestion service")]
struct Cli {
    /// Working directory holding the store and its JSON documents.
    #[arg(long, env = "TICKSTORE_WORK_DIR", default_value = ".")]
    work_dir: PathBuf,

    /// Rate budget: N requests per T seconds.
    #[arg(long, num_args = 2, value_names = ["N", "T"])]
    limits: Option<Vec<u64>>,

    /// Days a not-found interval stays in cooldown.
    #[arg(long, default_value_t = tickstore::registry::DEFAULT_COOLDOWN_DAYS)]
    cooldown_days: i64,

    /// Days of data recency that reactivate a not-found symbol.
    #[arg(long, default_value_t = tickstore::registry::DEFAULT_REACTIVATION_DAYS)]
    reactivation_days: i64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the working directory layout and default documents.
    Initialize,
    /// Run one incremental sweep over all configured intervals.
    UpdateData {
        /// Override the incremental window start (YYYY-MM-DD).
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Override the window end (YYYY-MM-DD).
        #[arg(long)]
        end: Option<NaiveDate>,
    },
    /// Union-merge the registry with a symbols file.
    UpdateTickers {
        #[arg(long)]
        symbols_file: PathBuf,
    },
    /// Probe globally not-found symbols and reactivate any that have data.
    ConfirmNotFounds,
    /// Reactivate not-found symbols from stored data recency, offline.
    ReparseNotFounds,
    /// Flip the global storage backend flag between legacy and partitioned.
    PartitionToggle,
    /// Ingest raw trade files for an exchange venue.
    UpdateTrades {
        /// Exchange venue code, e.g. XFRA.
        #[arg(long)]
        venue: String,
        /// Day to ingest (YYYY-MM-DD); defaults to today.
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Re-ingest days whose partition already holds data.
        #[arg(long)]
        refetch: bool,
    },
    /// Run the long-lived ingest loop.
    Daemon {
        /// Hours between sweeps.
        #[arg(long, default_value_t = 4)]
        interval: u64,
        /// PID file path; defaults to <work-dir>/tickstore.pid.
        #[arg(long)]
        pid_file: Option<PathBuf>,
        /// Active window, HH:MM-HH:MM market-local.
        #[arg(long)]
        trading_hours: Option<String>,
        #[arg(long, env = "TICKSTORE_MARKET_TZ", default_value = "America/New_York")]
        market_timezone: String,
        /// Use the extended-hours default window.
        #[arg(long)]
        extended_hours: bool,
        #[arg(long, default_value = "never")]
        ticker_maintenance: MaintenanceCadence,
        /// Symbols file for list refresh during maintenance.
        #[arg(long)]
        symbols_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        tracing::error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let store = ConfigStore::new(&cli.work_dir);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let horizons = RegistryHorizons {
        cooldown_days: cli.cooldown_days,
        reactivation_days: cli.reactivation_days,
    };
    let limiter: Arc<dyn RateLimiter> = match &cli.limits {
        Some(pair) if pair.len() == 2 => Arc::new(TokenBucket::new(pair[0] as usize, pair[1])),
        Some(_) => bail!("--limits takes exactly two values: N T"),
        None => Arc::new(TokenBucket::default()),
    };

    match cli.command {
        Command::Initialize => initialize(&store),
        Command::UpdateData { start, end } => {
            let _lock = RunLock::acquire(&store.root().join("tickstore.pid"))?;
            let cancel = CancellationToken::new();
            install_signal_handlers(cancel.clone())?;
            let mut scheduler =
                build_scheduler(&store, clock, horizons, limiter, cancel, require_bar_fetcher()?)?;
            let start = start.and_then(|d| d.and_hms_opt(0, 0, 0));
            let end = end.and_then(|d| d.and_hms_opt(23, 59, 59));
            scheduler.run(start, end).await?;
            Ok(())
        }
        Command::UpdateTickers { symbols_file } => {
            let mut registry = SymbolRegistry::load(store, clock, horizons)?;
            let symbols = read_symbols_file(&symbols_file)?;
            registry.refresh_current_list(&symbols);
            registry.save()?;
            Ok(())
        }
        Command::ConfirmNotFounds => {
            let fetcher = require_bar_fetcher()?;
            let mut registry = SymbolRegistry::load(store, clock, horizons)?;
            let reactivated = registry
                .confirm_not_founds(fetcher.as_ref(), limiter.as_ref())
                .await?;
            registry.save()?;
            info!(reactivated, "confirm-not-founds finished");
            Ok(())
        }
        Command::ReparseNotFounds => {
            let mut registry = SymbolRegistry::load(store, clock, horizons)?;
            let reactivated = registry.reparse_not_founds();
            registry.save()?;
            info!(reactivated, "reparse-not-founds finished");
            Ok(())
        }
        Command::PartitionToggle => {
            let mut config = store.load_storage_config()?;
            config.global_backend = match config.global_backend {
                StorageBackend::Legacy => StorageBackend::Partitioned,
                StorageBackend::Partitioned => StorageBackend::Legacy,
            };
            store.save_storage_config(&config)?;
            println!("global backend: {:?}", config.global_backend);
            Ok(())
        }
        Command::UpdateTrades { venue, date, refetch } => {
            let fetcher = require_trade_fetcher()?;
            let cancel = CancellationToken::new();
            install_signal_handlers(cancel.clone())?;
            let config = store.load_storage_config()?;
            let ingestor = TradeIngestor::new(
                PartitionedStore::new(PathBuilder::new(store.root())),
                fetcher,
                limiter,
                config.default_venue(),
                cancel,
            );
            let days = vec![date.unwrap_or_else(|| clock.today())];
            ingestor.run(&venue, &days, refetch).await?;
            Ok(())
        }
        Command::Daemon {
            interval,
            pid_file,
            trading_hours,
            market_timezone,
            extended_hours,
            ticker_maintenance,
            symbols_file,
        } => {
            let pid_path = pid_file.unwrap_or_else(|| store.root().join("tickstore.pid"));
            let _lock = RunLock::acquire(&pid_path)?;

            let cancel = CancellationToken::new();
            install_signal_handlers(cancel.clone())?;

            let window = trading_hours.unwrap_or_else(|| {
                (if extended_hours { EXTENDED_HOURS } else { REGULAR_HOURS }).to_string()
            });
            let gate = Some(TradingHoursGate::parse(&window, &market_timezone)?);

            let fetcher = require_bar_fetcher()?;
            let scheduler = build_scheduler(
                &store,
                clock.clone(),
                horizons,
                limiter.clone(),
                cancel.clone(),
                fetcher.clone(),
            )?;
            let mut daemon = DaemonLoop::new(
                scheduler,
                fetcher,
                limiter,
                clock,
                cancel,
                gate,
                Duration::from_secs(interval * 3600),
                ticker_maintenance,
                symbols_file,
            );
            daemon.run().await
        }
    }
}

fn initialize(store: &ConfigStore) -> Result<()> {
    std::fs::create_dir_all(store.root())
        .with_context(|| format!("Failed to create {}", store.root().display()))?;
    if !store.intervals_path().exists() {
        store.save_intervals(&tickstore::types::Interval::ALL)?;
    }
    if !store.storage_config_path().exists() {
        store.save_storage_config(&tickstore::config::StorageConfig::default())?;
    }
    if !store.registry_path().exists() {
        let registry = SymbolRegistry::load(
            store.clone(),
            Arc::new(SystemClock),
            RegistryHorizons::default(),
        )?;
        registry.save()?;
    }
    info!(root = %store.root().display(), "Working directory initialized");
    Ok(())
}

fn build_scheduler(
    store: &ConfigStore,
    clock: Arc<dyn Clock>,
    horizons: RegistryHorizons,
    limiter: Arc<dyn RateLimiter>,
    cancel: CancellationToken,
    fetcher: Arc<dyn BarFetcher>,
) -> Result<IntervalScheduler> {
    let registry = SymbolRegistry::load(store.clone(), clock.clone(), horizons)?;
    let router = StorageRouter::new(
        PathBuilder::new(store.root()),
        store.load_storage_config()?,
    );
    Ok(IntervalScheduler::new(
        registry, router, fetcher, limiter, clock, cancel,
    ))
}

fn require_bar_fetcher() -> Result<Arc<dyn BarFetcher>> {
    match HttpBarFetcher::from_env() {
        Some(f) => Ok(Arc::new(f)),
        None => bail!(
            "{PROVIDER_URL_VAR} not configured. \
             Set it to the quote provider base URL to fetch data."
        ),
    }
}

fn require_trade_fetcher() -> Result<Arc<dyn TradeFetcher>> {
    match HttpTradeFetcher::from_env() {
        Some(f) => Ok(Arc::new(f)),
        None => bail!(
            "{PROVIDER_URL_VAR} not configured. \
             Set it to the venue feed base URL to fetch trade files."
        ),
    }
}
