//! Migration CLI: plan, preflight, copy, verify, activate, rollback.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tickstore::clock::SystemClock;
use tickstore::config::ConfigStore;
use tickstore::migrate::{
    LayoutError, MigrateOptions, MigrationEngine, SymbolAction, SymbolOutcome,
};
use tickstore::types::{Interval, Venue};

#[derive(Parser)]
#[command(name = "tickstore-migrate", about = "Legacy → partitioned store migration")]
struct Cli {
    /// Working directory holding the store and its JSON documents.
    #[arg(long, env = "TICKSTORE_WORK_DIR", default_value = ".")]
    work_dir: PathBuf,

    /// Target venue as MARKET:SOURCE, e.g. us:yahoo.
    #[arg(long)]
    venue: Venue,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or extend the migration plan for the venue.
    Init {
        /// Intervals to migrate; defaults to all configured.
        #[arg(long, value_delimiter = ',')]
        intervals: Option<Vec<Interval>>,
    },
    /// Source size and free-space preflight.
    Estimate {
        #[arg(long)]
        interval: Interval,
    },
    /// Copy pending symbols into the partitioned layout.
    Migrate {
        #[arg(long)]
        interval: Interval,
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
        /// Report what would be copied without writing anything.
        #[arg(long)]
        dry_run: bool,
        /// Continue a previously started migration.
        #[arg(long)]
        resume: bool,
    },
    /// Re-verify migrated symbols against the legacy source.
    Verify {
        #[arg(long)]
        interval: Interval,
    },
    /// Flip the venue's storage flag to partitioned (metadata only).
    Activate {
        #[arg(long)]
        interval: Interval,
    },
    /// Point bindings and the venue flag back at legacy; deletes nothing.
    Rollback {
        #[arg(long)]
        interval: Interval,
    },
    /// Delete legacy source files for migrated symbols. Prompts first.
    DeleteLegacy {
        #[arg(long)]
        interval: Interval,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
}

fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        let code = if err.downcast_ref::<LayoutError>().is_some() {
            2
        } else {
            1
        };
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<()> {
    let store = ConfigStore::new(&cli.work_dir);
    let engine = MigrationEngine::new(store.clone(), Arc::new(SystemClock));
    let venue = cli.venue;

    match cli.command {
        Command::Init { intervals } => {
            let intervals = match intervals {
                Some(list) => list,
                None => store.load_intervals()?,
            };
            engine.init(&venue, &intervals)?;
            println!("plan initialized for {venue} ({} intervals)", intervals.len());
            Ok(())
        }
        Command::Estimate { interval } => {
            let report = engine.estimate(&venue, interval)?;
            println!(
                "{venue} {interval}: {} symbols, {} source bytes, need {} free, available {}",
                report.symbols,
                report.source_bytes,
                report.required_bytes,
                report
                    .available_bytes
                    .map_or_else(|| "unknown".to_string(), |b| b.to_string()),
            );
            if !report.sufficient() {
                anyhow::bail!("insufficient free space on the target filesystem");
            }
            Ok(())
        }
        Command::Migrate {
            interval,
            batch_size,
            dry_run,
            resume,
        } => {
            let report = engine.migrate(
                &venue,
                interval,
                MigrateOptions {
                    batch_size,
                    dry_run,
                    resume,
                },
            )?;
            print_table(&report.outcomes);
            println!(
                "{} migrated, {} remaining{}",
                report.migrated,
                report.remaining,
                if dry_run { " (dry run)" } else { "" }
            );
            Ok(())
        }
        Command::Verify { interval } => {
            let report = engine.verify(&venue, interval)?;
            print_table(&report.outcomes);
            if report.mismatches > 0 {
                anyhow::bail!("{} symbols failed verification", report.mismatches);
            }
            println!("{} symbols verified", report.outcomes.len());
            Ok(())
        }
        Command::Activate { interval } => {
            engine.activate(&venue, interval)?;
            println!("{venue} {interval} now routes to the partitioned layout");
            Ok(())
        }
        Command::Rollback { interval } => {
            let cleared = engine.rollback(&venue, interval)?;
            println!("{cleared} bindings reverted to legacy for {venue} {interval}");
            Ok(())
        }
        Command::DeleteLegacy { interval, yes } => {
            let deleted = engine.delete_legacy(&venue, interval, yes)?;
            println!("{deleted} legacy files deleted for {venue} {interval}");
            Ok(())
        }
    }
}

fn print_table(outcomes: &[SymbolOutcome]) {
    if outcomes.is_empty() {
        return;
    }
    println!("{:<12} {:>10}  {}", "symbol", "rows", "result");
    for outcome in outcomes {
        let result = match &outcome.action {
            SymbolAction::Migrated => "migrated".to_string(),
            SymbolAction::AlreadyMigrated => "already migrated".to_string(),
            SymbolAction::DryRun => "would migrate".to_string(),
            SymbolAction::Verified => "ok".to_string(),
            SymbolAction::Mismatch(reason) => format!("MISMATCH: {reason}"),
        };
        println!("{:<12} {:>10}  {}", outcome.symbol, outcome.rows, result);
    }
}
