//! Legacy → partitioned migration: plan, preflight, copy, verify, activate,
//! rollback. Runs off the hot path as a one-shot tool.
//!
//! Copies go through a staging tree (`.migration-staging/`) written with the
//! same merge semantics as the live store, verified against the source (row
//! counts, schema, SHA-256 over a canonical row serialization), and promoted
//! into the live tree by a single directory rename per symbol. Activation and
//! rollback touch metadata only; no command here deletes legacy data except
//! the explicit `delete-legacy`.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use polars::prelude::DataFrame;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::ConfigStore;
use crate::data::frame::TIMESTAMP_COL;
use crate::data::legacy::LegacyStore;
use crate::data::partitioned::PartitionedStore;
use crate::data::paths::PathBuilder;
use crate::registry::{RegistryHorizons, SymbolRegistry};
use crate::types::{Interval, StorageBackend, StorageBinding, Venue};

use super::plan::{load_plan, save_plan, MigrationPlan, PlanStatus};

/// Preflight failures caused by a working directory that does not match the
/// expected layout; surfaced with the usage exit code.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct LayoutError(pub String);

const FREE_SPACE_FACTOR: f64 = 2.5;

#[derive(Debug, Clone, Copy)]
pub struct EstimateReport {
    pub symbols: usize,
    pub source_bytes: u64,
    pub available_bytes: Option<u64>,
    pub required_bytes: u64,
}

impl EstimateReport {
    pub fn sufficient(&self) -> bool {
        match self.available_bytes {
            Some(avail) => avail >= self.required_bytes,
            // No mount information exposed; the check cannot run.
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SymbolAction {
    Migrated,
    AlreadyMigrated,
    DryRun,
    Verified,
    Mismatch(String),
}

#[derive(Debug, Clone)]
pub struct SymbolOutcome {
    pub symbol: String,
    pub rows: usize,
    pub action: SymbolAction,
}

#[derive(Debug, Default)]
pub struct MigrateReport {
    pub outcomes: Vec<SymbolOutcome>,
    pub migrated: usize,
    pub remaining: usize,
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub outcomes: Vec<SymbolOutcome>,
    pub mismatches: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct MigrateOptions {
    pub batch_size: usize,
    pub dry_run: bool,
    pub resume: bool,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            dry_run: false,
            resume: false,
        }
    }
}

pub struct MigrationEngine {
    store: ConfigStore,
    paths: PathBuilder,
    legacy: LegacyStore,
    staging: PartitionedStore,
    live: PartitionedStore,
    clock: Arc<dyn Clock>,
}

impl MigrationEngine {
    pub fn new(store: ConfigStore, clock: Arc<dyn Clock>) -> Self {
        let paths = PathBuilder::new(store.root());
        Self {
            legacy: LegacyStore::new(paths.clone()),
            staging: PartitionedStore::new(paths.staging()),
            live: PartitionedStore::new(paths.clone()),
            paths,
            store,
            clock,
        }
    }

    // -- init ---------------------------------------------------------------

    /// Create (or extend) the plan for a venue. The legacy source data must
    /// already sit under `legacy/`; conflicts with an existing plan fail.
    pub fn init(&self, venue: &Venue, intervals: &[Interval]) -> Result<()> {
        for iv in intervals {
            let dir = self.paths.legacy_relocated_dir(*iv);
            if !dir.is_dir() {
                bail!(LayoutError(format!(
                    "source data for {iv} must sit under {}; relocate the flat layout first",
                    dir.display()
                )));
            }
        }

        let mut plan =
            load_plan(&self.store)?.unwrap_or_else(|| MigrationPlan::new(self.clock.now_utc()));
        let conflicts = plan.ensure(venue, intervals);
        if !conflicts.is_empty() {
            let names: Vec<String> = conflicts.iter().map(ToString::to_string).collect();
            bail!(
                "plan already tracks {venue} intervals [{}]; use migrate --resume or rollback first",
                names.join(", ")
            );
        }
        save_plan(&self.store, &plan)?;
        info!(%venue, intervals = intervals.len(), "Migration plan initialized");
        Ok(())
    }

    // -- estimate -----------------------------------------------------------

    /// Size up the source tree and check the target filesystem has at least
    /// 2.5× that free.
    pub fn estimate(&self, venue: &Venue, interval: Interval) -> Result<EstimateReport> {
        let dir = self.paths.legacy_relocated_dir(interval);
        if !dir.is_dir() {
            bail!(LayoutError(format!(
                "no legacy source directory at {}",
                dir.display()
            )));
        }
        let source_bytes = dir_size(&dir)?;
        let symbols = self.legacy.list_relocated_symbols(interval)?.len();
        let required_bytes = (source_bytes as f64 * FREE_SPACE_FACTOR) as u64;
        let available_bytes = free_space(self.paths.root());
        if available_bytes.is_none() {
            warn!("No mount information available; skipping free-space check");
        }
        let report = EstimateReport {
            symbols,
            source_bytes,
            available_bytes,
            required_bytes,
        };
        info!(
            %venue,
            %interval,
            symbols,
            source_bytes,
            required_bytes,
            available = ?available_bytes,
            "Migration estimate"
        );
        Ok(report)
    }

    // -- migrate ------------------------------------------------------------

    /// Copy up to `batch_size` pending symbols into the partitioned layout,
    /// verifying and checkpointing after each one.
    pub fn migrate(
        &self,
        venue: &Venue,
        interval: Interval,
        opts: MigrateOptions,
    ) -> Result<MigrateReport> {
        let mut plan = load_plan(&self.store)?
            .with_context(|| format!("no migration plan; run init for {venue} first"))?;
        if plan.interval(venue, interval).is_none() {
            bail!("plan does not cover {venue} {interval}; run init first");
        }

        let estimate = self.estimate(venue, interval)?;
        if !estimate.sufficient() {
            bail!(
                "insufficient disk space: need {} bytes free, have {}",
                estimate.required_bytes,
                estimate.available_bytes.unwrap_or(0)
            );
        }

        let symbols = self.legacy.list_relocated_symbols(interval)?;
        {
            let entry = plan
                .interval_mut(venue, interval)
                .unwrap_or_else(|| unreachable!("checked above"));
            entry.symbols_total = Some(symbols.len());
            if !opts.resume && !opts.dry_run && !entry.symbols_migrated.is_empty() {
                bail!(
                    "migration for {venue} {interval} already has {} symbols done; pass --resume",
                    entry.symbols_migrated.len()
                );
            }
        }

        let pending: Vec<String> = {
            let entry = plan
                .interval(venue, interval)
                .unwrap_or_else(|| unreachable!("checked above"));
            symbols
                .iter()
                .filter(|s| !entry.is_migrated(s))
                .cloned()
                .collect()
        };
        let batch: Vec<String> = pending.iter().take(opts.batch_size).cloned().collect();

        let mut registry = SymbolRegistry::load(
            self.store.clone(),
            self.clock.clone(),
            RegistryHorizons::default(),
        )?;
        let binding = StorageBinding::partitioned(venue);
        let mut report = MigrateReport::default();
        let already = symbols.len() - pending.len();

        let pb = ProgressBar::new(batch.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {prefix:.bold} [{bar:30.cyan/dim}] {pos}/{len} symbols  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb.set_prefix(format!("{venue} {interval}"));

        for symbol in &batch {
            pb.set_message(symbol.clone());
            let src = self.legacy.read_relocated(interval, symbol)?;
            let rows = src.height();

            if opts.dry_run {
                report.outcomes.push(SymbolOutcome {
                    symbol: symbol.clone(),
                    rows,
                    action: SymbolAction::DryRun,
                });
                pb.inc(1);
                continue;
            }

            if let Err(err) = self.migrate_symbol(&src, &binding, symbol, interval) {
                // Verification and copy failures are fatal to the command;
                // the plan keeps what finished so --resume can continue.
                let entry = plan
                    .interval_mut(venue, interval)
                    .unwrap_or_else(|| unreachable!("checked above"));
                entry.status = PlanStatus::Failed;
                save_plan(&self.store, &plan)?;
                registry.save()?;
                pb.abandon_with_message(format!("failed at {symbol}"));
                return Err(err.context(format!("migrating {symbol} {interval}")));
            }

            registry.set_storage_binding(symbol, interval, binding.clone());

            let entry = plan
                .interval_mut(venue, interval)
                .unwrap_or_else(|| unreachable!("checked above"));
            entry.status = PlanStatus::InProgress;
            entry.symbols_migrated.push(symbol.clone());
            save_plan(&self.store, &plan)?;

            report.outcomes.push(SymbolOutcome {
                symbol: symbol.clone(),
                rows,
                action: SymbolAction::Migrated,
            });
            report.migrated += 1;
            pb.inc(1);
        }
        pb.finish_with_message(format!("{} migrated", report.migrated));

        if !opts.dry_run {
            registry.save()?;
            let done = already + report.migrated;
            let entry = plan
                .interval_mut(venue, interval)
                .unwrap_or_else(|| unreachable!("checked above"));
            if done == symbols.len() {
                entry.status = PlanStatus::Completed;
                info!(%venue, %interval, symbols = done, "Migration completed");
            }
            save_plan(&self.store, &plan)?;
            report.remaining = symbols.len() - done;
        } else {
            report.remaining = pending.len();
        }
        Ok(report)
    }

    /// Stage, verify and promote one symbol. The staging ticker tree is
    /// renamed into the live layout in one operation once verification has
    /// passed, so the live tree never holds a partially copied symbol.
    fn migrate_symbol(
        &self,
        src: &DataFrame,
        binding: &StorageBinding,
        symbol: &str,
        interval: Interval,
    ) -> Result<()> {
        let live_dir =
            self.paths
                .bar_ticker_dir(&binding.market, &binding.source, interval, symbol);

        if src.height() == 0 {
            // Nothing to copy; the binding alone is enough.
            return Ok(());
        }

        if live_dir.exists() {
            // A previous run promoted this symbol but crashed before the
            // plan checkpoint. Adopt the live tree if it matches.
            let live = self.live.read_bars(binding, symbol, interval, None)?;
            verify_frames(src, &live)
                .map_err(|reason| anyhow::anyhow!("existing live tree mismatches source: {reason}"))?;
            let staged_dir = self
                .paths
                .staging()
                .bar_ticker_dir(&binding.market, &binding.source, interval, symbol);
            if staged_dir.exists() {
                std::fs::remove_dir_all(&staged_dir)?;
            }
            return Ok(());
        }

        let staged_dir = self
            .paths
            .staging()
            .bar_ticker_dir(&binding.market, &binding.source, interval, symbol);
        if staged_dir.exists() {
            // Leftover from an interrupted run; start the symbol clean.
            std::fs::remove_dir_all(&staged_dir)?;
        }

        self.staging.save_bars(src, binding, symbol, interval)?;
        let staged = self.staging.read_bars(binding, symbol, interval, None)?;
        verify_frames(src, &staged)
            .map_err(|reason| anyhow::anyhow!("verification failed: {reason}"))?;

        let live_parent = live_dir
            .parent()
            .with_context(|| format!("no parent for {}", live_dir.display()))?;
        std::fs::create_dir_all(live_parent)?;
        std::fs::rename(&staged_dir, &live_dir).with_context(|| {
            format!(
                "Failed to promote {} → {}",
                staged_dir.display(),
                live_dir.display()
            )
        })?;
        Ok(())
    }

    // -- verify -------------------------------------------------------------

    /// Re-run verification for every migrated symbol without copying.
    pub fn verify(&self, venue: &Venue, interval: Interval) -> Result<VerifyReport> {
        let mut plan = load_plan(&self.store)?
            .with_context(|| format!("no migration plan; run init for {venue} first"))?;
        let migrated: Vec<String> = plan
            .interval(venue, interval)
            .with_context(|| format!("plan does not cover {venue} {interval}"))?
            .symbols_migrated
            .clone();

        let binding = StorageBinding::partitioned(venue);
        let mut report = VerifyReport::default();
        for symbol in &migrated {
            let src = self.legacy.read_relocated(interval, symbol)?;
            if src.height() == 0 {
                report.outcomes.push(SymbolOutcome {
                    symbol: symbol.clone(),
                    rows: 0,
                    action: SymbolAction::Verified,
                });
                continue;
            }
            let live = self.live.read_bars(&binding, symbol, interval, None)?;
            match verify_frames(&src, &live) {
                Ok(()) => report.outcomes.push(SymbolOutcome {
                    symbol: symbol.clone(),
                    rows: src.height(),
                    action: SymbolAction::Verified,
                }),
                Err(reason) => {
                    warn!(symbol, %interval, reason, "Verification mismatch");
                    report.mismatches += 1;
                    report.outcomes.push(SymbolOutcome {
                        symbol: symbol.clone(),
                        rows: src.height(),
                        action: SymbolAction::Mismatch(reason),
                    });
                }
            }
        }

        if let Some(entry) = plan.interval_mut(venue, interval) {
            entry.verified_at = Some(self.clock.now_utc());
            entry.checksum_verified = Some(report.mismatches == 0);
        }
        save_plan(&self.store, &plan)?;
        Ok(report)
    }

    // -- activate / rollback -------------------------------------------------

    /// Flip the venue's storage flag to partitioned. Metadata only; refuses
    /// until the plan is completed and checksum-verified.
    pub fn activate(&self, venue: &Venue, interval: Interval) -> Result<()> {
        let plan = load_plan(&self.store)?
            .with_context(|| format!("no migration plan; run init for {venue} first"))?;
        let entry = plan
            .interval(venue, interval)
            .with_context(|| format!("plan does not cover {venue} {interval}"))?;
        if entry.status != PlanStatus::Completed {
            bail!("migration for {venue} {interval} is not completed");
        }
        if entry.checksum_verified != Some(true) {
            bail!("run verify for {venue} {interval} before activating");
        }
        let mut config = self.store.load_storage_config()?;
        config.set_backend(venue, StorageBackend::Partitioned);
        self.store.save_storage_config(&config)?;
        info!(%venue, %interval, "Partitioned layout activated (metadata only)");
        Ok(())
    }

    /// Point registry bindings and the venue flag back at legacy. Never
    /// deletes partitioned data.
    pub fn rollback(&self, venue: &Venue, interval: Interval) -> Result<usize> {
        let mut registry = SymbolRegistry::load(
            self.store.clone(),
            self.clock.clone(),
            RegistryHorizons::default(),
        )?;
        let cleared = registry.clear_storage_bindings(venue, interval);
        registry.save()?;

        let mut config = self.store.load_storage_config()?;
        config.set_backend(venue, StorageBackend::Legacy);
        self.store.save_storage_config(&config)?;
        info!(%venue, %interval, cleared, "Rolled back to legacy (data untouched)");
        Ok(cleared)
    }

    /// Delete legacy source files for migrated symbols. Separate from the
    /// default path and prompts unless `assume_yes`.
    pub fn delete_legacy(
        &self,
        venue: &Venue,
        interval: Interval,
        assume_yes: bool,
    ) -> Result<usize> {
        let plan = load_plan(&self.store)?
            .with_context(|| format!("no migration plan; run init for {venue} first"))?;
        let entry = plan
            .interval(venue, interval)
            .with_context(|| format!("plan does not cover {venue} {interval}"))?;
        if entry.status != PlanStatus::Completed || entry.checksum_verified != Some(true) {
            bail!("refusing to delete legacy data before a verified, completed migration");
        }

        if !assume_yes && !confirm_on_stdin(&format!(
            "Delete {} legacy files for {venue} {interval}? Type 'yes' to confirm: ",
            entry.symbols_migrated.len()
        ))? {
            bail!("aborted by operator");
        }

        let mut deleted = 0usize;
        for symbol in &entry.symbols_migrated {
            let path = self.paths.legacy_relocated_file(interval, symbol);
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to delete {}", path.display()))?;
                deleted += 1;
            }
        }
        info!(%venue, %interval, deleted, "Deleted legacy source files");
        Ok(deleted)
    }
}

fn confirm_on_stdin(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}

/// Row count, schema, and canonical checksum must all match.
pub fn verify_frames(src: &DataFrame, dst: &DataFrame) -> std::result::Result<(), String> {
    if src.height() != dst.height() {
        return Err(format!("row count {} != {}", src.height(), dst.height()));
    }
    if src.schema() != dst.schema() {
        return Err("schema mismatch".to_string());
    }
    let src_sum = canonical_checksum(src).map_err(|e| e.to_string())?;
    let dst_sum = canonical_checksum(dst).map_err(|e| e.to_string())?;
    if src_sum != dst_sum {
        return Err(format!("checksum {src_sum} != {dst_sum}"));
    }
    Ok(())
}

/// SHA-256 over rows serialized in timestamp order with a fixed column
/// order, so the same logical series hashes identically regardless of how
/// its files are laid out.
pub fn canonical_checksum(df: &DataFrame) -> Result<String> {
    use polars::prelude::*;

    let sorted = df
        .clone()
        .lazy()
        .sort([TIMESTAMP_COL], SortMultipleOptions::default())
        .collect()?;

    let ts = sorted.column(TIMESTAMP_COL)?.cast(&DataType::Int64)?;
    let ts = ts.i64()?.clone();
    let mut value_cols = Vec::new();
    for name in sorted.get_column_names() {
        if name.as_str() == TIMESTAMP_COL {
            continue;
        }
        let col = sorted.column(name.as_str())?.cast(&DataType::Float64)?;
        value_cols.push(col.f64()?.clone());
    }

    let mut hasher = Sha256::new();
    let mut line = String::new();
    for i in 0..sorted.height() {
        line.clear();
        match ts.get(i) {
            Some(v) => line.push_str(&v.to_string()),
            None => line.push('-'),
        }
        for col in &value_cols {
            line.push('|');
            match col.get(i) {
                Some(v) => line.push_str(&v.to_string()),
                None => line.push('-'),
            }
        }
        line.push('\n');
        hasher.update(line.as_bytes());
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

/// Free bytes on the filesystem holding `root`, when the platform exposes
/// mount information.
fn free_space(root: &Path) -> Option<u64> {
    let canonical = root.canonicalize().ok()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| canonical.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(sysinfo::Disk::available_space)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frame::{bars_from_components, to_epoch_ms};
    use chrono::NaiveDate;

    fn frame(rows: &[(u32, f64)]) -> DataFrame {
        let ts: Vec<i64> = rows
            .iter()
            .map(|(d, _)| {
                to_epoch_ms(
                    NaiveDate::from_ymd_opt(2025, 1, *d)
                        .unwrap()
                        .and_hms_opt(0, 0, 0)
                        .unwrap(),
                )
            })
            .collect();
        let close: Vec<f64> = rows.iter().map(|(_, c)| *c).collect();
        let n = rows.len();
        bars_from_components(
            ts,
            vec![1.0; n],
            vec![1.0; n],
            vec![1.0; n],
            close,
            vec![10.0; n],
            vec![],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn checksum_is_order_insensitive_but_value_sensitive() {
        let a = frame(&[(2, 1.0), (3, 2.0)]);
        let b = frame(&[(3, 2.0), (2, 1.0)]);
        let c = frame(&[(2, 1.0), (3, 2.5)]);
        assert_eq!(
            canonical_checksum(&a).unwrap(),
            canonical_checksum(&b).unwrap()
        );
        assert_ne!(
            canonical_checksum(&a).unwrap(),
            canonical_checksum(&c).unwrap()
        );
    }

    #[test]
    fn verify_catches_row_count_and_value_drift() {
        let a = frame(&[(2, 1.0), (3, 2.0)]);
        assert!(verify_frames(&a, &a).is_ok());
        assert!(verify_frames(&a, &frame(&[(2, 1.0)])).is_err());
        assert!(verify_frames(&a, &frame(&[(2, 1.0), (3, 9.0)])).is_err());
    }

    #[test]
    fn estimate_sufficiency() {
        let ok = EstimateReport {
            symbols: 1,
            source_bytes: 100,
            available_bytes: Some(1000),
            required_bytes: 250,
        };
        assert!(ok.sufficient());
        let tight = EstimateReport {
            available_bytes: Some(200),
            ..ok
        };
        assert!(!tight.sufficient());
        let unknown = EstimateReport {
            available_bytes: None,
            ..ok
        };
        assert!(unknown.sufficient());
    }
}
