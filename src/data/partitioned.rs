//! Hive-partitioned store.
//!
//! Bars partition by (year, month) of the row timestamp under
//! `ticker=<SYM>`; trades partition by (year, month, day) of the trade time
//! under `venue=<V>`. Each partition file is merged and rewritten atomically
//! on save; partitions of one save are independent and written in parallel.
//! Partial multi-partition writes are not rolled back, but every individual
//! partition is crash-safe (rename is the commit point) and a rerun
//! converges because the merge is idempotent.

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use rayon::prelude::*;

use crate::data::frame::{
    bar_schema, empty_bar_frame, empty_trade_frame, merge_frames, read_parquet_or_recover,
    trade_schema, write_parquet_atomic, TIMESTAMP_COL, TRADE_KEY_COLS, TRADE_TIME_COL,
};
use crate::data::paths::{PathBuilder, DATA_FILE};
use crate::types::{Interval, StorageBinding};

const YEAR_KEY: &str = "__year";
const MONTH_KEY: &str = "__month";
const DAY_KEY: &str = "__day";

#[derive(Debug, Clone)]
pub struct PartitionedStore {
    paths: PathBuilder,
}

impl PartitionedStore {
    pub fn new(paths: PathBuilder) -> Self {
        Self { paths }
    }

    // -- bars ---------------------------------------------------------------

    /// Merge the new rows into every affected (year, month) partition. An
    /// empty frame is a no-op and creates nothing.
    pub fn save_bars(
        &self,
        new_frame: &DataFrame,
        binding: &StorageBinding,
        symbol: &str,
        interval: Interval,
    ) -> Result<()> {
        if new_frame.height() == 0 {
            return Ok(());
        }
        let keyed = new_frame
            .clone()
            .lazy()
            .with_columns([
                col(TIMESTAMP_COL)
                    .dt()
                    .year()
                    .cast(DataType::Int32)
                    .alias(YEAR_KEY),
                col(TIMESTAMP_COL)
                    .dt()
                    .month()
                    .cast(DataType::Int32)
                    .alias(MONTH_KEY),
            ])
            .collect()?;
        let parts = keyed.partition_by([YEAR_KEY, MONTH_KEY], true)?;

        parts
            .into_par_iter()
            .map(|part| self.write_bar_partition(part, binding, symbol, interval))
            .collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    fn write_bar_partition(
        &self,
        part: DataFrame,
        binding: &StorageBinding,
        symbol: &str,
        interval: Interval,
    ) -> Result<()> {
        let year = partition_key(&part, YEAR_KEY)?;
        let month = partition_key(&part, MONTH_KEY)?;
        let rows = part.drop(YEAR_KEY)?.drop(MONTH_KEY)?;

        let path = self.paths.bar_partition_file(
            &binding.market,
            &binding.source,
            interval,
            symbol,
            year,
            month as u32,
        );
        let existing = read_parquet_or_recover(&path, &bar_schema());
        let mut merged = merge_frames(existing, rows, &[TIMESTAMP_COL], TIMESTAMP_COL)?;
        write_parquet_atomic(&mut merged, &path)
    }

    /// Concatenate the symbol's partition subtree in timestamp order, with an
    /// optional inclusive range filter. Corrupt partitions are deleted and
    /// skipped.
    pub fn read_bars(
        &self,
        binding: &StorageBinding,
        symbol: &str,
        interval: Interval,
        range: Option<(NaiveDateTime, NaiveDateTime)>,
    ) -> Result<DataFrame> {
        let ticker_dir =
            self.paths
                .bar_ticker_dir(&binding.market, &binding.source, interval, symbol);
        let mut frames = Vec::new();
        for month_dir in partition_dirs(&ticker_dir)? {
            let path = month_dir.join(DATA_FILE);
            let df = read_parquet_or_recover(&path, &bar_schema());
            if df.height() > 0 {
                frames.push(df.lazy());
            }
        }
        if frames.is_empty() {
            return Ok(empty_bar_frame());
        }
        let mut lf = concat(frames, UnionArgs::default())?
            .sort([TIMESTAMP_COL], SortMultipleOptions::default());
        if let Some((start, end)) = range {
            lf = lf.filter(
                col(TIMESTAMP_COL)
                    .gt_eq(lit(start))
                    .and(col(TIMESTAMP_COL).lt_eq(lit(end))),
            );
        }
        Ok(lf.collect()?)
    }

    /// True when any partition file exists for the symbol.
    pub fn has_bars(&self, binding: &StorageBinding, symbol: &str, interval: Interval) -> bool {
        let ticker_dir =
            self.paths
                .bar_ticker_dir(&binding.market, &binding.source, interval, symbol);
        partition_dirs(&ticker_dir)
            .map(|dirs| dirs.iter().any(|d| d.join(DATA_FILE).exists()))
            .unwrap_or(false)
    }

    // -- trades -------------------------------------------------------------

    /// Merge trade rows into the venue's (year, month, day) partitions,
    /// deduplicating on `(trans_id, tick_id)`.
    pub fn save_trades(
        &self,
        new_frame: &DataFrame,
        market: &str,
        source: &str,
        venue: &str,
    ) -> Result<()> {
        if new_frame.height() == 0 {
            return Ok(());
        }
        let keyed = new_frame
            .clone()
            .lazy()
            .with_columns([
                col(TRADE_TIME_COL)
                    .dt()
                    .year()
                    .cast(DataType::Int32)
                    .alias(YEAR_KEY),
                col(TRADE_TIME_COL)
                    .dt()
                    .month()
                    .cast(DataType::Int32)
                    .alias(MONTH_KEY),
                col(TRADE_TIME_COL)
                    .dt()
                    .day()
                    .cast(DataType::Int32)
                    .alias(DAY_KEY),
            ])
            .collect()?;
        let parts = keyed.partition_by([YEAR_KEY, MONTH_KEY, DAY_KEY], true)?;

        parts
            .into_par_iter()
            .map(|part| self.write_trade_partition(part, market, source, venue))
            .collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    fn write_trade_partition(
        &self,
        part: DataFrame,
        market: &str,
        source: &str,
        venue: &str,
    ) -> Result<()> {
        let year = partition_key(&part, YEAR_KEY)?;
        let month = partition_key(&part, MONTH_KEY)? as u32;
        let day = partition_key(&part, DAY_KEY)? as u32;
        let rows = part.drop(YEAR_KEY)?.drop(MONTH_KEY)?.drop(DAY_KEY)?;

        let date = NaiveDate::from_ymd_opt(year, month, day)
            .with_context(|| format!("invalid partition date {year}-{month}-{day}"))?;
        let path = self.paths.trades_partition_file(market, source, venue, date);
        let existing = read_parquet_or_recover(&path, &trade_schema());
        let mut merged = merge_frames(existing, rows, TRADE_KEY_COLS, TRADE_TIME_COL)?;
        write_parquet_atomic(&mut merged, &path)
    }

    pub fn read_trades(
        &self,
        market: &str,
        source: &str,
        venue: &str,
        day: NaiveDate,
    ) -> Result<DataFrame> {
        let path = self.paths.trades_partition_file(market, source, venue, day);
        let df = read_parquet_or_recover(&path, &trade_schema());
        if df.height() == 0 {
            return Ok(empty_trade_frame());
        }
        Ok(df)
    }

    pub fn trades_file_exists(&self, market: &str, source: &str, venue: &str, day: NaiveDate) -> bool {
        self.paths
            .trades_partition_file(market, source, venue, day)
            .exists()
    }
}

fn partition_key(part: &DataFrame, name: &str) -> Result<i32> {
    part.column(name)?
        .i32()?
        .get(0)
        .with_context(|| format!("partition missing {name} key"))
}

/// The sorted `year=*/month=*` (and deeper) leaf directories under a ticker
/// or venue directory. Zero-padded segment values keep lexicographic order
/// equal to chronological order.
fn partition_dirs(root: &std::path::Path) -> Result<Vec<std::path::PathBuf>> {
    fn sorted_subdirs(dir: &std::path::Path, key: &str) -> Result<Vec<std::path::PathBuf>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let name = path.file_name().map(|n| n.to_string_lossy().to_string());
            if path.is_dir()
                && name.is_some_and(|n| crate::data::paths::partition_value(&n, key).is_some())
            {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut leaves = Vec::new();
    for year_dir in sorted_subdirs(root, "year")? {
        for month_dir in sorted_subdirs(&year_dir, "month")? {
            leaves.push(month_dir);
        }
    }
    Ok(leaves)
}
