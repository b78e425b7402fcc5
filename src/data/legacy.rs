//! Flat file-per-symbol store: `stocks_<interval>/<SYM>.parquet`.
//!
//! After a migration relocates the legacy tree the same files live under
//! `legacy/stocks_<interval>/`; reads and writes resolve whichever location
//! currently holds the symbol, preferring the original root.

use anyhow::Result;
use polars::prelude::DataFrame;

use crate::data::frame::{
    self, bar_schema, empty_bar_frame, merge_frames, read_parquet_or_recover,
    write_parquet_atomic, TIMESTAMP_COL,
};
use crate::data::paths::PathBuilder;
use crate::types::Interval;

#[derive(Debug, Clone)]
pub struct LegacyStore {
    paths: PathBuilder,
}

impl LegacyStore {
    pub fn new(paths: PathBuilder) -> Self {
        Self { paths }
    }

    fn resolve_file(&self, interval: Interval, symbol: &str) -> std::path::PathBuf {
        let primary = self.paths.legacy_file(interval, symbol);
        if primary.exists() {
            return primary;
        }
        let relocated = self.paths.legacy_relocated_file(interval, symbol);
        if relocated.exists() {
            relocated
        } else {
            primary
        }
    }

    /// Read the symbol's full series. Missing file yields an empty frame;
    /// a corrupt file is deleted and also yields an empty frame.
    pub fn read(&self, interval: Interval, symbol: &str) -> Result<DataFrame> {
        let path = self.resolve_file(interval, symbol);
        let df = read_parquet_or_recover(&path, &bar_schema());
        if df.height() == 0 {
            return Ok(empty_bar_frame());
        }
        frame::normalize_bars(df)
    }

    /// Read from the relocated `legacy/` tree only (migration source reads).
    pub fn read_relocated(&self, interval: Interval, symbol: &str) -> Result<DataFrame> {
        let path = self.paths.legacy_relocated_file(interval, symbol);
        let df = read_parquet_or_recover(&path, &bar_schema());
        if df.height() == 0 {
            return Ok(empty_bar_frame());
        }
        frame::normalize_bars(df)
    }

    /// Merge the new rows into the symbol's file; new rows win on timestamp
    /// collision. An empty frame is a no-op and creates nothing.
    pub fn save(&self, new_frame: &DataFrame, interval: Interval, symbol: &str) -> Result<()> {
        if new_frame.height() == 0 {
            return Ok(());
        }
        let existing = self.read(interval, symbol)?;
        let mut merged = merge_frames(
            existing,
            new_frame.clone(),
            &[TIMESTAMP_COL],
            TIMESTAMP_COL,
        )?;
        let path = self.resolve_file(interval, symbol);
        write_parquet_atomic(&mut merged, &path)
    }

    /// Symbols present for an interval, across both legacy locations, sorted.
    pub fn list_symbols(&self, interval: Interval) -> Result<Vec<String>> {
        let mut symbols = Vec::new();
        for dir in [
            self.paths.legacy_dir(interval),
            self.paths.legacy_relocated_dir(interval),
        ] {
            if !dir.exists() {
                continue;
            }
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == "parquet") {
                    if let Some(stem) = path.file_stem() {
                        symbols.push(stem.to_string_lossy().to_string());
                    }
                }
            }
        }
        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }

    /// Symbols under the relocated `legacy/` tree only, sorted.
    pub fn list_relocated_symbols(&self, interval: Interval) -> Result<Vec<String>> {
        let dir = self.paths.legacy_relocated_dir(interval);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut symbols = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "parquet") {
                if let Some(stem) = path.file_stem() {
                    symbols.push(stem.to_string_lossy().to_string());
                }
            }
        }
        symbols.sort();
        Ok(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frame::{bars_from_components, to_epoch_ms};
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn one_bar(y: i32, m: u32, d: u32, close: f64) -> DataFrame {
        let ts = to_epoch_ms(
            NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        );
        bars_from_components(
            vec![ts],
            vec![1.0],
            vec![1.0],
            vec![1.0],
            vec![close],
            vec![10.0],
            vec![],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn save_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = LegacyStore::new(PathBuilder::new(dir.path()));

        store.save(&one_bar(2025, 1, 2, 5.0), Interval::D1, "AAPL").unwrap();
        let df = store.read(Interval::D1, "AAPL").unwrap();
        assert_eq!(df.height(), 1);
        assert_eq!(store.list_symbols(Interval::D1).unwrap(), vec!["AAPL"]);
    }

    #[test]
    fn missing_symbol_reads_empty() {
        let dir = tempdir().unwrap();
        let store = LegacyStore::new(PathBuilder::new(dir.path()));
        let df = store.read(Interval::D1, "NOPE").unwrap();
        assert_eq!(df.height(), 0);
    }

    #[test]
    fn empty_save_creates_no_file() {
        let dir = tempdir().unwrap();
        let paths = PathBuilder::new(dir.path());
        let store = LegacyStore::new(paths.clone());
        store
            .save(&crate::data::frame::empty_bar_frame(), Interval::D1, "AAPL")
            .unwrap();
        assert!(!paths.legacy_file(Interval::D1, "AAPL").exists());
    }

    #[test]
    fn relocated_tree_is_found() {
        let dir = tempdir().unwrap();
        let paths = PathBuilder::new(dir.path());
        let store = LegacyStore::new(paths.clone());

        // Write, then simulate the relocation done before a migration.
        store.save(&one_bar(2025, 1, 2, 5.0), Interval::D1, "SAP").unwrap();
        let from = paths.legacy_file(Interval::D1, "SAP");
        let to = paths.legacy_relocated_file(Interval::D1, "SAP");
        std::fs::create_dir_all(to.parent().unwrap()).unwrap();
        std::fs::rename(&from, &to).unwrap();

        let df = store.read(Interval::D1, "SAP").unwrap();
        assert_eq!(df.height(), 1);
        assert_eq!(store.list_relocated_symbols(Interval::D1).unwrap(), vec!["SAP"]);
    }

    #[test]
    fn corruption_recovers_to_empty_and_deletes() {
        let dir = tempdir().unwrap();
        let paths = PathBuilder::new(dir.path());
        let store = LegacyStore::new(paths.clone());

        let path = paths.legacy_file(Interval::H1, "X");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"garbage").unwrap();

        let df = store.read(Interval::H1, "X").unwrap();
        assert_eq!(df.height(), 0);
        assert!(!path.exists());
    }
}
