//! Path construction for the legacy flat layout and the Hive-style
//! partitioned layout.
//!
//! Partitioned bars:
//!   `<root>/<market>/<source>/stocks_<interval>/ticker=<SYM>/year=<YYYY>/month=<MM>/data.parquet`
//! Partitioned trades:
//!   `<root>/<market>/<source>/trades/venue=<V>/year=<YYYY>/month=<MM>/day=<DD>/trades.parquet`
//! Legacy:
//!   `<root>/stocks_<interval>/<SYM>.parquet`, relocated to
//!   `<root>/legacy/stocks_<interval>/<SYM>.parquet` ahead of a migration.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::types::Interval;

pub const DATA_FILE: &str = "data.parquet";
pub const TRADES_FILE: &str = "trades.parquet";
pub const LEGACY_DIR: &str = "legacy";
pub const STAGING_DIR: &str = ".migration-staging";

#[derive(Debug, Clone)]
pub struct PathBuilder {
    root: PathBuf,
}

impl PathBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stocks_dir_name(interval: Interval) -> String {
        format!("stocks_{interval}")
    }

    // -- legacy layout ------------------------------------------------------

    pub fn legacy_dir(&self, interval: Interval) -> PathBuf {
        self.root.join(Self::stocks_dir_name(interval))
    }

    pub fn legacy_relocated_dir(&self, interval: Interval) -> PathBuf {
        self.root.join(LEGACY_DIR).join(Self::stocks_dir_name(interval))
    }

    pub fn legacy_file(&self, interval: Interval, symbol: &str) -> PathBuf {
        self.legacy_dir(interval).join(format!("{symbol}.parquet"))
    }

    pub fn legacy_relocated_file(&self, interval: Interval, symbol: &str) -> PathBuf {
        self.legacy_relocated_dir(interval)
            .join(format!("{symbol}.parquet"))
    }

    // -- partitioned layout -------------------------------------------------

    pub fn bars_dir(&self, market: &str, source: &str, interval: Interval) -> PathBuf {
        self.root
            .join(market)
            .join(source)
            .join(Self::stocks_dir_name(interval))
    }

    pub fn bar_ticker_dir(
        &self,
        market: &str,
        source: &str,
        interval: Interval,
        symbol: &str,
    ) -> PathBuf {
        self.bars_dir(market, source, interval)
            .join(format!("ticker={symbol}"))
    }

    pub fn bar_partition_file(
        &self,
        market: &str,
        source: &str,
        interval: Interval,
        symbol: &str,
        year: i32,
        month: u32,
    ) -> PathBuf {
        self.bar_ticker_dir(market, source, interval, symbol)
            .join(format!("year={year:04}"))
            .join(format!("month={month:02}"))
            .join(DATA_FILE)
    }

    pub fn trades_venue_dir(&self, market: &str, source: &str, venue: &str) -> PathBuf {
        self.root
            .join(market)
            .join(source)
            .join("trades")
            .join(format!("venue={venue}"))
    }

    pub fn trades_partition_file(
        &self,
        market: &str,
        source: &str,
        venue: &str,
        day: NaiveDate,
    ) -> PathBuf {
        use chrono::Datelike;
        self.trades_venue_dir(market, source, venue)
            .join(format!("year={:04}", day.year()))
            .join(format!("month={:02}", day.month()))
            .join(format!("day={:02}", day.day()))
            .join(TRADES_FILE)
    }

    // -- migration staging --------------------------------------------------

    pub fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// A builder rooted at the staging tree; staging paths mirror the live
    /// partitioned layout underneath it.
    pub fn staging(&self) -> PathBuilder {
        PathBuilder::new(self.staging_root())
    }
}

/// Split a Hive path segment like `year=2025` into `("year", "2025")`.
pub fn split_partition_segment(name: &str) -> Option<(&str, &str)> {
    name.split_once('=')
}

/// Numeric value of a Hive segment with the expected key, e.g.
/// `partition_value("month=03", "month") == Some(3)`.
pub fn partition_value(name: &str, key: &str) -> Option<u32> {
    match split_partition_segment(name) {
        Some((k, v)) if k == key => v.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_partition_path_is_hive_style() {
        let paths = PathBuilder::new("/data");
        let p = paths.bar_partition_file("us", "yahoo", Interval::D1, "AAPL", 2025, 3);
        assert_eq!(
            p,
            PathBuf::from("/data/us/yahoo/stocks_1d/ticker=AAPL/year=2025/month=03/data.parquet")
        );
    }

    #[test]
    fn trade_partition_path_includes_day() {
        let paths = PathBuilder::new("/data");
        let day = NaiveDate::from_ymd_opt(2025, 1, 7).unwrap();
        let p = paths.trades_partition_file("de", "xetra", "XFRA", day);
        assert_eq!(
            p,
            PathBuf::from("/data/de/xetra/trades/venue=XFRA/year=2025/month=01/day=07/trades.parquet")
        );
    }

    #[test]
    fn legacy_paths_cover_both_locations() {
        let paths = PathBuilder::new("/data");
        assert_eq!(
            paths.legacy_file(Interval::H1, "SAP"),
            PathBuf::from("/data/stocks_1h/SAP.parquet")
        );
        assert_eq!(
            paths.legacy_relocated_file(Interval::H1, "SAP"),
            PathBuf::from("/data/legacy/stocks_1h/SAP.parquet")
        );
    }

    #[test]
    fn staging_mirrors_live_layout() {
        let paths = PathBuilder::new("/data");
        let staged = paths
            .staging()
            .bar_partition_file("us", "yahoo", Interval::D1, "AAPL", 2025, 1);
        assert!(staged.starts_with("/data/.migration-staging/us/yahoo"));
    }

    #[test]
    fn partition_segments_parse() {
        assert_eq!(partition_value("year=2025", "year"), Some(2025));
        assert_eq!(partition_value("month=07", "month"), Some(7));
        assert_eq!(partition_value("month=07", "year"), None);
        assert_eq!(partition_value("bogus", "year"), None);
    }
}
