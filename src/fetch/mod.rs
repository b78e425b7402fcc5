//! Remote fetch capabilities.
//!
//! The core consumes these traits; the concrete HTTP client in
//! [`provider`] is one implementation, and tests substitute scripted fakes.
//! Fetchers return frames already normalized to the canonical schemas
//! (lowercase columns, UTC-naïve millisecond timestamps, deterministic
//! column order).

pub mod provider;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::DataFrame;
use thiserror::Error;

use crate::types::Interval;

#[derive(Debug, Error)]
pub enum FetchError {
    /// Network failure or a 5xx after retries; the scheduler retries the
    /// symbol on the next sweep.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// Provider said 429 and backoff did not clear it.
    #[error("provider rate limit exceeded")]
    RateLimited,
    /// The provider knows nothing for the queried window.
    #[error("no data for the requested window")]
    NotFound,
    /// The requested window reaches past the provider's history for this
    /// granularity; retrying is pointless.
    #[error("window exceeds provider history for {interval}")]
    WindowExceeded { interval: Interval },
    /// Schema or parse failure in the provider response.
    #[error("provider response invalid: {0}")]
    Fatal(String),
}

impl FetchError {
    /// Errors the scheduler records as a transient outcome rather than a
    /// definitive not-found.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::RateLimited)
    }
}

/// Fails with `WindowExceeded` when the window starts before the provider's
/// history horizon for the interval.
pub fn check_window(interval: Interval, start: NaiveDateTime, now: NaiveDateTime) -> Result<(), FetchError> {
    let horizon = now - chrono::Duration::days(interval.max_history_days());
    if start < horizon {
        return Err(FetchError::WindowExceeded { interval });
    }
    Ok(())
}

#[async_trait]
pub trait BarFetcher: Send + Sync {
    /// Fetch OHLCV bars for `[start, end]`, normalized per the canonical
    /// bar schema. An empty frame means the window genuinely held no data.
    async fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<DataFrame, FetchError>;
}

/// A remote trade file for one venue and day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub venue: String,
    pub date: NaiveDate,
    pub name: String,
}

#[async_trait]
pub trait TradeFetcher: Send + Sync {
    async fn list_files(&self, venue: &str, date: NaiveDate) -> Result<Vec<FileRef>, FetchError>;

    /// Fetch one file, normalized per the canonical trade schema.
    async fn fetch_file(&self, file: &FileRef) -> Result<DataFrame, FetchError>;
}
