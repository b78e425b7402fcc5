//! Thin HTTP clients for the quote provider and the trade venue feed.
//!
//! Both keep a minimum interval between requests on top of the sweep's
//! global limiter and retry transient failures with exponential backoff.
//! HTTP statuses map onto the [`FetchError`](super::FetchError) taxonomy;
//! everything downstream only sees normalized frames.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::{check_window, BarFetcher, FetchError, FileRef, TradeFetcher};
use crate::data::frame::{self, empty_bar_frame};
use crate::types::Interval;

const TIMEOUT_SECS: u64 = 60;
const MAX_RETRIES: u32 = 4;
const MIN_REQUEST_INTERVAL_MS: u64 = 100;

pub const PROVIDER_URL_VAR: &str = "TICKSTORE_PROVIDER_URL";
pub const PROVIDER_KEY_VAR: &str = "TICKSTORE_PROVIDER_KEY";

#[derive(Debug, Deserialize)]
struct ProviderBar {
    /// Epoch seconds, UTC.
    timestamp: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    #[serde(default)]
    dividends: f64,
    #[serde(default)]
    splits: f64,
}

#[derive(Debug, Deserialize)]
struct ProviderTrade {
    /// Epoch milliseconds, UTC.
    trade_time: i64,
    distribution_time: i64,
    venue: String,
    isin: String,
    price: f64,
    volume: f64,
    trans_id: i64,
    tick_id: i64,
}

struct Transport {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    last_request: Mutex<Instant>,
}

impl Transport {
    fn from_env() -> Option<Self> {
        let base_url = std::env::var(PROVIDER_URL_VAR).ok()?;
        if base_url.is_empty() {
            return None;
        }
        let api_key = std::env::var(PROVIDER_KEY_VAR).ok().filter(|k| !k.is_empty());
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(TIMEOUT_SECS))
            .build()
            .ok()?;
        Some(Self {
            client,
            base_url,
            api_key,
            last_request: Mutex::new(Instant::now()),
        })
    }

    /// Rate-limited GET with backoff on transient statuses. Terminal
    /// statuses map straight onto the error taxonomy.
    async fn throttled_get(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<reqwest::Response, FetchError> {
        let url = format!("{}/{path}", self.base_url.trim_end_matches('/'));
        let mut params = params.to_vec();
        if let Some(key) = &self.api_key {
            params.push(("api_token".into(), key.clone()));
        }

        for attempt in 0..=MAX_RETRIES {
            {
                let mut last = self.last_request.lock().await;
                let min_interval = std::time::Duration::from_millis(MIN_REQUEST_INTERVAL_MS);
                if let Some(remaining) = min_interval.checked_sub(last.elapsed()) {
                    sleep(remaining).await;
                }
                *last = Instant::now();
            }

            let resp = match self.client.get(&url).query(&params).send().await {
                Ok(r) => r,
                Err(e) => {
                    if attempt == MAX_RETRIES {
                        return Err(FetchError::Transient(e.to_string()));
                    }
                    let wait = 2u64.pow(attempt);
                    tracing::warn!(
                        "provider request error, retrying in {wait}s (attempt {}/{}): {e}",
                        attempt + 1,
                        MAX_RETRIES
                    );
                    sleep(std::time::Duration::from_secs(wait)).await;
                    continue;
                }
            };

            let status = resp.status().as_u16();
            match status {
                404 => return Err(FetchError::NotFound),
                429 => {
                    if attempt == MAX_RETRIES {
                        return Err(FetchError::RateLimited);
                    }
                    let wait = 2u64.pow(attempt + 1);
                    tracing::warn!(
                        "provider 429, backing off {wait}s (attempt {}/{})",
                        attempt + 1,
                        MAX_RETRIES
                    );
                    sleep(std::time::Duration::from_secs(wait)).await;
                }
                s if s >= 500 => {
                    if attempt == MAX_RETRIES {
                        return Err(FetchError::Transient(format!("server error {s}")));
                    }
                    let wait = 2u64.pow(attempt + 1);
                    tracing::warn!(
                        "provider {s} server error, backing off {wait}s (attempt {}/{})",
                        attempt + 1,
                        MAX_RETRIES
                    );
                    sleep(std::time::Duration::from_secs(wait)).await;
                }
                s if s >= 400 => {
                    return Err(FetchError::Fatal(format!("unexpected status {s}")));
                }
                _ => return Ok(resp),
            }
        }
        Err(FetchError::Transient("max retries exceeded".into()))
    }
}

/// OHLCV client for the quote provider's bar endpoint.
pub struct HttpBarFetcher {
    transport: Transport,
}

impl HttpBarFetcher {
    /// Create from environment. `None` when `TICKSTORE_PROVIDER_URL` is
    /// unset, in which case fetch-driven commands refuse to run.
    pub fn from_env() -> Option<Self> {
        Transport::from_env().map(|transport| Self { transport })
    }
}

#[async_trait]
impl BarFetcher for HttpBarFetcher {
    async fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<DataFrame, FetchError> {
        check_window(interval, start, chrono::Utc::now().naive_utc())?;

        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), interval.to_string()),
            ("from".to_string(), start.and_utc().timestamp().to_string()),
            ("to".to_string(), end.and_utc().timestamp().to_string()),
        ];
        let resp = self.transport.throttled_get("bars", &params).await?;
        let rows: Vec<ProviderBar> = resp
            .json()
            .await
            .map_err(|e| FetchError::Fatal(format!("JSON parse error: {e}")))?;

        if rows.is_empty() {
            return Ok(empty_bar_frame());
        }
        let df = frame::bars_from_components(
            rows.iter().map(|r| r.timestamp * 1000).collect(),
            rows.iter().map(|r| r.open).collect(),
            rows.iter().map(|r| r.high).collect(),
            rows.iter().map(|r| r.low).collect(),
            rows.iter().map(|r| r.close).collect(),
            rows.iter().map(|r| r.volume).collect(),
            rows.iter().map(|r| r.dividends).collect(),
            rows.iter().map(|r| r.splits).collect(),
        )
        .map_err(|e| FetchError::Fatal(e.to_string()))?;
        Ok(df)
    }
}

/// Client for the venue's per-day raw trade files.
pub struct HttpTradeFetcher {
    transport: Transport,
}

impl HttpTradeFetcher {
    pub fn from_env() -> Option<Self> {
        Transport::from_env().map(|transport| Self { transport })
    }
}

#[async_trait]
impl TradeFetcher for HttpTradeFetcher {
    async fn list_files(&self, venue: &str, date: NaiveDate) -> Result<Vec<FileRef>, FetchError> {
        let params = vec![
            ("venue".to_string(), venue.to_string()),
            ("date".to_string(), date.format("%Y-%m-%d").to_string()),
        ];
        let resp = self.transport.throttled_get("trades", &params).await?;
        let names: Vec<String> = resp
            .json()
            .await
            .map_err(|e| FetchError::Fatal(format!("JSON parse error: {e}")))?;
        Ok(names
            .into_iter()
            .map(|name| FileRef {
                venue: venue.to_string(),
                date,
                name,
            })
            .collect())
    }

    async fn fetch_file(&self, file: &FileRef) -> Result<DataFrame, FetchError> {
        let params = vec![
            ("venue".to_string(), file.venue.clone()),
            ("date".to_string(), file.date.format("%Y-%m-%d").to_string()),
            ("file".to_string(), file.name.clone()),
        ];
        let resp = self.transport.throttled_get("trades/file", &params).await?;
        let rows: Vec<ProviderTrade> = resp
            .json()
            .await
            .map_err(|e| FetchError::Fatal(format!("JSON parse error: {e}")))?;
        if rows.is_empty() {
            return Ok(crate::data::frame::empty_trade_frame());
        }

        let df = df! {
            crate::data::frame::TRADE_TIME_COL => rows.iter().map(|r| r.trade_time).collect::<Vec<_>>(),
            "distribution_time" => rows.iter().map(|r| r.distribution_time).collect::<Vec<_>>(),
            "venue" => rows.iter().map(|r| r.venue.as_str()).collect::<Vec<_>>(),
            "isin" => rows.iter().map(|r| r.isin.as_str()).collect::<Vec<_>>(),
            "price" => rows.iter().map(|r| r.price).collect::<Vec<_>>(),
            "volume" => rows.iter().map(|r| r.volume).collect::<Vec<_>>(),
            "trans_id" => rows.iter().map(|r| r.trans_id).collect::<Vec<_>>(),
            "tick_id" => rows.iter().map(|r| r.tick_id).collect::<Vec<_>>(),
        }
        .map_err(|e| FetchError::Fatal(e.to_string()))?;
        frame::normalize_trades(df).map_err(|e| FetchError::Fatal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_bar_defaults_optional_fields() {
        let row: ProviderBar = serde_json::from_str(
            r#"{"timestamp": 1735776000, "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 100.0}"#,
        )
        .unwrap();
        assert_eq!(row.dividends, 0.0);
        assert_eq!(row.splits, 0.0);
    }

    #[test]
    fn fetchers_require_provider_url() {
        // Guard against ambient env leaking into the test run.
        std::env::remove_var(PROVIDER_URL_VAR);
        assert!(HttpBarFetcher::from_env().is_none());
        assert!(HttpTradeFetcher::from_env().is_none());
    }
}
