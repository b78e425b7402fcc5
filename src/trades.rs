//! Raw trade-file ingestion.
//!
//! For each requested day, lists the venue's remote files and merges each
//! fetched frame into the `trades/venue=<V>/...` day partition. Days whose
//! partition already holds data are skipped unless a refetch is forced;
//! rerunning is always safe because the per-day merge dedups on
//! `(trans_id, tick_id)`.

use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::data::partitioned::PartitionedStore;
use crate::fetch::{FetchError, TradeFetcher};
use crate::limiter::RateLimiter;
use crate::types::Venue;

#[derive(Debug, Default, Clone, Copy)]
pub struct TradeIngestStats {
    pub days_processed: usize,
    pub days_skipped: usize,
    pub files_fetched: usize,
    pub rows_saved: usize,
    pub failures: usize,
}

pub struct TradeIngestor {
    store: PartitionedStore,
    fetcher: Arc<dyn TradeFetcher>,
    limiter: Arc<dyn RateLimiter>,
    storage_venue: Venue,
    cancel: CancellationToken,
}

impl TradeIngestor {
    pub fn new(
        store: PartitionedStore,
        fetcher: Arc<dyn TradeFetcher>,
        limiter: Arc<dyn RateLimiter>,
        storage_venue: Venue,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            fetcher,
            limiter,
            storage_venue,
            cancel,
        }
    }

    /// Ingest the venue's files for each day. Per-file failures are logged
    /// and the run continues.
    pub async fn run(
        &self,
        exchange_venue: &str,
        days: &[NaiveDate],
        refetch: bool,
    ) -> Result<TradeIngestStats> {
        let mut stats = TradeIngestStats::default();
        let market = &self.storage_venue.market;
        let source = &self.storage_venue.source;

        for day in days {
            if self.cancel.is_cancelled() {
                break;
            }
            if !refetch && self.store.trades_file_exists(market, source, exchange_venue, *day) {
                stats.days_skipped += 1;
                continue;
            }

            self.limiter.acquire().await;
            let files = match self.fetcher.list_files(exchange_venue, *day).await {
                Ok(files) => files,
                Err(FetchError::NotFound) => {
                    info!(venue = exchange_venue, %day, "No trade files listed");
                    stats.days_processed += 1;
                    continue;
                }
                Err(err) => {
                    warn!(venue = exchange_venue, %day, %err, "Listing trade files failed");
                    stats.failures += 1;
                    continue;
                }
            };

            for file in &files {
                if self.cancel.is_cancelled() {
                    break;
                }
                self.limiter.acquire().await;
                match self.fetcher.fetch_file(file).await {
                    Ok(frame) if frame.height() > 0 => {
                        let rows = frame.height();
                        self.store
                            .save_trades(&frame, market, source, exchange_venue)?;
                        stats.files_fetched += 1;
                        stats.rows_saved += rows;
                    }
                    Ok(_) => {
                        stats.files_fetched += 1;
                    }
                    Err(err) => {
                        warn!(file = %file.name, %day, %err, "Trade file fetch failed");
                        stats.failures += 1;
                    }
                }
            }
            stats.days_processed += 1;
        }

        info!(
            days = stats.days_processed,
            skipped = stats.days_skipped,
            files = stats.files_fetched,
            rows = stats.rows_saved,
            failures = stats.failures,
            "Trade ingestion finished"
        );
        Ok(stats)
    }
}
