//! The incremental fetch sweep.
//!
//! Intervals are processed in configured order; within an interval, symbols
//! in the registry's stable alphabetical order. Per-symbol failures never
//! abort the sweep. The registry is saved once, after the sweep completes
//! or is cancelled.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, NaiveDateTime};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::data::frame::{max_timestamp, TIMESTAMP_COL};
use crate::data::router::{RouteRequest, StorageRouter};
use crate::fetch::{BarFetcher, FetchError};
use crate::limiter::RateLimiter;
use crate::registry::{FetchOutcome, SymbolRegistry};
use crate::types::Interval;

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub fetched: usize,
    pub not_found: usize,
    pub transient: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
}

pub struct IntervalScheduler {
    registry: SymbolRegistry,
    router: StorageRouter,
    fetcher: Arc<dyn BarFetcher>,
    limiter: Arc<dyn RateLimiter>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl IntervalScheduler {
    pub fn new(
        registry: SymbolRegistry,
        router: StorageRouter,
        fetcher: Arc<dyn BarFetcher>,
        limiter: Arc<dyn RateLimiter>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            router,
            fetcher,
            limiter,
            clock,
            cancel,
        }
    }

    pub fn registry(&self) -> &SymbolRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SymbolRegistry {
        &mut self.registry
    }

    /// Run one full sweep over every configured interval and active symbol.
    /// `start`/`end` override the incremental window when given.
    pub async fn run(
        &mut self,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> Result<SweepStats> {
        self.registry.reload()?;
        let mut stats = SweepStats::default();

        'sweep: for interval in self.registry.configured_intervals().to_vec() {
            info!(%interval, symbols = self.registry.len(), "Starting interval sweep");
            for symbol in self.registry.snapshot() {
                if self.cancel.is_cancelled() {
                    stats.cancelled = true;
                    info!(%interval, symbol, "Sweep cancelled");
                    break 'sweep;
                }
                if !self.registry.is_active_for_interval(&symbol, interval) {
                    stats.skipped += 1;
                    continue;
                }
                self.limiter.acquire().await;
                if let Err(err) = self.update_symbol(&symbol, interval, start, end, &mut stats).await
                {
                    warn!(symbol, %interval, %err, "Symbol update failed");
                    stats.failed += 1;
                }
            }
        }

        self.registry.save()?;
        info!(
            fetched = stats.fetched,
            not_found = stats.not_found,
            transient = stats.transient,
            skipped = stats.skipped,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "Sweep finished"
        );
        Ok(stats)
    }

    async fn update_symbol(
        &mut self,
        symbol: &str,
        interval: Interval,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
        stats: &mut SweepStats,
    ) -> Result<()> {
        let binding = self
            .registry
            .interval_state(symbol, interval)
            .and_then(|st| st.storage.clone());
        let req = RouteRequest::new(symbol, interval, binding.as_ref());

        let existing = self.router.read(&req)?;
        let last = max_timestamp(&existing, TIMESTAMP_COL)?;
        let now = self.clock.now_utc();
        let Some((w_start, w_end)) = compute_window(last, interval, start, end, now) else {
            // Already current for this interval; nothing to ask for.
            stats.skipped += 1;
            return Ok(());
        };

        match self.fetcher.fetch(symbol, interval, w_start, w_end).await {
            Ok(frame) if frame.height() > 0 => {
                let last_data = max_timestamp(&frame, TIMESTAMP_COL)?
                    .map_or_else(|| self.clock.today(), |ts| ts.date());
                self.router.save(&req, &frame)?;
                self.registry.update_interval_status(
                    symbol,
                    interval,
                    FetchOutcome::Found { last_data_date: last_data },
                );
                stats.fetched += 1;
            }
            Ok(_) | Err(FetchError::NotFound) => {
                self.registry
                    .update_interval_status(symbol, interval, FetchOutcome::NotFound);
                stats.not_found += 1;
            }
            Err(err) if err.is_transient() => {
                warn!(symbol, %interval, %err, "Transient fetch failure");
                self.registry
                    .update_interval_status(symbol, interval, FetchOutcome::TransientError);
                stats.transient += 1;
            }
            Err(err) => {
                // WindowExceeded / Fatal: operator configuration bug, skip.
                error!(symbol, %interval, %err, "Non-retryable fetch error, skipping symbol");
                stats.failed += 1;
            }
        }
        Ok(())
    }
}

/// Incremental window: continue one step past the newest stored row, clamped
/// to the provider's history horizon; full horizon when nothing is stored.
/// `None` when the symbol is already current.
pub fn compute_window(
    last: Option<NaiveDateTime>,
    interval: Interval,
    start: Option<NaiveDateTime>,
    end: Option<NaiveDateTime>,
    now: NaiveDateTime,
) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let end = end.unwrap_or(now);
    let start = match start {
        // Explicit start is passed through; the fetcher rejects it with
        // WindowExceeded when it reaches past the provider's history.
        Some(s) => s,
        None => {
            let horizon = now - Duration::days(interval.max_history_days());
            match last {
                Some(ts) => (ts + interval.step()).max(horizon),
                None => horizon,
            }
        }
    };
    (start < end).then_some((start, end))
}
