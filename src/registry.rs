//! Per-symbol, per-interval lifecycle registry persisted as `tickers.json`.
//!
//! The registry is owned by the sweep for the duration of a run and saved
//! once at the end (and on graceful shutdown), not after every symbol;
//! atomic rewrites of a large registry are not free.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::ConfigStore;
use crate::fetch::{BarFetcher, FetchError};
use crate::limiter::RateLimiter;
use crate::types::{Interval, StorageBinding, Venue};

pub const DEFAULT_COOLDOWN_DAYS: i64 = 30;
pub const DEFAULT_REACTIVATION_DAYS: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolStatus {
    Active,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalState {
    pub status: SymbolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_found_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_data_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_not_found_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageBinding>,
}

impl IntervalState {
    fn new_active() -> Self {
        Self {
            status: SymbolStatus::Active,
            last_found_date: None,
            last_data_date: None,
            last_checked: None,
            last_not_found_date: None,
            storage: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub ticker: String,
    pub status: SymbolStatus,
    pub added_date: NaiveDate,
    pub last_checked: NaiveDate,
    #[serde(default)]
    pub intervals: BTreeMap<Interval, IntervalState>,
}

/// Result of one fetch attempt, as the scheduler reports it back.
#[derive(Debug, Clone, Copy)]
pub enum FetchOutcome {
    Found { last_data_date: NaiveDate },
    NotFound,
    TransientError,
}

/// Cooldown and reactivation horizons; configuration, not constants.
#[derive(Debug, Clone, Copy)]
pub struct RegistryHorizons {
    pub cooldown_days: i64,
    pub reactivation_days: i64,
}

impl Default for RegistryHorizons {
    fn default() -> Self {
        Self {
            cooldown_days: DEFAULT_COOLDOWN_DAYS,
            reactivation_days: DEFAULT_REACTIVATION_DAYS,
        }
    }
}

pub struct SymbolRegistry {
    store: ConfigStore,
    clock: Arc<dyn Clock>,
    horizons: RegistryHorizons,
    configured_intervals: Vec<Interval>,
    symbols: BTreeMap<String, SymbolRecord>,
}

impl SymbolRegistry {
    /// Load the registry snapshot from `tickers.json`; an absent file is an
    /// empty registry.
    pub fn load(
        store: ConfigStore,
        clock: Arc<dyn Clock>,
        horizons: RegistryHorizons,
    ) -> Result<Self> {
        let configured_intervals = store.load_intervals()?;
        let symbols = store
            .read_json(&store.registry_path())?
            .unwrap_or_default();
        Ok(Self {
            store,
            clock,
            horizons,
            configured_intervals,
            symbols,
        })
    }

    /// Re-read the on-disk snapshot, discarding in-memory state.
    pub fn reload(&mut self) -> Result<()> {
        self.configured_intervals = self.store.load_intervals()?;
        self.symbols = self
            .store
            .read_json(&self.store.registry_path())?
            .unwrap_or_default();
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.store
            .write_json_atomic(&self.store.registry_path(), &self.symbols)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn configured_intervals(&self) -> &[Interval] {
        &self.configured_intervals
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolRecord> {
        self.symbols.get(symbol)
    }

    pub fn interval_state(&self, symbol: &str, interval: Interval) -> Option<&IntervalState> {
        self.symbols
            .get(symbol)
            .and_then(|rec| rec.intervals.get(&interval))
    }

    /// Stable iteration order for the sweep: alphabetical by symbol.
    pub fn snapshot(&self) -> Vec<String> {
        self.symbols.keys().cloned().collect()
    }

    pub fn not_found_symbols(&self) -> Vec<String> {
        self.symbols
            .values()
            .filter(|rec| rec.status == SymbolStatus::NotFound)
            .map(|rec| rec.ticker.clone())
            .collect()
    }

    /// Union-merge the current provider list. New symbols start `active`;
    /// previously `not_found` symbols with an interval found inside the
    /// reactivation horizon come back globally.
    pub fn refresh_current_list(&mut self, current: &[String]) {
        let today = self.clock.today();
        let mut added = 0usize;
        let mut reactivated = 0usize;
        for symbol in current {
            match self.symbols.get_mut(symbol) {
                None => {
                    self.symbols.insert(
                        symbol.clone(),
                        SymbolRecord {
                            ticker: symbol.clone(),
                            status: SymbolStatus::Active,
                            added_date: today,
                            last_checked: today,
                            intervals: BTreeMap::new(),
                        },
                    );
                    added += 1;
                }
                Some(rec) => {
                    rec.last_checked = today;
                    if rec.status == SymbolStatus::NotFound
                        && Self::any_date_within(
                            rec.intervals.values().filter_map(|st| st.last_found_date),
                            today,
                            self.horizons.reactivation_days,
                        )
                    {
                        rec.status = SymbolStatus::Active;
                        reactivated += 1;
                    }
                }
            }
        }
        info!(added, reactivated, total = self.symbols.len(), "Refreshed symbol list");
    }

    /// Active for a sweep iff globally active and the interval is not inside
    /// its not-found cooldown.
    pub fn is_active_for_interval(&self, symbol: &str, interval: Interval) -> bool {
        let Some(rec) = self.symbols.get(symbol) else {
            return false;
        };
        if rec.status != SymbolStatus::Active {
            return false;
        }
        match rec.intervals.get(&interval) {
            None => true,
            Some(state) => {
                if state.status != SymbolStatus::NotFound {
                    return true;
                }
                match state.last_not_found_date {
                    Some(d) => !Self::within(d, self.clock.today(), self.horizons.cooldown_days),
                    None => true,
                }
            }
        }
    }

    /// Apply a fetch outcome to the (symbol, interval) state.
    pub fn update_interval_status(
        &mut self,
        symbol: &str,
        interval: Interval,
        outcome: FetchOutcome,
    ) {
        let today = self.clock.today();
        let Some(rec) = self.symbols.get_mut(symbol) else {
            warn!(symbol, "update for unknown symbol ignored");
            return;
        };
        rec.last_checked = today;
        let state = rec
            .intervals
            .entry(interval)
            .or_insert_with(IntervalState::new_active);
        match outcome {
            FetchOutcome::Found { last_data_date } => {
                state.status = SymbolStatus::Active;
                state.last_found_date = Some(today);
                state.last_data_date = Some(last_data_date);
                state.last_checked = Some(today);
                // Data proves the symbol exists.
                rec.status = SymbolStatus::Active;
            }
            FetchOutcome::NotFound => {
                state.status = SymbolStatus::NotFound;
                state.last_not_found_date = Some(today);
                state.last_checked = Some(today);
                let all_not_found = self.configured_intervals.iter().all(|iv| {
                    rec.intervals
                        .get(iv)
                        .is_some_and(|st| st.status == SymbolStatus::NotFound)
                });
                if all_not_found {
                    rec.status = SymbolStatus::NotFound;
                }
            }
            FetchOutcome::TransientError => {
                state.last_checked = Some(today);
            }
        }
    }

    /// Record where a (symbol, interval) series now lives.
    pub fn set_storage_binding(
        &mut self,
        symbol: &str,
        interval: Interval,
        binding: StorageBinding,
    ) {
        let today = self.clock.today();
        let rec = self
            .symbols
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolRecord {
                ticker: symbol.to_string(),
                status: SymbolStatus::Active,
                added_date: today,
                last_checked: today,
                intervals: BTreeMap::new(),
            });
        let state = rec
            .intervals
            .entry(interval)
            .or_insert_with(IntervalState::new_active);
        state.storage = Some(binding);
    }

    /// Drop partitioned bindings pointing at the venue for one interval;
    /// affected series route back to legacy. Returns how many changed.
    pub fn clear_storage_bindings(&mut self, venue: &Venue, interval: Interval) -> usize {
        let mut cleared = 0;
        for rec in self.symbols.values_mut() {
            if let Some(state) = rec.intervals.get_mut(&interval) {
                if state
                    .storage
                    .as_ref()
                    .is_some_and(|b| b.market == venue.market && b.source == venue.source)
                {
                    state.storage = None;
                    cleared += 1;
                }
            }
        }
        cleared
    }

    /// Probe each globally `not_found` symbol with a single coarse-interval
    /// fetch; any data reactivates it.
    pub async fn confirm_not_founds(
        &mut self,
        fetcher: &dyn BarFetcher,
        limiter: &dyn RateLimiter,
    ) -> Result<usize> {
        let probe_interval = Interval::coarsest();
        let now = self.clock.now_utc();
        let start = now - chrono::Duration::days(7);
        let mut reactivated = 0usize;

        for symbol in self.not_found_symbols() {
            limiter.acquire().await;
            match fetcher.fetch(&symbol, probe_interval, start, now).await {
                Ok(frame) if frame.height() > 0 => {
                    let last = crate::data::frame::max_timestamp(
                        &frame,
                        crate::data::frame::TIMESTAMP_COL,
                    )?
                    .map_or_else(|| self.clock.today(), |ts| ts.date());
                    self.update_interval_status(
                        &symbol,
                        probe_interval,
                        FetchOutcome::Found { last_data_date: last },
                    );
                    info!(symbol, "not-found symbol produced data, reactivated");
                    reactivated += 1;
                }
                Ok(_) | Err(FetchError::NotFound) => {
                    if let Some(rec) = self.symbols.get_mut(&symbol) {
                        rec.last_checked = self.clock.today();
                    }
                }
                Err(err) => {
                    warn!(symbol, %err, "probe failed, leaving status untouched");
                }
            }
        }
        Ok(reactivated)
    }

    /// Reactivate `not_found` symbols whose stored data is recent enough,
    /// without touching the network.
    pub fn reparse_not_founds(&mut self) -> usize {
        let today = self.clock.today();
        let horizon = self.horizons.reactivation_days;
        let mut reactivated = 0usize;
        for rec in self.symbols.values_mut() {
            if rec.status != SymbolStatus::NotFound {
                continue;
            }
            if Self::any_date_within(
                rec.intervals.values().filter_map(|st| st.last_data_date),
                today,
                horizon,
            ) {
                rec.status = SymbolStatus::Active;
                reactivated += 1;
            }
        }
        info!(reactivated, "Reparsed not-found symbols");
        reactivated
    }

    fn within(date: NaiveDate, today: NaiveDate, days: i64) -> bool {
        (today - date).num_days() < days
    }

    fn any_date_within(
        dates: impl Iterator<Item = NaiveDate>,
        today: NaiveDate,
        days: i64,
    ) -> bool {
        let mut dates = dates;
        dates.any(|d| Self::within(d, today, days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use tempfile::tempdir;

    fn at(y: i32, m: u32, d: u32) -> Arc<FixedClock> {
        Arc::new(FixedClock(
            NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
        ))
    }

    fn registry(clock: Arc<FixedClock>, dir: &std::path::Path) -> SymbolRegistry {
        SymbolRegistry::load(
            ConfigStore::new(dir),
            clock,
            RegistryHorizons::default(),
        )
        .unwrap()
    }

    #[test]
    fn cooldown_skips_recent_not_found() {
        let dir = tempdir().unwrap();
        let mut reg = registry(at(2025, 12, 1), dir.path());
        reg.refresh_current_list(&["X".to_string()]);

        // Simulate the not-found recorded on 2025-11-20.
        let mut back = registry(at(2025, 11, 20), dir.path());
        reg.save().unwrap();
        back.reload().unwrap();
        back.update_interval_status("X", Interval::H1, FetchOutcome::NotFound);
        back.save().unwrap();

        let mut now = registry(at(2025, 12, 1), dir.path());
        now.reload().unwrap();
        assert!(!now.is_active_for_interval("X", Interval::H1));

        let mut later = registry(at(2026, 1, 1), dir.path());
        later.reload().unwrap();
        assert!(later.is_active_for_interval("X", Interval::H1));
    }

    #[test]
    fn global_not_found_requires_all_intervals() {
        let dir = tempdir().unwrap();
        let mut reg = registry(at(2025, 6, 1), dir.path());
        reg.refresh_current_list(&["AAPL".to_string()]);

        reg.update_interval_status("AAPL", Interval::M1, FetchOutcome::NotFound);
        reg.update_interval_status("AAPL", Interval::H1, FetchOutcome::NotFound);
        assert_eq!(reg.get("AAPL").unwrap().status, SymbolStatus::Active);

        reg.update_interval_status("AAPL", Interval::D1, FetchOutcome::NotFound);
        assert_eq!(reg.get("AAPL").unwrap().status, SymbolStatus::NotFound);
        assert!(!reg.is_active_for_interval("AAPL", Interval::D1));
    }

    #[test]
    fn found_reactivates_and_records_dates() {
        let dir = tempdir().unwrap();
        let mut reg = registry(at(2025, 6, 10), dir.path());
        reg.refresh_current_list(&["SAP".to_string()]);
        for iv in Interval::ALL {
            reg.update_interval_status("SAP", iv, FetchOutcome::NotFound);
        }
        assert_eq!(reg.get("SAP").unwrap().status, SymbolStatus::NotFound);

        let data_date = NaiveDate::from_ymd_opt(2025, 6, 9).unwrap();
        reg.update_interval_status(
            "SAP",
            Interval::D1,
            FetchOutcome::Found { last_data_date: data_date },
        );
        let rec = reg.get("SAP").unwrap();
        assert_eq!(rec.status, SymbolStatus::Active);
        let st = rec.intervals.get(&Interval::D1).unwrap();
        assert_eq!(st.last_data_date, Some(data_date));
        assert_eq!(st.last_found_date, Some(reg.clock.today()));
    }

    #[test]
    fn transient_error_only_touches_last_checked() {
        let dir = tempdir().unwrap();
        let mut reg = registry(at(2025, 6, 10), dir.path());
        reg.refresh_current_list(&["SAP".to_string()]);
        reg.update_interval_status("SAP", Interval::D1, FetchOutcome::TransientError);
        let st = reg.interval_state("SAP", Interval::D1).unwrap();
        assert_eq!(st.status, SymbolStatus::Active);
        assert!(st.last_found_date.is_none());
        assert_eq!(st.last_checked, Some(reg.clock.today()));
    }

    #[test]
    fn reparse_reactivates_recent_data() {
        let dir = tempdir().unwrap();
        let mut reg = registry(at(2025, 6, 10), dir.path());
        reg.refresh_current_list(&["OLD".to_string(), "NEW".to_string()]);
        for symbol in ["OLD", "NEW"] {
            for iv in Interval::ALL {
                reg.update_interval_status(symbol, iv, FetchOutcome::NotFound);
            }
        }
        // Backdate data: NEW has data 10 days old, OLD two years old.
        if let Some(rec) = reg.symbols.get_mut("NEW") {
            rec.intervals.get_mut(&Interval::D1).unwrap().last_data_date =
                Some(NaiveDate::from_ymd_opt(2025, 5, 31).unwrap());
        }
        if let Some(rec) = reg.symbols.get_mut("OLD") {
            rec.intervals.get_mut(&Interval::D1).unwrap().last_data_date =
                Some(NaiveDate::from_ymd_opt(2023, 5, 31).unwrap());
        }

        assert_eq!(reg.reparse_not_founds(), 1);
        assert_eq!(reg.get("NEW").unwrap().status, SymbolStatus::Active);
        assert_eq!(reg.get("OLD").unwrap().status, SymbolStatus::NotFound);
    }

    #[test]
    fn registry_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let mut reg = registry(at(2025, 6, 10), dir.path());
        reg.refresh_current_list(&["AAPL".to_string()]);
        reg.set_storage_binding(
            "AAPL",
            Interval::D1,
            StorageBinding::partitioned(&Venue::new("us", "yahoo")),
        );
        reg.save().unwrap();

        let mut reloaded = registry(at(2025, 6, 10), dir.path());
        reloaded.reload().unwrap();
        let st = reloaded.interval_state("AAPL", Interval::D1).unwrap();
        assert_eq!(
            st.storage.as_ref().unwrap().venue(),
            Venue::new("us", "yahoo")
        );
    }
}
