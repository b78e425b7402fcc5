#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::DataFrame;
use tokio_util::sync::CancellationToken;

use tickstore::data::frame::{bars_from_components, empty_bar_frame, to_epoch_ms};
use tickstore::fetch::{BarFetcher, FetchError, FileRef, TradeFetcher};
use tickstore::types::Interval;

pub fn dt(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

/// Build a bar frame from `(timestamp, open, close)` rows; high/low mirror
/// open, volume is constant.
pub fn make_bars(rows: &[(NaiveDateTime, f64, f64)]) -> DataFrame {
    let ts: Vec<i64> = rows.iter().map(|(t, _, _)| to_epoch_ms(*t)).collect();
    let open: Vec<f64> = rows.iter().map(|(_, o, _)| *o).collect();
    let close: Vec<f64> = rows.iter().map(|(_, _, c)| *c).collect();
    let n = rows.len();
    bars_from_components(
        ts,
        open.clone(),
        open.clone(),
        open,
        close,
        vec![100.0; n],
        vec![],
        vec![],
    )
    .unwrap()
}

/// Consecutive daily bars starting at `start`; close equals the day index.
pub fn daily_bars(start: NaiveDate, days: u32) -> DataFrame {
    let rows: Vec<(NaiveDateTime, f64, f64)> = (0..days)
        .map(|i| {
            let date = start + chrono::Duration::days(i64::from(i));
            (date.and_hms_opt(0, 0, 0).unwrap(), 1.0, f64::from(i))
        })
        .collect();
    make_bars(&rows)
}

pub fn closes(df: &DataFrame) -> Vec<f64> {
    df.column("close")
        .unwrap()
        .f64()
        .unwrap()
        .into_no_null_iter()
        .collect()
}

/// One scripted response for the fake bar fetcher.
pub enum Script {
    Frame(DataFrame),
    Empty,
    Transient,
    NotFound,
    Fatal,
    /// Serve the frame and cancel the token, for shutdown tests.
    FrameThenCancel(DataFrame, CancellationToken),
}

/// In-memory `BarFetcher` driven by per-(symbol, interval) scripts. Running
/// out of script serves empty frames.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<(String, Interval), VecDeque<Script>>>,
    windows: Mutex<Vec<(String, NaiveDateTime, NaiveDateTime)>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, symbol: &str, interval: Interval, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry((symbol.to_string(), interval))
            .or_default()
            .push_back(script);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// The (symbol, start, end) window of every fetch, in call order.
    pub fn windows(&self) -> Vec<(String, NaiveDateTime, NaiveDateTime)> {
        self.windows.lock().unwrap().clone()
    }
}

#[async_trait]
impl BarFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<DataFrame, FetchError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.windows
            .lock()
            .unwrap()
            .push((symbol.to_string(), start, end));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&(symbol.to_string(), interval))
            .and_then(VecDeque::pop_front);
        match script {
            Some(Script::Frame(df)) => Ok(df),
            Some(Script::Empty) | None => Ok(empty_bar_frame()),
            Some(Script::Transient) => Err(FetchError::Transient("scripted".into())),
            Some(Script::NotFound) => Err(FetchError::NotFound),
            Some(Script::Fatal) => Err(FetchError::Fatal("scripted".into())),
            Some(Script::FrameThenCancel(df, token)) => {
                token.cancel();
                Ok(df)
            }
        }
    }
}

/// In-memory `TradeFetcher` with one frame per (venue, date, file name).
#[derive(Default)]
pub struct ScriptedTradeFetcher {
    files: Mutex<HashMap<(String, NaiveDate), Vec<(String, DataFrame)>>>,
}

impl ScriptedTradeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, venue: &str, date: NaiveDate, name: &str, frame: DataFrame) {
        self.files
            .lock()
            .unwrap()
            .entry((venue.to_string(), date))
            .or_default()
            .push((name.to_string(), frame));
    }
}

#[async_trait]
impl TradeFetcher for ScriptedTradeFetcher {
    async fn list_files(&self, venue: &str, date: NaiveDate) -> Result<Vec<FileRef>, FetchError> {
        let files = self.files.lock().unwrap();
        Ok(files
            .get(&(venue.to_string(), date))
            .map(|entries| {
                entries
                    .iter()
                    .map(|(name, _)| FileRef {
                        venue: venue.to_string(),
                        date,
                        name: name.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_file(&self, file: &FileRef) -> Result<DataFrame, FetchError> {
        let files = self.files.lock().unwrap();
        files
            .get(&(file.venue.clone(), file.date))
            .and_then(|entries| {
                entries
                    .iter()
                    .find(|(name, _)| *name == file.name)
                    .map(|(_, df)| df.clone())
            })
            .ok_or(FetchError::NotFound)
    }
}
