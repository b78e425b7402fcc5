use std::fmt;
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Bar granularity. The set is fixed; provider window constraints hang off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "1d")]
    D1,
}

impl Interval {
    pub const ALL: [Interval; 3] = [Interval::M1, Interval::H1, Interval::D1];

    pub fn as_str(self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::H1 => "1h",
            Interval::D1 => "1d",
        }
    }

    /// How far back the quote provider serves this granularity.
    ///
    /// Minute bars are only available for roughly the trailing week and hourly
    /// bars for roughly two years; daily history is effectively unbounded, so
    /// it gets a generous fixed horizon instead.
    pub fn max_history_days(self) -> i64 {
        match self {
            Interval::M1 => 7,
            Interval::H1 => 729,
            Interval::D1 => 7300,
        }
    }

    /// Duration of one bar; also the epsilon added to the last stored
    /// timestamp when computing an incremental fetch window.
    pub fn step(self) -> Duration {
        match self {
            Interval::M1 => Duration::minutes(1),
            Interval::H1 => Duration::hours(1),
            Interval::D1 => Duration::days(1),
        }
    }

    /// The coarsest configured granularity, used for cheap existence probes.
    pub fn coarsest() -> Interval {
        Interval::D1
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Interval::M1),
            "1h" => Ok(Interval::H1),
            "1d" => Ok(Interval::D1),
            other => Err(format!("unknown interval: {other}")),
        }
    }
}

/// A (market, source) pair naming one branch of the partitioned layout,
/// e.g. `us:yahoo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Venue {
    pub market: String,
    pub source: String,
}

impl Venue {
    pub fn new(market: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            market: market.into(),
            source: source.into(),
        }
    }

    /// Key form used by `storage_config.json` flags.
    pub fn key(&self) -> String {
        format!("{}:{}", self.market, self.source)
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.market, self.source)
    }
}

impl FromStr for Venue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((market, source)) if !market.is_empty() && !source.is_empty() => {
                Ok(Venue::new(market, source))
            }
            _ => Err(format!("expected MARKET:SOURCE, got: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Legacy,
    Partitioned,
}

/// Where one (symbol, interval) series lives. Absent binding means legacy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageBinding {
    pub backend: StorageBackend,
    pub market: String,
    pub source: String,
}

impl StorageBinding {
    pub fn partitioned(venue: &Venue) -> Self {
        Self {
            backend: StorageBackend::Partitioned,
            market: venue.market.clone(),
            source: venue.source.clone(),
        }
    }

    pub fn venue(&self) -> Venue {
        Venue::new(self.market.clone(), self.source.clone())
    }
}
