//! Timezone-aware trading-hours gate.
//!
//! Evaluates whether the market's local active window contains a UTC
//! instant, and where the next window opens. DST transitions are resolved
//! through the tz database, so days around a transition are handled with
//! their real length. Weekends and holidays are deliberately not gated; the
//! daemon runs and naturally fetches nothing.

use anyhow::{bail, Context, Result};
use chrono::{Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;

#[derive(Debug, Clone)]
pub struct TradingHoursGate {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
}

pub const REGULAR_HOURS: &str = "09:30-16:00";
pub const EXTENDED_HOURS: &str = "04:00-20:00";

impl TradingHoursGate {
    pub fn new(tz: Tz, open: NaiveTime, close: NaiveTime) -> Result<Self> {
        if open >= close {
            bail!("trading window must open before it closes ({open}-{close})");
        }
        Ok(Self { tz, open, close })
    }

    /// Build from `HH:MM-HH:MM` and a tz database name.
    pub fn parse(window: &str, tz_name: &str) -> Result<Self> {
        let tz: Tz = tz_name
            .parse()
            .map_err(|e| anyhow::anyhow!("unknown timezone {tz_name}: {e}"))?;
        let (open_s, close_s) = window
            .split_once('-')
            .with_context(|| format!("expected HH:MM-HH:MM, got: {window}"))?;
        let open = NaiveTime::parse_from_str(open_s, "%H:%M")
            .with_context(|| format!("bad open time: {open_s}"))?;
        let close = NaiveTime::parse_from_str(close_s, "%H:%M")
            .with_context(|| format!("bad close time: {close_s}"))?;
        Self::new(tz, open, close)
    }

    pub fn is_active(&self, now_utc: NaiveDateTime) -> bool {
        let local = self.tz.from_utc_datetime(&now_utc);
        let t = local.time();
        t >= self.open && t < self.close
    }

    /// UTC instant at which the next active window opens (today's open if it
    /// is still ahead, otherwise tomorrow's).
    pub fn next_active_boundary(&self, now_utc: NaiveDateTime) -> NaiveDateTime {
        let local = self.tz.from_utc_datetime(&now_utc);
        let date = if local.time() < self.open {
            local.date_naive()
        } else {
            local.date_naive() + Duration::days(1)
        };
        self.resolve_local(date, self.open)
    }

    /// Map a local wall-clock time to UTC. Ambiguous times (fall-back) take
    /// the earlier instant; nonexistent times (spring-forward) roll forward
    /// an hour at a time until the wall clock exists.
    fn resolve_local(&self, date: NaiveDate, time: NaiveTime) -> NaiveDateTime {
        let mut candidate = date.and_time(time);
        for _ in 0..4 {
            match self.tz.from_local_datetime(&candidate) {
                LocalResult::Single(dt) => return dt.naive_utc(),
                LocalResult::Ambiguous(earliest, _) => return earliest.naive_utc(),
                LocalResult::None => candidate += Duration::hours(1),
            }
        }
        candidate
    }
}
