use chrono::{NaiveDate, NaiveDateTime, Utc};

/// Time source for everything that stamps dates into the registry or plan.
/// Wired at construction so tests can pin the clock.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now_utc().date()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

/// A clock pinned to a single instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now_utc(&self) -> NaiveDateTime {
        self.0
    }
}
