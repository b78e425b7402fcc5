//! The migration plan document (`migration_plan.json`).
//!
//! The plan is the only authority for in-flight migration state. Every
//! checkpoint rewrites it via temp file + rename, so a crash at any point
//! leaves either the previous or the next consistent snapshot.

use anyhow::Result;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::config::ConfigStore;
use crate::types::{Interval, Venue};

pub const PLAN_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalPlan {
    pub name: Interval,
    pub status: PlanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbols_total: Option<usize>,
    /// Symbols already copied and verified; membership drives `--resume`.
    #[serde(default)]
    pub symbols_migrated: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<NaiveDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum_verified: Option<bool>,
}

impl IntervalPlan {
    fn new(name: Interval) -> Self {
        Self {
            name,
            status: PlanStatus::Pending,
            symbols_total: None,
            symbols_migrated: Vec::new(),
            verified_at: None,
            checksum_verified: None,
        }
    }

    pub fn is_migrated(&self, symbol: &str) -> bool {
        self.symbols_migrated.iter().any(|s| s == symbol)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePlan {
    pub market: String,
    pub source: String,
    pub intervals: Vec<IntervalPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub version: String,
    pub created_at: NaiveDateTime,
    pub venues: Vec<VenuePlan>,
}

impl MigrationPlan {
    pub fn new(created_at: NaiveDateTime) -> Self {
        Self {
            version: PLAN_VERSION.to_string(),
            created_at,
            venues: Vec::new(),
        }
    }

    pub fn venue(&self, venue: &Venue) -> Option<&VenuePlan> {
        self.venues
            .iter()
            .find(|v| v.market == venue.market && v.source == venue.source)
    }

    pub fn venue_mut(&mut self, venue: &Venue) -> Option<&mut VenuePlan> {
        self.venues
            .iter_mut()
            .find(|v| v.market == venue.market && v.source == venue.source)
    }

    pub fn interval(&self, venue: &Venue, interval: Interval) -> Option<&IntervalPlan> {
        self.venue(venue)
            .and_then(|v| v.intervals.iter().find(|iv| iv.name == interval))
    }

    pub fn interval_mut(&mut self, venue: &Venue, interval: Interval) -> Option<&mut IntervalPlan> {
        self.venue_mut(venue)
            .and_then(|v| v.intervals.iter_mut().find(|iv| iv.name == interval))
    }

    /// Add venue/interval entries that do not exist yet. Returns the
    /// intervals that were already present (a conflict for `init`).
    pub fn ensure(&mut self, venue: &Venue, intervals: &[Interval]) -> Vec<Interval> {
        if self.venue(venue).is_none() {
            self.venues.push(VenuePlan {
                market: venue.market.clone(),
                source: venue.source.clone(),
                intervals: Vec::new(),
            });
        }
        let plan = self
            .venue_mut(venue)
            .unwrap_or_else(|| unreachable!("venue inserted above"));
        let mut existing = Vec::new();
        for iv in intervals {
            if plan.intervals.iter().any(|p| p.name == *iv) {
                existing.push(*iv);
            } else {
                plan.intervals.push(IntervalPlan::new(*iv));
            }
        }
        existing
    }
}

pub fn load_plan(store: &ConfigStore) -> Result<Option<MigrationPlan>> {
    store.read_json(&store.migration_plan_path())
}

pub fn save_plan(store: &ConfigStore, plan: &MigrationPlan) -> Result<()> {
    store.write_json_atomic(&store.migration_plan_path(), plan)
}
