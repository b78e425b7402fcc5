//! Persisted JSON documents under the working directory.
//!
//! Every save goes through a sibling temp file followed by a rename, so a
//! crash mid-write never leaves a half-written document behind. Reads
//! tolerate missing files by returning documented defaults.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{Interval, StorageBackend, StorageBinding, Venue};

pub const INTERVALS_FILE: &str = "intervals.json";
pub const REGISTRY_FILE: &str = "tickers.json";
pub const STORAGE_CONFIG_FILE: &str = "storage_config.json";
pub const MIGRATION_PLAN_FILE: &str = "migration_plan.json";

/// Owns the working directory and the JSON documents that live at its root.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn intervals_path(&self) -> PathBuf {
        self.root.join(INTERVALS_FILE)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    pub fn storage_config_path(&self) -> PathBuf {
        self.root.join(STORAGE_CONFIG_FILE)
    }

    pub fn migration_plan_path(&self) -> PathBuf {
        self.root.join(MIGRATION_PLAN_FILE)
    }

    /// Read a JSON document, `None` if the file does not exist.
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value = serde_json::from_str(&raw)
            .with_context(|| format!("Malformed JSON in {}", path.display()))?;
        Ok(Some(value))
    }

    /// Write a JSON document via temp file + rename within the same directory.
    pub fn write_json_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create dir: {}", parent.display()))?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;
        let raw = serde_json::to_string_pretty(value)?;
        file.write_all(raw.as_bytes())
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to flush {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path).with_context(|| {
            format!("Failed to rename {} → {}", tmp_path.display(), path.display())
        })?;
        Ok(())
    }

    /// Configured intervals, in sweep order. Default: `["1m", "1h", "1d"]`.
    pub fn load_intervals(&self) -> Result<Vec<Interval>> {
        Ok(self
            .read_json(&self.intervals_path())?
            .unwrap_or_else(|| Interval::ALL.to_vec()))
    }

    pub fn save_intervals(&self, intervals: &[Interval]) -> Result<()> {
        self.write_json_atomic(&self.intervals_path(), &intervals)
    }

    pub fn load_storage_config(&self) -> Result<StorageConfig> {
        Ok(self
            .read_json(&self.storage_config_path())?
            .unwrap_or_default())
    }

    pub fn save_storage_config(&self, config: &StorageConfig) -> Result<()> {
        self.write_json_atomic(&self.storage_config_path(), config)
    }
}

/// Global and per-venue backend flags consulted when an interval carries no
/// explicit storage binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend used when neither a binding nor a venue flag applies.
    pub global_backend: StorageBackend,
    /// Venue assumed for symbols routed to the partitioned layout by flags.
    pub default_market: String,
    pub default_source: String,
    /// Per-venue overrides keyed `market:source`.
    #[serde(default)]
    pub venues: BTreeMap<String, StorageBackend>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            global_backend: StorageBackend::Legacy,
            default_market: "us".to_string(),
            default_source: "yahoo".to_string(),
            venues: BTreeMap::new(),
        }
    }
}

impl StorageConfig {
    pub fn default_venue(&self) -> Venue {
        Venue::new(self.default_market.clone(), self.default_source.clone())
    }

    pub fn backend_for(&self, venue: &Venue) -> StorageBackend {
        self.venues
            .get(&venue.key())
            .copied()
            .unwrap_or(self.global_backend)
    }

    pub fn set_backend(&mut self, venue: &Venue, backend: StorageBackend) {
        self.venues.insert(venue.key(), backend);
    }

    /// The binding implied by the flags for the default venue, if any flag
    /// selects the partitioned layout.
    pub fn implied_binding(&self) -> Option<StorageBinding> {
        let venue = self.default_venue();
        match self.backend_for(&venue) {
            StorageBackend::Partitioned => Some(StorageBinding::partitioned(&venue)),
            StorageBackend::Legacy => None,
        }
    }
}
