//! Migration engine end-to-end: init preflight, copy with verification,
//! checkpointing, resume, activation and rollback.

mod common;

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use common::dt;
use tempfile::tempdir;

use tickstore::clock::FixedClock;
use tickstore::config::ConfigStore;
use tickstore::data::frame::write_parquet_atomic;
use tickstore::data::paths::PathBuilder;
use tickstore::data::PartitionedStore;
use tickstore::migrate::engine::canonical_checksum;
use tickstore::migrate::{
    load_plan, LayoutError, MigrateOptions, MigrationEngine, PlanStatus,
};
use tickstore::registry::{RegistryHorizons, SymbolRegistry};
use tickstore::types::{Interval, StorageBackend, StorageBinding, Venue};

fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock(dt(2025, 6, 15)))
}

fn venue() -> Venue {
    Venue::new("us", "yahoo")
}

/// Drop `days` daily bars for a symbol into the relocated legacy tree.
fn seed_legacy(root: &Path, symbol: &str, days: u32) {
    let paths = PathBuilder::new(root);
    let mut df = common::daily_bars(NaiveDate::from_ymd_opt(2024, 11, 15).unwrap(), days);
    write_parquet_atomic(&mut df, &paths.legacy_relocated_file(Interval::D1, symbol)).unwrap();
}

fn engine(root: &Path) -> MigrationEngine {
    MigrationEngine::new(ConfigStore::new(root), clock())
}

#[test]
fn init_requires_relocated_legacy_layout() {
    let dir = tempdir().unwrap();
    let err = engine(dir.path())
        .init(&venue(), &[Interval::D1])
        .unwrap_err();
    assert!(err.downcast_ref::<LayoutError>().is_some());
}

#[test]
fn migrate_without_plan_fails_before_writing() {
    let dir = tempdir().unwrap();
    seed_legacy(dir.path(), "AAPL", 10);
    let err = engine(dir.path())
        .migrate(&venue(), Interval::D1, MigrateOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains("init"));
    assert!(!PathBuilder::new(dir.path()).staging_root().exists());
}

#[test]
fn full_migration_round_trip() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    seed_legacy(root, "AAPL", 100);
    let eng = engine(root);
    let store = ConfigStore::new(root);
    let paths = PathBuilder::new(root);

    eng.init(&venue(), &[Interval::D1]).unwrap();

    let estimate = eng.estimate(&venue(), Interval::D1).unwrap();
    assert_eq!(estimate.symbols, 1);
    assert!(estimate.source_bytes > 0);

    let report = eng
        .migrate(&venue(), Interval::D1, MigrateOptions::default())
        .unwrap();
    assert_eq!(report.migrated, 1);
    assert_eq!(report.remaining, 0);

    // Plan checkpointed and completed.
    let plan = load_plan(&store).unwrap().unwrap();
    let entry = plan.interval(&venue(), Interval::D1).unwrap();
    assert_eq!(entry.status, PlanStatus::Completed);
    assert_eq!(entry.symbols_total, Some(1));
    assert_eq!(entry.symbols_migrated, vec!["AAPL"]);

    // The partitioned tree carries the same 100 rows, checksum-equal, and
    // the staging tree is gone.
    let binding = StorageBinding::partitioned(&venue());
    let partitioned = PartitionedStore::new(paths.clone());
    let live = partitioned
        .read_bars(&binding, "AAPL", Interval::D1, None)
        .unwrap();
    assert_eq!(live.height(), 100);
    let src = tickstore::data::LegacyStore::new(paths.clone())
        .read_relocated(Interval::D1, "AAPL")
        .unwrap();
    assert_eq!(
        canonical_checksum(&src).unwrap(),
        canonical_checksum(&live).unwrap()
    );
    assert!(!paths
        .staging()
        .bar_ticker_dir("us", "yahoo", Interval::D1, "AAPL")
        .exists());

    // Registry binding now points at the partitioned layout.
    let registry =
        SymbolRegistry::load(store.clone(), clock(), RegistryHorizons::default()).unwrap();
    let state = registry.interval_state("AAPL", Interval::D1).unwrap();
    assert_eq!(state.storage.as_ref().unwrap().venue(), venue());

    // Verify passes and records it in the plan.
    let verify = eng.verify(&venue(), Interval::D1).unwrap();
    assert_eq!(verify.mismatches, 0);
    let plan = load_plan(&store).unwrap().unwrap();
    let entry = plan.interval(&venue(), Interval::D1).unwrap();
    assert_eq!(entry.checksum_verified, Some(true));
    assert!(entry.verified_at.is_some());

    // Activation is metadata only.
    eng.activate(&venue(), Interval::D1).unwrap();
    let config = store.load_storage_config().unwrap();
    assert_eq!(config.backend_for(&venue()), StorageBackend::Partitioned);
    assert!(paths.legacy_relocated_file(Interval::D1, "AAPL").exists());

    // Rollback flips metadata back and deletes nothing.
    eng.rollback(&venue(), Interval::D1).unwrap();
    let config = store.load_storage_config().unwrap();
    assert_eq!(config.backend_for(&venue()), StorageBackend::Legacy);
    let registry = SymbolRegistry::load(store, clock(), RegistryHorizons::default()).unwrap();
    assert!(registry
        .interval_state("AAPL", Interval::D1)
        .unwrap()
        .storage
        .is_none());
    assert!(partitioned.has_bars(&binding, "AAPL", Interval::D1));
}

#[test]
fn migrate_resumes_and_refuses_without_flag() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    seed_legacy(root, "AAPL", 10);
    let eng = engine(root);
    eng.init(&venue(), &[Interval::D1]).unwrap();
    eng.migrate(&venue(), Interval::D1, MigrateOptions::default())
        .unwrap();

    // A second symbol shows up after the first run.
    seed_legacy(root, "MSFT", 10);

    let err = eng
        .migrate(&venue(), Interval::D1, MigrateOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains("--resume"));

    let report = eng
        .migrate(
            &venue(),
            Interval::D1,
            MigrateOptions {
                resume: true,
                ..MigrateOptions::default()
            },
        )
        .unwrap();
    assert_eq!(report.migrated, 1);

    let plan = load_plan(&ConfigStore::new(root)).unwrap().unwrap();
    let entry = plan.interval(&venue(), Interval::D1).unwrap();
    assert_eq!(entry.symbols_migrated, vec!["AAPL", "MSFT"]);
    assert_eq!(entry.status, PlanStatus::Completed);
}

#[test]
fn dry_run_copies_nothing() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    seed_legacy(root, "AAPL", 10);
    let eng = engine(root);
    eng.init(&venue(), &[Interval::D1]).unwrap();

    let report = eng
        .migrate(
            &venue(),
            Interval::D1,
            MigrateOptions {
                dry_run: true,
                ..MigrateOptions::default()
            },
        )
        .unwrap();
    assert_eq!(report.migrated, 0);
    assert_eq!(report.remaining, 1);

    let paths = PathBuilder::new(root);
    assert!(!paths
        .bar_ticker_dir("us", "yahoo", Interval::D1, "AAPL")
        .exists());
    let plan = load_plan(&ConfigStore::new(root)).unwrap().unwrap();
    assert!(plan
        .interval(&venue(), Interval::D1)
        .unwrap()
        .symbols_migrated
        .is_empty());
}

#[test]
fn activate_refuses_before_verification() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    seed_legacy(root, "AAPL", 10);
    let eng = engine(root);
    eng.init(&venue(), &[Interval::D1]).unwrap();
    eng.migrate(&venue(), Interval::D1, MigrateOptions::default())
        .unwrap();

    let err = eng.activate(&venue(), Interval::D1).unwrap_err();
    assert!(err.to_string().contains("verify"));

    eng.verify(&venue(), Interval::D1).unwrap();
    eng.activate(&venue(), Interval::D1).unwrap();
}

#[test]
fn verify_reports_tampered_partitions() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    seed_legacy(root, "AAPL", 40);
    let eng = engine(root);
    eng.init(&venue(), &[Interval::D1]).unwrap();
    eng.migrate(&venue(), Interval::D1, MigrateOptions::default())
        .unwrap();

    // Tamper with one live partition after the fact.
    let paths = PathBuilder::new(root);
    let ticker_dir = paths.bar_ticker_dir("us", "yahoo", Interval::D1, "AAPL");
    let mut tampered = None;
    for year in std::fs::read_dir(&ticker_dir).unwrap() {
        for month in std::fs::read_dir(year.unwrap().path()).unwrap() {
            tampered = Some(month.unwrap().path().join("data.parquet"));
        }
    }
    let mut replacement = common::make_bars(&[(dt(2030, 1, 1), 0.0, 0.0)]);
    write_parquet_atomic(&mut replacement, &tampered.unwrap()).unwrap();

    let report = eng.verify(&venue(), Interval::D1).unwrap();
    assert_eq!(report.mismatches, 1);
    let plan = load_plan(&ConfigStore::new(root)).unwrap().unwrap();
    assert_eq!(
        plan.interval(&venue(), Interval::D1).unwrap().checksum_verified,
        Some(false)
    );

    let err = eng.activate(&venue(), Interval::D1).unwrap_err();
    assert!(err.to_string().contains("verify"));
}
