//! Storage engine semantics: merge/dedup, corruption recovery, partition
//! locality, router fallback.

mod common;

use common::{closes, dt, make_bars};
use tempfile::tempdir;

use tickstore::config::StorageConfig;
use tickstore::data::paths::PathBuilder;
use tickstore::data::{LegacyStore, PartitionedStore, RouteRequest, StorageRouter};
use tickstore::types::{Interval, StorageBackend, StorageBinding, Venue};

fn binding() -> StorageBinding {
    StorageBinding::partitioned(&Venue::new("us", "yahoo"))
}

#[test]
fn merge_dedup_scenario() {
    let dir = tempdir().unwrap();
    let store = PartitionedStore::new(PathBuilder::new(dir.path()));

    let first = make_bars(&[(dt(2025, 1, 2), 1.0, 1.0), (dt(2025, 1, 3), 2.0, 2.0)]);
    let second = make_bars(&[(dt(2025, 1, 3), 2.0, 9.0), (dt(2025, 1, 4), 3.0, 3.0)]);

    store.save_bars(&first, &binding(), "AAPL", Interval::D1).unwrap();
    store.save_bars(&second, &binding(), "AAPL", Interval::D1).unwrap();

    let read = store.read_bars(&binding(), "AAPL", Interval::D1, None).unwrap();
    assert_eq!(read.height(), 3);
    assert_eq!(closes(&read), vec![1.0, 9.0, 3.0]);
}

#[test]
fn saving_the_same_frame_twice_is_idempotent() {
    let dir = tempdir().unwrap();
    let store = PartitionedStore::new(PathBuilder::new(dir.path()));
    let frame = make_bars(&[(dt(2025, 1, 2), 1.0, 1.0), (dt(2025, 2, 3), 2.0, 2.0)]);

    store.save_bars(&frame, &binding(), "AAPL", Interval::D1).unwrap();
    let once = store.read_bars(&binding(), "AAPL", Interval::D1, None).unwrap();
    store.save_bars(&frame, &binding(), "AAPL", Interval::D1).unwrap();
    let twice = store.read_bars(&binding(), "AAPL", Interval::D1, None).unwrap();

    assert_eq!(once.height(), twice.height());
    assert_eq!(closes(&once), closes(&twice));
}

#[test]
fn timestamps_stay_unique_and_ascending_across_saves() {
    let dir = tempdir().unwrap();
    let store = PartitionedStore::new(PathBuilder::new(dir.path()));

    for frame in [
        make_bars(&[(dt(2025, 3, 5), 1.0, 1.0), (dt(2025, 1, 2), 1.0, 2.0)]),
        make_bars(&[(dt(2025, 2, 1), 1.0, 3.0), (dt(2025, 3, 5), 1.0, 4.0)]),
        make_bars(&[(dt(2025, 1, 2), 1.0, 5.0)]),
    ] {
        store.save_bars(&frame, &binding(), "AAPL", Interval::D1).unwrap();
    }

    let read = store.read_bars(&binding(), "AAPL", Interval::D1, None).unwrap();
    let ts: Vec<i64> = read
        .column("timestamp")
        .unwrap()
        .cast(&polars::prelude::DataType::Int64)
        .unwrap()
        .i64()
        .unwrap()
        .into_no_null_iter()
        .collect();
    let mut expected = ts.clone();
    expected.sort_unstable();
    expected.dedup();
    assert_eq!(ts, expected);
    // Latest write for each timestamp wins.
    assert_eq!(closes(&read), vec![5.0, 3.0, 4.0]);
}

#[test]
fn corruption_scenario_deletes_and_reads_empty() {
    let dir = tempdir().unwrap();
    let paths = PathBuilder::new(dir.path());
    let store = PartitionedStore::new(paths.clone());

    let file = paths.bar_partition_file("us", "yahoo", Interval::D1, "AAPL", 2025, 1);
    std::fs::create_dir_all(file.parent().unwrap()).unwrap();
    std::fs::write(&file, b"not valid").unwrap();

    let read = store.read_bars(&binding(), "AAPL", Interval::D1, None).unwrap();
    assert_eq!(read.height(), 0);
    assert!(!file.exists());
}

#[test]
fn month_save_does_not_touch_other_partitions() {
    let dir = tempdir().unwrap();
    let paths = PathBuilder::new(dir.path());
    let store = PartitionedStore::new(paths.clone());

    store
        .save_bars(
            &make_bars(&[(dt(2025, 1, 10), 1.0, 1.0)]),
            &binding(),
            "AAPL",
            Interval::D1,
        )
        .unwrap();
    let jan = paths.bar_partition_file("us", "yahoo", Interval::D1, "AAPL", 2025, 1);
    let jan_bytes = std::fs::read(&jan).unwrap();

    store
        .save_bars(
            &make_bars(&[(dt(2025, 2, 10), 1.0, 2.0)]),
            &binding(),
            "AAPL",
            Interval::D1,
        )
        .unwrap();

    assert_eq!(std::fs::read(&jan).unwrap(), jan_bytes);
    let months: Vec<String> = std::fs::read_dir(
        paths
            .bar_ticker_dir("us", "yahoo", Interval::D1, "AAPL")
            .join("year=2025"),
    )
    .unwrap()
    .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
    .collect();
    assert_eq!(months.len(), 2);
}

#[test]
fn router_falls_back_to_legacy_when_partitioned_is_empty() {
    let dir = tempdir().unwrap();
    let paths = PathBuilder::new(dir.path());

    // storage_config selects partitioned for (us, yahoo) but the symbol has
    // only a legacy file.
    let mut config = StorageConfig::default();
    config.set_backend(&Venue::new("us", "yahoo"), StorageBackend::Partitioned);
    let router = StorageRouter::new(paths.clone(), config);

    let legacy = LegacyStore::new(paths);
    legacy
        .save(&make_bars(&[(dt(2025, 1, 2), 1.0, 7.0)]), Interval::D1, "AAPL")
        .unwrap();

    let req = RouteRequest::new("AAPL", Interval::D1, None);
    let read = router.read(&req).unwrap();
    assert_eq!(read.height(), 1);
    assert_eq!(closes(&read), vec![7.0]);
}

#[test]
fn router_save_respects_interval_binding() {
    let dir = tempdir().unwrap();
    let paths = PathBuilder::new(dir.path());
    let router = StorageRouter::new(paths.clone(), StorageConfig::default());

    let b = binding();
    let req = RouteRequest::new("MSFT", Interval::H1, Some(&b));
    router
        .save(&req, &make_bars(&[(dt(2025, 4, 1), 1.0, 2.0)]))
        .unwrap();

    assert!(paths
        .bar_partition_file("us", "yahoo", Interval::H1, "MSFT", 2025, 4)
        .exists());
    assert!(!paths.legacy_file(Interval::H1, "MSFT").exists());
    assert_eq!(router.read(&req).unwrap().height(), 1);
}
