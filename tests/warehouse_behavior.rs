//! Behavior-driven tests for persisting series buffers
//!
//! These tests verify that what a process synced survives a restart through
//! the DuckDB warehouse, so nothing already covered is fetched again.

use std::sync::Arc;

use barsync_core::{
    Bar, CoverageRange, Granularity, ManualClock, OwnerId, SeriesPersistence, SeriesStore,
    SimulatedFeed, SyncConfig, SyncCoordinator, SyncStatus, UtcDateTime, Warehouse, WarehouseConfig,
};
use barsync_tests::series_key as key;
use tempfile::tempdir;

fn now() -> UtcDateTime {
    UtcDateTime::parse("2024-06-03T20:00:00Z").expect("timestamp")
}

fn coordinator(feed: &SimulatedFeed, store: Arc<SeriesStore>) -> SyncCoordinator {
    SyncCoordinator::with_store(
        SyncConfig::default(),
        Arc::new(feed.clone()),
        Arc::new(ManualClock::new(now())),
        store,
    )
    .expect("coordinator")
}

// =============================================================================
// Warehouse: Restart Without Refetch
// =============================================================================

#[test]
fn when_process_restarts_persisted_coverage_prevents_refetch() {
    // Given: A synced hourly series persisted to a warehouse
    let temp = tempdir().expect("tempdir");
    let config = WarehouseConfig::in_home(temp.path().join("home"));
    let hour_key = key("AAPL", Granularity::OneHour);
    let original = {
        let feed = SimulatedFeed::auto_respond();
        let sync = coordinator(&feed, Arc::new(SeriesStore::default()));
        sync.request_updates(OwnerId::new(), std::slice::from_ref(&hour_key), false);
        sync.run_until_idle();
        assert_eq!(sync.status(&hour_key), SyncStatus::Initialized);

        let warehouse = Warehouse::open(config.clone()).expect("warehouse open");
        let saved = sync.store().persist_all(&warehouse).expect("persist");
        assert!(saved >= 1);
        sync.get_buffer(&hour_key)
    };

    // When: A new process restores from the same warehouse and asks again
    let warehouse = Warehouse::open(config).expect("warehouse reopen");
    let store = Arc::new(SeriesStore::default());
    assert!(store.load_from(&warehouse).expect("restore") >= 1);
    let feed = SimulatedFeed::auto_respond();
    let sync = coordinator(&feed, store);
    sync.request_updates(OwnerId::new(), std::slice::from_ref(&hour_key), false);
    sync.run_until_idle();

    // Then: The buffer matches and the feed saw no traffic
    assert_eq!(sync.get_buffer(&hour_key), original);
    assert!(feed.submitted().is_empty());
    assert_eq!(sync.status(&hour_key), SyncStatus::Initialized);
}

#[test]
fn when_series_is_saved_again_the_newer_snapshot_wins() {
    let temp = tempdir().expect("tempdir");
    let warehouse =
        Warehouse::open(WarehouseConfig::in_home(temp.path())).expect("warehouse open");
    let store = SeriesStore::new(false);
    let day_key = key("SPY", Granularity::OneDay);
    let start = UtcDateTime::parse("2024-01-02T00:00:00Z").expect("timestamp");
    let day = |n: i64| start.add_seconds(n * 86_400);
    let bar =
        |n: i64, close: f64| Bar::new(day(n), 470.0, 480.0, 465.0, close, 1_000).expect("bar");

    store.merge_new_data(
        &day_key,
        vec![bar(0, 471.0)],
        Some(CoverageRange::new(day(0), day(1)).expect("range")),
    );
    store.persist_all(&warehouse).expect("first persist");
    store.merge_new_data(
        &day_key,
        vec![bar(1, 476.0), bar(2, 479.0)],
        Some(CoverageRange::new(day(1), day(3)).expect("range")),
    );
    store.persist_all(&warehouse).expect("second persist");

    let (bars, coverage) = warehouse
        .load(&day_key)
        .expect("load")
        .expect("stored series");
    assert_eq!(bars, store.get(&day_key).bars);
    assert_eq!(
        coverage.ranges(),
        &[CoverageRange::new(day(0), day(3)).expect("range")]
    );
    assert_eq!(SeriesPersistence::keys(&warehouse).expect("keys"), vec![day_key]);
}

#[test]
fn when_nothing_was_synced_nothing_is_written() {
    let temp = tempdir().expect("tempdir");
    let warehouse =
        Warehouse::open(WarehouseConfig::in_home(temp.path())).expect("warehouse open");
    let store = SeriesStore::default();
    store.get(&key("QQQ", Granularity::FiveMinutes));

    assert_eq!(store.persist_all(&warehouse).expect("persist"), 0);
    assert!(warehouse.series_keys().expect("keys").is_empty());
    assert!(warehouse
        .load(&key("QQQ", Granularity::FiveMinutes))
        .expect("load")
        .is_none());
}
