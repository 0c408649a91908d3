//! Behavior-driven tests for the series store
//!
//! These tests verify HOW bar batches are merged, amended and propagated
//! to coarser granularities, focusing on what readers observe.

use std::sync::Arc;
use std::thread;

use barsync_core::{Bar, CoverageRange, Granularity, SeriesKey, SeriesStore, UtcDateTime};
use barsync_tests::{series_key, unix};
use proptest::prelude::*;

const BASE: i64 = 1_704_103_200;

fn minute(n: i64) -> UtcDateTime {
    unix(BASE, n * 60)
}

fn minutes(start: i64, end: i64) -> CoverageRange {
    CoverageRange::new(minute(start), minute(end)).expect("range")
}

fn key(granularity: Granularity) -> SeriesKey {
    series_key("TSLA", granularity)
}

/// Deterministic bar for minute `n`, identical no matter who builds it.
fn bar_at(n: i64) -> Bar {
    let price = 200.0 + (n % 17) as f64;
    Bar::new(minute(n), price, price + 2.0, price - 1.5, price + 0.5, 100 + n as u64)
        .expect("bar")
}

fn bars_between(start: i64, end: i64) -> Vec<Bar> {
    (start..end).map(bar_at).collect()
}

// =============================================================================
// Merging: Idempotency and Amendment
// =============================================================================

#[test]
fn when_same_batch_arrives_twice_nothing_changes() {
    // Given: A merged hour of 1m bars
    let store = SeriesStore::default();
    let fine = key(Granularity::OneMinute);
    store.merge_new_data(&fine, bars_between(0, 60), Some(minutes(0, 60)));
    let before: Vec<_> = store.keys().iter().map(|key| store.get(key)).collect();

    // When: The feed replays the exact same batch
    let outcome = store.merge_new_data(&fine, bars_between(0, 60), Some(minutes(0, 60)));

    // Then: The merge is a no-op for every granularity
    assert!(!outcome.changed());
    let after: Vec<_> = store.keys().iter().map(|key| store.get(key)).collect();
    assert_eq!(before, after);
}

#[test]
fn when_forming_bar_updates_it_is_amended_in_place() {
    let store = SeriesStore::new(false);
    let fine = key(Granularity::OneMinute);
    store.merge_new_data(&fine, bars_between(0, 5), None);

    let mut update = bar_at(4);
    update.close = update.high;
    update.volume += 50;
    let outcome = store.merge_new_data(&fine, vec![update.clone()], None);

    assert_eq!(outcome.inserted, 0);
    assert_eq!(outcome.amended, 1);
    assert_eq!(outcome.first_changed, Some(minute(4)));
    let snapshot = store.get(&fine);
    assert_eq!(snapshot.bars.len(), 5);
    assert_eq!(snapshot.last_bar(), Some(&update));
}

#[test]
fn when_propagation_is_disabled_coarse_series_stay_untouched() {
    let store = SeriesStore::new(false);
    let fine = key(Granularity::OneMinute);

    let outcome = store.merge_new_data(&fine, bars_between(0, 30), Some(minutes(0, 30)));

    assert!(outcome.affected_keys.is_empty());
    assert_eq!(store.keys(), vec![fine]);
}

// =============================================================================
// Propagation: Derived Bars
// =============================================================================

#[test]
fn when_fine_window_is_partial_the_coarse_bar_is_provisional() {
    // Given: Only the first three minutes of a 5m window
    let store = SeriesStore::default();
    let fine = key(Granularity::OneMinute);
    let five = key(Granularity::FiveMinutes);
    store.merge_new_data(&fine, bars_between(0, 3), Some(minutes(0, 3)));

    // Then: A 5m bar exists but the 5m window is not covered yet
    let snapshot = store.get(&five);
    assert_eq!(snapshot.bars.len(), 1);
    assert_eq!(snapshot.bars[0].volume, 100 + 101 + 102);
    assert!(snapshot.coverage.is_empty());

    // When: The rest of the window arrives
    store.merge_new_data(&fine, bars_between(3, 5), Some(minutes(3, 5)));

    // Then: The coarse bar reflects all five minutes and is covered
    let snapshot = store.get(&five);
    let expected = Bar::aggregate(minute(0), &bars_between(0, 5)).expect("aggregate");
    assert_eq!(snapshot.bars, vec![expected]);
    assert!(snapshot.coverage.contains(&minutes(0, 5)));
}

#[test]
fn when_newer_chunk_completes_first_the_coarse_bar_is_rebuilt_from_all_fine_bars() {
    // Given: Minutes [3, 10) delivered and completed before the older chunk
    let store = SeriesStore::default();
    let fine = key(Granularity::OneMinute);
    let five = key(Granularity::FiveMinutes);
    store.merge_new_data(&fine, bars_between(3, 10), None);
    store.merge_new_data(&fine, Vec::new(), Some(minutes(3, 10)));

    // When: Minutes [0, 3) arrive and their request completes
    store.merge_new_data(&fine, bars_between(0, 3), None);
    let outcome = store.merge_new_data(&fine, Vec::new(), Some(minutes(0, 3)));

    // Then: Each 5m bar is the aggregate of all five minutes, open included
    assert!(outcome.affected_keys.contains(&five));
    let snapshot = store.get(&five);
    assert_eq!(
        snapshot.bars,
        vec![
            Bar::aggregate(minute(0), &bars_between(0, 5)).expect("aggregate"),
            Bar::aggregate(minute(5), &bars_between(5, 10)).expect("aggregate"),
        ]
    );
    assert_eq!(snapshot.bars[0].open, bar_at(0).open);
    assert_eq!(snapshot.coverage.ranges(), &[minutes(0, 10)]);
}

#[test]
fn when_coverage_completes_without_new_bars_the_window_is_recomputed() {
    // Given: A 5m bar fetched directly, then amended by minutes without coverage
    let store = SeriesStore::default();
    let fine = key(Granularity::OneMinute);
    let five = key(Granularity::FiveMinutes);
    let fetched = Bar::new(minute(0), 150.0, 260.0, 140.0, 199.0, 1).expect("bar");
    store.merge_new_data(&five, vec![fetched], Some(minutes(0, 5)));
    store.merge_new_data(&fine, bars_between(0, 5), None);
    assert_eq!(store.get(&five).bars[0].open, 150.0);

    // When: The minute request completes with no further bars
    store.merge_new_data(&fine, Vec::new(), Some(minutes(0, 5)));

    // Then: The window is rebuilt from its minutes
    assert_eq!(
        store.get(&five).bars,
        vec![Bar::aggregate(minute(0), &bars_between(0, 5)).expect("aggregate")]
    );
}

#[test]
fn when_change_is_broadcast_subscribers_learn_affected_keys() {
    let store = SeriesStore::default();
    let mut changes = store.subscribe();
    let fine = key(Granularity::OneMinute);

    store.merge_new_data(&fine, bars_between(10, 20), Some(minutes(10, 20)));

    let event = changes.try_recv().expect("change event");
    assert_eq!(event.key, fine);
    assert_eq!(event.first_changed, Some(minute(10)));
    for derived in [
        Granularity::TwoMinutes,
        Granularity::ThreeMinutes,
        Granularity::FiveMinutes,
        Granularity::FifteenMinutes,
        Granularity::ThirtyMinutes,
        Granularity::OneHour,
        Granularity::FourHours,
    ] {
        assert!(event.affected_keys.contains(&key(derived)), "{derived} missing");
    }
    assert!(!event.affected_keys.contains(&key(Granularity::OneDay)));
}

fn arb_minute_bar() -> impl Strategy<Value = (f64, f64, f64, f64, u64)> {
    (1.0f64..100.0, 1.0f64..100.0, 0.0f64..1.0, 0.0f64..1.0, 0u64..10_000)
}

proptest! {
    #[test]
    fn coarse_bars_match_aggregate_of_their_fine_bars(
        raw in prop::collection::vec(arb_minute_bar(), 15),
    ) {
        let store = SeriesStore::default();
        let fine = key(Granularity::OneMinute);
        let bars: Vec<Bar> = raw
            .iter()
            .enumerate()
            .map(|(n, (open, close, up, down, volume))| {
                let high = open.max(*close) + up;
                let low = (open.min(*close) - down).max(0.0);
                Bar::new(minute(n as i64), *open, high, low, *close, *volume).expect("bar")
            })
            .collect();

        store.merge_new_data(&fine, bars.clone(), Some(minutes(0, 15)));

        let five = store.get(&key(Granularity::FiveMinutes));
        prop_assert_eq!(five.bars.len(), 3);
        for (index, coarse) in five.bars.iter().enumerate() {
            let members = &bars[index * 5..index * 5 + 5];
            let expected = Bar::aggregate(minute(index as i64 * 5), members).expect("aggregate");
            prop_assert_eq!(coarse, &expected);
        }

        let fifteen = store.get(&key(Granularity::FifteenMinutes));
        let expected = Bar::aggregate(minute(0), &bars).expect("aggregate");
        prop_assert_eq!(fifteen.bars, vec![expected]);
        prop_assert!(fifteen.coverage.contains(&minutes(0, 15)));
    }
}

// =============================================================================
// Concurrency: Overlapping Writers
// =============================================================================

#[test]
fn when_overlapping_batches_merge_concurrently_the_result_is_their_union() {
    // Given: Two writers with overlapping ranges for the same key
    let store = Arc::new(SeriesStore::default());
    let fine = key(Granularity::OneMinute);
    let writers: Vec<_> = [(0, 90), (45, 120)]
        .into_iter()
        .map(|(start, end)| {
            let store = Arc::clone(&store);
            let fine = fine.clone();
            thread::spawn(move || {
                store.merge_new_data(&fine, bars_between(start, end), Some(minutes(start, end)))
            })
        })
        .collect();

    // When: Both merges finish
    for writer in writers {
        writer.join().expect("writer thread");
    }

    // Then: Coverage is the union and every minute appears exactly once
    let snapshot = store.get(&fine);
    assert_eq!(snapshot.coverage.ranges(), &[minutes(0, 120)]);
    assert_eq!(snapshot.bars, bars_between(0, 120));

    // And: Every derived bar matches the aggregate of its minutes
    for (granularity, minutes_per_bar) in [
        (Granularity::FiveMinutes, 5),
        (Granularity::FifteenMinutes, 15),
        (Granularity::OneHour, 60),
    ] {
        let coarse = store.get(&key(granularity));
        let expected: Vec<_> = (0..120 / minutes_per_bar)
            .map(|index| {
                let start = index * minutes_per_bar;
                Bar::aggregate(minute(start), &bars_between(start, start + minutes_per_bar))
                    .expect("aggregate")
            })
            .collect();
        assert_eq!(coarse.bars, expected, "{granularity}");
        assert!(coarse.coverage.contains(&minutes(0, 120)));
    }
}

#[test]
fn when_writers_race_repeatedly_derived_bars_stay_exact() {
    for _ in 0..20 {
        let store = Arc::new(SeriesStore::default());
        let fine = key(Granularity::OneMinute);
        let writers: Vec<_> = [(0, 40), (20, 75), (60, 120)]
            .into_iter()
            .map(|(start, end)| {
                let store = Arc::clone(&store);
                let fine = fine.clone();
                thread::spawn(move || {
                    store.merge_new_data(&fine, bars_between(start, end), Some(minutes(start, end)))
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer thread");
        }

        let hour = store.get(&key(Granularity::OneHour));
        assert_eq!(
            hour.bars,
            vec![
                Bar::aggregate(minute(0), &bars_between(0, 60)).expect("aggregate"),
                Bar::aggregate(minute(60), &bars_between(60, 120)).expect("aggregate"),
            ]
        );
    }
}
