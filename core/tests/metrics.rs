mod common;

use chrono::{Duration, NaiveDate};
use common::{file_store, start_time};
use simlab_core::{clock::ManualClock, metrics::MetricsAggregator, store::SimStore};
use std::sync::{Arc, Barrier};
use std::thread;

fn store() -> SimStore {
    let store = SimStore::in_memory().unwrap();
    store.migrate().unwrap();
    store
}

#[test]
fn untouched_day_reads_as_zero() {
    let store = store();
    let clock = ManualClock::new(start_time());
    let metric = MetricsAggregator::new(&store, &clock).today().unwrap();

    assert_eq!(metric.date, start_time().date_naive());
    assert_eq!(metric.requested, 0);
    assert_eq!(metric.average_processing_seconds, 0);
}

#[test]
fn failures_alone_leave_the_average_at_zero() {
    let store = store();
    let clock = ManualClock::new(start_time());
    let metrics = MetricsAggregator::new(&store, &clock);

    metrics.record_requested(false).unwrap();
    metrics.record_failed().unwrap();

    let metric = metrics.today().unwrap();
    assert_eq!(metric.requested, 1);
    assert_eq!(metric.failed, 1);
    assert_eq!(metric.completed, 0);
    assert_eq!(metric.average_processing_seconds, 0);
}

#[test]
fn average_is_rounded_total_over_completed() {
    let store = store();
    let clock = ManualClock::new(start_time());
    let metrics = MetricsAggregator::new(&store, &clock);

    metrics.record_completed(Some(10)).unwrap();
    metrics.record_completed(Some(11)).unwrap();
    metrics.record_completed(None).unwrap();

    let metric = metrics.today().unwrap();
    assert_eq!(metric.completed, 3);
    assert_eq!(metric.total_processing_seconds, 21);
    assert_eq!(metric.average_processing_seconds, 7);
}

#[test]
fn regenerations_count_as_requests_too() {
    let store = store();
    let clock = ManualClock::new(start_time());
    let metrics = MetricsAggregator::new(&store, &clock);

    metrics.record_requested(false).unwrap();
    metrics.record_requested(true).unwrap();

    let metric = metrics.today().unwrap();
    assert_eq!(metric.requested, 2);
    assert_eq!(metric.regenerated, 1);
}

#[test]
fn each_utc_date_has_its_own_row() {
    let store = store();
    let clock = ManualClock::new(start_time());
    let metrics = MetricsAggregator::new(&store, &clock);

    metrics.record_requested(false).unwrap();
    clock.advance(Duration::days(1));
    metrics.record_requested(false).unwrap();
    metrics.record_requested(false).unwrap();

    let first = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
    let second = NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();
    assert_eq!(metrics.for_date(first).unwrap().requested, 1);
    assert_eq!(metrics.for_date(second).unwrap().requested, 2);
    assert_eq!(metrics.today().unwrap().date, second);
}

#[test]
fn concurrent_increments_are_not_lost() {
    let (_dir, path) = file_store();
    let threads = 6;
    let per_thread = 10;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let path = path.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let store = SimStore::open(&path).unwrap();
                let clock = ManualClock::new(start_time());
                let metrics = MetricsAggregator::new(&store, &clock);
                barrier.wait();
                for _ in 0..per_thread {
                    metrics.record_requested(false).unwrap();
                    metrics.record_completed(Some(4)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let store = SimStore::open(&path).unwrap();
    let clock = ManualClock::new(start_time());
    let metric = MetricsAggregator::new(&store, &clock).today().unwrap();
    let expected = (threads * per_thread) as i64;
    assert_eq!(metric.requested, expected);
    assert_eq!(metric.completed, expected);
    assert_eq!(metric.total_processing_seconds, expected * 4);
    assert_eq!(metric.average_processing_seconds, 4);
}
