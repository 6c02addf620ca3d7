//! Bookkeeping failures roll the whole step back.
//!
//! A second connection renames `daily_metric` away so every metric write on
//! the engine's connection fails, then renames it back.

mod common;

use chrono::Duration;
use common::{brief, file_store, start_time, user, FakeTransport};
use simlab_core::{
    clock::ManualClock, config::LifecycleConfig, engine::LifecycleEngine,
    simulation::{SimulationRecord, SimulationStatus}, store::SimStore,
};
use std::sync::Arc;

fn engine_on(path: &str, clock: &Arc<ManualClock>, transport: &Arc<FakeTransport>) -> LifecycleEngine {
    LifecycleEngine::new(
        SimStore::open(path).unwrap(),
        LifecycleConfig::default_test(),
        clock.clone(),
        transport.clone(),
    )
}

fn take_metrics_offline(path: &str) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch("ALTER TABLE daily_metric RENAME TO daily_metric_offline;")
        .unwrap();
}

fn bring_metrics_back(path: &str) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch("ALTER TABLE daily_metric_offline RENAME TO daily_metric;")
        .unwrap();
}

fn completion(corr: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "correlationId": corr,
        "status": "completed",
        "resultData": { "name": "Glow Serum" },
        "processingTimeSeconds": 30
    }))
    .unwrap()
}

#[test]
fn failed_metric_write_keeps_the_completion_retryable() {
    let (_dir, path) = file_store();
    let clock = Arc::new(ManualClock::new(start_time()));
    let transport = FakeTransport::ok();
    let engine = engine_on(&path, &clock, &transport);
    let record = engine.submit(&user("u1"), brief()).unwrap();
    let body = completion(record.correlation_id.as_deref().unwrap());

    take_metrics_offline(&path);
    assert!(!engine.handle_callback(&body, None));

    let stored = engine.simulation(&record.id).unwrap();
    assert_eq!(stored.status, SimulationStatus::Processing);
    assert!(stored.output.is_none());
    assert_eq!(engine.store.event_count("simulation_completed").unwrap(), 0);

    bring_metrics_back(&path);
    assert!(engine.handle_callback(&body, None));

    let stored = engine.simulation(&record.id).unwrap();
    assert_eq!(stored.status, SimulationStatus::Completed);
    let metric = engine.metrics_for(None).unwrap();
    assert_eq!(metric.completed, 1);
    assert_eq!(metric.total_processing_seconds, 30);
    assert_eq!(engine.store.event_count("simulation_completed").unwrap(), 1);
}

#[test]
fn failed_admission_leaves_no_record_and_refunds_quota() {
    let (_dir, path) = file_store();
    let clock = Arc::new(ManualClock::new(start_time()));
    let transport = FakeTransport::ok();
    let engine = engine_on(&path, &clock, &transport);
    let owner = user("u1");

    take_metrics_offline(&path);
    assert!(engine.submit(&owner, brief()).is_err());

    assert!(engine.history(&owner).unwrap().is_empty());
    assert_eq!(engine.quota_status(&owner).unwrap().used, 0);
    assert!(transport.sent().is_empty());
    assert_eq!(engine.store.event_count("simulation_requested").unwrap(), 0);

    bring_metrics_back(&path);
    let record = engine.submit(&owner, brief()).unwrap();
    assert_eq!(record.status, SimulationStatus::Processing);
    assert_eq!(engine.quota_status(&owner).unwrap().used, 1);
    assert_eq!(engine.metrics_for(None).unwrap().requested, 1);
    assert_eq!(transport.sent().len(), 1);
}

#[test]
fn failed_sweep_leaves_the_record_for_the_next_pass() {
    let (_dir, path) = file_store();
    let clock = Arc::new(ManualClock::new(start_time()));
    let transport = FakeTransport::ok();
    let engine = engine_on(&path, &clock, &transport);
    let record = engine.submit(&user("u1"), brief()).unwrap();
    clock.advance(Duration::hours(2));

    take_metrics_offline(&path);
    assert!(engine.expire_stale_processing().is_err());
    assert_eq!(
        engine.simulation(&record.id).unwrap().status,
        SimulationStatus::Processing
    );

    bring_metrics_back(&path);
    assert_eq!(engine.expire_stale_processing().unwrap(), vec![record.id.clone()]);
    assert_eq!(
        engine.simulation(&record.id).unwrap().status,
        SimulationStatus::Failed
    );
    assert_eq!(engine.metrics_for(None).unwrap().failed, 1);
}

#[test]
fn dispatching_a_stored_pending_record() {
    let (_dir, path) = file_store();
    let clock = Arc::new(ManualClock::new(start_time()));
    let transport = FakeTransport::ok();
    let engine = engine_on(&path, &clock, &transport);
    let owner = user("u1");
    engine.store.ensure_owner(&owner, "free", start_time()).unwrap();
    let mut record = SimulationRecord::new_pending(owner, brief(), None, start_time());
    engine.store.insert_simulation(&record).unwrap();

    let corr = engine.dispatcher().dispatch(&mut record).unwrap();

    assert_eq!(record.status, SimulationStatus::Processing);
    assert_eq!(record.correlation_id.as_deref(), Some(corr.as_str()));
    let stored = engine.simulation(&record.id).unwrap();
    assert_eq!(stored.status, SimulationStatus::Processing);
    assert_eq!(stored.correlation_id.as_deref(), Some(corr.as_str()));
    let sent = transport.last();
    assert_eq!(sent.correlation_id, corr);
    assert_eq!(sent.simulation_id, record.id);
    assert_eq!(engine.store.event_count("workflow_dispatched").unwrap(), 1);
}
