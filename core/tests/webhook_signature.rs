mod common;

use common::{brief, clock, user, FakeTransport};
use simlab_core::{
    config::LifecycleConfig,
    engine::LifecycleEngine,
    signature,
    simulation::SimulationStatus,
    store::SimStore,
};

const SECRET: &str = "whsec_test";

fn signed_engine() -> (LifecycleEngine, String, String) {
    let store = SimStore::in_memory().unwrap();
    store.migrate().unwrap();
    let mut config = LifecycleConfig::default_test();
    config.webhook.secret = Some(SECRET.into());
    let engine = LifecycleEngine::new(store, config, clock(), FakeTransport::ok());
    let record = engine.submit(&user("u1"), brief()).unwrap();
    let corr = record.correlation_id.clone().unwrap();
    (engine, record.id, corr)
}

fn completion(corr: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "correlationId": corr,
        "status": "completed",
        "resultData": { "name": "Glow Serum" }
    }))
    .unwrap()
}

#[test]
fn valid_header_signature_is_accepted() {
    let (engine, id, corr) = signed_engine();
    let body = completion(&corr);
    let sig = format!("sha256={}", signature::sign(SECRET, &body));

    assert!(engine.handle_callback(&body, Some(&sig)));
    assert_eq!(
        engine.simulation(&id).unwrap().status,
        SimulationStatus::Completed
    );
}

#[test]
fn bare_hex_header_signature_is_accepted() {
    let (engine, id, corr) = signed_engine();
    let body = completion(&corr);
    let sig = signature::sign(SECRET, &body);

    assert!(engine.handle_callback(&body, Some(&sig)));
    assert_eq!(
        engine.simulation(&id).unwrap().status,
        SimulationStatus::Completed
    );
}

#[test]
fn wrong_signature_is_rejected_without_mutation() {
    let (engine, id, corr) = signed_engine();
    let body = completion(&corr);
    let forged = signature::sign("someone-else", &body);

    assert!(!engine.handle_callback(&body, Some(&forged)));
    assert!(!engine.handle_callback(&body, Some("sha256=zz")));

    let stored = engine.simulation(&id).unwrap();
    assert_eq!(stored.status, SimulationStatus::Processing);
    assert!(stored.output.is_none());
    assert_eq!(engine.metrics_for(None).unwrap().completed, 0);
}

#[test]
fn tampered_body_is_rejected() {
    let (engine, id, corr) = signed_engine();
    let body = completion(&corr);
    let sig = signature::sign(SECRET, &body);
    let tampered = serde_json::to_vec(&serde_json::json!({
        "correlationId": corr,
        "status": "completed",
        "resultData": { "name": "Something Else" }
    }))
    .unwrap();

    assert!(!engine.handle_callback(&tampered, Some(&sig)));
    assert_eq!(
        engine.simulation(&id).unwrap().status,
        SimulationStatus::Processing
    );
}

#[test]
fn embedded_signature_is_accepted() {
    let (engine, id, corr) = signed_engine();
    let payload = serde_json::json!({
        "correlationId": corr,
        "status": "failed",
        "errorDetails": { "message": "node crashed" }
    });
    let body = serde_json::to_vec(&signature::embed(SECRET, &payload).unwrap()).unwrap();

    assert!(engine.handle_callback(&body, None));
    assert_eq!(
        engine.simulation(&id).unwrap().status,
        SimulationStatus::Failed
    );
}

#[test]
fn missing_signature_is_rejected_when_a_secret_is_set() {
    let (engine, id, corr) = signed_engine();

    assert!(!engine.handle_callback(&completion(&corr), None));
    assert_eq!(
        engine.simulation(&id).unwrap().status,
        SimulationStatus::Processing
    );
    assert_eq!(engine.store.event_count("callback_rejected").unwrap(), 1);
}

#[test]
fn unsigned_callbacks_pass_without_a_secret() {
    let clock = clock();
    let transport = FakeTransport::ok();
    let engine = common::engine(&clock, &transport);
    let record = engine.submit(&user("u1"), brief()).unwrap();
    let body = completion(record.correlation_id.as_deref().unwrap());

    assert!(engine.handle_callback(&body, None));
}
