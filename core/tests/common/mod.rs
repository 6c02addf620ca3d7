//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use simlab_core::{
    clock::ManualClock,
    dispatcher::{DispatchRequest, TransportError, WorkflowTransport},
    engine::LifecycleEngine,
    store::SimStore,
    types::OwnerRef,
};
use std::sync::{Arc, Mutex};

/// Records every request; optionally fails every send.
#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<DispatchRequest>>,
    fail_with: Option<TransportError>,
}

impl FakeTransport {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(err: TransportError) -> Arc<Self> {
        Arc::new(Self { sent: Mutex::new(Vec::new()), fail_with: Some(err) })
    }

    pub fn sent(&self) -> Vec<DispatchRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last(&self) -> DispatchRequest {
        self.sent().pop().expect("at least one dispatch")
    }
}

impl WorkflowTransport for FakeTransport {
    fn send(&self, request: &DispatchRequest) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(request.clone());
        match &self.fail_with {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap()
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start_time()))
}

pub fn engine(clock: &Arc<ManualClock>, transport: &Arc<FakeTransport>) -> LifecycleEngine {
    LifecycleEngine::build_test(clock.clone(), transport.clone()).expect("build test engine")
}

pub fn user(id: &str) -> OwnerRef {
    OwnerRef::User(id.to_string())
}

pub fn brief() -> serde_json::Value {
    serde_json::json!({
        "product_type": "serum",
        "target_gender": "unisex",
        "target_age_range": "25-35",
        "key_ingredients": ["niacinamide", "centella asiatica"],
        "texture": "lightweight gel"
    })
}

pub fn callback(engine: &LifecycleEngine, payload: serde_json::Value) -> bool {
    let body = serde_json::to_vec(&payload).unwrap();
    engine.handle_callback(&body, None)
}

/// A migrated database file that several connections can share.
pub fn file_store() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("simulations.db").to_string_lossy().into_owned();
    let store = SimStore::open(&path).expect("open store");
    store.migrate().expect("migration");
    (dir, path)
}
