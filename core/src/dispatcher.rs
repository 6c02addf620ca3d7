//! Workflow Dispatcher: hands a pending simulation to the workflow engine.
//!
//! ORDER (fixed):
//!   1. Generate a fresh correlation id.
//!   2. Persist pending -> processing with the id (compare-and-swap) and
//!      its audit event in one transaction.
//!   3. Send the request. No store lock or transaction is held here.
//!   4. On any send failure, fail the record with `workflow_dispatch_failed`.
//!
//! Retries live in the transport only; a workflow that could not be
//! delivered is never re-dispatched under the same record.

use crate::{
    clock::Clock,
    config::{WebhookConfig, WorkflowConfig},
    error::{SimError, SimResult},
    event::{EventLogEntry, LifecycleEvent},
    metrics::MetricsAggregator,
    signature,
    simulation::{SimulationError, SimulationRecord, ERROR_DISPATCH_FAILED},
    store::SimStore,
    types::{CorrelationId, SimulationId},
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// The JSON body posted to the workflow engine.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub correlation_id: CorrelationId,
    pub simulation_id: SimulationId,
    pub owner_id: String,
    pub input: serde_json::Value,
    pub processing_options: serde_json::Value,
    pub callback_url: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("workflow engine answered HTTP {status}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request encoding failed: {0}")]
    Encode(String),
}

impl TransportError {
    /// Client errors will not change on a second attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Transport(_) => true,
            Self::Encode(_) => false,
        }
    }

    fn details(&self) -> serde_json::Value {
        match self {
            Self::Status { status, body } => serde_json::json!({
                "http_status": status,
                "body": body,
            }),
            Self::Transport(msg) | Self::Encode(msg) => serde_json::json!({ "reason": msg }),
        }
    }
}

/// Delivers a dispatch request to the workflow engine.
pub trait WorkflowTransport: Send + Sync {
    fn send(&self, request: &DispatchRequest) -> Result<(), TransportError>;
}

// ── HTTP transport ─────────────────────────────────────────────────

/// Blocking HTTP transport with a bounded timeout and fixed-backoff retries.
pub struct HttpTransport {
    agent: ureq::Agent,
    endpoint: String,
    max_attempts: u32,
    backoff: Duration,
    signing_secret: Option<String>,
    signature_header: String,
}

impl HttpTransport {
    pub fn from_config(workflow: &WorkflowConfig, webhook: &WebhookConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(workflow.connect_timeout_secs))
            .timeout(Duration::from_secs(workflow.timeout_secs))
            .build();
        Self {
            agent,
            endpoint: workflow.endpoint.clone(),
            max_attempts: workflow.max_attempts.max(1),
            backoff: Duration::from_secs(workflow.retry_backoff_secs),
            signing_secret: webhook.secret.clone(),
            signature_header: webhook.signature_header.clone(),
        }
    }

    fn send_once(&self, body: &str) -> Result<(), TransportError> {
        let mut req = self
            .agent
            .post(&self.endpoint)
            .set("content-type", "application/json")
            .set("accept", "application/json");
        if let Some(secret) = &self.signing_secret {
            let sig = signature::sign(secret, body.as_bytes());
            req = req.set(&self.signature_header, &format!("sha256={sig}"));
        }
        match req.send_string(body) {
            Ok(resp) if (200..=299).contains(&resp.status()) => Ok(()),
            Ok(resp) => {
                let status = resp.status();
                Err(TransportError::Status {
                    status,
                    body: resp.into_string().unwrap_or_default(),
                })
            }
            Err(ureq::Error::Status(status, resp)) => Err(TransportError::Status {
                status,
                body: resp.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Transport(err)) => Err(TransportError::Transport(err.to_string())),
        }
    }
}

impl WorkflowTransport for HttpTransport {
    fn send(&self, request: &DispatchRequest) -> Result<(), TransportError> {
        let body =
            serde_json::to_string(request).map_err(|e| TransportError::Encode(e.to_string()))?;
        let mut attempt = 1;
        loop {
            match self.send_once(&body) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    log::warn!(
                        "dispatch {} attempt {attempt}/{} failed: {err}; retrying in {:?}",
                        request.correlation_id,
                        self.max_attempts,
                        self.backoff
                    );
                    std::thread::sleep(self.backoff);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// ── Dispatcher ─────────────────────────────────────────────────────

pub struct WorkflowDispatcher<'a> {
    store: &'a SimStore,
    config: &'a WorkflowConfig,
    clock: &'a dyn Clock,
    transport: &'a dyn WorkflowTransport,
}

impl<'a> WorkflowDispatcher<'a> {
    pub fn new(
        store: &'a SimStore,
        config: &'a WorkflowConfig,
        clock: &'a dyn Clock,
        transport: &'a dyn WorkflowTransport,
    ) -> Self {
        Self { store, config, clock, transport }
    }

    /// Move a pending record to processing and send it to the engine.
    ///
    /// On return `record` reflects the stored row. A send failure leaves
    /// the record failed and is surfaced as `DispatchFailed`.
    pub fn dispatch(&self, record: &mut SimulationRecord) -> SimResult<CorrelationId> {
        let request = self.store.in_transaction(|_| self.begin(record))?;
        self.send(record, &request)
    }

    /// Persist pending -> processing under a fresh correlation id and audit
    /// it. Opens no transaction of its own; callers wrap it in one.
    pub fn begin(&self, record: &mut SimulationRecord) -> SimResult<DispatchRequest> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let mut next = record.clone();
        next.begin_processing(
            correlation_id.clone(),
            &self.config.initial_steps,
            self.clock.now(),
        )?;
        if !self.store.update_simulation_cas(&mut next)? {
            return Err(SimError::Other(anyhow::anyhow!(
                "simulation {} changed before dispatch",
                next.id
            )));
        }
        self.log_event(&LifecycleEvent::WorkflowDispatched {
            simulation_id: next.id.clone(),
            correlation_id: correlation_id.clone(),
        })?;
        *record = next;

        Ok(DispatchRequest {
            correlation_id,
            simulation_id: record.id.clone(),
            owner_id: record.owner.key(),
            input: record.input.clone(),
            processing_options: self.config.processing_options.clone(),
            callback_url: self.config.callback_url.clone(),
        })
    }

    /// Deliver a request prepared by `begin`. No store lock is held while
    /// the transport blocks.
    pub fn send(
        &self,
        record: &mut SimulationRecord,
        request: &DispatchRequest,
    ) -> SimResult<CorrelationId> {
        match self.transport.send(request) {
            Ok(()) => {
                log::info!(
                    "simulation {} dispatched as {}",
                    record.id,
                    request.correlation_id
                );
                Ok(request.correlation_id.clone())
            }
            Err(err) => {
                log::error!("simulation {} dispatch failed: {err}", record.id);
                self.fail_dispatch(record, &err)?;
                Err(SimError::DispatchFailed {
                    simulation_id: record.id.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// The failed record, its metric and its audit event commit together.
    /// If that transaction fails the record stays processing and the
    /// stale-processing sweep fails it later.
    fn fail_dispatch(&self, record: &mut SimulationRecord, err: &TransportError) -> SimResult<()> {
        let now = self.clock.now();
        let diagnostic = SimulationError {
            kind: ERROR_DISPATCH_FAILED.into(),
            message: err.to_string(),
            details: Some(err.details()),
            occurred_at: now,
        };
        let result = self.store.in_transaction(|store| {
            let (updated, ()) = store.modify_simulation(&record.id, |r| {
                if r.status.is_terminal() {
                    return Err(SimError::StaleCallback {
                        simulation_id: r.id.clone(),
                        status: r.status.to_string(),
                    });
                }
                r.fail(diagnostic.clone(), now)
            })?;
            MetricsAggregator::new(store, self.clock).record_failed()?;
            self.log_event(&LifecycleEvent::DispatchFailed {
                simulation_id: updated.id.clone(),
                reason: err.to_string(),
            })?;
            Ok(updated)
        });
        match result {
            Ok(updated) => {
                *record = updated;
                Ok(())
            }
            // A callback already finished the record while the send was failing.
            Err(SimError::StaleCallback { status, .. }) => {
                log::warn!(
                    "simulation {} already {status}; dispatch failure not recorded",
                    record.id
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn log_event(&self, event: &LifecycleEvent) -> SimResult<()> {
        self.store
            .append_event(&EventLogEntry::from_event(event, self.clock.now())?)
    }
}
