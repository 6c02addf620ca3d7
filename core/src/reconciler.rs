//! Webhook Reconciler: applies workflow engine callbacks to records.
//!
//! ALGORITHM:
//!   1. Verify the HMAC signature when a secret is configured.
//!   2. Decode the payload and resolve the record by correlation id.
//!   3. Refuse records already completed or failed (stale callback).
//!   4. Classify into Progress | Success | Failure and apply it with a
//!      compare-and-swap write, re-checking the terminal state on retry.
//!   5. Record metrics and audit events only after the write lands.
//!
//! Errors never leave `reconcile`: they become `false` plus a log line.

use crate::{
    clock::Clock,
    config::{ContactConfig, WebhookConfig},
    error::{SimError, SimResult},
    event::{EventLogEntry, LifecycleEvent},
    metrics::MetricsAggregator,
    signature,
    simulation::{
        ProgressUpdate, SimulationError, SimulationRecord, SimulationStatus,
        ERROR_WORKFLOW_FAILED,
    },
    store::SimStore,
    types::SimulationId,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

pub const CONTACT_LINK_FIELD: &str = "cta_whatsapp_url";

// ── Wire format ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallbackProgress {
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default, alias = "current_step")]
    pub current_step: Option<String>,
    #[serde(default, alias = "completed_steps")]
    pub completed_steps: Option<Vec<String>>,
    #[serde(default, alias = "remaining_steps")]
    pub remaining_steps: Option<Vec<String>>,
    #[serde(default, alias = "estimated_completion")]
    pub estimated_completion: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    #[serde(default, alias = "correlation_id")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "result_data")]
    pub result_data: Option<serde_json::Value>,
    #[serde(default, alias = "error_details")]
    pub error_details: Option<serde_json::Value>,
    #[serde(default)]
    pub progress: Option<CallbackProgress>,
    #[serde(default, alias = "processing_time_seconds")]
    pub processing_time_seconds: Option<f64>,
    #[serde(default)]
    pub signature: Option<String>,
}

/// A callback decoded once at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    Progress(ProgressUpdate),
    Success {
        result: serde_json::Value,
        reported_seconds: Option<f64>,
    },
    Failure {
        details: Option<serde_json::Value>,
    },
}

impl CallbackProgress {
    fn to_update(&self) -> ProgressUpdate {
        let estimated_completion = self.estimated_completion.as_deref().and_then(|raw| {
            match DateTime::parse_from_rfc3339(raw) {
                Ok(t) => Some(t.with_timezone(&Utc)),
                Err(e) => {
                    log::debug!("ignoring unparseable estimatedCompletion '{raw}': {e}");
                    None
                }
            }
        });
        ProgressUpdate {
            percentage: self.percentage,
            current_step: self.current_step.clone(),
            steps_completed: self.completed_steps.clone(),
            steps_remaining: self.remaining_steps.clone(),
            estimated_completion,
        }
    }
}

impl CallbackPayload {
    pub fn classify(&self) -> SimResult<CallbackOutcome> {
        let status = self.status.as_deref().map(str::to_ascii_lowercase);
        match status.as_deref() {
            Some("completed" | "success" | "succeeded") => match &self.result_data {
                Some(result) if !result.is_null() => Ok(CallbackOutcome::Success {
                    result: result.clone(),
                    reported_seconds: self.processing_time_seconds,
                }),
                _ => Err(SimError::InvalidCallback(
                    "completed callback without resultData".into(),
                )),
            },
            Some("failed" | "error") => Ok(CallbackOutcome::Failure {
                details: self.error_details.clone().filter(|d| !d.is_null()),
            }),
            Some("processing" | "progress" | "running") | None => Ok(CallbackOutcome::Progress(
                self.progress.as_ref().map(CallbackProgress::to_update).unwrap_or_default(),
            )),
            // Keep whatever partial information arrived, never as a terminal state.
            Some(other) => {
                log::debug!("unrecognized callback status '{other}', treating as progress");
                let mut update = self
                    .progress
                    .as_ref()
                    .map(CallbackProgress::to_update)
                    .unwrap_or_default();
                if update.current_step.is_none() {
                    update.current_step = Some(other.to_string());
                }
                Ok(CallbackOutcome::Progress(update))
            }
        }
    }
}

// ── Output shaping ─────────────────────────────────────────────────

/// Add a WhatsApp contact link to the result unless the engine sent one.
pub fn ensure_contact_link(mut output: serde_json::Value, contact: &ContactConfig) -> serde_json::Value {
    let Some(object) = output.as_object_mut() else {
        log::warn!("result payload is not an object; contact link not added");
        return output;
    };
    let present = object
        .get(CONTACT_LINK_FIELD)
        .and_then(|v| v.as_str())
        .is_some_and(|s| !s.trim().is_empty());
    if present {
        return output;
    }

    let product = ["name", "product_name", "productName"]
        .iter()
        .find_map(|key| object.get(*key).and_then(|v| v.as_str()))
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(contact.fallback_product_name.as_str())
        .to_string();
    let message = contact.message_template.replace("{product}", &product);
    let encoded: String = url::form_urlencoded::byte_serialize(message.as_bytes()).collect();
    object.insert(
        CONTACT_LINK_FIELD.into(),
        serde_json::Value::String(format!(
            "https://wa.me/{}?text={encoded}",
            contact.whatsapp_number
        )),
    );
    output
}

fn failure_diagnostic(details: Option<&serde_json::Value>, now: DateTime<Utc>) -> SimulationError {
    let field = |key: &str| {
        details
            .and_then(|d| d.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    SimulationError {
        kind: field("kind").unwrap_or_else(|| ERROR_WORKFLOW_FAILED.into()),
        message: field("message")
            .or_else(|| field("error"))
            .unwrap_or_else(|| "Workflow reported a failure without details".into()),
        details: details.cloned(),
        occurred_at: now,
    }
}

// ── Reconciler ─────────────────────────────────────────────────────

/// What a successful reconcile did.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub simulation_id: SimulationId,
    pub status: SimulationStatus,
    pub percentage: u8,
}

pub struct WebhookReconciler<'a> {
    store: &'a SimStore,
    webhook: &'a WebhookConfig,
    contact: &'a ContactConfig,
    clock: &'a dyn Clock,
}

impl<'a> WebhookReconciler<'a> {
    pub fn new(
        store: &'a SimStore,
        webhook: &'a WebhookConfig,
        contact: &'a ContactConfig,
        clock: &'a dyn Clock,
    ) -> Self {
        Self { store, webhook, contact, clock }
    }

    /// Apply a raw callback body. `header_signature` is the value of the
    /// configured signature header, if the request carried one.
    pub fn reconcile(&self, body: &[u8], header_signature: Option<&str>) -> bool {
        match self.reconcile_detailed(body, header_signature) {
            Ok(outcome) => {
                log::debug!(
                    "callback accepted for {} ({}, {}%)",
                    outcome.simulation_id,
                    outcome.status,
                    outcome.percentage
                );
                true
            }
            Err(err) => {
                let simulation_id = match &err {
                    SimError::StaleCallback { simulation_id, .. } => {
                        log::warn!("{err}");
                        Some(simulation_id.clone())
                    }
                    _ => {
                        log::warn!("callback rejected: {err}");
                        None
                    }
                };
                let event = LifecycleEvent::CallbackRejected {
                    simulation_id,
                    reason: err.to_string(),
                };
                if let Err(log_err) = self.log_event(&event) {
                    log::error!("could not record rejected callback: {log_err}");
                }
                false
            }
        }
    }

    pub fn reconcile_detailed(
        &self,
        body: &[u8],
        header_signature: Option<&str>,
    ) -> SimResult<ReconcileOutcome> {
        let raw: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| SimError::InvalidCallback(format!("body is not JSON: {e}")))?;
        self.verify(body, &raw, header_signature)?;

        let payload: CallbackPayload = serde_json::from_value(raw)
            .map_err(|e| SimError::InvalidCallback(format!("malformed payload: {e}")))?;
        let correlation_id = payload
            .correlation_id
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| SimError::InvalidCallback("missing correlationId".into()))?;

        let record = self.store.find_by_correlation(correlation_id)?.ok_or_else(|| {
            SimError::InvalidCallback(format!("unknown correlationId '{correlation_id}'"))
        })?;
        if record.status.is_terminal() {
            return Err(stale(&record));
        }

        let outcome = payload.classify()?;
        self.apply(&record.id, &outcome)
    }

    fn verify(
        &self,
        body: &[u8],
        raw: &serde_json::Value,
        header_signature: Option<&str>,
    ) -> SimResult<()> {
        let Some(secret) = self.webhook.secret.as_deref() else {
            return Ok(());
        };
        let valid = match header_signature {
            Some(sig) => signature::verify(secret, body, sig),
            None => match signature::split_embedded(raw) {
                Some((signed, sig)) => signature::verify(secret, &signed, &sig),
                None => return Err(SimError::InvalidCallback("missing signature".into())),
            },
        };
        if valid {
            Ok(())
        } else {
            Err(SimError::InvalidCallback("signature mismatch".into()))
        }
    }

    /// The record write, its metric and its audit event land in one
    /// transaction. A failure anywhere leaves the record as it was, so the
    /// engine's retry of the same callback is still accepted.
    fn apply(&self, simulation_id: &str, outcome: &CallbackOutcome) -> SimResult<ReconcileOutcome> {
        let now = self.clock.now();
        let (record, duration) = self.store.in_transaction(|store| {
            let (record, duration) = store.modify_simulation(simulation_id, |r| {
                if r.status.is_terminal() {
                    return Err(stale(r));
                }
                match outcome {
                    CallbackOutcome::Progress(update) => {
                        r.apply_progress(update, now)?;
                        Ok(None)
                    }
                    CallbackOutcome::Success { result, reported_seconds } => {
                        let duration = (*reported_seconds)
                            .filter(|s| s.is_finite() && *s >= 0.0)
                            .map(|s| s.round() as i64)
                            .unwrap_or_else(|| r.elapsed_seconds(now));
                        let output = ensure_contact_link(result.clone(), self.contact);
                        r.complete(output, duration, now)?;
                        Ok(Some(duration))
                    }
                    CallbackOutcome::Failure { details } => {
                        r.fail(failure_diagnostic(details.as_ref(), now), now)?;
                        Ok(None)
                    }
                }
            })?;

            let metrics = MetricsAggregator::new(store, self.clock);
            let event = match record.status {
                SimulationStatus::Completed => {
                    metrics.record_completed(duration)?;
                    LifecycleEvent::SimulationCompleted {
                        simulation_id: record.id.clone(),
                        duration_seconds: duration.unwrap_or(0),
                    }
                }
                SimulationStatus::Failed => {
                    metrics.record_failed()?;
                    LifecycleEvent::SimulationFailed {
                        simulation_id: record.id.clone(),
                        kind: record
                            .error
                            .as_ref()
                            .map(|e| e.kind.clone())
                            .unwrap_or_default(),
                    }
                }
                _ => LifecycleEvent::ProgressUpdated {
                    simulation_id: record.id.clone(),
                    percentage: record.progress.percentage,
                    current_step: record.progress.current_step.clone(),
                },
            };
            self.log_event(&event)?;
            Ok((record, duration))
        })?;

        match record.status {
            SimulationStatus::Completed => log::info!(
                "simulation {} completed in {}s",
                record.id,
                duration.unwrap_or(0)
            ),
            SimulationStatus::Failed => log::info!(
                "simulation {} failed ({})",
                record.id,
                record.error.as_ref().map(|e| e.kind.as_str()).unwrap_or_default()
            ),
            _ => {}
        }

        Ok(ReconcileOutcome {
            simulation_id: record.id.clone(),
            status: record.status,
            percentage: record.progress.percentage,
        })
    }

    fn log_event(&self, event: &LifecycleEvent) -> SimResult<()> {
        self.store
            .append_event(&EventLogEntry::from_event(event, self.clock.now())?)
    }
}

fn stale(record: &SimulationRecord) -> SimError {
    SimError::StaleCallback {
        simulation_id: record.id.clone(),
        status: record.status.to_string(),
    }
}
