//! Simulation records and their status machine.
//!
//!   pending -> processing -> { completed | failed }
//!
//! RULES:
//!   - `output` is Some exactly when status is completed.
//!   - `error` is Some exactly when status is failed.
//!   - Terminal records never change again. Regeneration creates a new record.
//!   - Progress is merged field by field; absent fields keep their prior value.

use crate::{
    error::{SimError, SimResult},
    types::{CorrelationId, OwnerRef, SimulationId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SimulationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SimulationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Progress updates are modelled as processing -> processing.
    pub fn can_transition_to(&self, next: SimulationStatus) -> bool {
        use SimulationStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }
}

impl fmt::Display for SimulationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SimulationStatus {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SimError::Other(anyhow::anyhow!(
                "unknown simulation status '{other}'"
            ))),
        }
    }
}

// ── Progress ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Progress {
    pub percentage: u8,
    pub current_step: String,
    pub steps_completed: Vec<String>,
    pub steps_remaining: Vec<String>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A partial progress report. `None` means "not reported", never "clear".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub percentage: Option<f64>,
    pub current_step: Option<String>,
    pub steps_completed: Option<Vec<String>>,
    pub steps_remaining: Option<Vec<String>>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl ProgressUpdate {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Clamp to [0, 100]. NaN counts as 0.
pub fn clamp_percentage(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

impl Progress {
    pub fn queued(steps: &[String], at: DateTime<Utc>) -> Self {
        Self {
            percentage: 0,
            current_step: "queued".into(),
            steps_completed: Vec::new(),
            steps_remaining: steps.to_vec(),
            estimated_completion: None,
            updated_at: at,
        }
    }

    /// Override only the fields the update carries.
    pub fn merge(&self, update: &ProgressUpdate, at: DateTime<Utc>) -> Progress {
        Progress {
            percentage: update
                .percentage
                .map(clamp_percentage)
                .unwrap_or(self.percentage),
            current_step: update
                .current_step
                .clone()
                .unwrap_or_else(|| self.current_step.clone()),
            steps_completed: update
                .steps_completed
                .clone()
                .unwrap_or_else(|| self.steps_completed.clone()),
            steps_remaining: update
                .steps_remaining
                .clone()
                .unwrap_or_else(|| self.steps_remaining.clone()),
            estimated_completion: update.estimated_completion.or(self.estimated_completion),
            updated_at: at,
        }
    }
}

// ── Error diagnostics ──────────────────────────────────────────────

pub const ERROR_DISPATCH_FAILED: &str = "workflow_dispatch_failed";
pub const ERROR_WORKFLOW_FAILED: &str = "workflow_failed";
pub const ERROR_PROCESSING_TIMEOUT: &str = "processing_timeout";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationError {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

// ── Record ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationRecord {
    pub id: SimulationId,
    pub owner: OwnerRef,
    pub parent_id: Option<SimulationId>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub status: SimulationStatus,
    pub correlation_id: Option<CorrelationId>,
    pub progress: Progress,
    pub error: Option<SimulationError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    /// Bumped on every persisted mutation; used for compare-and-swap updates.
    pub version: i64,
}

impl SimulationRecord {
    pub fn new_pending(
        owner: OwnerRef,
        input: serde_json::Value,
        parent_id: Option<SimulationId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner,
            parent_id,
            input,
            output: None,
            status: SimulationStatus::Pending,
            correlation_id: None,
            progress: Progress::queued(&[], now),
            error: None,
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            processing_completed_at: None,
            duration_seconds: None,
            version: 0,
        }
    }

    fn transition(&mut self, next: SimulationStatus) -> SimResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(SimError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn begin_processing(
        &mut self,
        correlation_id: CorrelationId,
        steps: &[String],
        now: DateTime<Utc>,
    ) -> SimResult<()> {
        if self.status != SimulationStatus::Pending {
            return Err(SimError::InvalidTransition {
                from: self.status.to_string(),
                to: SimulationStatus::Processing.to_string(),
            });
        }
        self.transition(SimulationStatus::Processing)?;
        self.correlation_id = Some(correlation_id);
        self.processing_started_at = Some(now);
        self.progress = Progress {
            current_step: "dispatched".into(),
            ..Progress::queued(steps, now)
        };
        self.updated_at = now;
        Ok(())
    }

    pub fn apply_progress(&mut self, update: &ProgressUpdate, now: DateTime<Utc>) -> SimResult<()> {
        // Only a dispatched record reports progress; pending -> processing
        // belongs to begin_processing.
        if self.status != SimulationStatus::Processing {
            return Err(SimError::InvalidTransition {
                from: self.status.to_string(),
                to: SimulationStatus::Processing.to_string(),
            });
        }
        self.progress = self.progress.merge(update, now);
        self.updated_at = now;
        Ok(())
    }

    pub fn complete(
        &mut self,
        output: serde_json::Value,
        duration_seconds: i64,
        now: DateTime<Utc>,
    ) -> SimResult<()> {
        self.transition(SimulationStatus::Completed)?;
        self.output = Some(output);
        self.processing_completed_at = Some(now);
        self.duration_seconds = Some(duration_seconds.max(0));
        let remaining = std::mem::take(&mut self.progress.steps_remaining);
        self.progress.steps_completed.extend(remaining);
        self.progress.percentage = 100;
        self.progress.current_step = "completed".into();
        self.progress.updated_at = now;
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, error: SimulationError, now: DateTime<Utc>) -> SimResult<()> {
        self.transition(SimulationStatus::Failed)?;
        self.error = Some(error);
        self.processing_completed_at = Some(now);
        self.duration_seconds = self
            .processing_started_at
            .map(|started| (now - started).num_seconds().max(0));
        self.progress.current_step = "failed".into();
        self.progress.updated_at = now;
        self.updated_at = now;
        Ok(())
    }

    /// Seconds since processing started, or 0 if it never did.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        self.processing_started_at
            .map(|started| (now - started).num_seconds().max(0))
            .unwrap_or(0)
    }

    /// The output/error invariants. Used by tests and debug assertions.
    pub fn invariants_hold(&self) -> bool {
        let output_ok = self.output.is_some() == (self.status == SimulationStatus::Completed);
        let error_ok = self.error.is_some() == (self.status == SimulationStatus::Failed);
        let correlation_ok =
            self.status == SimulationStatus::Pending || self.correlation_id.is_some();
        output_ok && error_ok && correlation_ok && self.progress.percentage <= 100
    }

    pub fn status_view(&self) -> StatusView {
        StatusView {
            id: self.id.clone(),
            status: self.status,
            progress_percentage: self.progress.percentage,
            current_step: self.progress.current_step.clone(),
            steps_completed: self.progress.steps_completed.clone(),
            steps_remaining: self.progress.steps_remaining.clone(),
            estimated_completion: self.progress.estimated_completion,
            error: self.error.as_ref().map(|e| e.kind.clone()),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// The client-facing status query shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub id: SimulationId,
    pub status: SimulationStatus,
    pub progress_percentage: u8,
    pub current_step: String,
    pub steps_completed: Vec<String>,
    pub steps_remaining: Vec<String>,
    pub estimated_completion: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
