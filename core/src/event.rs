//! Lifecycle events: the audit trail of every simulation.
//!
//! RULE: Every status change and every rejected callback is appended
//! to the event log. Variants are only ever added, never reordered.

use crate::types::{CorrelationId, OwnerKey, SimulationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    // ── Admission ──────────────────────────────────
    SimulationRequested {
        simulation_id: SimulationId,
        owner: OwnerKey,
        regeneration_of: Option<SimulationId>,
    },
    QuotaRejected {
        owner: OwnerKey,
        tier: String,
        limit: u32,
        used: u32,
    },

    // ── Dispatch ───────────────────────────────────
    WorkflowDispatched {
        simulation_id: SimulationId,
        correlation_id: CorrelationId,
    },
    DispatchFailed {
        simulation_id: SimulationId,
        reason: String,
    },

    // ── Callbacks ──────────────────────────────────
    ProgressUpdated {
        simulation_id: SimulationId,
        percentage: u8,
        current_step: String,
    },
    SimulationCompleted {
        simulation_id: SimulationId,
        duration_seconds: i64,
    },
    SimulationFailed {
        simulation_id: SimulationId,
        kind: String,
    },
    CallbackRejected {
        simulation_id: Option<SimulationId>,
        reason: String,
    },
}

impl LifecycleEvent {
    /// Stable name for the event_type column.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SimulationRequested { .. } => "simulation_requested",
            Self::QuotaRejected { .. } => "quota_rejected",
            Self::WorkflowDispatched { .. } => "workflow_dispatched",
            Self::DispatchFailed { .. } => "dispatch_failed",
            Self::ProgressUpdated { .. } => "progress_updated",
            Self::SimulationCompleted { .. } => "simulation_completed",
            Self::SimulationFailed { .. } => "simulation_failed",
            Self::CallbackRejected { .. } => "callback_rejected",
        }
    }

    pub fn simulation_id(&self) -> Option<&str> {
        match self {
            Self::SimulationRequested { simulation_id, .. }
            | Self::WorkflowDispatched { simulation_id, .. }
            | Self::DispatchFailed { simulation_id, .. }
            | Self::ProgressUpdated { simulation_id, .. }
            | Self::SimulationCompleted { simulation_id, .. }
            | Self::SimulationFailed { simulation_id, .. } => Some(simulation_id),
            Self::CallbackRejected { simulation_id, .. } => simulation_id.as_deref(),
            Self::QuotaRejected { .. } => None,
        }
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    pub simulation_id: Option<SimulationId>,
    pub event_type: String,
    pub payload: String, // JSON-serialized LifecycleEvent
    pub created_at: DateTime<Utc>,
}

impl EventLogEntry {
    pub fn from_event(event: &LifecycleEvent, at: DateTime<Utc>) -> serde_json::Result<Self> {
        Ok(Self {
            id: None,
            simulation_id: event.simulation_id().map(str::to_string),
            event_type: event.type_name().to_string(),
            payload: serde_json::to_string(event)?,
            created_at: at,
        })
    }

    pub fn decode(&self) -> serde_json::Result<LifecycleEvent> {
        serde_json::from_str(&self.payload)
    }
}
