use crate::types::SimulationId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Daily quota exceeded: {used}/{limit} used on tier '{tier}'")]
    QuotaExceeded { limit: u32, used: u32, tier: String },

    #[error("Workflow dispatch failed for simulation {simulation_id}: {reason}")]
    DispatchFailed {
        simulation_id: SimulationId,
        reason: String,
    },

    #[error("Invalid callback: {0}")]
    InvalidCallback(String),

    #[error("Stale callback for simulation {simulation_id} (already {status})")]
    StaleCallback {
        simulation_id: SimulationId,
        status: String,
    },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Simulation '{id}' not found")]
    NotFound { id: String },

    #[error("Simulation '{id}' is not exportable (status {status})")]
    NotExportable { id: SimulationId, status: String },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SimError {
    /// Stable machine-readable code, used by the runner's error responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::DispatchFailed { .. } => "DISPATCH_FAILED",
            Self::InvalidCallback(_) => "INVALID_CALLBACK",
            Self::StaleCallback { .. } => "STALE_CALLBACK",
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::NotExportable { .. } => "NOT_EXPORTABLE",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }
}

pub type SimResult<T> = Result<T, SimError>;
