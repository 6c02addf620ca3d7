//! Report export.
//!
//! Only completed records with an output can be exported. JSON is
//! rendered here; document formats are supplied by an `ExportRenderer`.

use crate::{
    error::{SimError, SimResult},
    simulation::{SimulationRecord, SimulationStatus},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Pdf,
    Docx,
    Png,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Png => "png",
            Self::Json => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            Self::Png => "image/png",
            Self::Json => "application/json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Ok(Self::Pdf),
            "docx" | "word" => Ok(Self::Docx),
            "png" => Ok(Self::Png),
            "json" => Ok(Self::Json),
            other => Err(SimError::ValidationFailed(format!(
                "unsupported export format '{other}'"
            ))),
        }
    }
}

/// Turns a completed simulation's output into a document.
pub trait ExportRenderer {
    fn supports(&self, format: ExportFormat) -> bool;

    fn render(
        &self,
        record: &SimulationRecord,
        output: &serde_json::Value,
        format: ExportFormat,
    ) -> SimResult<Vec<u8>>;
}

/// The export precondition: completed, with an output.
pub fn exportable_output(record: &SimulationRecord) -> SimResult<&serde_json::Value> {
    match (&record.status, &record.output) {
        (SimulationStatus::Completed, Some(output)) => Ok(output),
        _ => Err(SimError::NotExportable {
            id: record.id.clone(),
            status: record.status.to_string(),
        }),
    }
}

pub fn export(
    record: &SimulationRecord,
    format: ExportFormat,
    renderer: &dyn ExportRenderer,
) -> SimResult<Vec<u8>> {
    let output = exportable_output(record)?;
    if !renderer.supports(format) {
        return Err(SimError::ValidationFailed(format!(
            "no renderer installed for {format}"
        )));
    }
    renderer.render(record, output, format)
}

/// Pretty-printed JSON report.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRenderer;

impl ExportRenderer for JsonRenderer {
    fn supports(&self, format: ExportFormat) -> bool {
        format == ExportFormat::Json
    }

    fn render(
        &self,
        record: &SimulationRecord,
        output: &serde_json::Value,
        _format: ExportFormat,
    ) -> SimResult<Vec<u8>> {
        let document = serde_json::json!({
            "simulation_id": record.id,
            "parent_id": record.parent_id,
            "generated_at": record.processing_completed_at,
            "duration_seconds": record.duration_seconds,
            "input": record.input,
            "result": output,
        });
        Ok(serde_json::to_vec_pretty(&document)?)
    }
}
