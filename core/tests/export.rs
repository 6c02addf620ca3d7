mod common;

use common::{brief, callback, clock, engine, user, FakeTransport};
use simlab_core::{
    error::{SimError, SimResult},
    export::{ExportFormat, ExportRenderer, JsonRenderer},
    simulation::SimulationRecord,
};

#[test]
fn processing_record_is_not_exportable() {
    let clock = clock();
    let transport = FakeTransport::ok();
    let engine = engine(&clock, &transport);
    let record = engine.submit(&user("u1"), brief()).unwrap();

    let err = engine
        .export(&record.id, ExportFormat::Json, &JsonRenderer)
        .unwrap_err();
    assert!(matches!(err, SimError::NotExportable { .. }));
    assert_eq!(err.code(), "NOT_EXPORTABLE");
}

#[test]
fn failed_record_is_not_exportable() {
    let clock = clock();
    let transport = FakeTransport::ok();
    let engine = engine(&clock, &transport);
    let record = engine.submit(&user("u1"), brief()).unwrap();
    callback(&engine, serde_json::json!({
        "correlationId": record.correlation_id.unwrap(), "status": "failed"
    }));

    assert!(matches!(
        engine.export(&record.id, ExportFormat::Json, &JsonRenderer),
        Err(SimError::NotExportable { .. })
    ));
}

#[test]
fn completed_record_exports_as_json() {
    let clock = clock();
    let transport = FakeTransport::ok();
    let engine = engine(&clock, &transport);
    let record = engine.submit(&user("u1"), brief()).unwrap();
    assert!(callback(&engine, serde_json::json!({
        "correlationId": record.correlation_id.unwrap(),
        "status": "completed",
        "resultData": { "name": "Glow Serum", "ingredients": ["niacinamide"] },
        "processingTimeSeconds": 42
    })));

    let bytes = engine
        .export(&record.id, ExportFormat::Json, &JsonRenderer)
        .unwrap();
    let document: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(document["simulation_id"], record.id.as_str());
    assert_eq!(document["duration_seconds"], 42);
    assert_eq!(document["result"]["name"], "Glow Serum");
    assert!(document["result"]["cta_whatsapp_url"].is_string());
    assert_eq!(document["input"], brief());
}

#[test]
fn unsupported_format_is_refused_by_the_json_renderer() {
    let clock = clock();
    let transport = FakeTransport::ok();
    let engine = engine(&clock, &transport);
    let record = engine.submit(&user("u1"), brief()).unwrap();
    callback(&engine, serde_json::json!({
        "correlationId": record.correlation_id.unwrap(),
        "status": "completed",
        "resultData": { "name": "X" }
    }));

    let err = engine
        .export(&record.id, ExportFormat::Docx, &JsonRenderer)
        .unwrap_err();
    assert!(matches!(err, SimError::ValidationFailed(_)));
}

struct StubPdf;

impl ExportRenderer for StubPdf {
    fn supports(&self, format: ExportFormat) -> bool {
        format == ExportFormat::Pdf
    }

    fn render(
        &self,
        record: &SimulationRecord,
        output: &serde_json::Value,
        _format: ExportFormat,
    ) -> SimResult<Vec<u8>> {
        Ok(format!("%PDF {} {}", record.id, output["name"]).into_bytes())
    }
}

#[test]
fn custom_renderers_receive_the_output() {
    let clock = clock();
    let transport = FakeTransport::ok();
    let engine = engine(&clock, &transport);
    let record = engine.submit(&user("u1"), brief()).unwrap();
    callback(&engine, serde_json::json!({
        "correlationId": record.correlation_id.unwrap(),
        "status": "completed",
        "resultData": { "name": "X" }
    }));

    let bytes = engine.export(&record.id, ExportFormat::Pdf, &StubPdf).unwrap();
    assert!(String::from_utf8(bytes).unwrap().starts_with("%PDF "));
}

#[test]
fn format_names_parse() {
    assert_eq!("PDF".parse::<ExportFormat>().unwrap(), ExportFormat::Pdf);
    assert_eq!("word".parse::<ExportFormat>().unwrap(), ExportFormat::Docx);
    assert_eq!(ExportFormat::Png.content_type(), "image/png");
    assert!("xlsx".parse::<ExportFormat>().is_err());
}
