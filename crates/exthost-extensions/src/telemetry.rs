//! Telemetry sink.
//!
//! The engine reports `activateExtension`, `deactivateExtension`, and
//! `removeExtension` events with a JSON attribute bag.  Recording is
//! best-effort: a failing sink never affects the lifecycle.

use serde_json::Value;

pub const ACTIVATE_EVENT: &str = "activateExtension";
pub const DEACTIVATE_EVENT: &str = "deactivateExtension";
pub const REMOVE_EVENT: &str = "removeExtension";

/// Receives engine telemetry.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &str, attributes: &Value) -> Result<(), String>;
}

/// Forwards telemetry to `tracing` under the `exthost::telemetry` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: &str, attributes: &Value) -> Result<(), String> {
        tracing::info!(target: "exthost::telemetry", event, attributes = %attributes, "telemetry");
        Ok(())
    }
}

/// Record `event`, swallowing sink failures.
pub(crate) fn record_best_effort(sink: &dyn TelemetrySink, event: &str, attributes: Value) {
    if let Err(e) = sink.record(event, &attributes) {
        tracing::debug!(event, error = %e, "telemetry sink rejected event");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
