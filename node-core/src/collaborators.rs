//! Contracts for the telemetry and system-introspection collaborators.

use serde_json::{Map, Value};

/// Best-effort event sink. Implementations must not block for long; callers
/// log and ignore errors.
pub trait Telemetry: Send + Sync {
    fn notify(&self, event: &str, payload: &Value) -> anyhow::Result<()>;
}

pub trait SystemInfoSource: Send + Sync {
    fn collect(&self) -> Map<String, Value>;
}

/// Sends an event, logging instead of failing.
pub fn notify_best_effort(telemetry: &dyn Telemetry, event: &str, payload: &Value) {
    if let Err(e) = telemetry.notify(event, payload) {
        log::warn!("telemetry: '{}' not delivered: {:?}", event, e);
    }
}
