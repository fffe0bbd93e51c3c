use std::sync::atomic::{AtomicU32, Ordering};

use node_core::collaborators::Telemetry;
use serde::Serialize;
use serde_json::Value;

/// One telemetry event as written to the log
#[derive(Serialize)]
struct EventRecord<'a> {
    seq: u32,
    uptime_s: u64,
    event: &'a str,
    payload: &'a Value,
}

/// Telemetry sink that emits each event as a JSON log line
#[derive(Default)]
pub struct LogTelemetry {
    seq: AtomicU32,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Telemetry for LogTelemetry {
    fn notify(&self, event: &str, payload: &Value) -> anyhow::Result<()> {
        let record = EventRecord {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            uptime_s: crate::system::info::uptime_secs(),
            event,
            payload,
        };
        log::info!("telemetry {}", serde_json::to_string(&record)?);
        Ok(())
    }
}
