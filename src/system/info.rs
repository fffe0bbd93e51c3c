use std::sync::Arc;

use node_core::collaborators::SystemInfoSource;
use node_core::storage::Storage;
use node_core::{version, SharedConnectivity};
use serde_json::{json, Map, Value};

use crate::system::reset;

/// Snapshot for `GET /sysinfo`
pub struct DeviceInfo {
    connectivity: SharedConnectivity,
    storage: Arc<dyn Storage>,
    install_dir: String,
}

impl DeviceInfo {
    pub fn new(connectivity: SharedConnectivity, storage: Arc<dyn Storage>, install_dir: &str) -> Self {
        Self {
            connectivity,
            storage,
            install_dir: install_dir.to_string(),
        }
    }
}

pub fn free_heap() -> u32 {
    unsafe { esp_idf_sys::esp_get_free_heap_size() }
}

pub fn min_free_heap() -> u32 {
    unsafe { esp_idf_sys::esp_get_minimum_free_heap_size() }
}

pub fn uptime_secs() -> u64 {
    let us = unsafe { esp_idf_sys::esp_timer_get_time() };
    (us.max(0) as u64) / 1_000_000
}

pub fn format_uptime(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

impl SystemInfoSource for DeviceInfo {
    fn collect(&self) -> Map<String, Value> {
        let mut info = Map::new();
        info.insert("firmware".into(), json!(env!("CARGO_PKG_VERSION")));
        info.insert(
            "app_version".into(),
            json!(version::read(self.storage.as_ref(), &self.install_dir)),
        );
        info.insert("free_heap".into(), json!(free_heap()));
        info.insert("min_free_heap".into(), json!(min_free_heap()));
        info.insert("uptime".into(), json!(format_uptime(uptime_secs())));
        info.insert("reset_reason".into(), json!(reset::get_reset_reason()));

        // The portal handler does not hold the lock here, but a long connect
        // might; report what we can instead of waiting
        match self.connectivity.try_lock() {
            Ok(machine) => {
                let status = machine.status();
                match serde_json::to_value(status) {
                    Ok(Value::Object(fields)) => info.extend(fields),
                    Ok(_) => {}
                    Err(e) => log::warn!("sysinfo: status not serializable: {}", e),
                }
                info.insert("local_time".into(), json!(machine.local_time()));
            }
            Err(_) => {
                info.insert("connectivity".into(), json!("busy"));
            }
        }
        info
    }
}
