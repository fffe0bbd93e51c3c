//! Captive configuration portal served from the fallback access point.
//!
//! The portal owns no radio state of its own: it composes the shared
//! connectivity machine, an update checker and an optional system-info
//! source.

pub mod http;
mod page;

use std::sync::{Arc, MutexGuard};

use anyhow::anyhow;
use serde::Serialize;
use serde_json::{json, Value};

use crate::collaborators::SystemInfoSource;
use crate::connectivity::{self, ConnectivityStateMachine, SharedConnectivity};
use crate::credentials::NetworkCredentials;
use crate::error::ConfigError;
use crate::installer::UpdateCheck;

pub use http::{Request, Response, MAX_BODY_BYTES};

#[derive(Serialize)]
struct ScanEntry<'a> {
    ssid: &'a str,
    rssi: i8,
    secure: bool,
    hidden: bool,
}

pub struct ConfigPortal {
    connectivity: SharedConnectivity,
    updates: Arc<dyn UpdateCheck>,
    system_info: Option<Arc<dyn SystemInfoSource>>,
}

impl ConfigPortal {
    pub fn new(connectivity: SharedConnectivity, updates: Arc<dyn UpdateCheck>) -> Self {
        Self {
            connectivity,
            updates,
            system_info: None,
        }
    }

    pub fn with_system_info(mut self, source: Arc<dyn SystemInfoSource>) -> Self {
        self.system_info = Some(source);
        self
    }

    pub fn connectivity(&self) -> &SharedConnectivity {
        &self.connectivity
    }

    /// Routes one request. Never fails: errors become 500.
    pub fn handle(&self, request: &Request) -> Response {
        if request.body.len() > MAX_BODY_BYTES {
            log::warn!("portal: {} body of {} bytes rejected", request.path, request.body.len());
            return Response::status(413);
        }
        let result = match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/") => Ok(Response::html(page::INDEX_HTML)),
            ("GET", "/scan") => self.scan(),
            ("GET", "/sysinfo") => Ok(self.sysinfo()),
            ("POST", "/save") => self.save(request),
            ("POST", "/ota/check") => Ok(self.ota_check()),
            _ => Ok(Response::status(404)),
        };
        result.unwrap_or_else(|e| {
            log::error!("portal: {} {} failed: {:#}", request.method, request.path, e);
            Response::status(500)
        })
    }

    fn machine(&self) -> anyhow::Result<MutexGuard<'_, ConnectivityStateMachine>> {
        self.connectivity
            .lock()
            .map_err(|_| anyhow!("connectivity lock poisoned"))
    }

    fn scan(&self) -> anyhow::Result<Response> {
        let networks = self.machine()?.scan(3, 250, true);
        let entries: Vec<ScanEntry<'_>> = networks
            .iter()
            .map(|n| ScanEntry {
                ssid: &n.ssid,
                rssi: n.rssi,
                secure: n.secure,
                hidden: n.hidden,
            })
            .collect();
        Ok(Response::json(200, &entries))
    }

    fn save(&self, request: &Request) -> anyhow::Result<Response> {
        let form = http::parse_form(&request.body);
        let field = |name: &str| {
            form.iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.trim().to_string())
                .unwrap_or_default()
        };
        let hostname = field("hostname");
        let creds = NetworkCredentials {
            ssid: field("ssid"),
            password: field("password"),
            hostname: (!hostname.is_empty()).then_some(hostname),
        };
        if let Err(e) = creds.validate() {
            return Ok(rejected(&creds.ssid, &e));
        }

        let (timeout_ms, poll_ms) = {
            let mut machine = self.machine()?;
            if let Err(e) = machine.save_credentials(&creds) {
                return Ok(rejected(&creds.ssid, &e));
            }
            log::info!("portal: credentials for '{}' saved", creds.ssid);
            machine.connect(&creds, false, true);
            let settings = machine.settings();
            (settings.connect_timeout_ms, settings.poll_interval_ms)
        };

        // lock released so the watchdog tick keeps running while we wait
        let ok = connectivity::wait_for_station(&self.connectivity, timeout_ms, poll_ms);
        let ip = match self.machine()?.ip_info() {
            Some(info) => serde_json::to_value(info)?,
            None => json!({}),
        };
        Ok(Response::json(
            200,
            &json!({
                "ok": ok,
                "message": if ok { "connected" } else { "connect failed" },
                "ip": ip,
                "ssid": creds.ssid,
            }),
        ))
    }

    fn ota_check(&self) -> Response {
        let ok = self.updates.check_for_update();
        Response::json(
            200,
            &json!({
                "ok": ok,
                "message": if ok { "reboot to install" } else { "no update" },
            }),
        )
    }

    fn sysinfo(&self) -> Response {
        match &self.system_info {
            Some(source) => Response::json(200, &Value::Object(source.collect())),
            None => Response::status(404),
        }
    }
}

fn rejected(ssid: &str, err: &ConfigError) -> Response {
    Response::json(
        400,
        &json!({ "ok": false, "message": err.to_string(), "ip": {}, "ssid": ssid }),
    )
}
