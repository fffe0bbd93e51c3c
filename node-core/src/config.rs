/// Device settings that can be tested independently of NVS
use serde::{Deserialize, Serialize};

use crate::connectivity::ConnectivitySettings;
use crate::fetcher::RepoConfig;
use crate::installer::InstallerConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    // Release source
    pub github_repo: String,
    pub github_token: Option<String>,
    pub github_src_dir: String,
    pub main_dir: String,
    pub staging_dir: String,
    pub secret_files: Vec<String>,

    // Network
    pub hostname: String,
    pub ap_password: String,
    pub ntp_host: String,
    pub tz_offset_hours: i32,
    pub keepalive_sec: u64,
    pub connect_timeout_ms: u64,

    // Watchdog
    pub watchdog_timeout_ms: u32,
    pub watchdog_feed_ms: u32,
    pub watchdog_timer_id: Option<i32>,

    // OTA settings
    pub ota_enabled: bool,
    pub ota_check_interval_hours: u32,

    /// Serial log level name (`error` .. `trace`)
    pub log_level: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            github_repo: String::new(),
            github_token: None,
            github_src_dir: String::new(),
            main_dir: "main".to_string(),
            staging_dir: "next".to_string(),
            secret_files: Vec::new(),
            hostname: "esp32-home".to_string(),
            ap_password: "12345678".to_string(),
            ntp_host: "pool.ntp.org".to_string(),
            tz_offset_hours: 7,
            keepalive_sec: 8,
            connect_timeout_ms: 10_000,
            watchdog_timeout_ms: 15_000,
            watchdog_feed_ms: 3_000,
            watchdog_timer_id: Some(0),
            ota_enabled: true,
            ota_check_interval_hours: 24,
            log_level: "info".to_string(),
        }
    }
}

impl DeviceConfig {
    /// Pulls out-of-range values back to something the hardware accepts.
    /// Returns true when anything changed.
    pub fn sanitize(&mut self) -> bool {
        let before = self.clone();
        let defaults = Self::default();

        // WPA2 needs 8..=63 characters; empty means an open AP
        if !self.ap_password.is_empty() && !(8..=63).contains(&self.ap_password.len()) {
            self.ap_password = defaults.ap_password;
        }
        if self.main_dir.trim_matches('/').is_empty() {
            self.main_dir = defaults.main_dir;
        }
        if self.staging_dir.trim_matches('/').is_empty() || self.staging_dir == self.main_dir {
            self.staging_dir = defaults.staging_dir;
        }
        self.tz_offset_hours = self.tz_offset_hours.clamp(-12, 14);
        self.keepalive_sec = self.keepalive_sec.max(1);
        self.watchdog_timeout_ms = self.watchdog_timeout_ms.max(1_000);
        if self.watchdog_feed_ms == 0 || self.watchdog_feed_ms >= self.watchdog_timeout_ms {
            self.watchdog_feed_ms = self.watchdog_timeout_ms / 5;
        }
        self.ota_check_interval_hours = self.ota_check_interval_hours.max(1);
        if self.log_level.trim().is_empty() {
            self.log_level = defaults.log_level;
        }
        if self.github_token.as_deref().is_some_and(str::is_empty) {
            self.github_token = None;
        }

        *self != before
    }

    pub fn repo_config(&self) -> RepoConfig {
        RepoConfig {
            repo: self.github_repo.clone(),
            src_dir: self.github_src_dir.clone(),
            main_dir: self.main_dir.clone(),
            token: self.github_token.clone(),
        }
    }

    pub fn installer_config(&self) -> InstallerConfig {
        InstallerConfig {
            main_dir: self.main_dir.clone(),
            staging_dir: self.staging_dir.clone(),
            backup_dir: format!("{}.bak", self.main_dir.trim_matches('/')),
            secret_files: self.secret_files.clone(),
            ..Default::default()
        }
    }

    /// Longest single SNTP wait; stays two feed periods inside the
    /// watchdog timeout.
    pub fn sntp_wait_ms(&self) -> u64 {
        let window = self.watchdog_timeout_ms.saturating_sub(self.watchdog_feed_ms.saturating_mul(2));
        u64::from(window).clamp(1_000, 10_000)
    }

    pub fn connectivity_settings(&self) -> ConnectivitySettings {
        ConnectivitySettings {
            connect_timeout_ms: self.connect_timeout_ms,
            ap_password: self.ap_password.clone(),
            ..Default::default()
        }
    }
}
