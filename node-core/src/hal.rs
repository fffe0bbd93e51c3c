//! Hardware capability surfaces.
//!
//! The firmware implements these on top of ESP-IDF; tests substitute fakes.
//! Everything the connectivity machine touches arrives through
//! [`DeviceContext`], there are no hidden globals.

use std::sync::Arc;

use serde::Serialize;

use crate::credentials::CredentialStore;
use crate::error::{NetworkError, RadioError, TimerError};

/// One network seen by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub ssid: String,
    pub channel: u8,
    pub rssi: i8,
    pub secure: bool,
    pub hidden: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IpInfo {
    pub ip: String,
    pub mask: String,
    pub gw: String,
    pub dns: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointConfig {
    pub ssid: String,
    /// Empty means an open network.
    pub password: String,
    pub channel: u8,
    pub hidden: bool,
}

/// Station + access point radio.
pub trait RadioInterface: Send {
    fn set_station_active(&mut self, active: bool) -> Result<(), RadioError>;
    fn station_active(&self) -> bool;
    fn set_hostname(&mut self, hostname: &str) -> Result<(), RadioError>;
    /// Starts an association attempt; does not wait for it.
    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), RadioError>;
    fn disconnect(&mut self) -> Result<(), RadioError>;
    fn is_connected(&self) -> bool;
    fn scan(&mut self) -> Result<Vec<ScanResult>, RadioError>;

    fn configure_access_point(&mut self, config: &AccessPointConfig) -> Result<(), RadioError>;
    fn set_ap_active(&mut self, active: bool) -> Result<(), RadioError>;
    fn ap_active(&self) -> bool;

    fn mac_address(&self) -> [u8; 6];
    fn ip_info(&self) -> Option<IpInfo>;
}

pub trait Clock: Send + Sync {
    /// Monotonic milliseconds since boot.
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);
    /// Wall clock in UTC seconds, `None` until it has been set.
    fn unix_time(&self) -> Option<i64>;
}

/// Sets the device clock from a network time source.
pub trait TimeSource: Send {
    fn sync(&mut self, host: &str) -> Result<(), NetworkError>;
}

/// Reset-on-timeout watchdog. Dropping it does not disarm the hardware.
pub trait HardwareWatchdog: Send {
    fn feed(&mut self);
}

/// Periodic timer; cancelled on drop.
pub trait TimerHandle: Send {
    fn timer_id(&self) -> i32;
}

pub type TimerCallback = Box<dyn FnMut() + Send + 'static>;

pub trait TimerBank: Send {
    fn start_periodic(
        &mut self,
        timer_id: i32,
        period_ms: u32,
        callback: TimerCallback,
    ) -> Result<Box<dyn TimerHandle>, TimerError>;

    fn arm_watchdog(&mut self, timeout_ms: u32) -> Result<Box<dyn HardwareWatchdog>, TimerError>;
}

/// Handles injected into the connectivity machine at construction.
pub struct DeviceContext {
    pub radio: Box<dyn RadioInterface>,
    pub clock: Arc<dyn Clock>,
    pub time_source: Box<dyn TimeSource>,
    pub timers: Box<dyn TimerBank>,
    pub credentials: Arc<dyn CredentialStore>,
}

/// `AA:BB:CC:DD:EE:FF`
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}
