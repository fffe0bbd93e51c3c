//! Station/AP connectivity state machine with a timer-fed watchdog.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError, Weak};

use serde::Serialize;

use crate::credentials::{CredentialStore, NetworkCredentials};
use crate::error::{ConfigError, RadioError};
use crate::hal::{
    format_mac, AccessPointConfig, Clock, DeviceContext, HardwareWatchdog, IpInfo,
    RadioInterface, ScanResult, TimeSource, TimerBank, TimerCallback, TimerHandle,
};
use crate::installer::StationLink;

/// Timer ids tried after the preferred one; `-1` is the virtual timer.
pub const TIMER_CANDIDATES: [i32; 5] = [0, 1, 2, 3, -1];

/// Longest stretch the watchdog keeps feeding on the last seen link state
/// while another task holds the machine.
pub const MAX_BUSY_FEED_MS: u64 = 60_000;

pub type SharedConnectivity = Arc<Mutex<ConnectivityStateMachine>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectivityState {
    Down,
    AutoConnecting,
    Online,
    #[serde(rename = "APOnly")]
    ApOnly,
    PortalServing,
}

#[derive(Debug, Clone)]
pub struct ConnectivitySettings {
    /// Bounded wait used by `connect(wait = true)`.
    pub connect_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub ap_password: String,
    pub ap_channel: u8,
    /// Reconnect interval used from the watchdog tick.
    pub watchdog_keepalive_sec: u64,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            poll_interval_ms: 100,
            ap_password: "12345678".to_string(),
            ap_channel: 6,
            watchdog_keepalive_sec: 10,
        }
    }
}

/// Snapshot for system info and the portal.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityStatus {
    pub state: ConnectivityState,
    pub station_connected: bool,
    pub ap_active: bool,
    pub ap_ssid: Option<String>,
    pub mac: String,
    pub ip: Option<IpInfo>,
    pub reconnect_attempts: u32,
    pub watchdog: Option<WatchdogStatus>,
    pub time_synced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WatchdogStatus {
    pub timer_id: i32,
    pub timeout_ms: u32,
    pub feed_every_ms: u32,
}

/// Hardware watchdog plus the last observed link state, shared with the
/// timer callback so a tick never needs the machine lock to feed.
#[derive(Clone, Default)]
struct WatchdogFeeder {
    link_up: Arc<AtomicBool>,
    wdt: Arc<Mutex<Option<Box<dyn HardwareWatchdog>>>>,
}

impl WatchdogFeeder {
    fn publish(&self, link_up: bool) {
        self.link_up.store(link_up, Ordering::Release);
    }

    fn link_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }

    fn is_armed(&self) -> bool {
        self.wdt.lock().map_or(false, |wdt| wdt.is_some())
    }

    fn arm(&self, wdt: Box<dyn HardwareWatchdog>) {
        if let Ok(mut slot) = self.wdt.lock() {
            *slot = Some(wdt);
        }
    }

    fn feed(&self) {
        if let Ok(mut slot) = self.wdt.lock() {
            if let Some(wdt) = slot.as_mut() {
                wdt.feed();
            }
        }
    }
}

struct WatchdogLease {
    timer: Box<dyn TimerHandle>,
    timeout_ms: u32,
    feed_every_ms: u32,
}

pub struct ConnectivityStateMachine {
    radio: Box<dyn RadioInterface>,
    clock: Arc<dyn Clock>,
    time_source: Box<dyn TimeSource>,
    timers: Box<dyn TimerBank>,
    credentials: Arc<dyn CredentialStore>,
    settings: ConnectivitySettings,

    connect_pending: bool,
    portal_serving: bool,
    ap_ssid: Option<String>,
    last_attempt_ms: Option<u64>,
    reconnect_attempts: u32,
    tz_offset_sec: i64,
    time_synced: bool,
    lease: Option<WatchdogLease>,
    // stays armed once armed; hardware offers no disarm
    feeder: WatchdogFeeder,
}

impl ConnectivityStateMachine {
    pub fn new(ctx: DeviceContext, settings: ConnectivitySettings) -> Self {
        Self {
            radio: ctx.radio,
            clock: ctx.clock,
            time_source: ctx.time_source,
            timers: ctx.timers,
            credentials: ctx.credentials,
            settings,
            connect_pending: false,
            portal_serving: false,
            ap_ssid: None,
            last_attempt_ms: None,
            reconnect_attempts: 0,
            tz_offset_sec: 0,
            time_synced: false,
            lease: None,
            feeder: WatchdogFeeder::default(),
        }
    }

    pub fn into_shared(self) -> SharedConnectivity {
        Arc::new(Mutex::new(self))
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn settings(&self) -> &ConnectivitySettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectivityState {
        if self.radio.is_connected() {
            ConnectivityState::Online
        } else if self.radio.ap_active() {
            if self.portal_serving {
                ConnectivityState::PortalServing
            } else {
                ConnectivityState::ApOnly
            }
        } else if self.connect_pending && self.radio.station_active() {
            ConnectivityState::AutoConnecting
        } else {
            ConnectivityState::Down
        }
    }

    pub fn is_connected(&self) -> bool {
        self.radio.is_connected()
    }

    pub fn ap_active(&self) -> bool {
        self.radio.ap_active()
    }

    pub fn set_portal_serving(&mut self, serving: bool) {
        self.portal_serving = serving;
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn load_credentials(&self) -> NetworkCredentials {
        self.credentials.load()
    }

    pub fn save_credentials(&self, credentials: &NetworkCredentials) -> Result<(), ConfigError> {
        self.credentials.save(credentials)
    }

    /// Connects with the stored credentials, falling back to the AP.
    pub fn auto_connect(&mut self, hostname: Option<&str>, start_ap_if_fail: bool, wait: bool) -> bool {
        let mut creds = self.credentials.load();
        if let Some(host) = hostname {
            creds.hostname = Some(host.to_string());
        }

        if creds.is_usable() {
            if self.connect(&creds, wait, false) {
                return true;
            }
        } else {
            log::info!("WiFi: no stored credentials");
        }

        if start_ap_if_fail && !self.radio.ap_active() {
            match self.start_access_point(None) {
                Ok(ssid) => log::warn!("WiFi: connect failed, AP '{}' started", ssid),
                Err(e) => log::error!("WiFi: could not start AP: {}", e),
            }
        }
        self.radio.is_connected()
    }

    /// Starts a station connect. With `wait` the call polls until connected
    /// or the configured timeout passes; `keep_ap` leaves a running AP up.
    pub fn connect(&mut self, creds: &NetworkCredentials, wait: bool, keep_ap: bool) -> bool {
        if !keep_ap && self.radio.ap_active() {
            self.stop_access_point();
        }
        if let Err(e) = self.radio.set_station_active(true) {
            log::error!("WiFi: station start failed: {}", e);
            return false;
        }
        if let Some(host) = creds.hostname.as_deref().filter(|h| !h.is_empty()) {
            // not every driver accepts a hostname change at this point
            if let Err(e) = self.radio.set_hostname(host) {
                log::debug!("WiFi: hostname '{}' not applied: {}", host, e);
            }
        }

        if !self.radio.is_connected() {
            log::info!("WiFi: connecting to '{}'", creds.ssid);
            if let Err(e) = self.radio.connect(&creds.ssid, &creds.password) {
                log::warn!("WiFi: connect start error: {}", e);
                return false;
            }
            self.connect_pending = true;
            self.last_attempt_ms = Some(self.clock.now_ms());
        }

        if !wait {
            return self.radio.is_connected();
        }
        let started = self.clock.now_ms();
        while !self.radio.is_connected()
            && self.clock.now_ms().saturating_sub(started) < self.settings.connect_timeout_ms
        {
            self.clock.sleep_ms(self.settings.poll_interval_ms);
        }
        let connected = self.radio.is_connected();
        if connected {
            log::info!("WiFi: connected to '{}'", creds.ssid);
        } else {
            log::warn!("WiFi: '{}' not reachable within {} ms", creds.ssid, self.settings.connect_timeout_ms);
        }
        connected
    }

    pub fn disconnect(&mut self) {
        if let Err(e) = self.radio.disconnect() {
            log::debug!("WiFi: disconnect: {}", e);
        }
        if let Err(e) = self.radio.set_station_active(false) {
            log::debug!("WiFi: station stop: {}", e);
        }
        self.connect_pending = false;
    }

    /// Brings up the configuration AP. `None` derives `ESP32-XXXX` from the MAC.
    pub fn start_access_point(&mut self, ssid: Option<&str>) -> Result<String, RadioError> {
        let ssid = match ssid {
            Some(s) => s.to_string(),
            None => ap_name(&self.radio.mac_address()),
        };
        let config = AccessPointConfig {
            ssid: ssid.clone(),
            password: self.settings.ap_password.clone(),
            channel: self.settings.ap_channel,
            hidden: false,
        };
        self.radio.configure_access_point(&config)?;
        self.radio.set_ap_active(true)?;
        self.ap_ssid = Some(ssid.clone());
        self.publish_link_state();
        Ok(ssid)
    }

    pub fn stop_access_point(&mut self) {
        if let Err(e) = self.radio.set_ap_active(false) {
            log::warn!("WiFi: AP stop failed: {}", e);
        }
        self.ap_ssid = None;
        self.publish_link_state();
    }

    /// Non-blocking reconnect, rate limited to one attempt per interval.
    /// Returns true when an attempt was made.
    pub fn keepalive(&mut self, retry_interval_sec: u64) -> bool {
        if !self.radio.station_active() || self.radio.is_connected() {
            return false;
        }
        let now = self.clock.now_ms();
        if let Some(last) = self.last_attempt_ms {
            if now.saturating_sub(last) < retry_interval_sec.saturating_mul(1000) {
                return false;
            }
        }
        self.last_attempt_ms = Some(now);

        let creds = self.credentials.load();
        if !creds.is_usable() {
            return false;
        }
        self.reconnect_attempts += 1;
        log::info!("WiFi: reconnecting (attempt {})", self.reconnect_attempts);
        if let Err(e) = self.radio.connect(&creds.ssid, &creds.password) {
            log::warn!("WiFi: reconnect error: {}", e);
        }
        self.connect_pending = true;
        true
    }

    /// Scans for networks, strongest first. Never fails; errors give an
    /// empty list.
    pub fn scan(&mut self, retries: u32, backoff_ms: u64, aggressive: bool) -> Vec<ScanResult> {
        let clock = self.clock.clone();
        let mut pause = ApPause::new(self.radio.as_mut(), aggressive, clock.as_ref());
        let result = scan_with_retries(pause.radio(), clock.as_ref(), retries, backoff_ms);
        drop(pause);

        match result {
            Ok(mut networks) => {
                networks.sort_by(|a, b| b.rssi.cmp(&a.rssi));
                networks
            }
            Err(e) => {
                log::warn!("WiFi: scan failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Sets the clock to UTC; `tz_offset_hours` only affects [`Self::local_time`].
    pub fn ntp_sync(&mut self, host: &str, tz_offset_hours: i32, retries: u32, delay_sec: u64) -> bool {
        for attempt in 1..=retries {
            match self.time_source.sync(host) {
                Ok(()) => {
                    self.tz_offset_sec = i64::from(tz_offset_hours) * 3600;
                    self.time_synced = true;
                    log::info!("NTP: synced via {} (tz offset {}s)", host, self.tz_offset_sec);
                    return true;
                }
                Err(e) => {
                    log::warn!("NTP: attempt {} failed: {}", attempt, e);
                    if attempt < retries {
                        self.clock.sleep_ms(delay_sec * 1000);
                    }
                }
            }
        }
        false
    }

    pub fn utc_time(&self) -> Option<i64> {
        self.clock.unix_time()
    }

    pub fn local_time(&self) -> Option<i64> {
        self.clock.unix_time().map(|t| t + self.tz_offset_sec)
    }

    pub fn mac_address(&self) -> String {
        format_mac(&self.radio.mac_address())
    }

    pub fn ip_info(&self) -> Option<IpInfo> {
        if self.radio.is_connected() {
            self.radio.ip_info()
        } else {
            None
        }
    }

    pub fn watchdog_timer(&self) -> Option<i32> {
        self.lease.as_ref().map(|l| l.timer.timer_id())
    }

    /// Cancels the feeding timer. An armed hardware watchdog keeps running.
    pub fn stop_watchdog(&mut self) {
        if let Some(lease) = self.lease.take() {
            log::info!("WDT: timer {} stopped", lease.timer.timer_id());
        }
    }

    fn publish_link_state(&self) -> bool {
        let up = self.radio.is_connected() || self.radio.ap_active();
        self.feeder.publish(up);
        up
    }

    /// Keepalive pass from the timer; true while either link is up.
    fn watchdog_tick(&mut self) -> bool {
        self.keepalive(self.settings.watchdog_keepalive_sec);
        self.publish_link_state()
    }

    pub fn status(&self) -> ConnectivityStatus {
        ConnectivityStatus {
            state: self.state(),
            station_connected: self.radio.is_connected(),
            ap_active: self.radio.ap_active(),
            ap_ssid: self.ap_ssid.clone(),
            mac: self.mac_address(),
            ip: self.ip_info(),
            reconnect_attempts: self.reconnect_attempts,
            watchdog: self.lease.as_ref().map(|l| WatchdogStatus {
                timer_id: l.timer.timer_id(),
                timeout_ms: l.timeout_ms,
                feed_every_ms: l.feed_every_ms,
            }),
            time_synced: self.time_synced,
        }
    }
}

impl StationLink for ConnectivityStateMachine {
    fn connect_station(&mut self, ssid: &str, password: &str) -> bool {
        self.connect(&NetworkCredentials::new(ssid, password), true, false)
    }
}

/// `ESP32-` plus the last four hex digits of the station MAC.
pub fn ap_name(mac: &[u8; 6]) -> String {
    format!("ESP32-{:02X}{:02X}", mac[4], mac[5])
}

/// Preferred id first, then the defaults, without duplicates.
pub fn timer_candidates(preferred: Option<i32>) -> Vec<i32> {
    let mut ids: Vec<i32> = preferred.into_iter().collect();
    for id in TIMER_CANDIDATES {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// Starts the periodic watchdog feeder.
///
/// The hardware watchdog is armed only after a timer was claimed; with no
/// timer available the watchdog stays disabled.
pub fn start_watchdog(
    shared: &SharedConnectivity,
    timeout_ms: u32,
    feed_every_ms: u32,
    timer_id: Option<i32>,
) -> bool {
    let weak = Arc::downgrade(shared);
    let Ok(mut machine) = shared.lock() else {
        log::error!("WDT: state machine lock poisoned");
        return false;
    };
    machine.stop_watchdog();
    machine.publish_link_state();

    let mut claimed = None;
    for id in timer_candidates(timer_id) {
        let callback: TimerCallback = Box::new(watchdog_callback(
            weak.clone(),
            machine.feeder.clone(),
            machine.clock.clone(),
        ));
        match machine.timers.start_periodic(id, feed_every_ms, callback) {
            Ok(handle) => {
                claimed = Some(handle);
                break;
            }
            Err(e) => log::debug!("WDT: {}", e),
        }
    }
    let Some(timer) = claimed else {
        log::warn!("WDT: no usable timer, watchdog disabled");
        return false;
    };

    if !machine.feeder.is_armed() {
        match machine.timers.arm_watchdog(timeout_ms) {
            Ok(wdt) => machine.feeder.arm(wdt),
            Err(e) => {
                log::error!("WDT: {}", e);
                return false;
            }
        }
    } else {
        log::debug!("WDT: reusing armed watchdog");
    }

    log::info!(
        "WDT: started {} ms, feed every {} ms, timer {}",
        timeout_ms,
        feed_every_ms,
        timer.timer_id()
    );
    machine.lease = Some(WatchdogLease {
        timer,
        timeout_ms,
        feed_every_ms,
    });
    true
}

fn watchdog_callback(
    weak: Weak<Mutex<ConnectivityStateMachine>>,
    feeder: WatchdogFeeder,
    clock: Arc<dyn Clock>,
) -> impl FnMut() + Send + 'static {
    let mut busy_since: Option<u64> = None;
    move || {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let link_up = match shared.try_lock() {
            Ok(mut machine) => {
                busy_since = None;
                machine.watchdog_tick()
            }
            Err(TryLockError::WouldBlock) => {
                // keepalive waits for the holder; feeding goes on from the
                // last seen link state until the holder looks stuck
                let now = clock.now_ms();
                let since = *busy_since.get_or_insert(now);
                if now.saturating_sub(since) > MAX_BUSY_FEED_MS {
                    log::warn!("WDT: machine busy for {} ms, feeding stopped", now - since);
                    false
                } else {
                    log::debug!("WDT: machine busy, keepalive skipped");
                    feeder.link_up()
                }
            }
            Err(TryLockError::Poisoned(_)) => false,
        };
        if link_up {
            feeder.feed();
        }
    }
}

/// Polls the station state without holding the lock between polls.
pub fn wait_for_station(shared: &SharedConnectivity, timeout_ms: u64, poll_ms: u64) -> bool {
    let clock = match shared.lock() {
        Ok(machine) => machine.clock(),
        Err(_) => return false,
    };
    let started = clock.now_ms();
    loop {
        let connected = shared.lock().map(|m| m.is_connected()).unwrap_or(false);
        if connected {
            return true;
        }
        if clock.now_ms().saturating_sub(started) >= timeout_ms {
            return false;
        }
        clock.sleep_ms(poll_ms);
    }
}

/// Pauses the AP for an aggressive scan and restores it on drop.
struct ApPause<'a> {
    radio: &'a mut dyn RadioInterface,
    restore: bool,
}

impl<'a> ApPause<'a> {
    fn new(radio: &'a mut dyn RadioInterface, aggressive: bool, clock: &dyn Clock) -> Self {
        let restore = aggressive && radio.ap_active();
        if restore {
            if let Err(e) = radio.set_ap_active(false) {
                log::warn!("WiFi: AP pause failed: {}", e);
            }
            clock.sleep_ms(100);
        }
        Self { radio, restore }
    }

    fn radio(&mut self) -> &mut dyn RadioInterface {
        self.radio
    }
}

impl Drop for ApPause<'_> {
    fn drop(&mut self) {
        if self.restore && !self.radio.ap_active() {
            if let Err(e) = self.radio.set_ap_active(true) {
                log::error!("WiFi: AP restore failed: {}", e);
            }
        }
    }
}

fn scan_with_retries(
    radio: &mut dyn RadioInterface,
    clock: &dyn Clock,
    retries: u32,
    backoff_ms: u64,
) -> Result<Vec<ScanResult>, RadioError> {
    radio.set_station_active(true)?;
    if !radio.is_connected() {
        // abandons a pending connect that would keep the radio busy
        let _ = radio.disconnect();
        clock.sleep_ms(50);
    }

    let mut last_err = RadioError::Busy;
    for attempt in 1..=retries.max(1) {
        match radio.scan() {
            Ok(networks) => return Ok(networks),
            Err(RadioError::Busy) => {
                log::debug!("WiFi: scan busy (attempt {})", attempt);
                let _ = radio.set_station_active(false);
                clock.sleep_ms(50);
                let _ = radio.set_station_active(true);
                clock.sleep_ms(backoff_ms * u64::from(attempt));
                last_err = RadioError::Busy;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}
