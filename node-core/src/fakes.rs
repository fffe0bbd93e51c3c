//! Test doubles shared by the unit tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::collaborators::Telemetry;
use crate::credentials::{CredentialStore, NetworkCredentials};
use crate::error::{ConfigError, NetworkError, RadioError, StorageError, TimerError};
use crate::fetcher::{HttpResponse, HttpTransport};
use crate::hal::{
    AccessPointConfig, Clock, HardwareWatchdog, IpInfo, RadioInterface, ScanResult, TimeSource,
    TimerBank, TimerCallback, TimerHandle,
};
use crate::storage::{self, DirEntry, EntryKind, Storage};

// ---------------------------------------------------------------- storage

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

struct MemState {
    nodes: BTreeMap<String, Node>,
    rename_supported: bool,
    failing_renames: HashSet<String>,
}

/// In-memory filesystem with switchable rename support.
pub struct MemStorage {
    state: Mutex<MemState>,
}

fn norm(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn io_error(path: &str, kind: io::ErrorKind) -> StorageError {
    StorageError::Io {
        path: path.to_string(),
        source: io::Error::from(kind),
    }
}

impl MemStorage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState {
                nodes: BTreeMap::new(),
                rename_supported: true,
                failing_renames: HashSet::new(),
            }),
        }
    }

    pub fn set_rename_supported(&self, supported: bool) {
        self.state.lock().unwrap().rename_supported = supported;
    }

    /// Every later rename of `from` fails with an I/O error.
    pub fn fail_rename_from(&self, from: &str) {
        self.state.lock().unwrap().failing_renames.insert(norm(from));
    }

    pub fn add_dir(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = storage::join(&current, part);
            state.nodes.entry(current.clone()).or_insert(Node::Dir);
        }
    }

    pub fn add_file(&self, path: &str, text: &str) {
        let path = norm(path);
        self.add_dir(storage::parent(&path));
        self.state
            .lock()
            .unwrap()
            .nodes
            .insert(path, Node::File(text.as_bytes().to_vec()));
    }

    pub fn file_text(&self, path: &str) -> Option<String> {
        match self.state.lock().unwrap().nodes.get(&norm(path)) {
            Some(Node::File(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    /// Everything under `dir`, keyed by relative path. Directories map to `"/"`.
    pub fn snapshot(&self, dir: &str) -> BTreeMap<String, String> {
        let prefix = format!("{}/", norm(dir));
        self.state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .filter_map(|(path, node)| {
                let rel = path.strip_prefix(&prefix)?;
                let value = match node {
                    Node::Dir => "/".to_string(),
                    Node::File(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                };
                Some((rel.to_string(), value))
            })
            .collect()
    }
}

fn parent_is_dir(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
    let parent = storage::parent(path);
    parent.is_empty() || matches!(nodes.get(parent), Some(Node::Dir))
}

fn is_within(path: &str, dir: &str) -> bool {
    path == dir || path.starts_with(&format!("{dir}/"))
}

impl Storage for MemStorage {
    fn list(&self, dir: &str) -> Result<Vec<DirEntry>, StorageError> {
        let dir = norm(dir);
        let state = self.state.lock().unwrap();
        if !dir.is_empty() && !matches!(state.nodes.get(&dir), Some(Node::Dir)) {
            return Err(StorageError::NotFound(dir));
        }
        Ok(state
            .nodes
            .iter()
            .filter(|(path, _)| path.as_str() != dir && storage::parent(path) == dir)
            .map(|(path, node)| DirEntry {
                name: path.rsplit('/').next().unwrap_or(path).to_string(),
                kind: match node {
                    Node::Dir => EntryKind::Dir,
                    Node::File(_) => EntryKind::File,
                },
            })
            .collect())
    }

    fn kind(&self, path: &str) -> Option<EntryKind> {
        let path = norm(path);
        if path.is_empty() {
            return Some(EntryKind::Dir);
        }
        match self.state.lock().unwrap().nodes.get(&path)? {
            Node::Dir => Some(EntryKind::Dir),
            Node::File(_) => Some(EntryKind::File),
        }
    }

    fn mkdir(&self, path: &str) -> Result<(), StorageError> {
        let path = norm(path);
        let mut state = self.state.lock().unwrap();
        match state.nodes.get(&path) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File(_)) => Err(io_error(&path, io::ErrorKind::AlreadyExists)),
            None if parent_is_dir(&state.nodes, &path) => {
                state.nodes.insert(path, Node::Dir);
                Ok(())
            }
            None => Err(StorageError::NotFound(path)),
        }
    }

    fn open_read<'a>(&'a self, path: &str) -> Result<Box<dyn Read + 'a>, StorageError> {
        match self.state.lock().unwrap().nodes.get(&norm(path)) {
            Some(Node::File(bytes)) => Ok(Box::new(Cursor::new(bytes.clone()))),
            Some(Node::Dir) => Err(io_error(path, io::ErrorKind::InvalidInput)),
            None => Err(StorageError::NotFound(path.to_string())),
        }
    }

    fn create<'a>(&'a self, path: &str) -> Result<Box<dyn Write + 'a>, StorageError> {
        let path = norm(path);
        let mut state = self.state.lock().unwrap();
        if matches!(state.nodes.get(&path), Some(Node::Dir)) {
            return Err(io_error(&path, io::ErrorKind::InvalidInput));
        }
        if !parent_is_dir(&state.nodes, &path) {
            return Err(StorageError::NotFound(path));
        }
        state.nodes.insert(path.clone(), Node::File(Vec::new()));
        Ok(Box::new(MemWriter {
            storage: self,
            path,
        }))
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let (from, to) = (norm(from), norm(to));
        let mut state = self.state.lock().unwrap();
        if !state.rename_supported {
            return Err(StorageError::RenameUnsupported { from, to });
        }
        if state.failing_renames.contains(&from) {
            return Err(io_error(&from, io::ErrorKind::Other));
        }
        if !state.nodes.contains_key(&from) {
            return Err(StorageError::NotFound(from));
        }
        if state.nodes.contains_key(&to) {
            return Err(io_error(&to, io::ErrorKind::AlreadyExists));
        }
        let moved: Vec<String> = state
            .nodes
            .keys()
            .filter(|p| is_within(p, &from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = state.nodes.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                state.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    fn remove_file(&self, path: &str) -> Result<(), StorageError> {
        let path = norm(path);
        let mut state = self.state.lock().unwrap();
        match state.nodes.get(&path) {
            Some(Node::File(_)) => {
                state.nodes.remove(&path);
                Ok(())
            }
            Some(Node::Dir) => Err(io_error(&path, io::ErrorKind::InvalidInput)),
            None => Err(StorageError::NotFound(path)),
        }
    }

    fn remove_dir(&self, path: &str) -> Result<(), StorageError> {
        let path = norm(path);
        let mut state = self.state.lock().unwrap();
        match state.nodes.get(&path) {
            Some(Node::Dir) => {
                if state.nodes.keys().any(|p| p != &path && is_within(p, &path)) {
                    return Err(io_error(&path, io::ErrorKind::Other));
                }
                state.nodes.remove(&path);
                Ok(())
            }
            Some(Node::File(_)) => Err(io_error(&path, io::ErrorKind::InvalidInput)),
            None => Err(StorageError::NotFound(path)),
        }
    }
}

struct MemWriter<'a> {
    storage: &'a MemStorage,
    path: String,
}

impl Write for MemWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.storage.state.lock().unwrap();
        match state.nodes.get_mut(&self.path) {
            Some(Node::File(bytes)) => {
                bytes.extend_from_slice(data);
                Ok(data.len())
            }
            _ => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// -------------------------------------------------------------- transport

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

enum Route {
    Respond(u16, Vec<u8>),
    Fail,
}

#[derive(Default)]
struct TransportState {
    routes: HashMap<String, Route>,
    requests: Vec<RecordedRequest>,
}

/// Canned HTTP responses keyed by URL. Unknown URLs answer 404.
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) {
        self.state
            .lock()
            .unwrap()
            .routes
            .insert(url.to_string(), Route::Respond(status, body.as_bytes().to_vec()));
    }

    pub fn fail(&self, url: &str) {
        self.state
            .lock()
            .unwrap()
            .routes
            .insert(url.to_string(), Route::Fail);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

impl HttpTransport for FakeTransport {
    fn get<'a>(
        &'a mut self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse<'a>, NetworkError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(RecordedRequest {
            url: url.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        match state.routes.get(url) {
            Some(Route::Respond(status, body)) => Ok(HttpResponse {
                status: *status,
                body: Box::new(Cursor::new(body.clone())),
            }),
            Some(Route::Fail) => Err(NetworkError::transport(url, "connection refused")),
            None => Ok(HttpResponse {
                status: 404,
                body: Box::new(io::empty()),
            }),
        }
    }
}

// -------------------------------------------------------------- telemetry

#[derive(Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<(String, Value)>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().unwrap().clone()
    }
}

impl Telemetry for RecordingTelemetry {
    fn notify(&self, event: &str, payload: &Value) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((event.to_string(), payload.clone()));
        Ok(())
    }
}

// ------------------------------------------------------------------ clock

/// Manual clock. `sleep_ms` advances time instead of blocking.
#[derive(Clone, Default)]
pub struct FakeClock {
    now_ms: Arc<Mutex<u64>>,
    unix: Arc<Mutex<Option<i64>>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        *self.now_ms.lock().unwrap() += ms;
    }

    pub fn set_unix_time(&self, secs: i64) {
        *self.unix.lock().unwrap() = Some(secs);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        *self.now_ms.lock().unwrap()
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance(ms);
    }

    fn unix_time(&self) -> Option<i64> {
        *self.unix.lock().unwrap()
    }
}

/// Fails the first `failures` syncs, then sets the clock.
#[derive(Clone)]
pub struct FakeTimeSource {
    clock: FakeClock,
    failures: Arc<Mutex<u32>>,
    hosts: Arc<Mutex<Vec<String>>>,
}

pub const SYNCED_UNIX_TIME: i64 = 1_700_000_000;

impl FakeTimeSource {
    pub fn new(clock: FakeClock, failures: u32) -> Self {
        Self {
            clock,
            failures: Arc::new(Mutex::new(failures)),
            hosts: Arc::default(),
        }
    }

    pub fn hosts(&self) -> Vec<String> {
        self.hosts.lock().unwrap().clone()
    }
}

impl TimeSource for FakeTimeSource {
    fn sync(&mut self, host: &str) -> Result<(), NetworkError> {
        self.hosts.lock().unwrap().push(host.to_string());
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(NetworkError::transport(host, "no reply"));
        }
        self.clock.set_unix_time(SYNCED_UNIX_TIME);
        Ok(())
    }
}

// ------------------------------------------------------------------ radio

#[derive(Default)]
pub struct RadioState {
    pub station_active: bool,
    pub connected: bool,
    pub ap_active: bool,
    pub ap_config: Option<AccessPointConfig>,
    pub hostname: Option<String>,
    pub mac: [u8; 6],
    /// Network the simulated access point accepts.
    pub known_network: Option<(String, String)>,
    pub connects: Vec<String>,
    pub disconnects: u32,
    pub station_toggles: u32,
    pub scan_script: VecDeque<Result<Vec<ScanResult>, RadioError>>,
    /// AP state observed at each scan attempt.
    pub ap_during_scan: Vec<bool>,
}

/// Scripted radio; clones share state so tests can inspect it after the
/// machine took ownership.
#[derive(Clone, Default)]
pub struct FakeRadio {
    pub state: Arc<Mutex<RadioState>>,
}

impl FakeRadio {
    pub fn new() -> Self {
        let radio = Self::default();
        radio.state.lock().unwrap().mac = [0x24, 0x6f, 0x28, 0xa1, 0xb2, 0xc3];
        radio
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut RadioState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn accept(&self, ssid: &str, password: &str) {
        self.with(|s| s.known_network = Some((ssid.to_string(), password.to_string())));
    }

    pub fn drop_link(&self) {
        self.with(|s| s.connected = false);
    }

    pub fn script_scan(&self, result: Result<Vec<ScanResult>, RadioError>) {
        self.with(|s| s.scan_script.push_back(result));
    }
}

pub fn network(ssid: &str, rssi: i8) -> ScanResult {
    ScanResult {
        ssid: ssid.to_string(),
        channel: 6,
        rssi,
        secure: true,
        hidden: false,
    }
}

impl RadioInterface for FakeRadio {
    fn set_station_active(&mut self, active: bool) -> Result<(), RadioError> {
        self.with(|s| {
            if s.station_active != active {
                s.station_toggles += 1;
            }
            s.station_active = active;
            if !active {
                s.connected = false;
            }
        });
        Ok(())
    }

    fn station_active(&self) -> bool {
        self.with(|s| s.station_active)
    }

    fn set_hostname(&mut self, hostname: &str) -> Result<(), RadioError> {
        self.with(|s| s.hostname = Some(hostname.to_string()));
        Ok(())
    }

    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), RadioError> {
        self.with(|s| {
            if !s.station_active {
                return Err(RadioError::NotStarted);
            }
            s.connects.push(ssid.to_string());
            s.connected = s.known_network.as_ref()
                == Some(&(ssid.to_string(), password.to_string()));
            Ok(())
        })
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        self.with(|s| {
            s.disconnects += 1;
            s.connected = false;
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.with(|s| s.connected)
    }

    fn scan(&mut self) -> Result<Vec<ScanResult>, RadioError> {
        self.with(|s| {
            s.ap_during_scan.push(s.ap_active);
            s.scan_script.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        })
    }

    fn configure_access_point(&mut self, config: &AccessPointConfig) -> Result<(), RadioError> {
        self.with(|s| s.ap_config = Some(config.clone()));
        Ok(())
    }

    fn set_ap_active(&mut self, active: bool) -> Result<(), RadioError> {
        self.with(|s| s.ap_active = active);
        Ok(())
    }

    fn ap_active(&self) -> bool {
        self.with(|s| s.ap_active)
    }

    fn mac_address(&self) -> [u8; 6] {
        self.with(|s| s.mac)
    }

    fn ip_info(&self) -> Option<IpInfo> {
        self.with(|s| {
            s.connected.then(|| IpInfo {
                ip: "192.168.1.42".to_string(),
                mask: "255.255.255.0".to_string(),
                gw: "192.168.1.1".to_string(),
                dns: "192.168.1.1".to_string(),
            })
        })
    }
}

// ----------------------------------------------------------------- timers

struct WatchdogState {
    timeout_ms: u32,
    last_feed_ms: u64,
    feeds: u32,
}

#[derive(Default)]
struct TimerBankState {
    unavailable: HashSet<i32>,
    timers: HashMap<i32, Arc<Mutex<TimerCallback>>>,
    watchdog: Option<WatchdogState>,
    arms: u32,
}

/// Timers fire only when the test calls [`FakeTimerBank::fire`].
#[derive(Clone)]
pub struct FakeTimerBank {
    state: Arc<Mutex<TimerBankState>>,
    clock: FakeClock,
}

impl FakeTimerBank {
    pub fn new(clock: FakeClock) -> Self {
        Self {
            state: Arc::default(),
            clock,
        }
    }

    pub fn make_unavailable(&self, timer_id: i32) {
        self.state.lock().unwrap().unavailable.insert(timer_id);
    }

    pub fn active_timers(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.state.lock().unwrap().timers.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Runs the callback of `timer_id` once. False when no such timer runs.
    pub fn fire(&self, timer_id: i32) -> bool {
        let callback = self.state.lock().unwrap().timers.get(&timer_id).cloned();
        match callback {
            Some(callback) => {
                let mut guard = callback.lock().unwrap();
                let tick: &mut TimerCallback = &mut guard;
                tick();
                true
            }
            None => false,
        }
    }

    pub fn watchdog_armed(&self) -> bool {
        self.state.lock().unwrap().watchdog.is_some()
    }

    pub fn arms(&self) -> u32 {
        self.state.lock().unwrap().arms
    }

    pub fn feeds(&self) -> u32 {
        self.state
            .lock()
            .unwrap()
            .watchdog
            .as_ref()
            .map_or(0, |w| w.feeds)
    }

    /// Reset hook: true once an armed watchdog went unfed past its timeout.
    pub fn reset_triggered(&self) -> bool {
        let now = self.clock.now_ms();
        self.state
            .lock()
            .unwrap()
            .watchdog
            .as_ref()
            .is_some_and(|w| now.saturating_sub(w.last_feed_ms) > u64::from(w.timeout_ms))
    }
}

struct FakeTimerHandle {
    timer_id: i32,
    state: Arc<Mutex<TimerBankState>>,
}

impl TimerHandle for FakeTimerHandle {
    fn timer_id(&self) -> i32 {
        self.timer_id
    }
}

impl Drop for FakeTimerHandle {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.timers.remove(&self.timer_id);
        }
    }
}

struct FakeWatchdog {
    state: Arc<Mutex<TimerBankState>>,
    clock: FakeClock,
}

impl HardwareWatchdog for FakeWatchdog {
    fn feed(&mut self) {
        let now = self.clock.now_ms();
        if let Some(w) = self.state.lock().unwrap().watchdog.as_mut() {
            w.last_feed_ms = now;
            w.feeds += 1;
        }
    }
}

impl TimerBank for FakeTimerBank {
    fn start_periodic(
        &mut self,
        timer_id: i32,
        _period_ms: u32,
        callback: TimerCallback,
    ) -> Result<Box<dyn TimerHandle>, TimerError> {
        let mut state = self.state.lock().unwrap();
        if state.unavailable.contains(&timer_id) || state.timers.contains_key(&timer_id) {
            return Err(TimerError::Unavailable(timer_id));
        }
        state
            .timers
            .insert(timer_id, Arc::new(Mutex::new(callback)));
        Ok(Box::new(FakeTimerHandle {
            timer_id,
            state: self.state.clone(),
        }))
    }

    fn arm_watchdog(&mut self, timeout_ms: u32) -> Result<Box<dyn HardwareWatchdog>, TimerError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().unwrap();
        state.arms += 1;
        state.watchdog = Some(WatchdogState {
            timeout_ms,
            last_feed_ms: now,
            feeds: 0,
        });
        Ok(Box::new(FakeWatchdog {
            state: self.state.clone(),
            clock: self.clock.clone(),
        }))
    }
}

// ------------------------------------------------------------ credentials

#[derive(Default)]
pub struct MemCredentials {
    stored: Mutex<NetworkCredentials>,
}

impl MemCredentials {
    pub fn with(credentials: NetworkCredentials) -> Self {
        Self {
            stored: Mutex::new(credentials),
        }
    }
}

impl CredentialStore for MemCredentials {
    fn load(&self) -> NetworkCredentials {
        self.stored.lock().unwrap().clone()
    }

    fn save(&self, credentials: &NetworkCredentials) -> Result<(), ConfigError> {
        *self.stored.lock().unwrap() = credentials.clone();
        Ok(())
    }
}

/// Context wired entirely with fakes; the timer bank shares `clock`.
pub fn fake_context(radio: &FakeRadio, clock: &FakeClock, stored: NetworkCredentials) -> crate::hal::DeviceContext {
    crate::hal::DeviceContext {
        radio: Box::new(radio.clone()),
        clock: Arc::new(clock.clone()),
        time_source: Box::new(FakeTimeSource::new(clock.clone(), 0)),
        timers: Box::new(FakeTimerBank::new(clock.clone())),
        credentials: Arc::new(MemCredentials::with(stored)),
    }
}
