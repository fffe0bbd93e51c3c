use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use esp_idf_hal::gpio::PinDriver;
use esp_idf_hal::prelude::*;
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};
use esp_idf_sys as _; // Binstart
use log::{error, info, warn, LevelFilter};
use node_core::collaborators::{notify_best_effort, SystemInfoSource, Telemetry};
use node_core::credentials::{CredentialStore, NetworkCredentials};
use node_core::fetcher::RemoteArtifactFetcher;
use node_core::hal::DeviceContext;
use node_core::storage::{Storage, StdFsStorage};
use node_core::{
    connectivity, ConfigPortal, ConnectivityStateMachine, DeviceConfig, SharedConnectivity,
    UpdateInstaller,
};
use serde_json::{json, Value};

// Generate ESP-IDF app descriptor
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

mod config;
mod logging;
mod network;
mod status_led;
mod system;
mod telemetry;

use crate::network::{EspClock, EspRadio, EspTransport, PortalServer, SntpTimeSource};
use crate::system::{reset, DeviceInfo, EspTimerBank, NvsCredentialStore};
use crate::telemetry::LogTelemetry;

const STORAGE_MOUNT: &str = "/data";
const STORAGE_LABEL: &str = "storage";
const CARETAKER_PERIOD: Duration = Duration::from_secs(10);
const HEALTH_EVERY: Duration = Duration::from_secs(30);
const SYSINFO_EVERY: Duration = Duration::from_secs(300);
const NTP_ATTEMPTS: u32 = 3;

type Installer = UpdateInstaller<EspTransport>;

fn main() -> Result<()> {
    // Initialize ESP-IDF
    esp_idf_svc::sys::link_patches();
    logging::init_logger(LevelFilter::Info).map_err(|e| anyhow!("logger: {}", e))?;

    info!("ESP32 Home Node {}", env!("CARGO_PKG_VERSION"));
    info!("Boot reason: {}", reset::get_reset_reason());
    if reset::was_watchdog_reset() {
        warn!("Previous run ended in a watchdog reset");
    }
    info!("Free heap: {} bytes", system::info::free_heap());

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let config = config::load_or_default(&nvs)?;
    if let Some(level) = logging::level_from_str(&config.log_level) {
        log::set_max_level(level);
    }
    if config.github_repo.is_empty() {
        warn!("No release repository configured, updates disabled");
    }

    system::mount_fat(STORAGE_MOUNT, STORAGE_LABEL)?;
    let storage: Arc<dyn Storage> = Arc::new(StdFsStorage::new(STORAGE_MOUNT));

    let telemetry: Arc<dyn Telemetry> = Arc::new(LogTelemetry::new());
    let fetcher = RemoteArtifactFetcher::new(EspTransport::new(), config.repo_config());
    let installer = Arc::new(UpdateInstaller::new(
        fetcher,
        storage.clone(),
        telemetry.clone(),
        config.installer_config(),
    ));
    info!("Installed app version: {}", installer.installed_version());

    let credentials = Arc::new(NvsCredentialStore::new(
        &nvs,
        NetworkCredentials::new(config::BUILD_WIFI_SSID, config::BUILD_WIFI_PASSWORD),
    )?);
    let ctx = DeviceContext {
        radio: Box::new(EspRadio::new(peripherals.modem, sys_loop, nvs.clone())?),
        clock: Arc::new(EspClock),
        time_source: Box::new(SntpTimeSource::new(config.sntp_wait_ms())),
        timers: Box::new(EspTimerBank::new()),
        credentials: credentials.clone(),
    };
    let connectivity =
        ConnectivityStateMachine::new(ctx, config.connectivity_settings()).into_shared();

    // A release staged by the previous run is installed before anything else starts
    install_staged(&installer, &connectivity, credentials.as_ref());

    status_led::spawn(PinDriver::output(peripherals.pins.gpio2)?, connectivity.clone())?;

    let device_info = Arc::new(DeviceInfo::new(
        connectivity.clone(),
        storage.clone(),
        &installer.main_path(),
    ));
    let portal = Arc::new(
        ConfigPortal::new(connectivity.clone(), installer.clone())
            .with_system_info(device_info.clone()),
    );
    let server = PortalServer::new(portal);

    let caretaker = Caretaker {
        config: &config,
        connectivity: &connectivity,
        installer: installer.as_ref(),
        server: &server,
        telemetry: telemetry.as_ref(),
        device_info: device_info.as_ref(),
    };
    if let Err(e) = caretaker.run() {
        error!("Caretaker crashed: {:?}", e);
    }
    reset::restart("caretaker exited")
}

fn install_staged(installer: &Installer, connectivity: &SharedConnectivity, credentials: &dyn CredentialStore) {
    let creds = credentials.load();
    let Ok(mut machine) = connectivity.lock() else {
        error!("Connectivity lock poisoned, staged install skipped");
        return;
    };
    match installer.install_after_boot_if_staged(&mut *machine, &creds.ssid, &creds.password) {
        Ok(true) => {
            drop(machine);
            reset::restart("update installed");
        }
        Ok(false) => {}
        Err(e) if e.rolled_back => warn!("Staged install rolled back: {}", e),
        Err(e) => error!("Staged install left the app tree incomplete: {}", e),
    }
}

/// Long-running connectivity loop on the main task
struct Caretaker<'a> {
    config: &'a DeviceConfig,
    connectivity: &'a SharedConnectivity,
    installer: &'a Installer,
    server: &'a PortalServer,
    telemetry: &'a dyn Telemetry,
    device_info: &'a DeviceInfo,
}

impl Caretaker<'_> {
    fn machine<R>(&self, f: impl FnOnce(&mut ConnectivityStateMachine) -> R) -> Result<R> {
        let mut machine = self
            .connectivity
            .lock()
            .map_err(|_| anyhow!("connectivity lock poisoned"))?;
        Ok(f(&mut machine))
    }

    fn run(&self) -> Result<()> {
        let hostname = self.config.hostname.as_str();
        let online = self.machine(|m| m.auto_connect(Some(hostname), false, false))?;
        if !online {
            self.start_portal()?;
        }

        connectivity::start_watchdog(
            self.connectivity,
            self.config.watchdog_timeout_ms,
            self.config.watchdog_feed_ms,
            self.config.watchdog_timer_id,
        );

        let check_every = Duration::from_secs(u64::from(self.config.ota_check_interval_hours) * 3600);
        let mut ntp_attempts = 0;
        let mut announced = false;
        let mut last_check: Option<Instant> = None;
        let mut last_health = Instant::now();
        let mut last_sysinfo = Instant::now();

        loop {
            let connected = self.machine(|m| {
                m.keepalive(self.config.keepalive_sec);
                m.is_connected()
            })?;

            if connected && ntp_attempts < NTP_ATTEMPTS && !self.machine(|m| m.utc_time().is_some())? {
                ntp_attempts += 1;
                let synced = self.machine(|m| {
                    m.ntp_sync(&self.config.ntp_host, self.config.tz_offset_hours, 1, 0)
                })?;
                if synced {
                    info!("Local time: {:?}", self.machine(|m| m.local_time())?);
                }
            }

            if connected && !announced {
                announced = true;
                self.announce();
            }

            if connected && self.config.ota_enabled && !self.config.github_repo.is_empty() {
                let due = last_check.map_or(true, |t| t.elapsed() >= check_every);
                if due {
                    last_check = Some(Instant::now());
                    if self.installer.check_for_update() {
                        reset::restart("update staged");
                    }
                }
            }

            if last_health.elapsed() >= HEALTH_EVERY {
                last_health = Instant::now();
                let state = self.machine(|m| m.state())?;
                notify_best_effort(self.telemetry, "health", &json!({ "state": state }));
            }
            if last_sysinfo.elapsed() >= SYSINFO_EVERY {
                last_sysinfo = Instant::now();
                notify_best_effort(
                    self.telemetry,
                    "sysinfo",
                    &Value::Object(self.device_info.collect()),
                );
            }

            std::thread::sleep(CARETAKER_PERIOD);
        }
    }

    fn start_portal(&self) -> Result<()> {
        let ap = self.machine(|m| m.start_access_point(None))?;
        match ap {
            Ok(ssid) => info!("Setup AP '{}' up", ssid),
            Err(e) => error!("Setup AP failed: {}", e),
        }
        self.server.start()
    }

    fn announce(&self) {
        let ip = self
            .machine(|m| m.ip_info())
            .ok()
            .flatten()
            .map(|info| info.ip)
            .unwrap_or_default();
        info!("Online at {}", ip);
        notify_best_effort(self.telemetry, "online", &json!({ "source": "boot", "ip": ip }));
        notify_best_effort(
            self.telemetry,
            "version",
            &json!({ "version": self.installer.installed_version(), "source": "boot" }),
        );
    }
}
