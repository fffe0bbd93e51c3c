use std::time::{Duration, SystemTime, UNIX_EPOCH};

use esp_idf_svc::sntp::{EspSntp, SntpConf, SyncStatus};
use node_core::hal::{Clock, TimeSource};
use node_core::NetworkError;

/// Anything earlier than 2023-01-01 means the RTC was never set
const MIN_VALID_UNIX: i64 = 1_672_531_200;
const SYNC_POLL_MS: u64 = 200;

pub struct EspClock;

impl Clock for EspClock {
    fn now_ms(&self) -> u64 {
        let us = unsafe { esp_idf_sys::esp_timer_get_time() };
        (us.max(0) as u64) / 1000
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    fn unix_time(&self) -> Option<i64> {
        let secs = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs() as i64;
        (secs >= MIN_VALID_UNIX).then_some(secs)
    }
}

/// SNTP client; the service stays running after the first sync so the
/// clock keeps being corrected
pub struct SntpTimeSource {
    sntp: Option<EspSntp<'static>>,
    host: String,
    wait_ms: u64,
}

impl SntpTimeSource {
    /// `wait_ms` bounds one `sync` call
    pub fn new(wait_ms: u64) -> Self {
        Self {
            sntp: None,
            host: String::new(),
            wait_ms,
        }
    }
}

impl TimeSource for SntpTimeSource {
    fn sync(&mut self, host: &str) -> Result<(), NetworkError> {
        if self.sntp.is_none() || self.host != host {
            // only one SNTP instance may exist at a time
            self.sntp = None;
            let mut conf = SntpConf::default();
            conf.servers[0] = host;
            let sntp = EspSntp::new(&conf).map_err(|e| NetworkError::transport(host, e.to_string()))?;
            self.sntp = Some(sntp);
            self.host = host.to_string();
        }

        let clock = EspClock;
        let started = clock.now_ms();
        while clock.now_ms().saturating_sub(started) < self.wait_ms {
            let completed = self
                .sntp
                .as_ref()
                .is_some_and(|s| s.get_sync_status() == SyncStatus::Completed);
            if completed {
                return Ok(());
            }
            clock.sleep_ms(SYNC_POLL_MS);
        }
        Err(NetworkError::transport(host, "no SNTP reply"))
    }
}
