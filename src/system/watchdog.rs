// esp_timer backed periodic timers and the task watchdog
// Feeds the connectivity watchdog from the esp_timer task

use std::ffi::c_void;
use std::sync::Mutex;

use esp_idf_sys::*;
use node_core::error::TimerError;
use node_core::hal::{HardwareWatchdog, TimerBank, TimerCallback, TimerHandle};

/// Ids 0..=3 plus -1 for "any timer"
const SLOT_COUNT: usize = 5;

// The C side only sees a slot index; callbacks are cleared, never freed
// under a running tick
static SLOTS: [Mutex<Option<TimerCallback>>; SLOT_COUNT] = [
    Mutex::new(None),
    Mutex::new(None),
    Mutex::new(None),
    Mutex::new(None),
    Mutex::new(None),
];

fn slot_index(timer_id: i32) -> Option<usize> {
    match timer_id {
        0..=3 => Some(timer_id as usize),
        -1 => Some(SLOT_COUNT - 1),
        _ => None,
    }
}

extern "C" fn timer_trampoline(arg: *mut c_void) {
    let index = arg as usize;
    let Some(slot) = SLOTS.get(index) else {
        return;
    };
    if let Ok(mut guard) = slot.lock() {
        if let Some(tick) = guard.as_mut() {
            tick();
        }
    }
}

pub struct EspTimerBank;

impl EspTimerBank {
    pub fn new() -> Self {
        Self
    }
}

struct PeriodicTimer {
    timer_id: i32,
    slot: usize,
    timer: esp_timer_handle_t,
}

// esp_timer handles may be used from any task
unsafe impl Send for PeriodicTimer {}

impl TimerHandle for PeriodicTimer {
    fn timer_id(&self) -> i32 {
        self.timer_id
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        unsafe {
            let _ = esp_timer_stop(self.timer);
            let _ = esp_timer_delete(self.timer);
        }
        // waits for a tick that is still running
        if let Ok(mut guard) = SLOTS[self.slot].lock() {
            guard.take();
        }
        log::debug!("Timer {} released", self.timer_id);
    }
}

impl TimerBank for EspTimerBank {
    fn start_periodic(
        &mut self,
        timer_id: i32,
        period_ms: u32,
        callback: TimerCallback,
    ) -> Result<Box<dyn TimerHandle>, TimerError> {
        let slot = slot_index(timer_id).ok_or(TimerError::Unavailable(timer_id))?;
        let mut guard = SLOTS[slot]
            .lock()
            .map_err(|_| TimerError::Unavailable(timer_id))?;
        if guard.is_some() {
            return Err(TimerError::Unavailable(timer_id));
        }

        let timer_config = esp_timer_create_args_t {
            callback: Some(timer_trampoline),
            arg: slot as *mut c_void,
            dispatch_method: esp_timer_dispatch_t_ESP_TIMER_TASK,
            name: c"conn_wdt".as_ptr(),
            skip_unhandled_events: true,
        };
        let mut timer: esp_timer_handle_t = std::ptr::null_mut();
        esp!(unsafe { esp_timer_create(&timer_config, &mut timer) })
            .map_err(|_| TimerError::Unavailable(timer_id))?;

        *guard = Some(callback);
        drop(guard);

        let handle = PeriodicTimer {
            timer_id,
            slot,
            timer,
        };
        let period_us = u64::from(period_ms) * 1000;
        // on failure the handle's drop deletes the timer and frees the slot
        esp!(unsafe { esp_timer_start_periodic(handle.timer, period_us) })
            .map_err(|_| TimerError::Unavailable(timer_id))?;

        Ok(Box::new(handle))
    }

    fn arm_watchdog(&mut self, timeout_ms: u32) -> Result<Box<dyn HardwareWatchdog>, TimerError> {
        let wdt_config = esp_task_wdt_config_t {
            timeout_ms,
            idle_core_mask: 0,
            trigger_panic: true,
        };
        unsafe {
            // sdkconfig may already have started the task watchdog
            let mut result = esp_task_wdt_reconfigure(&wdt_config);
            if result == ESP_ERR_INVALID_STATE as esp_err_t {
                result = esp_task_wdt_init(&wdt_config);
            }
            esp!(result).map_err(|e| TimerError::Watchdog(e.to_string()))?;

            let mut user: esp_task_wdt_user_handle_t = std::ptr::null_mut();
            esp!(esp_task_wdt_add_user(c"connectivity".as_ptr(), &mut user))
                .map_err(|e| TimerError::Watchdog(e.to_string()))?;
            log::info!("Task watchdog armed: {} ms, panic on expiry", timeout_ms);
            Ok(Box::new(TaskWatchdog { user }))
        }
    }
}

/// Task watchdog user; expiry panics and resets the chip
struct TaskWatchdog {
    user: esp_task_wdt_user_handle_t,
}

unsafe impl Send for TaskWatchdog {}

impl HardwareWatchdog for TaskWatchdog {
    fn feed(&mut self) {
        unsafe {
            esp_task_wdt_reset_user(self.user);
        }
    }
}
