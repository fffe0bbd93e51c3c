use std::thread;
use std::time::Duration;

use anyhow::Result;
use esp_idf_hal::gpio::{Output, OutputPin, PinDriver};
use node_core::SharedConnectivity;

/// Slow blink while the station is up, fast blink otherwise
fn half_period(connected: bool) -> Duration {
    if connected {
        Duration::from_millis(500)
    } else {
        Duration::from_millis(100)
    }
}

pub fn spawn<P>(mut led: PinDriver<'static, P, Output>, connectivity: SharedConnectivity) -> Result<()>
where
    P: OutputPin,
{
    thread::Builder::new()
        .name("status-led".to_string())
        .stack_size(3072)
        .spawn(move || {
            let mut connected = false;
            loop {
                // keep the last pattern while the machine is busy connecting
                if let Ok(machine) = connectivity.try_lock() {
                    connected = machine.is_connected();
                }
                let period = half_period(connected);
                let _ = led.set_high();
                thread::sleep(period);
                let _ = led.set_low();
                thread::sleep(period);
            }
        })?;
    Ok(())
}
