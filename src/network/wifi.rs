use std::net::Ipv4Addr;

use anyhow::Result;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    nvs::EspDefaultNvsPartition,
    sys::EspError,
    wifi::{
        AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, EspWifi,
    },
};
use node_core::hal::{AccessPointConfig, IpInfo, RadioInterface, ScanResult};
use node_core::RadioError;

/// ESP-IDF Wi-Fi driver in station, AP or mixed mode.
///
/// Mode changes go through [`EspRadio::apply`]: the driver is reconfigured
/// from the two halves kept here.
pub struct EspRadio {
    wifi: EspWifi<'static>,
    client: ClientConfiguration,
    access_point: AccessPointConfiguration,
    station_on: bool,
    ap_on: bool,
}

fn driver_error(e: EspError) -> RadioError {
    // ESP_ERR_WIFI_STATE: connecting or scanning already
    if e.code() == esp_idf_sys::ESP_ERR_WIFI_STATE as esp_idf_sys::esp_err_t {
        RadioError::Busy
    } else {
        RadioError::Driver(e.to_string())
    }
}

fn mask_from_prefix(bits: u8) -> Ipv4Addr {
    let bits = u32::from(bits.min(32));
    let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
    Ipv4Addr::from(mask)
}

impl EspRadio {
    pub fn new(modem: Modem, sys_loop: EspSystemEventLoop, nvs: EspDefaultNvsPartition) -> Result<Self> {
        log::info!("Initializing WiFi driver");
        let wifi = EspWifi::new(modem, sys_loop, Some(nvs))?;
        Ok(Self {
            wifi,
            client: ClientConfiguration::default(),
            access_point: AccessPointConfiguration::default(),
            station_on: false,
            ap_on: false,
        })
    }

    fn apply(&mut self) -> Result<(), RadioError> {
        let cfg = match (self.station_on, self.ap_on) {
            (_, true) => Configuration::Mixed(self.client.clone(), self.access_point.clone()),
            (true, false) => Configuration::Client(self.client.clone()),
            (false, false) => Configuration::None,
        };
        let running = self.wifi.is_started().unwrap_or(false);

        if matches!(cfg, Configuration::None) {
            if running {
                self.wifi.stop().map_err(driver_error)?;
            }
            return Ok(());
        }

        self.wifi.set_configuration(&cfg).map_err(driver_error)?;
        if !running {
            self.wifi.start().map_err(driver_error)?;
            // Power save drops the link under portal traffic
            unsafe {
                use esp_idf_sys::*;
                let result = esp_wifi_set_ps(wifi_ps_type_t_WIFI_PS_NONE);
                if result != ESP_OK {
                    log::warn!("Failed to set WiFi power save mode: {:?}", result);
                }
            }
        }
        Ok(())
    }
}

impl RadioInterface for EspRadio {
    fn set_station_active(&mut self, active: bool) -> Result<(), RadioError> {
        if self.station_on == active {
            return Ok(());
        }
        self.station_on = active;
        self.apply()
    }

    fn station_active(&self) -> bool {
        self.station_on
    }

    fn set_hostname(&mut self, hostname: &str) -> Result<(), RadioError> {
        self.wifi
            .sta_netif_mut()
            .set_hostname(hostname)
            .map_err(driver_error)
    }

    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), RadioError> {
        self.client = ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| RadioError::Driver(format!("ssid '{}' too long", ssid)))?,
            password: password
                .try_into()
                .map_err(|_| RadioError::Driver("password too long".to_string()))?,
            auth_method: if password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        };
        self.station_on = true;
        self.apply()?;
        log::info!("Connecting to {}...", ssid);
        self.wifi.connect().map_err(driver_error)
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        if !self.wifi.is_started().unwrap_or(false) {
            return Ok(());
        }
        self.wifi.disconnect().map_err(driver_error)
    }

    fn is_connected(&self) -> bool {
        // associated and holding a DHCP lease
        self.wifi.is_up().unwrap_or(false)
    }

    fn scan(&mut self) -> Result<Vec<ScanResult>, RadioError> {
        if !self.wifi.is_started().unwrap_or(false) {
            return Err(RadioError::NotStarted);
        }
        let found = self.wifi.scan().map_err(driver_error)?;
        Ok(found
            .iter()
            .map(|ap| ScanResult {
                ssid: ap.ssid.to_string(),
                channel: ap.channel,
                rssi: ap.signal_strength,
                secure: !matches!(ap.auth_method, None | Some(AuthMethod::None)),
                hidden: ap.ssid.is_empty(),
            })
            .collect())
    }

    fn configure_access_point(&mut self, config: &AccessPointConfig) -> Result<(), RadioError> {
        self.access_point = AccessPointConfiguration {
            ssid: config
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| RadioError::Driver(format!("AP ssid '{}' too long", config.ssid)))?,
            password: config
                .password
                .as_str()
                .try_into()
                .map_err(|_| RadioError::Driver("AP password too long".to_string()))?,
            auth_method: if config.password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            channel: config.channel,
            ssid_hidden: config.hidden,
            max_connections: 4,
            ..Default::default()
        };
        if self.ap_on {
            self.apply()?;
        }
        Ok(())
    }

    fn set_ap_active(&mut self, active: bool) -> Result<(), RadioError> {
        if self.ap_on == active {
            return Ok(());
        }
        self.ap_on = active;
        self.apply()
    }

    fn ap_active(&self) -> bool {
        self.ap_on && self.wifi.is_started().unwrap_or(false)
    }

    fn mac_address(&self) -> [u8; 6] {
        self.wifi.sta_netif().get_mac().unwrap_or([0; 6])
    }

    fn ip_info(&self) -> Option<IpInfo> {
        let info = self.wifi.sta_netif().get_ip_info().ok()?;
        Some(IpInfo {
            ip: info.ip.to_string(),
            mask: mask_from_prefix(info.subnet.mask.0).to_string(),
            gw: info.subnet.gateway.to_string(),
            dns: info.dns.map(|d| d.to_string()).unwrap_or_default(),
        })
    }
}
