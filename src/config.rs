use anyhow::Result;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use node_core::DeviceConfig;

const CONFIG_NAMESPACE: &str = "homenode";
const CONFIG_KEY: &str = "config";

/// Build-time defaults from wifi_config.h (see build.rs)
pub const BUILD_WIFI_SSID: &str = env!("WIFI_SSID");
pub const BUILD_WIFI_PASSWORD: &str = env!("WIFI_PASSWORD");

pub fn build_defaults() -> DeviceConfig {
    let token = env!("GITHUB_TOKEN");
    DeviceConfig {
        github_repo: env!("GITHUB_REPO").to_string(),
        github_token: (!token.is_empty()).then(|| token.to_string()),
        ..Default::default()
    }
}

pub fn load_or_default(partition: &EspDefaultNvsPartition) -> Result<DeviceConfig> {
    let mut nvs = EspNvs::new(partition.clone(), CONFIG_NAMESPACE, true)?;

    let mut config = match load_from_nvs(&nvs) {
        Ok(Some(config)) => {
            log::info!("Loaded configuration from NVS");
            config
        }
        Ok(None) => {
            log::info!("No stored configuration, using build defaults");
            let config = build_defaults();
            save_to_nvs(&mut nvs, &config)?;
            config
        }
        Err(e) => {
            log::warn!("Stored configuration unreadable ({:?}), using build defaults", e);
            let config = build_defaults();
            save_to_nvs(&mut nvs, &config)?;
            config
        }
    };

    // A repo baked into this build fills in a config saved by an older one
    if config.github_repo.is_empty() && !env!("GITHUB_REPO").is_empty() {
        config.github_repo = env!("GITHUB_REPO").to_string();
        save_to_nvs(&mut nvs, &config)?;
    }

    if config.sanitize() {
        log::warn!("Configuration had out-of-range values, corrected");
        save_to_nvs(&mut nvs, &config)?;
    }

    Ok(config)
}

fn load_from_nvs(nvs: &EspNvs<NvsDefault>) -> Result<Option<DeviceConfig>> {
    let mut buf = vec![0u8; 2048];
    match nvs.get_blob(CONFIG_KEY, &mut buf)? {
        Some(data) => Ok(Some(serde_json::from_slice(data)?)),
        None => Ok(None),
    }
}

fn save_to_nvs(nvs: &mut EspNvs<NvsDefault>, config: &DeviceConfig) -> Result<()> {
    let data = serde_json::to_vec(config)?;
    nvs.set_blob(CONFIG_KEY, &data)?;
    log::info!("Configuration saved to NVS");
    Ok(())
}
