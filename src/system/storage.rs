use std::ffi::CString;
use std::sync::Mutex;

use anyhow::Result;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_sys::{esp, esp_vfs_fat_mount_config_t, esp_vfs_fat_spiflash_mount_rw_wl};
use node_core::credentials::{CredentialStore, NetworkCredentials};
use node_core::ConfigError;

const CREDENTIALS_NAMESPACE: &str = "homenode";
const CREDENTIALS_KEY: &str = "wifi";

/// Mount the wear-levelled FAT partition `label` at `base_path`.
///
/// The mount lives until reset; the install tree and staging tree are
/// plain directories on it.
pub fn mount_fat(base_path: &str, label: &str) -> Result<()> {
    let base = CString::new(base_path)?;
    let label_c = CString::new(label)?;
    let mount_config = esp_vfs_fat_mount_config_t {
        format_if_mount_failed: true,
        max_files: 8,
        allocation_unit_size: 4096,
        ..Default::default()
    };
    let mut handle: esp_idf_sys::wl_handle_t = -1;

    esp!(unsafe {
        esp_vfs_fat_spiflash_mount_rw_wl(base.as_ptr(), label_c.as_ptr(), &mount_config, &mut handle)
    })?;

    log::info!("FAT partition '{}' mounted at {}", label, base_path);
    Ok(())
}

/// Station credentials as a JSON blob in NVS.
///
/// `fallback` is handed out while nothing usable has been stored, which is
/// how the build-time credentials from wifi_config.h reach the first boot.
pub struct NvsCredentialStore {
    nvs: Mutex<EspNvs<NvsDefault>>,
    fallback: NetworkCredentials,
}

impl NvsCredentialStore {
    pub fn new(partition: &EspDefaultNvsPartition, fallback: NetworkCredentials) -> Result<Self> {
        let nvs = EspNvs::new(partition.clone(), CREDENTIALS_NAMESPACE, true)?;
        Ok(Self {
            nvs: Mutex::new(nvs),
            fallback,
        })
    }

    fn read(&self) -> Result<Option<NetworkCredentials>> {
        let nvs = self
            .nvs
            .lock()
            .map_err(|_| anyhow::anyhow!("credential store lock poisoned"))?;
        let mut buf = vec![0u8; 512];
        match nvs.get_blob(CREDENTIALS_KEY, &mut buf)? {
            Some(data) => Ok(Some(serde_json::from_slice(data)?)),
            None => Ok(None),
        }
    }
}

impl CredentialStore for NvsCredentialStore {
    fn load(&self) -> NetworkCredentials {
        match self.read() {
            Ok(Some(creds)) if creds.is_usable() => creds,
            Ok(_) => self.fallback.clone(),
            Err(e) => {
                log::warn!("Stored credentials unreadable: {:?}", e);
                self.fallback.clone()
            }
        }
    }

    fn save(&self, credentials: &NetworkCredentials) -> Result<(), ConfigError> {
        let data =
            serde_json::to_vec(credentials).map_err(|e| ConfigError::Store(e.to_string()))?;
        let mut nvs = self
            .nvs
            .lock()
            .map_err(|_| ConfigError::Store("lock poisoned".to_string()))?;
        nvs.set_blob(CREDENTIALS_KEY, &data)
            .map_err(|e| ConfigError::Store(e.to_string()))?;
        log::info!("Credentials for '{}' saved to NVS", credentials.ssid);
        Ok(())
    }
}
