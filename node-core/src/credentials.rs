//! Persisted station credentials.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, StorageError};
use crate::storage::{self, Storage};

pub const CREDENTIALS_PATH: &str = "config/wifi.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredentials {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl NetworkCredentials {
    pub fn new(ssid: &str, password: &str) -> Self {
        Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
            hostname: None,
        }
    }

    /// Both ssid and password are required before a connect is attempted.
    pub fn is_usable(&self) -> bool {
        !self.ssid.is_empty() && !self.password.is_empty()
    }

    /// Checks submitted values before they are persisted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssid.is_empty() || self.password.is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        if self.ssid.len() > 32 {
            return Err(ConfigError::Invalid {
                field: "ssid",
                reason: "must be 32 bytes or less".to_string(),
            });
        }
        if self.ssid.chars().any(|c| c.is_control()) {
            return Err(ConfigError::Invalid {
                field: "ssid",
                reason: "cannot contain control characters".to_string(),
            });
        }
        if self.password.len() > 64 {
            return Err(ConfigError::Invalid {
                field: "password",
                reason: "must be 64 bytes or less".to_string(),
            });
        }
        if let Some(host) = &self.hostname {
            let valid = !host.is_empty()
                && host.len() <= 32
                && host.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
            if !valid {
                return Err(ConfigError::Invalid {
                    field: "hostname",
                    reason: "use up to 32 letters, digits or '-'".to_string(),
                });
            }
        }
        Ok(())
    }
}

pub trait CredentialStore: Send + Sync {
    /// Missing or unreadable credentials load as the empty default.
    fn load(&self) -> NetworkCredentials;
    fn save(&self, credentials: &NetworkCredentials) -> Result<(), ConfigError>;
}

/// JSON document on a [`Storage`].
pub struct JsonFileCredentialStore {
    storage: Arc<dyn Storage>,
    path: String,
}

impl JsonFileCredentialStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_path(storage, CREDENTIALS_PATH)
    }

    pub fn with_path(storage: Arc<dyn Storage>, path: &str) -> Self {
        Self {
            storage,
            path: path.to_string(),
        }
    }

    fn write(&self, credentials: &NetworkCredentials) -> Result<(), StorageError> {
        storage::mkdirs(self.storage.as_ref(), storage::parent(&self.path))?;
        let json = serde_json::to_string(credentials).unwrap_or_else(|_| "{}".to_string());
        storage::write_string(self.storage.as_ref(), &self.path, &json)
    }
}

impl CredentialStore for JsonFileCredentialStore {
    fn load(&self) -> NetworkCredentials {
        match storage::read_to_string(self.storage.as_ref(), &self.path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                log::warn!("credentials: {} is not valid JSON: {}", self.path, e);
                NetworkCredentials::default()
            }),
            Err(_) => NetworkCredentials::default(),
        }
    }

    fn save(&self, credentials: &NetworkCredentials) -> Result<(), ConfigError> {
        self.write(credentials)
            .map_err(|e| ConfigError::Store(e.to_string()))
    }
}
