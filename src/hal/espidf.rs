//! ESP-IDF adapters for the display MCU.
//!
//! Only the ports the display side needs: the task watchdog and NVS-backed
//! storage. The controller MCU has its own SDK-level implementations of the
//! serial and flash ports.

use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_svc::sys::*;
use log::{info, warn};

use super::{ConfigError, ConfigPort, StorageError, StoragePort, WatchdogPort};
use crate::config::{validate_config, SystemConfig};

// ---------------------------------------------------------------------------
// Task watchdog
// ---------------------------------------------------------------------------

pub struct EspWatchdog {
    subscribed: bool,
}

impl EspWatchdog {
    /// Initialise and subscribe the current task to the TWDT.
    pub fn new() -> Self {
        unsafe {
            let cfg = esp_task_wdt_config_t {
                timeout_ms: 10_000,
                idle_core_mask: 0,
                trigger_panic: true,
            };
            let ret = esp_task_wdt_reconfigure(&cfg);
            if ret != ESP_OK {
                warn!("TWDT reconfigure returned {} (may already be configured)", ret);
            }

            let ret = esp_task_wdt_add(core::ptr::null_mut());
            let subscribed = ret == ESP_OK;
            if subscribed {
                info!("Watchdog: subscribed (10s timeout, panic on trigger)");
            } else {
                warn!("Watchdog: failed to subscribe ({})", ret);
            }
            Self { subscribed }
        }
    }
}

impl Default for EspWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchdogPort for EspWatchdog {
    fn feed(&self) {
        if self.subscribed {
            unsafe {
                esp_task_wdt_reset();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// NVS storage
// ---------------------------------------------------------------------------

const CONFIG_NAMESPACE: &str = "brewcore";
const CONFIG_KEY: &str = "syscfg";

pub struct NvsStorage {
    partition: EspDefaultNvsPartition,
}

impl NvsStorage {
    pub fn new() -> Result<Self, ConfigError> {
        let partition = EspDefaultNvsPartition::take().map_err(|e| {
            warn!("NVS partition take failed: {e}");
            ConfigError::IoError
        })?;
        info!("NvsStorage: ESP-IDF NVS initialised");
        Ok(Self { partition })
    }

    fn open(&self, namespace: &str, write: bool) -> Result<EspNvs<NvsDefault>, StorageError> {
        EspNvs::new(self.partition.clone(), namespace, write).map_err(|_| StorageError::IoError)
    }
}

impl StoragePort for NvsStorage {
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let nvs = self.open(namespace, false)?;
        match nvs.get_blob(key, buf) {
            Ok(Some(data)) => Ok(data.len()),
            Ok(None) => Err(StorageError::NotFound),
            Err(_) => Err(StorageError::IoError),
        }
    }

    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut nvs = self.open(namespace, true)?;
        nvs.set_blob(key, data).map_err(|_| StorageError::IoError)
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError> {
        let mut nvs = self.open(namespace, true)?;
        let _ = nvs.remove(key);
        Ok(())
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        let Ok(nvs) = self.open(namespace, false) else {
            return false;
        };
        matches!(nvs.blob_len(key), Ok(Some(_)))
    }
}

impl ConfigPort for NvsStorage {
    fn load(&self) -> Result<SystemConfig, ConfigError> {
        let mut buf = [0u8; 2048];
        let n = match StoragePort::read(self, CONFIG_NAMESPACE, CONFIG_KEY, &mut buf) {
            Ok(n) => n,
            Err(StorageError::NotFound) => return Err(ConfigError::NotFound),
            Err(_) => return Err(ConfigError::IoError),
        };
        serde_json::from_slice(&buf[..n]).map_err(|_| ConfigError::Corrupted)
    }

    fn save(&mut self, config: &SystemConfig) -> Result<(), ConfigError> {
        validate_config(config).map_err(ConfigError::ValidationFailed)?;
        let blob = serde_json::to_vec(config).map_err(|_| ConfigError::IoError)?;
        StoragePort::write(self, CONFIG_NAMESPACE, CONFIG_KEY, &blob)
            .map_err(|_| ConfigError::IoError)
    }
}
