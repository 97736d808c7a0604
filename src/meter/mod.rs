//! Power-meter ingestion.
//!
//! Two very different sources feed one unified reading: MQTT smart-plug
//! payloads parsed on the display MCU, or a local Modbus/RTU meter polled
//! by the controller. Both hide behind the [`PowerMeter`] tagged variant
//! so the rest of the system only ever sees the common operation set.

pub mod energy;
pub mod modbus;
pub mod mqtt;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::hal::{StoragePort, StorageError};
use energy::DailyEnergy;
use mqtt::MqttMeter;

/// Unified reading produced by every source.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerMeterReading {
    /// Volts (RMS).
    pub voltage: f32,
    /// Amps (RMS).
    pub current: f32,
    /// Watts (active).
    pub power: f32,
    /// kWh imported from the grid (cumulative).
    pub energy_import: f32,
    /// kWh exported (solar / bidirectional meters).
    pub energy_export: f32,
    /// Hz.
    pub frequency: f32,
    /// 0.0 - 1.0.
    pub power_factor: f32,
    /// Local milliseconds when read.
    pub timestamp_ms: u64,
    /// Reading successful.
    pub valid: bool,
}

/// Where readings come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PowerMeterSource {
    #[default]
    None,
    Mqtt,
    Modbus,
}

impl PowerMeterSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Mqtt => "mqtt",
            Self::Modbus => "modbus",
        }
    }
}

/// The active meter, if any.
pub enum PowerMeter {
    None,
    Mqtt(MqttMeter),
    Modbus(modbus::ModbusMeter),
}

impl PowerMeter {
    pub fn source(&self) -> PowerMeterSource {
        match self {
            Self::None => PowerMeterSource::None,
            Self::Mqtt(_) => PowerMeterSource::Mqtt,
            Self::Modbus(_) => PowerMeterSource::Modbus,
        }
    }

    /// Latest reading, if one is fresh enough to trust.
    pub fn read_latest(&self, now_ms: u64) -> Option<PowerMeterReading> {
        match self {
            Self::None => None,
            Self::Mqtt(m) => m.read_latest(now_ms),
            Self::Modbus(m) => m.read_latest(now_ms),
        }
    }

    pub fn is_connected(&self, now_ms: u64) -> bool {
        match self {
            Self::None => false,
            Self::Mqtt(m) => m.is_connected(now_ms),
            Self::Modbus(m) => m.is_connected(now_ms),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::None => "None",
            Self::Mqtt(m) => m.name(),
            Self::Modbus(m) => m.name(),
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Mqtt(m) => m.last_error(),
            Self::Modbus(m) => m.last_error(),
        }
    }
}

/// Persisted meter configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MeterConfig {
    pub source: PowerMeterSource,
    pub mqtt_topic: String,
    pub mqtt_format: String,
    pub modbus_meter_index: u8,
}

const METER_NAMESPACE: &str = "power_meter";
const METER_CONFIG_KEY: &str = "cfg";

/// Display-side manager: owns the active meter, the daily-energy tracker,
/// and config persistence.
pub struct PowerMeterManager {
    meter: PowerMeter,
    daily: DailyEnergy,
    last_reading: PowerMeterReading,
    stale_secs: u32,
    enabled: bool,
}

impl PowerMeterManager {
    pub fn new(stale_secs: u32) -> Self {
        Self {
            meter: PowerMeter::None,
            daily: DailyEnergy::new(),
            last_reading: PowerMeterReading::default(),
            stale_secs,
            enabled: true,
        }
    }

    /// Restore the configured source from storage, if any.
    pub fn begin(&mut self, storage: &impl StoragePort) {
        match load_meter_config(storage) {
            Some(cfg) => {
                info!("Power meter: loaded config, source={}", cfg.source.as_str());
                self.apply_config(&cfg);
            }
            None => info!("Power meter: no saved config, source=none"),
        }
    }

    fn apply_config(&mut self, cfg: &MeterConfig) {
        self.meter = match cfg.source {
            PowerMeterSource::None => PowerMeter::None,
            PowerMeterSource::Mqtt if !cfg.mqtt_topic.is_empty() => PowerMeter::Mqtt(
                MqttMeter::new(&cfg.mqtt_topic, &cfg.mqtt_format, self.stale_secs),
            ),
            PowerMeterSource::Mqtt => PowerMeter::None,
            PowerMeterSource::Modbus => {
                PowerMeter::Modbus(modbus::ModbusMeter::new(cfg.modbus_meter_index))
            }
        };
    }

    /// Disabled during firmware updates so nothing races the link.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled != self.enabled {
            self.enabled = enabled;
            info!("Power meter {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    /// Configure the MQTT source and persist.
    pub fn configure_mqtt(
        &mut self,
        storage: &mut impl StoragePort,
        topic: &str,
        format: &str,
    ) -> bool {
        info!("Power meter: configuring MQTT source, topic={topic}, format={format}");
        self.meter = PowerMeter::Mqtt(MqttMeter::new(topic, format, self.stale_secs));
        self.save_config(storage)
    }

    /// Switch to a different source and persist.
    pub fn set_source(&mut self, storage: &mut impl StoragePort, source: PowerMeterSource) -> bool {
        if self.meter.source() == source {
            return true;
        }
        info!(
            "Power meter: source {} -> {}",
            self.meter.source().as_str(),
            source.as_str()
        );
        self.apply_config(&MeterConfig {
            source,
            ..self.snapshot_config()
        });
        self.save_config(storage)
    }

    /// Periodic tick: refresh the cached reading and run the daily-energy
    /// rollover when a calendar time is available (NTP synced).
    pub fn tick(&mut self, now_ms: u64, local_time: Option<chrono::NaiveDateTime>) {
        if !self.enabled {
            return;
        }
        if let Some(reading) = self.meter.read_latest(now_ms) {
            self.last_reading = reading;
        }
        if let Some(local) = local_time {
            self.daily
                .update(&self.last_reading, local);
        }
    }

    /// Route an incoming data-topic payload to the MQTT meter.
    pub fn on_mqtt_data(&mut self, payload: &[u8], now_ms: u64) {
        if let PowerMeter::Mqtt(m) = &mut self.meter {
            m.on_data(payload, now_ms);
        }
    }

    /// Route an incoming last-will payload to the MQTT meter.
    pub fn on_mqtt_lwt(&mut self, payload: &[u8]) {
        if let PowerMeter::Mqtt(m) = &mut self.meter {
            m.on_lwt(payload);
        }
    }

    /// The data topic currently subscribed, if the MQTT source is active.
    pub fn mqtt_topic(&self) -> Option<&str> {
        match &self.meter {
            PowerMeter::Mqtt(m) => Some(m.topic()),
            _ => None,
        }
    }

    pub fn reading(&self, now_ms: u64) -> Option<PowerMeterReading> {
        self.meter.read_latest(now_ms)
    }

    pub fn is_connected(&self, now_ms: u64) -> bool {
        self.enabled && self.meter.is_connected(now_ms)
    }

    pub fn meter_name(&self) -> &str {
        self.meter.name()
    }

    pub fn today_kwh(&self) -> f32 {
        self.daily.today_kwh(&self.last_reading)
    }

    /// Status blob for the UI and cloud publication.
    pub fn status_json(&self, now_ms: u64) -> serde_json::Value {
        let connected = self.is_connected(now_ms);
        let reading = connected.then(|| self.meter.read_latest(now_ms)).flatten();
        serde_json::json!({
            "source": self.meter.source().as_str(),
            "connected": connected,
            "meterType": self.meter.name(),
            "configured": !matches!(self.meter, PowerMeter::None),
            "todayKwh": self.today_kwh(),
            "reading": reading.map(|r| serde_json::json!({
                "voltage": r.voltage,
                "current": r.current,
                "power": r.power,
                "energy": r.energy_import,
                "frequency": r.frequency,
                "powerFactor": r.power_factor,
            })),
            "error": self.meter.last_error(),
        })
    }

    fn snapshot_config(&self) -> MeterConfig {
        MeterConfig {
            source: self.meter.source(),
            mqtt_topic: match &self.meter {
                PowerMeter::Mqtt(m) => m.topic().to_string(),
                _ => String::new(),
            },
            mqtt_format: match &self.meter {
                PowerMeter::Mqtt(m) => m.format_str().to_string(),
                _ => "auto".into(),
            },
            modbus_meter_index: match &self.meter {
                PowerMeter::Modbus(m) => m.meter_index(),
                _ => 0xFF,
            },
        }
    }

    fn save_config(&self, storage: &mut impl StoragePort) -> bool {
        let cfg = self.snapshot_config();
        match save_meter_config(storage, &cfg) {
            Ok(()) => {
                info!("Power meter: config saved");
                true
            }
            Err(e) => {
                warn!("Power meter: config save failed: {e}");
                false
            }
        }
    }
}

fn save_meter_config(storage: &mut impl StoragePort, cfg: &MeterConfig) -> Result<(), StorageError> {
    let blob = serde_json::to_vec(cfg).map_err(|_| StorageError::IoError)?;
    storage.write(METER_NAMESPACE, METER_CONFIG_KEY, &blob)
}

fn load_meter_config(storage: &impl StoragePort) -> Option<MeterConfig> {
    let mut buf = [0u8; 512];
    let n = storage.read(METER_NAMESPACE, METER_CONFIG_KEY, &mut buf).ok()?;
    serde_json::from_slice(&buf[..n]).ok()
}

/// Derive the companion last-will topic from a data topic by replacing the
/// final path segment with `LWT`.
pub fn lwt_topic_for(data_topic: &str) -> String {
    match data_topic.rfind('/') {
        Some(idx) => format!("{}/LWT", &data_topic[..idx]),
        None => "LWT".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::MemStorage;

    #[test]
    fn lwt_topic_replaces_last_segment() {
        assert_eq!(lwt_topic_for("tele/plug1/SENSOR"), "tele/plug1/LWT");
        assert_eq!(lwt_topic_for("shellies/shelly1/status"), "shellies/shelly1/LWT");
        assert_eq!(lwt_topic_for("flat"), "LWT");
    }

    #[test]
    fn manager_starts_unconfigured() {
        let mgr = PowerMeterManager::new(60);
        assert!(!mgr.is_connected(0));
        assert_eq!(mgr.meter_name(), "None");
    }

    #[test]
    fn mqtt_config_persists_and_restores() {
        let mut storage = MemStorage::new();
        let mut mgr = PowerMeterManager::new(60);
        assert!(mgr.configure_mqtt(&mut storage, "tele/plug/SENSOR", "tasmota"));

        let mut restored = PowerMeterManager::new(60);
        restored.begin(&storage);
        assert_eq!(restored.mqtt_topic(), Some("tele/plug/SENSOR"));
    }

    #[test]
    fn disabled_manager_reports_disconnected() {
        let mut storage = MemStorage::new();
        let mut mgr = PowerMeterManager::new(60);
        mgr.configure_mqtt(&mut storage, "tele/plug/SENSOR", "tasmota");
        mgr.on_mqtt_data(br#"{"ENERGY":{"Power":100}}"#, 1000);
        assert!(mgr.is_connected(1100));
        mgr.set_enabled(false);
        assert!(!mgr.is_connected(1100));
    }

    #[test]
    fn status_json_shape() {
        let mgr = PowerMeterManager::new(60);
        let status = mgr.status_json(0);
        assert_eq!(status["source"], "none");
        assert_eq!(status["configured"], false);
        assert!(status["reading"].is_null());
    }
}
