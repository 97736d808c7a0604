//! MQTT smart-plug payload parsing.
//!
//! Three vendor dialects plus auto-detection:
//! - Shelly-style: `meters[0].power` / `meters[0].total` (Watt-minutes).
//! - Tasmota-style: an `ENERGY` object with `Power`, `Voltage`, `Current`,
//!   `Total`, `Factor`.
//! - Generic: four user-configured top-level JSON keys.
//!
//! Auto-detect tries Shelly, then Tasmota, then bare top-level
//! `power`/`voltage`/`current`/`energy` keys, and latches the detected
//! dialect on first success.
//!
//! Liveness combines the companion last-will topic with payload freshness:
//! a device whose broker says `Offline` is gone even with fresh data, and
//! an LWT-less device still counts as connected while its data is fresh.

use heapless::String as HString;
use log::{info, warn};
use serde_json::Value;

use super::PowerMeterReading;

/// Payload dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttFormat {
    Shelly,
    Tasmota,
    Generic,
    Auto,
}

impl MqttFormat {
    pub fn from_str(s: &str) -> Self {
        match s {
            "shelly" => Self::Shelly,
            "tasmota" => Self::Tasmota,
            "generic" => Self::Generic,
            _ => Self::Auto,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shelly => "shelly",
            Self::Tasmota => "tasmota",
            Self::Generic => "generic",
            Self::Auto => "auto",
        }
    }
}

/// MQTT-fed power meter.
pub struct MqttMeter {
    topic: String,
    format: MqttFormat,
    json_path_power: String,
    json_path_voltage: String,
    json_path_current: String,
    json_path_energy: String,
    last_reading: PowerMeterReading,
    last_update_ms: u64,
    has_data: bool,
    /// Assume online until the last-will topic says otherwise.
    device_online: bool,
    stale_threshold_ms: u64,
    last_error: HString<64>,
}

impl MqttMeter {
    pub fn new(topic: &str, format: &str, stale_secs: u32) -> Self {
        info!("MQTT power meter: topic={topic}, format={format}");
        Self {
            topic: topic.to_string(),
            format: MqttFormat::from_str(format),
            json_path_power: String::new(),
            json_path_voltage: String::new(),
            json_path_current: String::new(),
            json_path_energy: String::new(),
            last_reading: PowerMeterReading::default(),
            last_update_ms: 0,
            has_data: false,
            device_online: true,
            stale_threshold_ms: stale_secs as u64 * 1000,
            last_error: HString::new(),
        }
    }

    /// Configure the generic dialect's top-level key names.
    pub fn set_json_paths(&mut self, power: &str, voltage: &str, current: &str, energy: &str) {
        self.json_path_power = power.to_string();
        self.json_path_voltage = voltage.to_string();
        self.json_path_current = current.to_string();
        self.json_path_energy = energy.to_string();
        self.format = MqttFormat::Generic;
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn format(&self) -> MqttFormat {
        self.format
    }

    pub fn format_str(&self) -> &'static str {
        self.format.as_str()
    }

    pub fn name(&self) -> &str {
        &self.topic
    }

    pub fn last_error(&self) -> Option<&str> {
        (!self.last_error.is_empty()).then_some(self.last_error.as_str())
    }

    /// Connected when at least one parse succeeded AND the broker has not
    /// declared the device offline (or, lacking an LWT, data is fresh).
    pub fn is_connected(&self, now_ms: u64) -> bool {
        self.has_data && (self.device_online || !self.is_stale(now_ms))
    }

    fn is_stale(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_update_ms) > self.stale_threshold_ms
    }

    pub fn read_latest(&self, now_ms: u64) -> Option<PowerMeterReading> {
        (self.is_connected(now_ms) && self.last_reading.valid).then_some(self.last_reading)
    }

    /// Last-will payload: `Online`/`Offline` or `true`/`false`, any case.
    pub fn on_lwt(&mut self, payload: &[u8]) {
        let text = core::str::from_utf8(payload).unwrap_or("");
        let was_online = self.device_online;
        if text.eq_ignore_ascii_case("online") || text.eq_ignore_ascii_case("true") {
            self.device_online = true;
        } else if text.eq_ignore_ascii_case("offline") || text.eq_ignore_ascii_case("false") {
            self.device_online = false;
        } else {
            return; // Unknown payload, ignore.
        }
        if was_online != self.device_online {
            info!(
                "MQTT power meter device {} (LWT)",
                if self.device_online { "online" } else { "offline" }
            );
        }
    }

    /// Data-topic payload.
    pub fn on_data(&mut self, payload: &[u8], now_ms: u64) {
        let doc: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                self.last_error.clear();
                let _ = core::fmt::Write::write_fmt(
                    &mut self.last_error,
                    format_args!("JSON parse error"),
                );
                warn!("MQTT power meter JSON parse error: {e}");
                return;
            }
        };

        let parsed = match self.format {
            MqttFormat::Shelly => self.parse_shelly(&doc),
            MqttFormat::Tasmota => self.parse_tasmota(&doc),
            MqttFormat::Generic => self.parse_generic(&doc),
            MqttFormat::Auto => self.try_auto_parse(&doc),
        };

        if parsed {
            self.last_reading.timestamp_ms = now_ms;
            self.last_reading.valid = true;
            self.last_update_ms = now_ms;
            if !self.has_data {
                info!(
                    "MQTT power meter connected: topic={}, format={}",
                    self.topic,
                    self.format.as_str()
                );
            }
            self.has_data = true;
            self.last_error.clear();
        } else {
            self.last_error.clear();
            let _ = core::fmt::Write::write_fmt(
                &mut self.last_error,
                format_args!("unrecognised payload"),
            );
        }
    }

    // ── Dialect parsers ───────────────────────────────────────────

    fn parse_shelly(&mut self, doc: &Value) -> bool {
        let Some(meter) = doc.get("meters").and_then(|m| m.get(0)) else {
            return false;
        };
        if let Some(power) = as_f32(meter.get("power")) {
            self.last_reading.power = power;
        } else {
            return false;
        }
        if let Some(total) = as_f32(meter.get("total")) {
            // Shelly counts Watt-minutes: Wmin -> Wh (/60) -> kWh (/1000).
            self.last_reading.energy_import = total / 60_000.0;
        }
        // Voltage/current are not in the status payload; assume a European
        // 230 V plug and infer the current.
        self.last_reading.voltage = 230.0;
        if self.last_reading.power > 0.0 {
            self.last_reading.current = self.last_reading.power / self.last_reading.voltage;
        }
        true
    }

    fn parse_tasmota(&mut self, doc: &Value) -> bool {
        let Some(energy) = doc.get("ENERGY").filter(|e| e.is_object()) else {
            return false;
        };
        if let Some(v) = as_f32(energy.get("Power")) {
            self.last_reading.power = v;
        }
        if let Some(v) = as_f32(energy.get("Voltage")) {
            self.last_reading.voltage = v;
        }
        if let Some(v) = as_f32(energy.get("Current")) {
            self.last_reading.current = v;
        }
        if let Some(v) = as_f32(energy.get("Total")) {
            self.last_reading.energy_import = v;
        }
        if let Some(v) = as_f32(energy.get("Factor")) {
            self.last_reading.power_factor = v;
        }
        if let Some(v) = as_f32(energy.get("Frequency")) {
            self.last_reading.frequency = v;
        } else {
            self.last_reading.frequency = 50.0;
        }
        true
    }

    fn parse_generic(&mut self, doc: &Value) -> bool {
        // Top-level keys only in this revision.
        let mut success = false;
        let mut extract = |path: &str| {
            let v = (!path.is_empty()).then(|| as_f32(doc.get(path))).flatten();
            success |= v.is_some();
            v
        };
        let power = extract(&self.json_path_power);
        let voltage = extract(&self.json_path_voltage);
        let current = extract(&self.json_path_current);
        let energy = extract(&self.json_path_energy);

        if let Some(v) = power {
            self.last_reading.power = v;
        }
        if let Some(v) = voltage {
            self.last_reading.voltage = v;
        }
        if let Some(v) = current {
            self.last_reading.current = v;
        }
        if let Some(v) = energy {
            self.last_reading.energy_import = v;
        }
        success
    }

    fn try_auto_parse(&mut self, doc: &Value) -> bool {
        if self.parse_shelly(doc) {
            self.format = MqttFormat::Shelly;
            info!("MQTT power meter: auto-detected Shelly format");
            return true;
        }
        if self.parse_tasmota(doc) {
            self.format = MqttFormat::Tasmota;
            info!("MQTT power meter: auto-detected Tasmota format");
            return true;
        }

        // Bare top-level keys.
        let mut found = false;
        if let Some(v) = as_f32(doc.get("power")) {
            self.last_reading.power = v;
            found = true;
        }
        if let Some(v) = as_f32(doc.get("voltage")) {
            self.last_reading.voltage = v;
            found = true;
        }
        if let Some(v) = as_f32(doc.get("current")) {
            self.last_reading.current = v;
            found = true;
        }
        if let Some(v) = as_f32(doc.get("energy")) {
            self.last_reading.energy_import = v;
            found = true;
        }
        if found {
            info!("MQTT power meter: auto-detected simple JSON format");
        }
        found
    }
}

fn as_f32(value: Option<&Value>) -> Option<f32> {
    value.and_then(Value::as_f64).map(|v| v as f32)
}
