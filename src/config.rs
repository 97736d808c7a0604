//! System configuration parameters.
//!
//! All tunable parameters for the controller and display cores. Values can
//! be overridden at runtime from the display (setpoint commands) and are
//! persisted through the storage port.

use serde::{Deserialize, Serialize};

use crate::machine::MachineKind;

/// Gains for one PID loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

/// Core system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Boiler topology of the host machine.
    pub machine: MachineKind,

    // --- Temperature control ---
    /// Brew boiler setpoint (Celsius).
    pub brew_setpoint_c: f32,
    /// Steam boiler setpoint (Celsius).
    pub steam_setpoint_c: f32,
    /// Brew boiler PID gains.
    pub brew_pid: PidGains,
    /// Steam boiler PID gains.
    pub steam_pid: PidGains,
    /// Setpoint slew rate when the user changes temperature (Celsius/s).
    pub setpoint_ramp_c_per_s: f32,
    /// Hard over-temperature limit (Celsius) enforced by the safety layer.
    pub max_boiler_temp_c: f32,

    // --- Power meter ---
    /// MQTT data topic for the smart-plug meter ("" = unconfigured).
    pub mqtt_meter_topic: String,
    /// Payload dialect: "shelly", "tasmota", "generic", or "auto".
    pub mqtt_meter_format: String,
    /// How long after the last good parse an LWT-less meter still counts
    /// as connected (seconds).
    pub mqtt_meter_stale_secs: u32,
    /// Modbus meter table index, 0xFF = auto-detect on demand.
    pub modbus_meter_index: u8,
    /// Modbus path enabled at all.
    pub modbus_meter_enabled: bool,

    // --- Timing ---
    /// Sensor sampling interval (milliseconds).
    pub sensor_read_interval_ms: u32,
    /// Control loop interval (milliseconds).
    pub control_loop_interval_ms: u32,
    /// Unsolicited status frame cadence (milliseconds).
    pub status_interval_ms: u32,
    /// Command ack timeout on the display side (milliseconds).
    pub command_ack_timeout_ms: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            machine: MachineKind::DualBoiler,

            brew_setpoint_c: 93.0,
            steam_setpoint_c: 140.0,
            brew_pid: PidGains {
                kp: 2.0,
                ki: 0.1,
                kd: 0.5,
            },
            steam_pid: PidGains {
                kp: 3.0,
                ki: 0.05,
                kd: 0.2,
            },
            setpoint_ramp_c_per_s: 1.0,
            max_boiler_temp_c: 165.0,

            mqtt_meter_topic: String::new(),
            mqtt_meter_format: "auto".into(),
            mqtt_meter_stale_secs: 60,
            modbus_meter_index: 0xFF,
            modbus_meter_enabled: false,

            sensor_read_interval_ms: 50,  // 20 Hz sampling
            control_loop_interval_ms: 100, // 10 Hz control
            status_interval_ms: 100,       // 10 Hz status stream
            command_ack_timeout_ms: 500,
        }
    }
}

/// Setpoint bounds accepted from the display. Out-of-range values are
/// rejected with a NAK and the previous value is preserved.
pub const BREW_SETPOINT_RANGE_C: core::ops::RangeInclusive<f32> = 80.0..=105.0;
pub const STEAM_SETPOINT_RANGE_C: core::ops::RangeInclusive<f32> = 110.0..=155.0;

/// Range-check a configuration before persisting it. Invalid values are
/// rejected, not clamped, so a compromised link cannot inject dangerous
/// operating parameters.
pub fn validate_config(cfg: &SystemConfig) -> Result<(), &'static str> {
    if !BREW_SETPOINT_RANGE_C.contains(&cfg.brew_setpoint_c) {
        return Err("brew_setpoint_c out of range 80-105");
    }
    if !STEAM_SETPOINT_RANGE_C.contains(&cfg.steam_setpoint_c) {
        return Err("steam_setpoint_c out of range 110-155");
    }
    for gains in [&cfg.brew_pid, &cfg.steam_pid] {
        if !(0.0..=100.0).contains(&gains.kp)
            || !(0.0..=10.0).contains(&gains.ki)
            || !(0.0..=50.0).contains(&gains.kd)
        {
            return Err("PID gains out of range");
        }
        if !(gains.kp.is_finite() && gains.ki.is_finite() && gains.kd.is_finite()) {
            return Err("PID gains must be finite");
        }
    }
    if !(120.0..=180.0).contains(&cfg.max_boiler_temp_c) {
        return Err("max_boiler_temp_c out of range 120-180");
    }
    if cfg.control_loop_interval_ms == 0 || cfg.control_loop_interval_ms > 1000 {
        return Err("control_loop_interval_ms out of range 1-1000");
    }
    if cfg.status_interval_ms < 20 || cfg.status_interval_ms > 5000 {
        return Err("status_interval_ms out of range 20-5000");
    }
    if cfg.mqtt_meter_stale_secs == 0 || cfg.mqtt_meter_stale_secs > 3600 {
        return Err("mqtt_meter_stale_secs out of range 1-3600");
    }
    match cfg.mqtt_meter_format.as_str() {
        "shelly" | "tasmota" | "generic" | "auto" => {}
        _ => return Err("mqtt_meter_format must be shelly/tasmota/generic/auto"),
    }
    Ok(())
}
