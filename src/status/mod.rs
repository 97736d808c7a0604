//! Device status snapshot and cloud/MQTT publication gating.

pub mod change;

pub use change::{ChangedFields, StatusChangeDetector};

use heapless::String as HString;

use crate::machine::{HeatingMode, MachineState};

/// Snapshot of everything the display publishes. Built each tick from the
/// latest controller status frame plus display-local state, then gated by
/// the change detector before anything leaves the device.
#[derive(Debug, Clone, Default)]
pub struct UiStatus {
    pub machine_state: MachineState,
    pub heating_mode: HeatingMode,
    pub is_heating: bool,
    pub is_brewing: bool,

    pub brew_temp_c: f32,
    pub brew_setpoint_c: f32,
    pub steam_temp_c: f32,
    pub steam_setpoint_c: f32,
    pub group_temp_c: f32,
    pub pressure_bar: f32,

    pub power_watts: f32,
    pub brew_weight_g: f32,
    pub flow_rate_ml_s: f32,
    pub target_weight_g: f32,
    pub brew_time_ms: u32,
    pub brew_count: u32,

    pub controller_connected: bool,
    pub wifi_connected: bool,
    pub mqtt_connected: bool,
    pub scale_connected: bool,
    pub cloud_connected: bool,

    pub water_low: bool,
    pub alarm_active: bool,
    pub alarm_code: u8,

    pub wifi_ap_mode: bool,
    pub wifi_rssi_dbm: i32,
    pub wifi_ip: HString<16>,
}
