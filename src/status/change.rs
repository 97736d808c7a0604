//! Status change detection.
//!
//! The controller streams status at 10 Hz, but the cloud and MQTT only
//! need to hear about *meaningful* changes. The detector keeps a mirror
//! of the last published snapshot and compares field by field: scalars
//! against per-unit thresholds, booleans and enums by strict inequality,
//! the IP string byte-for-byte. Brew elapsed time always counts as
//! changed while a brew is running.

use super::UiStatus;

/// Temperature threshold (degrees Celsius).
pub const TEMP_THRESHOLD_C: f32 = 0.5;
/// Pressure threshold (bar).
pub const PRESSURE_THRESHOLD_BAR: f32 = 0.1;
/// Power threshold (watts).
pub const POWER_THRESHOLD_W: f32 = 10.0;
/// Weight threshold (grams).
pub const WEIGHT_THRESHOLD_G: f32 = 0.5;
/// Flow-rate threshold (mL/s).
pub const FLOW_THRESHOLD_ML_S: f32 = 0.1;
/// WiFi signal threshold (dBm).
pub const RSSI_THRESHOLD_DBM: i32 = 10;

/// Bitmap of logical field groups, so publishers can send minimal deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangedFields(u16);

impl ChangedFields {
    pub const STATE: u16 = 1 << 0;
    pub const HEATING: u16 = 1 << 1;
    pub const TEMPS: u16 = 1 << 2;
    pub const PRESSURE: u16 = 1 << 3;
    pub const POWER: u16 = 1 << 4;
    pub const SCALE: u16 = 1 << 5;
    pub const BREW: u16 = 1 << 6;
    pub const CONNECTIONS: u16 = 1 << 7;
    pub const WATER: u16 = 1 << 8;
    pub const ALARM: u16 = 1 << 9;
    pub const WIFI: u16 = 1 << 10;
    pub const CLEANING: u16 = 1 << 11;

    pub const ALL: u16 = (1 << 12) - 1;

    pub fn none() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Self(Self::ALL)
    }

    pub fn contains(self, group: u16) -> bool {
        self.0 & group != 0
    }

    pub fn any(self) -> bool {
        self.0 != 0
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    fn set(&mut self, group: u16) {
        self.0 |= group;
    }
}

fn float_changed(current: f32, previous: f32, threshold: f32) -> bool {
    (current - previous).abs() >= threshold
}

/// Detects meaningful differences between consecutive status snapshots.
#[derive(Debug, Default)]
pub struct StatusChangeDetector {
    previous: UiStatus,
    initialized: bool,
}

impl StatusChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the mirror; the next check reports a change. Used after a
    /// reconnect so the first publication is always a full one.
    pub fn reset(&mut self) {
        self.initialized = false;
        self.previous = UiStatus::default();
    }

    /// Which logical groups differ from the mirror. Does **not** update
    /// the mirror — call [`has_changed`](Self::has_changed) to commit.
    pub fn changed_fields(&self, current: &UiStatus) -> ChangedFields {
        if !self.initialized {
            return ChangedFields::all();
        }
        let prev = &self.previous;
        let mut fields = ChangedFields::none();

        if current.machine_state != prev.machine_state {
            fields.set(ChangedFields::STATE);
        }
        if current.heating_mode != prev.heating_mode
            || current.is_heating != prev.is_heating
            || current.is_brewing != prev.is_brewing
        {
            fields.set(ChangedFields::HEATING);
        }

        if float_changed(current.brew_temp_c, prev.brew_temp_c, TEMP_THRESHOLD_C)
            || float_changed(current.brew_setpoint_c, prev.brew_setpoint_c, TEMP_THRESHOLD_C)
            || float_changed(current.steam_temp_c, prev.steam_temp_c, TEMP_THRESHOLD_C)
            || float_changed(current.steam_setpoint_c, prev.steam_setpoint_c, TEMP_THRESHOLD_C)
            || float_changed(current.group_temp_c, prev.group_temp_c, TEMP_THRESHOLD_C)
        {
            fields.set(ChangedFields::TEMPS);
        }

        if float_changed(current.pressure_bar, prev.pressure_bar, PRESSURE_THRESHOLD_BAR) {
            fields.set(ChangedFields::PRESSURE);
        }
        if float_changed(current.power_watts, prev.power_watts, POWER_THRESHOLD_W) {
            fields.set(ChangedFields::POWER);
        }

        if float_changed(current.brew_weight_g, prev.brew_weight_g, WEIGHT_THRESHOLD_G)
            || float_changed(current.flow_rate_ml_s, prev.flow_rate_ml_s, FLOW_THRESHOLD_ML_S)
            || float_changed(current.target_weight_g, prev.target_weight_g, WEIGHT_THRESHOLD_G)
            || current.scale_connected != prev.scale_connected
        {
            fields.set(ChangedFields::SCALE);
        }

        if current.is_brewing && current.brew_time_ms != prev.brew_time_ms {
            fields.set(ChangedFields::BREW);
        }

        if current.controller_connected != prev.controller_connected
            || current.wifi_connected != prev.wifi_connected
            || current.mqtt_connected != prev.mqtt_connected
            || current.scale_connected != prev.scale_connected
            || current.cloud_connected != prev.cloud_connected
        {
            fields.set(ChangedFields::CONNECTIONS);
        }

        if current.water_low != prev.water_low {
            fields.set(ChangedFields::WATER);
        }
        if current.alarm_active != prev.alarm_active || current.alarm_code != prev.alarm_code {
            fields.set(ChangedFields::ALARM);
        }
        if current.brew_count != prev.brew_count {
            fields.set(ChangedFields::CLEANING);
        }

        if current.wifi_ap_mode != prev.wifi_ap_mode
            || current.wifi_ip != prev.wifi_ip
            || (current.wifi_rssi_dbm - prev.wifi_rssi_dbm).abs() >= RSSI_THRESHOLD_DBM
        {
            fields.set(ChangedFields::WIFI);
        }

        fields
    }

    /// True when anything meaningful changed since the last `true` return.
    /// On change the snapshot becomes the new mirror, so an identical
    /// follow-up returns false.
    pub fn has_changed(&mut self, current: &UiStatus) -> bool {
        if !self.initialized {
            self.previous = current.clone();
            self.initialized = true;
            return true;
        }

        let changed = self.changed_fields(current).any();
        if changed {
            self.previous = current.clone();
        }
        changed
    }
}
