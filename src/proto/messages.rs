//! Typed frame payloads.
//!
//! Fixed-point little-endian packing: temperatures travel as tenths of a
//! degree in an `i16`, pressure as hundredths of a bar in a `u16`. Sensor
//! channels that do not exist on the machine variant are flagged absent in
//! a presence bitmask — never encoded as zero.

use crate::machine::{HeatingMode, MachineState};

// ---------------------------------------------------------------------------
// Status snapshot (unsolicited, 10 Hz)
// ---------------------------------------------------------------------------

pub const STATUS_PAYLOAD_LEN: usize = 19;

const PRESENT_BREW: u8 = 0b0001;
const PRESENT_STEAM: u8 = 0b0010;
const PRESENT_GROUP: u8 = 0b0100;
const PRESENT_PRESSURE: u8 = 0b1000;

/// Periodic sensor/state snapshot streamed by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatusPayload {
    pub machine_state: MachineState,
    pub heating_mode: HeatingMode,
    pub fault_bits: u8,
    pub water_level_pct: u8,
    pub brew_temp_c: Option<f32>,
    pub brew_setpoint_c: f32,
    pub steam_temp_c: Option<f32>,
    pub steam_setpoint_c: f32,
    pub group_temp_c: Option<f32>,
    pub pressure_bar: Option<f32>,
    pub brew_duty_pct: u8,
    pub steam_duty_pct: u8,
}

fn pack_temp(value: Option<f32>) -> i16 {
    match value {
        Some(v) => (v * 10.0) as i16,
        None => 0,
    }
}

impl StatusPayload {
    pub fn to_bytes(&self) -> [u8; STATUS_PAYLOAD_LEN] {
        let mut presence = 0u8;
        if self.brew_temp_c.is_some() {
            presence |= PRESENT_BREW;
        }
        if self.steam_temp_c.is_some() {
            presence |= PRESENT_STEAM;
        }
        if self.group_temp_c.is_some() {
            presence |= PRESENT_GROUP;
        }
        if self.pressure_bar.is_some() {
            presence |= PRESENT_PRESSURE;
        }

        let mut out = [0u8; STATUS_PAYLOAD_LEN];
        out[0] = presence;
        out[1] = self.machine_state as u8;
        out[2] = self.heating_mode as u8;
        out[3] = self.fault_bits;
        out[4] = self.water_level_pct;
        out[5..7].copy_from_slice(&pack_temp(self.brew_temp_c).to_le_bytes());
        out[7..9].copy_from_slice(&((self.brew_setpoint_c * 10.0) as i16).to_le_bytes());
        out[9..11].copy_from_slice(&pack_temp(self.steam_temp_c).to_le_bytes());
        out[11..13].copy_from_slice(&((self.steam_setpoint_c * 10.0) as i16).to_le_bytes());
        out[13..15].copy_from_slice(&pack_temp(self.group_temp_c).to_le_bytes());
        let pressure = (self.pressure_bar.unwrap_or(0.0) * 100.0) as u16;
        out[15..17].copy_from_slice(&pressure.to_le_bytes());
        out[17] = self.brew_duty_pct;
        out[18] = self.steam_duty_pct;
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != STATUS_PAYLOAD_LEN {
            return None;
        }
        let presence = data[0];
        let temp = |lo: usize, bit: u8| -> Option<f32> {
            (presence & bit != 0)
                .then(|| i16::from_le_bytes([data[lo], data[lo + 1]]) as f32 / 10.0)
        };
        Some(Self {
            machine_state: MachineState::from_u8(data[1])?,
            heating_mode: HeatingMode::from_u8(data[2])?,
            fault_bits: data[3],
            water_level_pct: data[4],
            brew_temp_c: temp(5, PRESENT_BREW),
            brew_setpoint_c: i16::from_le_bytes([data[7], data[8]]) as f32 / 10.0,
            steam_temp_c: temp(9, PRESENT_STEAM),
            steam_setpoint_c: i16::from_le_bytes([data[11], data[12]]) as f32 / 10.0,
            group_temp_c: temp(13, PRESENT_GROUP),
            pressure_bar: (presence & PRESENT_PRESSURE != 0)
                .then(|| u16::from_le_bytes([data[15], data[16]]) as f32 / 100.0),
            brew_duty_pct: data[17],
            steam_duty_pct: data[18],
        })
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Setpoint commands carry tenths of a degree in an `i16`.
pub fn encode_setpoint(celsius: f32) -> [u8; 2] {
    ((celsius * 10.0) as i16).to_le_bytes()
}

pub fn decode_setpoint(payload: &[u8]) -> Option<f32> {
    if payload.len() != 2 {
        return None;
    }
    Some(i16::from_le_bytes([payload[0], payload[1]]) as f32 / 10.0)
}

/// PID gain update: boiler index + three LE f32s.
pub fn encode_pid_gains(boiler: u8, kp: f32, ki: f32, kd: f32) -> [u8; 13] {
    let mut out = [0u8; 13];
    out[0] = boiler;
    out[1..5].copy_from_slice(&kp.to_le_bytes());
    out[5..9].copy_from_slice(&ki.to_le_bytes());
    out[9..13].copy_from_slice(&kd.to_le_bytes());
    out
}

pub fn decode_pid_gains(payload: &[u8]) -> Option<(u8, f32, f32, f32)> {
    if payload.len() != 13 {
        return None;
    }
    let f = |lo: usize| f32::from_le_bytes([payload[lo], payload[lo + 1], payload[lo + 2], payload[lo + 3]]);
    Some((payload[0], f(1), f(5), f(9)))
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Reply to a handshake command: protocol version, checksum scheme, and
/// the reset cause latched from the previous boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub proto_version: u8,
    pub checksum_scheme: u8,
    pub fw_major: u8,
    pub fw_minor: u8,
    pub reset_cause: u8,
}

impl HandshakeInfo {
    pub fn to_bytes(&self) -> [u8; 5] {
        [
            self.proto_version,
            self.checksum_scheme,
            self.fw_major,
            self.fw_minor,
            self.reset_cause,
        ]
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != 5 {
            return None;
        }
        Some(Self {
            proto_version: data[0],
            checksum_scheme: data[1],
            fw_major: data[2],
            fw_minor: data[3],
            reset_cause: data[4],
        })
    }
}

// ---------------------------------------------------------------------------
// Config report
// ---------------------------------------------------------------------------

/// Controller config subset readable by the display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfigReport {
    pub brew_setpoint_c: f32,
    pub steam_setpoint_c: f32,
    pub heating_mode: HeatingMode,
    pub machine_kind: u8,
}

impl ConfigReport {
    pub fn to_bytes(&self) -> [u8; 6] {
        let mut out = [0u8; 6];
        out[0..2].copy_from_slice(&((self.brew_setpoint_c * 10.0) as i16).to_le_bytes());
        out[2..4].copy_from_slice(&((self.steam_setpoint_c * 10.0) as i16).to_le_bytes());
        out[4] = self.heating_mode as u8;
        out[5] = self.machine_kind;
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != 6 {
            return None;
        }
        Some(Self {
            brew_setpoint_c: i16::from_le_bytes([data[0], data[1]]) as f32 / 10.0,
            steam_setpoint_c: i16::from_le_bytes([data[2], data[3]]) as f32 / 10.0,
            heating_mode: HeatingMode::from_u8(data[4])?,
            machine_kind: data[5],
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{HeatingMode, MachineState};

    #[test]
    fn status_roundtrip_full() {
        let status = StatusPayload {
            machine_state: MachineState::Heating,
            heating_mode: HeatingMode::Both,
            fault_bits: 0b0001_0000,
            water_level_pct: 80,
            brew_temp_c: Some(92.4),
            brew_setpoint_c: 93.0,
            steam_temp_c: Some(139.9),
            steam_setpoint_c: 140.0,
            group_temp_c: None,
            pressure_bar: Some(9.12),
            brew_duty_pct: 42,
            steam_duty_pct: 7,
        };
        let decoded = StatusPayload::from_bytes(&status.to_bytes()).unwrap();
        assert_eq!(decoded.machine_state, MachineState::Heating);
        assert!((decoded.brew_temp_c.unwrap() - 92.4).abs() < 0.05);
        assert!((decoded.pressure_bar.unwrap() - 9.12).abs() < 0.005);
        assert!(decoded.group_temp_c.is_none());
        assert_eq!(decoded.brew_duty_pct, 42);
    }

    #[test]
    fn absent_channels_stay_absent_not_zero() {
        // A heat-exchanger machine: no brew NTC. The decoded reading must
        // come back as None even though the wire bytes for the field are 0.
        let status = StatusPayload {
            brew_temp_c: None,
            steam_temp_c: Some(120.0),
            ..Default::default()
        };
        let decoded = StatusPayload::from_bytes(&status.to_bytes()).unwrap();
        assert!(decoded.brew_temp_c.is_none());
        assert_eq!(decoded.steam_temp_c, Some(120.0));
    }

    #[test]
    fn status_rejects_wrong_length() {
        assert!(StatusPayload::from_bytes(&[0u8; 5]).is_none());
        assert!(StatusPayload::from_bytes(&[0u8; STATUS_PAYLOAD_LEN + 1]).is_none());
    }

    #[test]
    fn status_rejects_invalid_state() {
        let mut bytes = StatusPayload::default().to_bytes();
        bytes[1] = 0xEE;
        assert!(StatusPayload::from_bytes(&bytes).is_none());
    }

    #[test]
    fn setpoint_roundtrip() {
        let bytes = encode_setpoint(93.5);
        assert_eq!(decode_setpoint(&bytes), Some(93.5));
        assert!(decode_setpoint(&[1]).is_none());
    }

    #[test]
    fn negative_setpoint_roundtrip() {
        let bytes = encode_setpoint(-5.0);
        assert_eq!(decode_setpoint(&bytes), Some(-5.0));
    }

    #[test]
    fn pid_gains_roundtrip() {
        let bytes = encode_pid_gains(1, 2.0, 0.1, 0.5);
        let (boiler, kp, ki, kd) = decode_pid_gains(&bytes).unwrap();
        assert_eq!(boiler, 1);
        assert_eq!((kp, ki, kd), (2.0, 0.1, 0.5));
    }

    #[test]
    fn handshake_roundtrip() {
        let info = HandshakeInfo {
            proto_version: 3,
            checksum_scheme: 1,
            fw_major: 2,
            fw_minor: 33,
            reset_cause: 0x83,
        };
        assert_eq!(HandshakeInfo::from_bytes(&info.to_bytes()), Some(info));
    }

    #[test]
    fn config_report_roundtrip() {
        let report = ConfigReport {
            brew_setpoint_c: 93.0,
            steam_setpoint_c: 140.0,
            heating_mode: HeatingMode::BrewOnly,
            machine_kind: 2,
        };
        assert_eq!(ConfigReport::from_bytes(&report.to_bytes()), Some(report));
    }
}
