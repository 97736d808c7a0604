//! Machine variants and the state/mode enums shared by both MCUs.
//!
//! The same PCB drives several boiler topologies. A variant may
//! legitimately lack a sensor: heat-exchanger machines have no brew NTC,
//! single-boiler machines have no steam NTC. Sensor channels that do not
//! exist report `None`, never zero, and the control layer must not enable
//! the corresponding PID.

use serde::{Deserialize, Serialize};

/// Boiler topology of the host machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MachineKind {
    SingleBoiler = 0,
    HeatExchanger = 1,
    DualBoiler = 2,
}

impl MachineKind {
    /// HX machines brew through the exchanger; there is no brew NTC.
    pub fn has_brew_ntc(self) -> bool {
        !matches!(self, Self::HeatExchanger)
    }

    /// Single-boiler machines have no separate steam circuit.
    pub fn has_steam_ntc(self) -> bool {
        !matches!(self, Self::SingleBoiler)
    }
}

/// Top-level machine state as streamed to the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MachineState {
    #[default]
    Standby = 0,
    Heating = 1,
    Ready = 2,
    Brewing = 3,
    Fault = 4,
    Updating = 5,
}

impl MachineState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Standby),
            1 => Some(Self::Heating),
            2 => Some(Self::Ready),
            3 => Some(Self::Brewing),
            4 => Some(Self::Fault),
            5 => Some(Self::Updating),
            _ => None,
        }
    }
}

/// Which boilers the control loop is allowed to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum HeatingMode {
    Off = 0,
    #[default]
    BrewOnly = 1,
    SteamOnly = 2,
    Both = 3,
}

impl HeatingMode {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Off),
            1 => Some(Self::BrewOnly),
            2 => Some(Self::SteamOnly),
            3 => Some(Self::Both),
            _ => None,
        }
    }

    pub fn brew_enabled(self) -> bool {
        matches!(self, Self::BrewOnly | Self::Both)
    }

    pub fn steam_enabled(self) -> bool {
        matches!(self, Self::SteamOnly | Self::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hx_has_no_brew_ntc() {
        assert!(!MachineKind::HeatExchanger.has_brew_ntc());
        assert!(MachineKind::HeatExchanger.has_steam_ntc());
    }

    #[test]
    fn single_boiler_has_no_steam_ntc() {
        assert!(MachineKind::SingleBoiler.has_brew_ntc());
        assert!(!MachineKind::SingleBoiler.has_steam_ntc());
    }

    #[test]
    fn dual_boiler_has_both() {
        assert!(MachineKind::DualBoiler.has_brew_ntc());
        assert!(MachineKind::DualBoiler.has_steam_ntc());
    }

    #[test]
    fn state_roundtrip() {
        for s in [
            MachineState::Standby,
            MachineState::Heating,
            MachineState::Ready,
            MachineState::Brewing,
            MachineState::Fault,
            MachineState::Updating,
        ] {
            assert_eq!(MachineState::from_u8(s as u8), Some(s));
        }
        assert_eq!(MachineState::from_u8(99), None);
    }

    #[test]
    fn mode_gating() {
        assert!(HeatingMode::Both.brew_enabled());
        assert!(HeatingMode::Both.steam_enabled());
        assert!(!HeatingMode::Off.brew_enabled());
        assert!(!HeatingMode::SteamOnly.brew_enabled());
    }
}
