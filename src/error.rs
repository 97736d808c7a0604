//! Unified error types for the brewcore firmware.
//!
//! A single `Error` enum that every subsystem can convert into, keeping the
//! top-level control loop's error handling uniform. All variants are `Copy`
//! so they can be cheaply passed through the safety supervisor and across
//! cores without allocation.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level firmware error
// ---------------------------------------------------------------------------

/// Every fallible operation in the firmware funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A sensor could not be read or returned out-of-range data.
    Sensor(SensorError),
    /// A safety interlock was violated.
    Safety(SafetyFault),
    /// A communication subsystem failed.
    Comms(CommsError),
    /// Configuration is invalid or could not be loaded.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sensor(e) => write!(f, "sensor: {e}"),
            Self::Safety(e) => write!(f, "safety: {e}"),
            Self::Comms(e) => write!(f, "comms: {e}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sensor errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    /// ADC read returned an error or timed out.
    AdcReadFailed,
    /// Reading is outside the physically plausible range.
    OutOfRange,
    /// Channel does not exist on this machine variant.
    NotPresent,
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdcReadFailed => write!(f, "ADC read failed"),
            Self::OutOfRange => write!(f, "reading out of range"),
            Self::NotPresent => write!(f, "sensor not present"),
        }
    }
}

impl From<SensorError> for Error {
    fn from(e: SensorError) -> Self {
        Self::Sensor(e)
    }
}

// ---------------------------------------------------------------------------
// Safety faults
// ---------------------------------------------------------------------------

/// Safety faults are a special category: they force the machine into a safe
/// state with all heaters and pumps off. They are accumulated in a bitfield
/// by the safety supervisor so that multiple simultaneous faults can be
/// tracked and individually cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SafetyFault {
    /// Brew boiler NTC persistently invalid.
    BrewSensorFault = 0b0000_0001,
    /// Steam boiler NTC persistently invalid.
    SteamSensorFault = 0b0000_0010,
    /// Pressure transducer persistently invalid.
    PressureSensorFault = 0b0000_0100,
    /// Water tank empty.
    WaterLow = 0b0000_1000,
    /// Boiler temperature above the hard limit.
    OverTemperature = 0b0001_0000,
}

impl SafetyFault {
    /// Return the bitmask for this fault.
    pub const fn mask(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for SafetyFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BrewSensorFault => write!(f, "brew sensor fault"),
            Self::SteamSensorFault => write!(f, "steam sensor fault"),
            Self::PressureSensorFault => write!(f, "pressure sensor fault"),
            Self::WaterLow => write!(f, "water level low"),
            Self::OverTemperature => write!(f, "over temperature"),
        }
    }
}

impl From<SafetyFault> for Error {
    fn from(e: SafetyFault) -> Self {
        Self::Safety(e)
    }
}

// ---------------------------------------------------------------------------
// Communications errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommsError {
    /// No ack arrived within the command timeout.
    AckTimeout,
    /// Peer replied with a NAK carrying this code.
    Nak(u8),
    /// The transmit path failed (FIFO never drained).
    TxFailed,
}

impl fmt::Display for CommsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AckTimeout => write!(f, "ack timeout"),
            Self::Nak(code) => write!(f, "peer NAK (code {code})"),
            Self::TxFailed => write!(f, "transmit failed"),
        }
    }
}

impl From<CommsError> for Error {
    fn from(e: CommsError) -> Self {
        Self::Comms(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
