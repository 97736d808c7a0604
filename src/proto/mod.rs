//! Framed serial protocol between the display and controller MCUs.
//!
//! Wire format:
//! ```text
//! ┌──────┬────────┬─────┬──────────────┬──────────┐
//! │ SOF  │ OPCODE │ LEN │ PAYLOAD[LEN] │ CHECKSUM │
//! │ 0x7E │  (1B)  │(1B) │              │ XOR (1B) │
//! └──────┴────────┴─────┴──────────────┴──────────┘
//! ```
//!
//! The checksum is XOR over `OPCODE | LEN | PAYLOAD`. XOR is sufficient for
//! short frames on a short on-board UART; the handshake response carries a
//! checksum-scheme byte so a CRC-8 revision can be detected by the peer.
//!
//! Opcodes fall in three disjoint spaces: commands (display → controller),
//! responses (controller → display), and unsolicited status
//! (controller → display). A malformed frame is silently dropped — status
//! is periodic and self-healing, and commands are retried by the caller.

pub mod codec;
pub mod messages;

pub use codec::{encode_frame, Frame, FrameDecoder, MAX_PAYLOAD};

/// Start-of-frame sentinel.
pub const SOF: u8 = 0x7E;

/// Protocol version reported by the handshake.
pub const PROTO_VERSION: u8 = 3;

/// Checksum scheme identifier carried in the handshake (1 = XOR-8).
pub const CHECKSUM_SCHEME_XOR: u8 = 1;

/// Command opcodes (display → controller).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Handshake = 0x01,
    SetBrewSetpoint = 0x02,
    SetSteamSetpoint = 0x03,
    SetHeatingMode = 0x04,
    SetComponent = 0x05,
    EnterBootloader = 0x06,
    Reset = 0x07,
    GetConfig = 0x08,
    SetPidGains = 0x09,
    ConfigureMeter = 0x0A,
}

impl Command {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(Self::Handshake),
            0x02 => Some(Self::SetBrewSetpoint),
            0x03 => Some(Self::SetSteamSetpoint),
            0x04 => Some(Self::SetHeatingMode),
            0x05 => Some(Self::SetComponent),
            0x06 => Some(Self::EnterBootloader),
            0x07 => Some(Self::Reset),
            0x08 => Some(Self::GetConfig),
            0x09 => Some(Self::SetPidGains),
            0x0A => Some(Self::ConfigureMeter),
            _ => None,
        }
    }
}

/// Response opcodes (controller → display).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Response {
    Ack = 0x41,
    Nak = 0x42,
    HandshakeInfo = 0x43,
    ConfigReport = 0x44,
}

impl Response {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x41 => Some(Self::Ack),
            0x42 => Some(Self::Nak),
            0x43 => Some(Self::HandshakeInfo),
            0x44 => Some(Self::ConfigReport),
            _ => None,
        }
    }
}

/// Unsolicited status opcodes (controller → display).
pub const STATUS_REPORT: u8 = 0x81;

/// NAK error codes.
pub const NAK_BAD_PAYLOAD: u8 = 0x01;
pub const NAK_OUT_OF_RANGE: u8 = 0x02;
pub const NAK_UNSUPPORTED: u8 = 0x03;
pub const NAK_BUSY: u8 = 0x04;
