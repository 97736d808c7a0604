//! Cross-core shared state.
//!
//! Both MCUs split work across two hardware cores. The handful of flags
//! that one core writes while the other reads live here as explicit
//! atomics instead of ad-hoc globals. Transitions that must be observed
//! in order (protocol decoder reset before the bootloader takes the UART)
//! use release/acquire ordering; the reader side pairs every `Acquire`
//! load with the writer's `Release` store.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Device-wide shared flags. Created once at boot, lives until reset.
#[derive(Debug, Default)]
pub struct DeviceShared {
    /// True while the bootloader owns the serial link. While set, no code
    /// outside the bootloader may touch flash or accept command frames.
    bootloader_active: AtomicBool,
    /// A config save has been requested and should be flushed from the
    /// core that owns persistence.
    pending_save: AtomicBool,
    /// Master heating enable, written by the packet handler core, read by
    /// the control core.
    heating_enabled: AtomicBool,
    /// Latched reset cause, reported to the display after reboot.
    reset_cause: AtomicU8,
}

impl DeviceShared {
    pub const fn new() -> Self {
        Self {
            bootloader_active: AtomicBool::new(false),
            pending_save: AtomicBool::new(false),
            heating_enabled: AtomicBool::new(true),
            reset_cause: AtomicU8::new(ResetCause::Ok.encode()),
        }
    }

    /// Publish the bootloader-active transition. The release store makes
    /// every write before it (decoder reset, FIFO drain) visible to the
    /// other core before the flag itself.
    pub fn set_bootloader_active(&self, active: bool) {
        self.bootloader_active.store(active, Ordering::Release);
    }

    pub fn bootloader_active(&self) -> bool {
        self.bootloader_active.load(Ordering::Acquire)
    }

    pub fn request_save(&self) {
        self.pending_save.store(true, Ordering::Release);
    }

    /// Consume a pending save request, if any.
    pub fn take_pending_save(&self) -> bool {
        self.pending_save.swap(false, Ordering::AcqRel)
    }

    pub fn set_heating_enabled(&self, enabled: bool) {
        self.heating_enabled.store(enabled, Ordering::Release);
    }

    pub fn heating_enabled(&self) -> bool {
        self.heating_enabled.load(Ordering::Acquire)
    }

    pub fn set_reset_cause(&self, cause: ResetCause) {
        self.reset_cause.store(cause.encode(), Ordering::Release);
    }

    pub fn reset_cause(&self) -> ResetCause {
        ResetCause::decode(self.reset_cause.load(Ordering::Acquire))
    }
}

/// One-byte reset-cause encoding exposed to the display for diagnostics.
///
/// `0x00` ok, `0x01` watchdog, `0x02` sensor fault, `0x03` stack overflow,
/// `0x80 | err` bootloader failure carrying the wire error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCause {
    Ok,
    Watchdog,
    SensorFault,
    StackOverflow,
    BootloaderFail(u8),
}

impl ResetCause {
    pub const fn encode(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::Watchdog => 0x01,
            Self::SensorFault => 0x02,
            Self::StackOverflow => 0x03,
            Self::BootloaderFail(code) => 0x80 | (code & 0x7F),
        }
    }

    pub fn decode(raw: u8) -> Self {
        match raw {
            0x00 => Self::Ok,
            0x01 => Self::Watchdog,
            0x02 => Self::SensorFault,
            0x03 => Self::StackOverflow,
            b if b & 0x80 != 0 => Self::BootloaderFail(b & 0x7F),
            _ => Self::Ok,
        }
    }
}
