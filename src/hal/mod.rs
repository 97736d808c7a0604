//! Port traits — the boundary between domain logic and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ domain (protocol, bootloader, meter, ...)
//! ```
//!
//! Driven adapters (UART, flash, watchdog, clock, storage) implement these
//! traits. The domain consumes them via generics, so the core never touches
//! hardware directly and every module is testable on the host with the
//! simulation backends in [`sim`].

pub mod sim;

#[cfg(target_os = "espidf")]
pub mod espidf;

use crate::config::SystemConfig;

// ---------------------------------------------------------------------------
// Serial port
// ---------------------------------------------------------------------------

/// A byte-oriented serial link.
///
/// The link is single-writer: only one core transmits at a time, and
/// ownership is transferred explicitly to the bootloader for the duration
/// of a firmware update.
pub trait SerialPort {
    /// True if at least one byte is waiting in the receive FIFO.
    fn readable(&self) -> bool;

    /// Pop one byte from the receive FIFO, if any. Never blocks.
    fn read_byte(&mut self) -> Option<u8>;

    /// Queue bytes for transmission.
    fn write(&mut self, bytes: &[u8]);

    /// Block until the transmit FIFO has drained.
    fn flush(&mut self);

    /// Discard everything in the receive FIFO. Returns the number of
    /// bytes dropped.
    fn drain_rx(&mut self) -> usize {
        let mut n = 0;
        while self.read_byte().is_some() {
            n += 1;
        }
        n
    }
}

// ---------------------------------------------------------------------------
// Flash
// ---------------------------------------------------------------------------

/// Erase granularity of the controller's flash part.
pub const FLASH_SECTOR_SIZE: usize = 4096;
/// Program granularity.
pub const FLASH_PAGE_SIZE: usize = 256;
/// Total flash size modeled by the layout below.
pub const FLASH_TOTAL_SIZE: usize = 2 * 1024 * 1024;
/// Active firmware region starts at offset 0 (the part boots from it).
pub const FLASH_ACTIVE_OFFSET: u32 = 0;
/// Staging region for received firmware images.
pub const FLASH_STAGING_OFFSET: u32 = 0x0018_0000; // 1.5 MiB
/// Largest image that fits between staging start and end of flash.
pub const FLASH_MAX_IMAGE_SIZE: u32 = (FLASH_TOTAL_SIZE as u32) - FLASH_STAGING_OFFSET;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Offset not aligned to the required granularity or out of range.
    BadOffset,
    /// The erase operation failed.
    EraseFailed,
    /// The program operation failed (or targeted unerased bytes).
    ProgramFailed,
}

/// Sector-erase / page-program flash primitives.
///
/// Implementations must be callable while the other core is parked: they
/// may briefly disable interrupts but must not stall the peer core. On the
/// real part the implementations used during the copy phase are
/// ROM-resident; see [`crate::boot::copier`].
pub trait FlashOps {
    /// Erase one sector. `offset` must be sector-aligned.
    fn erase_sector(&mut self, offset: u32) -> Result<(), FlashError>;

    /// Program one page. `offset` must be page-aligned and the page must
    /// have been erased since it was last programmed.
    fn program_page(&mut self, offset: u32, data: &[u8; FLASH_PAGE_SIZE])
        -> Result<(), FlashError>;

    /// Read raw flash contents.
    fn read(&self, offset: u32, buf: &mut [u8]);
}

// ---------------------------------------------------------------------------
// Watchdog and clock
// ---------------------------------------------------------------------------

/// Hardware watchdog. Fed every main-loop tick, inside every bootloader
/// wait loop, and before/after each flash primitive.
pub trait WatchdogPort {
    fn feed(&self);
}

/// Monotonic milliseconds since boot.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

// ---------------------------------------------------------------------------
// Storage / configuration ports
// ---------------------------------------------------------------------------

/// Errors from [`ConfigPort`] operations.
#[derive(Debug)]
pub enum ConfigError {
    /// No config found in storage (first boot).
    NotFound,
    /// Stored config failed integrity / deserialization check.
    Corrupted,
    /// A config field failed range validation.
    ValidationFailed(&'static str),
    /// Generic I/O error from the storage backend.
    IoError,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "config not found"),
            Self::Corrupted => write!(f, "config corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {}", msg),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

/// Errors from [`StoragePort`] operations.
#[derive(Debug)]
pub enum StorageError {
    /// Requested key does not exist.
    NotFound,
    /// Storage partition is full.
    Full,
    /// Generic I/O error.
    IoError,
}

impl core::fmt::Display for StorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Full => write!(f, "storage full"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

/// Persistent key-value storage (NVS on the display MCU, a reserved flash
/// region on the controller). Writes must be atomic — no partial records
/// on power loss.
pub trait StoragePort {
    /// Read a value. Returns the number of bytes written to `buf`.
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Write a value atomically.
    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Delete a key. Returns `Ok(())` even if the key didn't exist.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError>;

    /// Check whether a key exists without reading it.
    fn exists(&self, namespace: &str, key: &str) -> bool;
}

/// Loads and persists system configuration.
///
/// Implementations MUST validate before persisting
/// ([`crate::config::validate_config`]); invalid values are rejected with
/// [`ConfigError::ValidationFailed`], never silently clamped.
pub trait ConfigPort {
    /// Load configuration from persistent storage.
    fn load(&self) -> Result<SystemConfig, ConfigError>;

    /// Validate and persist configuration.
    fn save(&mut self, config: &SystemConfig) -> Result<(), ConfigError>;
}
