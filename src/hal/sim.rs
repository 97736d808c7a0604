//! Simulation backends for the port traits.
//!
//! Used by the host harness (`main.rs`) and the test suite. The flash
//! model enforces real NOR semantics — programming can only clear bits,
//! so a page programmed without a preceding erase comes out wrong and the
//! image-validation tests catch the ordering bug.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use super::{
    Clock, ConfigError, ConfigPort, FlashError, FlashOps, SerialPort, StorageError, StoragePort,
    WatchdogPort, FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE, FLASH_TOTAL_SIZE,
};
use crate::config::{validate_config, SystemConfig};

// ---------------------------------------------------------------------------
// Serial link
// ---------------------------------------------------------------------------

type ByteQueue = Arc<Mutex<std::collections::VecDeque<u8>>>;

/// One end of an in-memory duplex serial link.
pub struct SimSerial {
    rx: ByteQueue,
    tx: ByteQueue,
}

impl SimSerial {
    /// Create a connected pair: what one end writes, the other reads.
    pub fn pair() -> (SimSerial, SimSerial) {
        let a_to_b: ByteQueue = Arc::default();
        let b_to_a: ByteQueue = Arc::default();
        (
            SimSerial {
                rx: b_to_a.clone(),
                tx: a_to_b.clone(),
            },
            SimSerial {
                rx: a_to_b,
                tx: b_to_a,
            },
        )
    }

    /// Bytes currently queued toward this end.
    pub fn rx_len(&self) -> usize {
        self.rx.lock().unwrap().len()
    }
}

impl SerialPort for SimSerial {
    fn readable(&self) -> bool {
        !self.rx.lock().unwrap().is_empty()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.rx.lock().unwrap().pop_front()
    }

    fn write(&mut self, bytes: &[u8]) {
        self.tx.lock().unwrap().extend(bytes.iter().copied());
    }

    fn flush(&mut self) {
        // In-memory queue: writes are visible immediately.
    }
}

// ---------------------------------------------------------------------------
// Flash
// ---------------------------------------------------------------------------

/// NOR-flash model: erase sets a sector to 0xFF, programming ANDs bits in.
pub struct SimFlash {
    mem: Vec<u8>,
    erase_count: u32,
    program_count: u32,
}

impl Default for SimFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl SimFlash {
    pub fn new() -> Self {
        Self {
            mem: vec![0xFF; FLASH_TOTAL_SIZE],
            erase_count: 0,
            program_count: 0,
        }
    }

    pub fn erase_count(&self) -> u32 {
        self.erase_count
    }

    pub fn program_count(&self) -> u32 {
        self.program_count
    }

    /// Direct slice access for test assertions.
    pub fn contents(&self, offset: u32, len: usize) -> &[u8] {
        &self.mem[offset as usize..offset as usize + len]
    }
}

impl FlashOps for SimFlash {
    fn erase_sector(&mut self, offset: u32) -> Result<(), FlashError> {
        let off = offset as usize;
        if off % FLASH_SECTOR_SIZE != 0 || off + FLASH_SECTOR_SIZE > self.mem.len() {
            return Err(FlashError::BadOffset);
        }
        self.mem[off..off + FLASH_SECTOR_SIZE].fill(0xFF);
        self.erase_count += 1;
        debug!("sim flash: erase sector @0x{offset:06X}");
        Ok(())
    }

    fn program_page(
        &mut self,
        offset: u32,
        data: &[u8; FLASH_PAGE_SIZE],
    ) -> Result<(), FlashError> {
        let off = offset as usize;
        if off % FLASH_PAGE_SIZE != 0 || off + FLASH_PAGE_SIZE > self.mem.len() {
            return Err(FlashError::BadOffset);
        }
        for (dst, src) in self.mem[off..off + FLASH_PAGE_SIZE].iter_mut().zip(data) {
            *dst &= *src;
        }
        self.program_count += 1;
        Ok(())
    }

    fn read(&self, offset: u32, buf: &mut [u8]) {
        let off = offset as usize;
        buf.copy_from_slice(&self.mem[off..off + buf.len()]);
    }
}

// ---------------------------------------------------------------------------
// Watchdog and clock
// ---------------------------------------------------------------------------

/// Counts feeds so tests can assert the wait loops keep the dog alive.
#[derive(Default)]
pub struct SimWatchdog {
    feeds: AtomicU32,
}

impl SimWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_count(&self) -> u32 {
        self.feeds.load(Ordering::Relaxed)
    }
}

impl WatchdogPort for SimWatchdog {
    fn feed(&self) {
        self.feeds.fetch_add(1, Ordering::Relaxed);
    }
}

/// Monotonic clock that advances a fixed step on every read, so bounded
/// wait loops terminate deterministically without wall-clock sleeps.
pub struct SimClock {
    now_us: AtomicU64,
    step_us: u64,
}

impl SimClock {
    /// `step_us` is added on each `now_ms` call.
    pub fn new(step_us: u64) -> Self {
        Self {
            now_us: AtomicU64::new(0),
            step_us,
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_us.fetch_add(ms * 1000, Ordering::Relaxed);
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new(100) // 0.1 ms per poll
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        self.now_us.fetch_add(self.step_us, Ordering::Relaxed) / 1000
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// In-memory key-value store with NVS-like namespacing.
#[derive(Default)]
pub struct MemStorage {
    store: HashMap<String, Vec<u8>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn composite_key(namespace: &str, key: &str) -> String {
        format!("{}::{}", namespace, key)
    }
}

impl StoragePort for MemStorage {
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        match self.store.get(&Self::composite_key(namespace, key)) {
            Some(v) => {
                let n = v.len().min(buf.len());
                buf[..n].copy_from_slice(&v[..n]);
                Ok(n)
            }
            None => Err(StorageError::NotFound),
        }
    }

    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.store
            .insert(Self::composite_key(namespace, key), data.to_vec());
        Ok(())
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError> {
        self.store.remove(&Self::composite_key(namespace, key));
        Ok(())
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        self.store.contains_key(&Self::composite_key(namespace, key))
    }
}

const CONFIG_NAMESPACE: &str = "brewcore";
const CONFIG_KEY: &str = "syscfg";

impl ConfigPort for MemStorage {
    fn load(&self) -> Result<SystemConfig, ConfigError> {
        let mut buf = [0u8; 2048];
        let n = match StoragePort::read(self, CONFIG_NAMESPACE, CONFIG_KEY, &mut buf) {
            Ok(n) => n,
            Err(StorageError::NotFound) => return Err(ConfigError::NotFound),
            Err(_) => return Err(ConfigError::IoError),
        };
        serde_json::from_slice(&buf[..n]).map_err(|_| ConfigError::Corrupted)
    }

    fn save(&mut self, config: &SystemConfig) -> Result<(), ConfigError> {
        validate_config(config).map_err(ConfigError::ValidationFailed)?;
        let blob = serde_json::to_vec(config).map_err(|_| ConfigError::IoError)?;
        StoragePort::write(self, CONFIG_NAMESPACE, CONFIG_KEY, &blob)
            .map_err(|_| ConfigError::IoError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_pair_is_crossed() {
        let (mut a, mut b) = SimSerial::pair();
        a.write(b"ping");
        assert_eq!(b.read_byte(), Some(b'p'));
        b.write(&[0x42]);
        assert_eq!(a.read_byte(), Some(0x42));
    }

    #[test]
    fn drain_empties_rx() {
        let (mut a, mut b) = SimSerial::pair();
        a.write(&[1, 2, 3]);
        assert_eq!(b.drain_rx(), 3);
        assert!(!b.readable());
    }

    #[test]
    fn flash_program_requires_erase() {
        let mut flash = SimFlash::new();
        let page = [0x00u8; FLASH_PAGE_SIZE];
        flash.erase_sector(0).unwrap();
        flash.program_page(0, &page).unwrap();

        // Second program without erase can only clear bits.
        let page2 = [0xAAu8; FLASH_PAGE_SIZE];
        flash.program_page(0, &page2).unwrap();
        assert_eq!(flash.contents(0, 1)[0], 0x00);
    }

    #[test]
    fn flash_rejects_misaligned_erase() {
        let mut flash = SimFlash::new();
        assert_eq!(flash.erase_sector(17), Err(FlashError::BadOffset));
    }

    #[test]
    fn clock_monotonic() {
        let clock = SimClock::default();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
        clock.advance_ms(100);
        assert!(clock.now_ms() >= a + 100);
    }

    #[test]
    fn config_roundtrip_via_storage() {
        let mut storage = MemStorage::new();
        assert!(matches!(
            ConfigPort::load(&storage),
            Err(ConfigError::NotFound)
        ));
        let cfg = SystemConfig::default();
        ConfigPort::save(&mut storage, &cfg).unwrap();
        let loaded = ConfigPort::load(&storage).unwrap();
        assert_eq!(loaded.brew_setpoint_c, cfg.brew_setpoint_c);
    }

    #[test]
    fn invalid_config_is_rejected_and_previous_kept() {
        let mut storage = MemStorage::new();
        let good = SystemConfig::default();
        ConfigPort::save(&mut storage, &good).unwrap();

        let mut bad = good.clone();
        bad.brew_setpoint_c = 400.0;
        assert!(matches!(
            ConfigPort::save(&mut storage, &bad),
            Err(ConfigError::ValidationFailed(_))
        ));
        let loaded = ConfigPort::load(&storage).unwrap();
        assert_eq!(loaded.brew_setpoint_c, good.brew_setpoint_c);
    }
}
