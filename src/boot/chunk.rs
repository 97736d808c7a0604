//! Chunk-level wire reading for the bootloader.
//!
//! The bootloader polls the UART directly (its interrupt is disabled for
//! the duration of the update), so every read here is a bounded busy-wait
//! that feeds the watchdog while spinning.
//!
//! Chunk frame: `0x55 0xAA | seq_le32 | len_le16 | payload[len] | xor8`.
//! End of stream is either a chunk with sequence `0xFFFFFFFF` or the bare
//! `0xAA 0x55` sentinel; both dialects are accepted.

use crate::hal::{Clock, SerialPort, WatchdogPort};

use super::{CHUNK_MAGIC, CHUNK_MAX_SIZE, END_MAGIC, END_SEQUENCE};

/// Watchdog feed cadence inside wait loops (milliseconds).
const FEED_INTERVAL_MS: u64 = 100;

/// Outcome of a header scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkHeader {
    /// A data chunk follows: `len` payload bytes plus one checksum byte.
    Chunk { seq: u32, len: u16 },
    /// End of stream (either dialect).
    End,
}

/// Block until a byte arrives or `timeout_ms` elapses, feeding the
/// watchdog while waiting.
pub fn read_byte_timeout(
    serial: &mut impl SerialPort,
    clock: &impl Clock,
    watchdog: &impl WatchdogPort,
    timeout_ms: u64,
) -> Option<u8> {
    let start = clock.now_ms();
    let mut last_feed = start;
    loop {
        if let Some(byte) = serial.read_byte() {
            return Some(byte);
        }
        let now = clock.now_ms();
        if now.saturating_sub(start) >= timeout_ms {
            return None;
        }
        if now.saturating_sub(last_feed) >= FEED_INTERVAL_MS {
            watchdog.feed();
            last_feed = now;
        }
    }
}

/// Read exactly `buf.len()` bytes within an overall `timeout_ms` budget.
pub fn read_exact_timeout(
    serial: &mut impl SerialPort,
    clock: &impl Clock,
    watchdog: &impl WatchdogPort,
    buf: &mut [u8],
    timeout_ms: u64,
) -> bool {
    let start = clock.now_ms();
    for slot in buf.iter_mut() {
        let elapsed = clock.now_ms().saturating_sub(start);
        let remaining = timeout_ms.saturating_sub(elapsed).max(100);
        match read_byte_timeout(serial, clock, watchdog, remaining) {
            Some(b) => *slot = b,
            None => return false,
        }
    }
    true
}

/// Scan for the next chunk header or end marker within `timeout_ms`.
///
/// Resynchronises on garbage by searching for a magic pair byte-by-byte.
/// For the bare `0xAA 0x55` sentinel dialect, one trailing byte is
/// consumed if present: a quiet link or a non-magic byte both mean the
/// stream is over.
pub fn receive_header(
    serial: &mut impl SerialPort,
    clock: &impl Clock,
    watchdog: &impl WatchdogPort,
    timeout_ms: u64,
) -> Option<ChunkHeader> {
    let start = clock.now_ms();
    while clock.now_ms().saturating_sub(start) < timeout_ms {
        watchdog.feed();

        let Some(b1) = read_byte_timeout(serial, clock, watchdog, 100) else {
            continue;
        };

        if b1 == CHUNK_MAGIC[0] {
            let Some(b2) = read_byte_timeout(serial, clock, watchdog, 100) else {
                continue;
            };
            if b2 != CHUNK_MAGIC[1] {
                continue;
            }
            let mut header = [0u8; 6];
            if !read_exact_timeout(serial, clock, watchdog, &mut header, timeout_ms) {
                return None;
            }
            let seq = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let len = u16::from_le_bytes([header[4], header[5]]);
            if seq == END_SEQUENCE {
                // End-chunk dialect: drain the rest of the frame so the
                // link stays aligned for the CRC packet.
                let mut scratch = [0u8; CHUNK_MAX_SIZE + 1];
                let drain_len = (len as usize + 1).min(scratch.len());
                let _ = read_exact_timeout(
                    serial,
                    clock,
                    watchdog,
                    &mut scratch[..drain_len],
                    500,
                );
                return Some(ChunkHeader::End);
            }
            return Some(ChunkHeader::Chunk { seq, len });
        } else if b1 == END_MAGIC[0] {
            let Some(b2) = read_byte_timeout(serial, clock, watchdog, 100) else {
                continue;
            };
            if b2 != END_MAGIC[1] {
                continue;
            }
            // Bare sentinel dialect. Consume the tiny trailer byte if one
            // shows up; a magic-looking byte means this was not the end.
            match read_byte_timeout(serial, clock, watchdog, 200) {
                None => return Some(ChunkHeader::End),
                Some(b3) if b3 == CHUNK_MAGIC[1] => continue,
                Some(_) => return Some(ChunkHeader::End),
            }
        }
        // Unrecognised byte: keep scanning.
    }
    None
}

/// Read a chunk's payload and checksum byte. Returns `true` when the XOR
/// verifies; the payload lands in `buf[..len]`.
pub fn receive_chunk_data(
    serial: &mut impl SerialPort,
    clock: &impl Clock,
    watchdog: &impl WatchdogPort,
    buf: &mut [u8],
    timeout_ms: u64,
) -> bool {
    watchdog.feed();
    if !read_exact_timeout(serial, clock, watchdog, buf, timeout_ms) {
        return false;
    }
    watchdog.feed();
    let Some(checksum) = read_byte_timeout(serial, clock, watchdog, timeout_ms) else {
        return false;
    };
    super::xor8(buf) == checksum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::{SimClock, SimSerial, SimWatchdog};

    fn make_chunk(seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&CHUNK_MAGIC);
        out.extend_from_slice(&seq.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(payload);
        out.push(super::super::xor8(payload));
        out
    }

    #[test]
    fn header_parses_chunk() {
        let (mut tx, mut rx) = SimSerial::pair();
        let clock = SimClock::default();
        let dog = SimWatchdog::new();

        tx.write(&make_chunk(7, &[1, 2, 3]));
        let hdr = receive_header(&mut rx, &clock, &dog, 1000).unwrap();
        assert_eq!(hdr, ChunkHeader::Chunk { seq: 7, len: 3 });

        let mut buf = [0u8; 3];
        assert!(receive_chunk_data(&mut rx, &clock, &dog, &mut buf, 1000));
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn header_skips_leading_garbage() {
        let (mut tx, mut rx) = SimSerial::pair();
        let clock = SimClock::default();
        let dog = SimWatchdog::new();

        tx.write(&[0x00, 0x12, 0x55, 0x00]); // noise, including a lone magic byte
        tx.write(&make_chunk(0, &[9]));
        let hdr = receive_header(&mut rx, &clock, &dog, 2000).unwrap();
        assert_eq!(hdr, ChunkHeader::Chunk { seq: 0, len: 1 });
    }

    #[test]
    fn bad_checksum_detected() {
        let (mut tx, mut rx) = SimSerial::pair();
        let clock = SimClock::default();
        let dog = SimWatchdog::new();

        let mut frame = make_chunk(0, &[1, 2, 3]);
        *frame.last_mut().unwrap() = 0x00; // corrupt the xor
        tx.write(&frame);

        let _ = receive_header(&mut rx, &clock, &dog, 1000).unwrap();
        let mut buf = [0u8; 3];
        assert!(!receive_chunk_data(&mut rx, &clock, &dog, &mut buf, 1000));
    }

    #[test]
    fn end_chunk_dialect_recognised_and_drained() {
        let (mut tx, mut rx) = SimSerial::pair();
        let clock = SimClock::default();
        let dog = SimWatchdog::new();

        tx.write(&make_chunk(END_SEQUENCE, &[0xEE, 0xEE]));
        tx.write(&[0x42]); // next byte after the end frame
        let hdr = receive_header(&mut rx, &clock, &dog, 1000).unwrap();
        assert_eq!(hdr, ChunkHeader::End);
        // The end frame body was drained; the following byte is intact.
        assert_eq!(rx.read_byte(), Some(0x42));
    }

    #[test]
    fn bare_sentinel_dialect_recognised() {
        let (mut tx, mut rx) = SimSerial::pair();
        let clock = SimClock::default();
        let dog = SimWatchdog::new();

        tx.write(&END_MAGIC);
        tx.write(&[0x00]); // tiny trailer
        let hdr = receive_header(&mut rx, &clock, &dog, 1000).unwrap();
        assert_eq!(hdr, ChunkHeader::End);
    }

    #[test]
    fn quiet_sentinel_is_end_too() {
        let (mut tx, mut rx) = SimSerial::pair();
        let clock = SimClock::default();
        let dog = SimWatchdog::new();

        tx.write(&END_MAGIC); // nothing after it
        let hdr = receive_header(&mut rx, &clock, &dog, 1000).unwrap();
        assert_eq!(hdr, ChunkHeader::End);
    }

    #[test]
    fn header_times_out_on_silence() {
        let (_tx, mut rx) = SimSerial::pair();
        let clock = SimClock::default();
        let dog = SimWatchdog::new();
        assert!(receive_header(&mut rx, &clock, &dog, 300).is_none());
        // The wait loop kept the watchdog fed.
        assert!(dog.feed_count() > 0);
    }
}
