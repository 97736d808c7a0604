//! Firmware sender — the display side of the update pipeline.
//!
//! Streams an image to the controller in acknowledged chunks, then the
//! end marker, the expected-CRC packet, and waits for the final 3-byte
//! ack. The controller acks each chunk only after it has been flashed, so
//! the per-chunk wait must cover a sector erase.

use crc::{Crc, CRC_32_ISO_HDLC};
use log::{info, warn};

use crate::boot::{
    xor8, ACK_BYTE, ACK_FINAL, CHUNK_MAGIC, CHUNK_MAX_SIZE, END_MAGIC, END_SEQUENCE, ERROR_PREFIX,
};
use crate::hal::{Clock, SerialPort};
use crate::proto::{Command, FrameDecoder, Response};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// How long to wait for the controller's ready ack after the bootloader
/// command (covers the safe-state transition and drains).
pub const READY_TIMEOUT_MS: u64 = 5_000;
/// How long to wait for each chunk's ack (covers erase + program).
pub const CHUNK_ACK_TIMEOUT_MS: u64 = 5_000;
/// How long to wait for the final success ack after the CRC packet.
pub const FINAL_ACK_TIMEOUT_MS: u64 = 10_000;

/// Why a send attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The controller never acked the bootloader entry.
    NotReady,
    /// Controller replied `0xFF | code`.
    Rejected(u8),
    /// No ack within the window.
    AckTimeout,
    /// Final ack missing or malformed.
    FinalAckTimeout,
    /// Image empty or larger than the staging region can hold.
    BadImage,
}

impl core::fmt::Display for SendError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotReady => write!(f, "controller not ready for update"),
            Self::Rejected(code) => write!(f, "controller rejected update (code 0x{code:02X})"),
            Self::AckTimeout => write!(f, "chunk ack timeout"),
            Self::FinalAckTimeout => write!(f, "final ack timeout"),
            Self::BadImage => write!(f, "image empty or oversized"),
        }
    }
}

/// Block until the controller's handoff ack for the bootloader command
/// arrives. Chunks sent before this can be lost to the handoff drains.
pub fn wait_ready(serial: &mut impl SerialPort, clock: &impl Clock) -> Result<(), SendError> {
    let mut decoder = FrameDecoder::new();
    let start = clock.now_ms();
    while clock.now_ms().saturating_sub(start) < READY_TIMEOUT_MS {
        let Some(byte) = serial.read_byte() else {
            continue;
        };
        if let Some(frame) = decoder.step(byte) {
            if frame.opcode == Response::Ack as u8
                && frame.payload().first() == Some(&(Command::EnterBootloader as u8))
            {
                info!("OTA send: controller ready");
                return Ok(());
            }
            // Stale status frames from before the handoff: ignore.
        }
    }
    Err(SendError::NotReady)
}

/// Stream `image` to a controller that was just sent the bootloader
/// command: waits for its ready ack, then streams acknowledged chunks.
pub fn send_firmware(
    serial: &mut impl SerialPort,
    clock: &impl Clock,
    image: &[u8],
) -> Result<(), SendError> {
    if image.is_empty() || image.len() > crate::hal::FLASH_MAX_IMAGE_SIZE as usize {
        return Err(SendError::BadImage);
    }

    wait_ready(serial, clock)?;

    info!(
        "OTA send: {} bytes in {} chunks",
        image.len(),
        image.len().div_ceil(CHUNK_MAX_SIZE)
    );

    for (seq, data) in image.chunks(CHUNK_MAX_SIZE).enumerate() {
        write_chunk(serial, seq as u32, data);
        match wait_ack(serial, clock, CHUNK_ACK_TIMEOUT_MS) {
            AckResult::Ack => {}
            AckResult::Error(code) => {
                warn!("OTA send: chunk {seq} rejected with code 0x{code:02X}");
                return Err(SendError::Rejected(code));
            }
            AckResult::Timeout => {
                warn!("OTA send: no ack for chunk {seq}");
                return Err(SendError::AckTimeout);
            }
        }
    }

    // End-chunk dialect, then the expected CRC of the whole image.
    write_chunk(serial, END_SEQUENCE, &[0x00]);
    serial.write(&END_MAGIC);
    serial.write(&CRC32.checksum(image).to_le_bytes());
    serial.flush();

    wait_final_ack(serial, clock)
}

fn write_chunk(serial: &mut impl SerialPort, seq: u32, data: &[u8]) {
    serial.write(&CHUNK_MAGIC);
    serial.write(&seq.to_le_bytes());
    serial.write(&(data.len() as u16).to_le_bytes());
    serial.write(data);
    serial.write(&[xor8(data)]);
    serial.flush();
}

enum AckResult {
    Ack,
    Error(u8),
    Timeout,
}

fn wait_ack(serial: &mut impl SerialPort, clock: &impl Clock, timeout_ms: u64) -> AckResult {
    let start = clock.now_ms();
    while clock.now_ms().saturating_sub(start) < timeout_ms {
        let Some(byte) = serial.read_byte() else {
            continue;
        };
        if byte == ACK_BYTE {
            return AckResult::Ack;
        }
        if byte == ERROR_PREFIX {
            // Error code follows; give it a short grace window.
            let deadline = clock.now_ms() + 200;
            while clock.now_ms() < deadline {
                if let Some(code) = serial.read_byte() {
                    return AckResult::Error(code);
                }
            }
            return AckResult::Error(0);
        }
        // Anything else is line noise; keep scanning.
    }
    AckResult::Timeout
}

fn wait_final_ack(serial: &mut impl SerialPort, clock: &impl Clock) -> Result<(), SendError> {
    let mut window = [0u8; 3];
    let mut filled = 0;
    let start = clock.now_ms();
    while clock.now_ms().saturating_sub(start) < FINAL_ACK_TIMEOUT_MS {
        let Some(byte) = serial.read_byte() else {
            continue;
        };
        if filled == window.len() {
            window.rotate_left(1);
            filled -= 1;
        }
        window[filled] = byte;
        filled += 1;

        if filled >= 2 && window[0] == ERROR_PREFIX {
            return Err(SendError::Rejected(window[1]));
        }
        if filled == 3 && window == ACK_FINAL {
            info!("OTA send: final ack received");
            return Ok(());
        }
    }
    Err(SendError::FinalAckTimeout)
}
