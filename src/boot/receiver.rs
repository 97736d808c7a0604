//! Reception into the staging region and post-reception validation.
//!
//! The session owns the serial link for its whole lifetime: the protocol
//! decoder has been reset and the UART interrupt disabled before `run` is
//! entered, and nothing else may touch flash until the device resets.
//!
//! Every accepted chunk is appended to a RAM page buffer and programmed
//! into the staging region as pages fill, erasing each sector on first
//! touch. The CRC-32 of the image is accumulated chunk-by-chunk during
//! reception — the staging region is never read back for it, which keeps
//! the check independent of cache coherency on the execute-in-place bus.

use crc::{Crc, CRC_32_ISO_HDLC};
use log::{info, warn};

use crate::hal::{
    Clock, FlashOps, SerialPort, WatchdogPort, FLASH_MAX_IMAGE_SIZE, FLASH_PAGE_SIZE,
    FLASH_SECTOR_SIZE, FLASH_STAGING_OFFSET,
};

use super::chunk::{self, ChunkHeader};
use super::{
    vector_table_plausible, BootError, BootState, ACK_BYTE, ACK_FINAL, CHUNK_MAX_SIZE,
    CHUNK_TIMEOUT_MS, CRC_PACKET_WAIT_MS, END_MAGIC, ERROR_PREFIX, OVERALL_TIMEOUT_MS,
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A staged image that passed every validation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedImage {
    pub size: u32,
    pub chunks: u32,
    pub crc32: u32,
}

// ---------------------------------------------------------------------------
// Staging writer
// ---------------------------------------------------------------------------

/// Page-buffered writer into the staging region. Sectors are erased on
/// first touch; pages are programmed as the buffer fills.
struct StagingWriter<'f, F: FlashOps> {
    flash: &'f mut F,
    page_buf: [u8; FLASH_PAGE_SIZE],
    page_fill: usize,
    next_page: u32,
    erased_sector: Option<u32>,
}

impl<'f, F: FlashOps> StagingWriter<'f, F> {
    fn new(flash: &'f mut F) -> Self {
        Self {
            flash,
            page_buf: [0xFF; FLASH_PAGE_SIZE],
            page_fill: 0,
            next_page: FLASH_STAGING_OFFSET,
            erased_sector: None,
        }
    }

    fn push(&mut self, data: &[u8], watchdog: &impl WatchdogPort) -> Result<(), BootError> {
        let mut offset = 0;
        while offset < data.len() {
            let space = FLASH_PAGE_SIZE - self.page_fill;
            let take = (data.len() - offset).min(space);
            self.page_buf[self.page_fill..self.page_fill + take]
                .copy_from_slice(&data[offset..offset + take]);
            self.page_fill += take;
            offset += take;

            if self.page_fill == FLASH_PAGE_SIZE {
                self.flush_page(watchdog)?;
            }
        }
        Ok(())
    }

    /// Pad the tail with 0xFF and program the last partial page.
    fn finish(&mut self, watchdog: &impl WatchdogPort) -> Result<(), BootError> {
        if self.page_fill > 0 {
            self.page_buf[self.page_fill..].fill(0xFF);
            self.page_fill = FLASH_PAGE_SIZE;
            self.flush_page(watchdog)?;
        }
        Ok(())
    }

    fn flush_page(&mut self, watchdog: &impl WatchdogPort) -> Result<(), BootError> {
        let sector = self.next_page & !(FLASH_SECTOR_SIZE as u32 - 1);
        // Erase can take 50-100 ms and program 10-20 ms with interrupts
        // off; feed the dog on both sides of each.
        watchdog.feed();
        if self.erased_sector != Some(sector) {
            self.flash
                .erase_sector(sector)
                .map_err(|_| BootError::FlashErase)?;
            self.erased_sector = Some(sector);
            watchdog.feed();
        }
        self.flash
            .program_page(self.next_page, &self.page_buf)
            .map_err(|_| BootError::FlashWrite)?;
        watchdog.feed();

        self.next_page += FLASH_PAGE_SIZE as u32;
        self.page_fill = 0;
        self.page_buf = [0xFF; FLASH_PAGE_SIZE];
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One firmware-reception session.
#[derive(Debug)]
pub struct BootloaderSession {
    state: BootState,
}

impl Default for BootloaderSession {
    fn default() -> Self {
        Self::new()
    }
}

impl BootloaderSession {
    pub fn new() -> Self {
        Self {
            state: BootState::Idle,
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    /// Receive, stage, and validate a firmware image.
    ///
    /// On success the image sits validated in the staging region and the
    /// final ack has been sent; the caller proceeds to the copy phase.
    /// On failure a 2-byte error reply has been sent and the caller must
    /// drain the link and reset — normal operation cannot be resumed from
    /// the middle of an update.
    pub fn run(
        &mut self,
        serial: &mut impl SerialPort,
        flash: &mut impl FlashOps,
        watchdog: &impl WatchdogPort,
        clock: &impl Clock,
    ) -> Result<ValidatedImage, BootError> {
        // The link was fully drained during the handoff, before the ready
        // ack went out; anything in the FIFO now is firmware traffic.
        self.state = BootState::Prepared;

        match self.receive_and_validate(serial, flash, watchdog, clock) {
            Ok(image) => {
                self.state = BootState::Validated;
                Ok(image)
            }
            Err(err) => {
                warn!("Bootloader: failed: {err}");
                serial.write(&[ERROR_PREFIX, err.code()]);
                serial.flush();
                self.state = BootState::Failed(err);
                Err(err)
            }
        }
    }

    fn receive_and_validate(
        &mut self,
        serial: &mut impl SerialPort,
        flash: &mut impl FlashOps,
        watchdog: &impl WatchdogPort,
        clock: &impl Clock,
    ) -> Result<ValidatedImage, BootError> {
        let start = clock.now_ms();
        let mut writer = StagingWriter::new(flash);
        let mut digest = CRC32.digest();
        let mut head = [0u8; 8];
        let mut received: u32 = 0;
        let mut expected_seq: u32 = 0;

        info!("Bootloader: reception loop started");

        loop {
            watchdog.feed();
            if clock.now_ms().saturating_sub(start) > OVERALL_TIMEOUT_MS {
                return Err(BootError::Timeout);
            }
            self.state = BootState::Receiving {
                next_seq: expected_seq,
            };

            let header = chunk::receive_header(serial, clock, watchdog, CHUNK_TIMEOUT_MS)
                .ok_or(BootError::Timeout)?;

            let (seq, len) = match header {
                ChunkHeader::End => break,
                ChunkHeader::Chunk { seq, len } => (seq, len),
            };

            // Strictly in sequence: no gaps, no resends.
            if len == 0 || len as usize > CHUNK_MAX_SIZE || seq != expected_seq {
                warn!(
                    "Bootloader: invalid chunk (seq={seq}, expected {expected_seq}, len={len})"
                );
                return Err(BootError::InvalidChunk);
            }
            if received + len as u32 > FLASH_MAX_IMAGE_SIZE {
                return Err(BootError::InvalidChunk);
            }

            let mut data = [0u8; CHUNK_MAX_SIZE];
            if !chunk::receive_chunk_data(
                serial,
                clock,
                watchdog,
                &mut data[..len as usize],
                CHUNK_TIMEOUT_MS,
            ) {
                return Err(BootError::Checksum);
            }
            let data = &data[..len as usize];

            // Capture the vector-table words as they stream past.
            if (received as usize) < head.len() {
                let take = (head.len() - received as usize).min(data.len());
                head[received as usize..received as usize + take]
                    .copy_from_slice(&data[..take]);
            }

            digest.update(data);
            writer.push(data, watchdog)?;
            received += len as u32;
            expected_seq += 1;

            // Ack only after the chunk hit flash: programming runs with
            // interrupts off, so the link must be idle until we're ready
            // for the next chunk.
            watchdog.feed();
            serial.write(&[ACK_BYTE]);
            serial.flush();
        }

        writer.finish(watchdog)?;

        if received < head.len() as u32 {
            return Err(BootError::InvalidImage);
        }
        if !vector_table_plausible(&head) {
            warn!("Bootloader: implausible vector table in staged image");
            return Err(BootError::InvalidImage);
        }

        let crc = digest.finalize();
        info!("Bootloader: received {received} bytes in {expected_seq} chunks, CRC32=0x{crc:08X}");

        // Optional expected-CRC packet: `0xAA 0x55` + 4 LE bytes.
        if let Some(expected) = wait_expected_crc(serial, clock, watchdog) {
            if expected != crc {
                warn!("Bootloader: CRC mismatch (calculated 0x{crc:08X}, expected 0x{expected:08X})");
                return Err(BootError::CrcMismatch);
            }
            info!("Bootloader: CRC verified");
        } else {
            info!("Bootloader: no expected CRC received, skipping verification");
        }

        serial.write(&ACK_FINAL);
        serial.flush();

        Ok(ValidatedImage {
            size: received,
            chunks: expected_seq,
            crc32: crc,
        })
    }
}

/// Wait up to [`CRC_PACKET_WAIT_MS`] for the sender's expected CRC-32.
fn wait_expected_crc(
    serial: &mut impl SerialPort,
    clock: &impl Clock,
    watchdog: &impl WatchdogPort,
) -> Option<u32> {
    let start = clock.now_ms();
    while clock.now_ms().saturating_sub(start) < CRC_PACKET_WAIT_MS {
        watchdog.feed();
        let Some(b1) = chunk::read_byte_timeout(serial, clock, watchdog, 100) else {
            continue;
        };
        if b1 != END_MAGIC[0] {
            continue;
        }
        let Some(b2) = chunk::read_byte_timeout(serial, clock, watchdog, 100) else {
            continue;
        };
        if b2 != END_MAGIC[1] {
            continue;
        }
        let mut bytes = [0u8; 4];
        if chunk::read_exact_timeout(serial, clock, watchdog, &mut bytes, 1000) {
            return Some(u32::from_le_bytes(bytes));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::{SimClock, SimFlash, SimSerial, SimWatchdog};
    use crate::hal::FLASH_STAGING_OFFSET;

    const CRC_TEST: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

    /// A plausible image: SP in SRAM, PC in flash, then a byte pattern.
    fn test_image(len: usize) -> Vec<u8> {
        let mut image = vec![0u8; len];
        image[..4].copy_from_slice(&0x2004_2000u32.to_le_bytes());
        image[4..8].copy_from_slice(&0x1000_0201u32.to_le_bytes());
        for (i, b) in image.iter_mut().enumerate().skip(8) {
            *b = (i % 251) as u8;
        }
        image
    }

    fn write_chunk(serial: &mut SimSerial, seq: u32, payload: &[u8]) {
        serial.write(&super::super::CHUNK_MAGIC);
        serial.write(&seq.to_le_bytes());
        serial.write(&(payload.len() as u16).to_le_bytes());
        serial.write(payload);
        serial.write(&[super::super::xor8(payload)]);
    }

    fn write_end(serial: &mut SimSerial) {
        write_chunk(serial, super::super::END_SEQUENCE, &[0x00]);
    }

    fn write_crc_packet(serial: &mut SimSerial, crc: u32) {
        serial.write(&END_MAGIC);
        serial.write(&crc.to_le_bytes());
    }

    /// Pre-script the whole transfer into the link, then run the session.
    /// `mutate` sees the (sequence, payload) pairs before they are sent.
    fn run_scripted(
        image: &[u8],
        mutate: impl FnOnce(&mut Vec<(u32, Vec<u8>)>),
        with_crc: bool,
    ) -> (Result<ValidatedImage, BootError>, SimFlash, SimSerial) {
        let (mut sender, mut receiver) = SimSerial::pair();

        let mut chunks: Vec<(u32, Vec<u8>)> = image
            .chunks(256)
            .enumerate()
            .map(|(seq, c)| (seq as u32, c.to_vec()))
            .collect();
        mutate(&mut chunks);
        for (seq, data) in &chunks {
            write_chunk(&mut sender, *seq, data);
        }
        write_end(&mut sender);
        if with_crc {
            write_crc_packet(&mut sender, CRC_TEST.checksum(image));
        }

        let mut flash = SimFlash::new();
        let dog = SimWatchdog::new();
        let clock = SimClock::default();
        let mut session = BootloaderSession::new();
        let result = session.run(&mut receiver, &mut flash, &dog, &clock);
        (result, flash, sender)
    }

    #[test]
    fn happy_path_4k_image() {
        let image = test_image(4096);
        let (result, flash, mut sender) = run_scripted(&image, |_| {}, true);
        let validated = result.unwrap();
        assert_eq!(validated.size, 4096);
        assert_eq!(validated.chunks, 16);

        // Staged bytes match the image.
        assert_eq!(flash.contents(FLASH_STAGING_OFFSET, 4096), &image[..]);

        // 16 per-chunk acks then the 3-byte final ack.
        let mut acks = Vec::new();
        while let Some(b) = sender.read_byte() {
            acks.push(b);
        }
        assert_eq!(&acks[..16], &[ACK_BYTE; 16]);
        assert_eq!(&acks[16..], &ACK_FINAL);
    }

    #[test]
    fn unaligned_image_is_padded() {
        let image = test_image(1000); // not a page multiple
        let (result, flash, _) = run_scripted(&image, |_| {}, true);
        assert_eq!(result.unwrap().size, 1000);
        assert_eq!(flash.contents(FLASH_STAGING_OFFSET, 1000), &image[..]);
        // Pad bytes after the image are erased-state 0xFF.
        assert_eq!(flash.contents(FLASH_STAGING_OFFSET + 1000, 24), &[0xFF; 24]);
    }

    #[test]
    fn corrupted_chunk_reports_checksum_error() {
        let image = test_image(4096);
        let (mut sender, mut receiver) = SimSerial::pair();

        for (seq, data) in image.chunks(256).enumerate() {
            if seq == 7 {
                // Chunk 7 goes out with a zeroed checksum byte.
                sender.write(&super::super::CHUNK_MAGIC);
                sender.write(&(seq as u32).to_le_bytes());
                sender.write(&(data.len() as u16).to_le_bytes());
                sender.write(data);
                sender.write(&[0x00]);
                break;
            }
            write_chunk(&mut sender, seq as u32, data);
        }

        let mut flash = SimFlash::new();
        let dog = SimWatchdog::new();
        let clock = SimClock::default();
        let mut session = BootloaderSession::new();
        let err = session
            .run(&mut receiver, &mut flash, &dog, &clock)
            .unwrap_err();
        assert_eq!(err, BootError::Checksum);
        assert_eq!(session.state(), BootState::Failed(BootError::Checksum));

        // Error reply after the 7 good acks: 0xFF 0x03.
        let mut replies = Vec::new();
        while let Some(b) = sender.read_byte() {
            replies.push(b);
        }
        assert_eq!(&replies[..7], &[ACK_BYTE; 7]);
        assert_eq!(&replies[7..], &[ERROR_PREFIX, 0x03]);

        // Nothing past the last good page reached staging.
        let staged = flash.contents(FLASH_STAGING_OFFSET, 4096);
        assert_eq!(&staged[..7 * 256], &image[..7 * 256]);
        assert_eq!(&staged[7 * 256..], &vec![0xFF; 4096 - 7 * 256][..]);
    }

    #[test]
    fn sequence_gap_rejected() {
        let image = test_image(1024);
        let (result, _, mut sender) = run_scripted(
            &image,
            |chunks| {
                chunks.remove(1); // seq jumps 0 -> 2
            },
            false,
        );
        assert_eq!(result.unwrap_err(), BootError::InvalidChunk);
        let mut replies = Vec::new();
        while let Some(b) = sender.read_byte() {
            replies.push(b);
        }
        assert_eq!(replies.last_chunk::<2>().unwrap(), &[ERROR_PREFIX, 0x02]);
    }

    #[test]
    fn duplicate_chunk_rejected() {
        let image = test_image(1024);
        let (result, _, _) = run_scripted(
            &image,
            |chunks| {
                let dup = chunks[1].clone();
                chunks.insert(2, dup); // seq 1 resent while 2 is expected
            },
            false,
        );
        assert_eq!(result.unwrap_err(), BootError::InvalidChunk);
    }

    #[test]
    fn crc_mismatch_aborts_before_final_ack() {
        let image = test_image(2048);
        let (mut sender, mut receiver) = SimSerial::pair();
        for (seq, data) in image.chunks(256).enumerate() {
            write_chunk(&mut sender, seq as u32, data);
        }
        write_end(&mut sender);
        write_crc_packet(&mut sender, 0xDEAD_BEEF);

        let mut flash = SimFlash::new();
        let dog = SimWatchdog::new();
        let clock = SimClock::default();
        let mut session = BootloaderSession::new();
        let err = session
            .run(&mut receiver, &mut flash, &dog, &clock)
            .unwrap_err();
        assert_eq!(err, BootError::CrcMismatch);

        let mut replies = Vec::new();
        while let Some(b) = sender.read_byte() {
            replies.push(b);
        }
        assert_eq!(replies.last_chunk::<2>().unwrap(), &[ERROR_PREFIX, 0x07]);
    }

    #[test]
    fn missing_crc_packet_still_succeeds() {
        let image = test_image(512);
        let (result, _, _) = run_scripted(&image, |_| {}, false);
        assert!(result.is_ok());
    }

    #[test]
    fn implausible_vector_table_rejected() {
        let mut image = test_image(512);
        image[..8].fill(0xFF); // erased-looking head
        let (result, _, _) = run_scripted(&image, |_| {}, false);
        assert_eq!(result.unwrap_err(), BootError::InvalidImage);
    }

    #[test]
    fn empty_stream_rejected() {
        let (mut sender, mut receiver) = SimSerial::pair();
        write_end(&mut sender);

        let mut flash = SimFlash::new();
        let dog = SimWatchdog::new();
        let clock = SimClock::default();
        let mut session = BootloaderSession::new();
        let err = session
            .run(&mut receiver, &mut flash, &dog, &clock)
            .unwrap_err();
        assert_eq!(err, BootError::InvalidImage);
    }

    #[test]
    fn silence_times_out() {
        let (_sender, mut receiver) = SimSerial::pair();
        let mut flash = SimFlash::new();
        let dog = SimWatchdog::new();
        let clock = SimClock::default();
        let mut session = BootloaderSession::new();
        let err = session
            .run(&mut receiver, &mut flash, &dog, &clock)
            .unwrap_err();
        assert_eq!(err, BootError::Timeout);
        assert!(dog.feed_count() > 10);
    }

    #[test]
    fn oversize_chunk_len_rejected() {
        let (mut sender, mut receiver) = SimSerial::pair();
        sender.write(&super::super::CHUNK_MAGIC);
        sender.write(&0u32.to_le_bytes());
        sender.write(&300u16.to_le_bytes()); // > CHUNK_MAX_SIZE
        let mut flash = SimFlash::new();
        let dog = SimWatchdog::new();
        let clock = SimClock::default();
        let mut session = BootloaderSession::new();
        let err = session
            .run(&mut receiver, &mut flash, &dog, &clock)
            .unwrap_err();
        assert_eq!(err, BootError::InvalidChunk);
    }
}
