//! Atomic copy from the staging region to the active region.
//!
//! The part executes in place from the active region, so this phase is
//! the one step that cannot be recovered in software. On the real MCU the
//! copy routine and **everything it calls** — the flash primitives, the
//! watchdog register pokes, the phase markers — live in a dedicated RAM
//! section, enforced by a linker assertion that forbids references from
//! that section into flash-hosted code. The flash primitives are the ROM
//! ones, never SDK helpers whose sector may itself be erased. Interrupts
//! are disabled for the duration and never restored: the vector table in
//! flash is invalid mid-copy, and the routine ends in a reset anyway.
//!
//! The staged image is pre-loaded into RAM before the first erase, so the
//! execute-in-place window is never read while an erase or program is in
//! flight.

use log::info;

use crate::hal::{
    FlashOps, WatchdogPort, FLASH_ACTIVE_OFFSET, FLASH_MAX_IMAGE_SIZE, FLASH_PAGE_SIZE,
    FLASH_SECTOR_SIZE, FLASH_STAGING_OFFSET,
};

use super::BootError;

/// Copy milestones emitted per sector so a hung copy can be post-mortem
/// diagnosed from a logic-analyzer trace on the debug UART.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPhase {
    PreErase,
    PostErase,
    PreProgram,
    PostProgram,
}

/// Sink for the per-phase debug markers. The hardware implementation is a
/// single RAM-resident register write per marker.
pub trait CopyMarker {
    fn mark(&mut self, phase: CopyPhase, sector_index: u32);
}

/// Marker sink that discards everything.
pub struct NullMarker;

impl CopyMarker for NullMarker {
    fn mark(&mut self, _phase: CopyPhase, _sector_index: u32) {}
}

/// Copy `image_size` bytes from staging to the active region.
///
/// `ram_buf` is the pre-load buffer, sized for the largest supported
/// image; this routine itself never allocates. On hardware the buffer is
/// the reserved static in the copy routine's RAM section.
///
/// Returns the number of sectors written; the caller must immediately
/// trigger a system reset — on hardware the reset happens inside the
/// RAM-resident routine (watchdog reboot, AIRCR as fallback) and control
/// never returns.
pub fn copy_staging_to_active(
    flash: &mut impl FlashOps,
    watchdog: &impl WatchdogPort,
    marker: &mut impl CopyMarker,
    image_size: u32,
    ram_buf: &mut [u8],
) -> Result<u32, BootError> {
    if image_size == 0 || image_size > FLASH_MAX_IMAGE_SIZE {
        return Err(BootError::InvalidImage);
    }

    let sector_count = image_size.div_ceil(FLASH_SECTOR_SIZE as u32);
    let padded_len = (sector_count as usize) * FLASH_SECTOR_SIZE;
    if ram_buf.len() < padded_len {
        return Err(BootError::InvalidImage);
    }

    // Pre-load the whole staged image while reading flash is still safe,
    // padding the tail of the last sector with the erased value.
    let ram_image = &mut ram_buf[..padded_len];
    ram_image[image_size as usize..].fill(0xFF);
    flash.read(FLASH_STAGING_OFFSET, &mut ram_image[..image_size as usize]);

    info!(
        "Bootloader: copying {image_size} bytes ({sector_count} sectors) to the active region"
    );

    for sector in 0..sector_count {
        let dst = FLASH_ACTIVE_OFFSET + sector * FLASH_SECTOR_SIZE as u32;
        let src = &ram_image[(sector as usize) * FLASH_SECTOR_SIZE..][..FLASH_SECTOR_SIZE];

        watchdog.feed();
        marker.mark(CopyPhase::PreErase, sector);
        flash.erase_sector(dst).map_err(|_| BootError::FlashErase)?;
        marker.mark(CopyPhase::PostErase, sector);

        watchdog.feed();
        marker.mark(CopyPhase::PreProgram, sector);
        for (page_idx, page) in src.chunks_exact(FLASH_PAGE_SIZE).enumerate() {
            let mut page_buf = [0u8; FLASH_PAGE_SIZE];
            page_buf.copy_from_slice(page);
            flash
                .program_page(dst + (page_idx * FLASH_PAGE_SIZE) as u32, &page_buf)
                .map_err(|_| BootError::FlashWrite)?;
        }
        marker.mark(CopyPhase::PostProgram, sector);
        watchdog.feed();
    }

    // On hardware: flush the flash cache, then reset. Control never
    // returns to the caller there; the simulation returns for the harness
    // to model the reboot.
    Ok(sector_count)
}
