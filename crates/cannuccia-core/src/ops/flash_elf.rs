//! Flash an ELF image to a single device.

use tracing::{debug, error, info, warn};

use super::{OpCtx, OpFlow};
use crate::can::CanBackend;
use crate::comms::DeviceStats;
use crate::elf::FirmwareElf;
use crate::events::{CommsEvent, LogLevel, ProgressHandler};
use crate::flash_map::FlashMap;

/// Error codes surfaced through the progress callback.
const ERR_ELF: i32 = -1;
const ERR_MACHINE: i32 = -2;
const ERR_LINK: i32 = -3;

/// Progress band for the page-flashing phase.
const FLASH_BAND_START: i32 = 15;
const FLASH_BAND_END: i32 = 99;

enum Phase {
    /// PROG_REQ sent, waiting for the device to report unlocked.
    AwaitUnlock,
    /// Pages are going out one at a time.
    Flashing { map: FlashMap, retries: u32 },
}

/// Flashes an ELF's loadable segments to one device, page by page.
///
/// Unlocks the device first but deliberately does not send PROG_DONE at the
/// end: leaving the device unlocked lets a caller flash several images into
/// one unlock window and re-lock with a single [`super::StopDevicesOp`].
pub struct FlashElfOp {
    dev_id: u8,
    elf_data: Vec<u8>,
    on_progress: ProgressHandler,
    elf: Option<FirmwareElf>,
    phase: Phase,
}

impl FlashElfOp {
    pub fn new(dev_id: u8, elf_data: Vec<u8>, on_progress: ProgressHandler) -> Self {
        Self {
            dev_id,
            elf_data,
            on_progress,
            elf: None,
            phase: Phase::AwaitUnlock,
        }
    }

    fn report(&mut self, message: &str, progress: i32) {
        (self.on_progress)(message, progress);
    }

    pub(crate) fn start<C: CanBackend>(&mut self, ctx: &mut OpCtx<'_, C>) -> OpFlow {
        let dev_id = self.dev_id;

        if self.elf_data.is_empty() {
            self.report(&format!("No ELF supplied for 0x{dev_id:02X}"), ERR_ELF);
            return OpFlow::Done;
        }

        // [0..4]: parse the image in memory.
        self.report(&format!("Loading ELF for 0x{dev_id:02X}"), 0);
        match FirmwareElf::parse(&self.elf_data) {
            Ok(elf) => self.elf = Some(elf),
            Err(e) => {
                error!(dev_id, error = %e, "ELF parse failed");
                ctx.log(LogLevel::Error, &format!("ELF parse failed: {e}"));
                self.report(&format!("Failed to load ELF for 0x{dev_id:02X}"), ERR_ELF);
                return OpFlow::Done;
            }
        }
        self.report(&format!("ELF loaded for 0x{dev_id:02X}"), 4);

        // [5..9]: request programming mode; resumed by ProgStarted.
        self.report(&format!("Unlocking 0x{dev_id:02X} to flash ELF"), 5);
        if let Err(e) = ctx.comms.prog_start(ctx.can, dev_id) {
            error!(dev_id, error = %e, "CAN link failed");
            self.report(&format!("CAN link failed: {e}"), ERR_LINK);
            return OpFlow::Done;
        }
        OpFlow::Pending
    }

    pub(crate) fn handle_event<C: CanBackend>(
        &mut self,
        ctx: &mut OpCtx<'_, C>,
        event: &CommsEvent,
    ) -> OpFlow {
        if event.dev_id() != self.dev_id {
            // Not the device we are flashing.
            return OpFlow::Pending;
        }

        match (&mut self.phase, *event) {
            (Phase::AwaitUnlock, CommsEvent::ProgStarted { stats, .. }) => {
                self.on_unlocked(ctx, stats)
            }

            (Phase::Flashing { .. }, CommsEvent::PageFlashed { page_addr, .. }) => {
                self.on_page_flashed(ctx, page_addr)
            }

            (
                Phase::Flashing { map, retries },
                CommsEvent::PageFlashErrored {
                    page_addr,
                    expected_crc,
                    received_crc,
                    ..
                },
            ) => {
                // The engine dropped the page; re-enqueue the same bytes.
                // Retries are unbounded: a device that keeps mis-reading a
                // page keeps getting it until the operation is abandoned.
                *retries += 1;
                let retries = *retries;
                warn!(
                    dev_id = self.dev_id,
                    page_addr = format!("0x{page_addr:08X}"),
                    expected = format!("0x{expected_crc:04X}"),
                    received = format!("0x{received_crc:04X}"),
                    retries,
                    "Page CRC mismatch, retrying"
                );

                let Some(data) = map.pages().get(&page_addr).cloned() else {
                    warn!(
                        dev_id = self.dev_id,
                        page_addr = format!("0x{page_addr:08X}"),
                        "CRC error for a page not in the flash map"
                    );
                    return OpFlow::Pending;
                };
                ctx.log(
                    LogLevel::Warning,
                    &format!(
                        "CRC mismatch on page 0x{page_addr:08X} (retry {retries}), rewriting"
                    ),
                );
                if let Err(e) = ctx.comms.flash_page(ctx.can, self.dev_id, page_addr, data) {
                    error!(dev_id = self.dev_id, error = %e, "CAN link failed");
                    self.report(&format!("CAN link failed: {e}"), ERR_LINK);
                    return OpFlow::Done;
                }
                OpFlow::Pending
            }

            _ => OpFlow::Pending,
        }
    }

    /// Device is unlocked: check compatibility, build the page map and push
    /// the first page out.
    fn on_unlocked<C: CanBackend>(&mut self, ctx: &mut OpCtx<'_, C>, stats: DeviceStats) -> OpFlow {
        let dev_id = self.dev_id;
        // Parsed in start(); the phase guarantees we only get here after it.
        let Some(elf) = self.elf.take() else {
            return OpFlow::Pending;
        };

        self.report(&format!("0x{dev_id:02X} unlocked"), 9);

        // [10]: the device names the e_machine it accepts.
        self.report(
            &format!("Checking if 0x{dev_id:02X} is compatible with ELF"),
            10,
        );
        if stats.elf_machine != elf.machine {
            error!(
                dev_id,
                device_machine = stats.elf_machine,
                elf_machine = elf.machine,
                "ELF machine mismatch"
            );
            ctx.log(
                LogLevel::Error,
                &format!(
                    "0x{dev_id:02X} has machine type {} but ELF e_machine is {}",
                    stats.elf_machine, elf.machine
                ),
            );
            self.report(&format!("0x{dev_id:02X} ELF machine mismatch"), ERR_MACHINE);
            return OpFlow::Done;
        }

        // [11..14]: carve the segments into pages.
        self.report(&format!("Building ELF flash map for 0x{dev_id:02X}"), 11);
        let map = FlashMap::new(stats.page_size, &elf.segments);
        if map.num_pages() == 0 {
            info!(dev_id, "ELF has no flashable content");
            self.report(&format!("Nothing to flash to 0x{dev_id:02X}"), 100);
            return OpFlow::Done;
        }
        debug!(
            dev_id,
            pages = map.num_pages(),
            page_size = stats.page_size,
            "Flash map built"
        );
        self.report(
            &format!("Flashing {} pages to 0x{dev_id:02X}", map.num_pages()),
            14,
        );

        // [15..99]: one page in flight at a time keeps progress linear.
        let first = map.first_page().map(|(addr, data)| (addr, data.clone()));
        self.phase = Phase::Flashing { map, retries: 0 };
        match first {
            Some((addr, data)) => {
                if let Err(e) = ctx.comms.flash_page(ctx.can, dev_id, addr, data) {
                    error!(dev_id, error = %e, "CAN link failed");
                    self.report(&format!("CAN link failed: {e}"), ERR_LINK);
                    return OpFlow::Done;
                }
                OpFlow::Pending
            }
            None => OpFlow::Pending,
        }
    }

    fn on_page_flashed<C: CanBackend>(&mut self, ctx: &mut OpCtx<'_, C>, page_addr: u32) -> OpFlow {
        let dev_id = self.dev_id;
        let Phase::Flashing { map, .. } = &mut self.phase else {
            return OpFlow::Pending;
        };

        if map.pages().remove(&page_addr).is_none() {
            warn!(
                dev_id,
                page_addr = format!("0x{page_addr:08X}"),
                "Commit reported for a page not in the flash map"
            );
        }

        if map.is_done() {
            let num_pages = map.num_pages();
            self.report(
                &format!("Flashed {num_pages} pages to 0x{dev_id:02X}"),
                100,
            );
            return OpFlow::Done;
        }

        let flashed = map.flashed();
        let num_pages = map.num_pages();
        let span = (FLASH_BAND_END - FLASH_BAND_START) as usize;
        let progress = (FLASH_BAND_START + (span * flashed / num_pages) as i32).min(FLASH_BAND_END);

        let next = map.first_page().map(|(addr, data)| (addr, data.clone()));
        self.report(
            &format!("Flashed page 0x{page_addr:08X} to 0x{dev_id:02X} ({flashed} of {num_pages})"),
            progress,
        );

        let Some((addr, data)) = next else {
            return OpFlow::Pending;
        };
        if let Err(e) = ctx.comms.flash_page(ctx.can, dev_id, addr, data) {
            error!(dev_id, error = %e, "CAN link failed");
            self.report(&format!("CAN link failed: {e}"), ERR_LINK);
            return OpFlow::Done;
        }
        OpFlow::Pending
    }
}
