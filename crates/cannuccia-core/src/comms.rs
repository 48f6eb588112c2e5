//! CANnuccia protocol state machine.
//!
//! `Comms` tracks per-device programming state and turns raw CAN frames into
//! the high-level [`CommsEvent`]s operations consume. It is driven entirely
//! from the outside: commands come in through [`Comms::prog_start`],
//! [`Comms::prog_end`] and [`Comms::flash_page`]; inbound frames come in
//! through [`Comms::handle_frame`], which replies on the bus as needed and
//! returns at most one event per frame.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace, warn};

use crate::can::{CanBackend, CanError};
use crate::events::CommsEvent;
use crate::protocol::constants::*;
use crate::protocol::eid::{driver_id, unpack_driver_id};
use crate::protocol::wire::{crc16, read_u16_le, read_u32_le, u32_le_bytes};

/// Stats a device reports in PROG_REQ_RESP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Flash page size in bytes (the wire carries only its log2).
    pub page_size: u32,
    /// Total number of flash pages.
    pub n_flash_pages: u16,
    /// The ELF `e_machine` value this device accepts.
    pub elf_machine: u16,
}

/// Per-device programming state, created lazily on first reference.
#[derive(Debug, Default)]
struct DeviceState {
    /// Zeroed until a PROG_REQ_RESP arrives.
    stats: DeviceStats,
    /// Page address -> page bytes still to be written. Address-sorted so
    /// `select_next_page` is deterministic.
    pending_pages: BTreeMap<u32, Vec<u8>>,
    /// The last PAGE_SELECTED acknowledged by the device; `None` while no
    /// selection is outstanding.
    selected_page: Option<u32>,
}

/// The CANnuccia protocol engine state, keyed by device id.
#[derive(Debug, Default)]
pub struct Comms {
    devices: HashMap<u8, DeviceState>,
}

impl Comms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks `dev_id` to enter programming mode.
    ///
    /// PROG_REQ -> PROG_REQ_RESP -> UNLOCK -> UNLOCKED; the final UNLOCKED
    /// surfaces as [`CommsEvent::ProgStarted`].
    pub fn prog_start<C: CanBackend>(&mut self, can: &mut C, dev_id: u8) -> Result<(), CanError> {
        can.send_frame(driver_id(MSG_PROG_REQ, dev_id), &[])
    }

    /// Asks `dev_id` to leave programming mode and boot the application.
    ///
    /// PROG_DONE -> PROG_DONE_ACK; the ack surfaces as
    /// [`CommsEvent::ProgEnded`].
    pub fn prog_end<C: CanBackend>(&mut self, can: &mut C, dev_id: u8) -> Result<(), CanError> {
        can.send_frame(driver_id(MSG_PROG_DONE, dev_id), &[])
    }

    /// Queues `data` to be written to the page at `page_addr` on `dev_id`.
    ///
    /// If no page selection is outstanding the SELECT_PAGE goes out
    /// immediately; otherwise the new page is picked up once the current
    /// page's flow completes. `page_addr` must not be the reserved
    /// [`NO_PAGE`] value.
    pub fn flash_page<C: CanBackend>(
        &mut self,
        can: &mut C,
        dev_id: u8,
        page_addr: u32,
        data: Vec<u8>,
    ) -> Result<(), CanError> {
        debug_assert_ne!(page_addr, NO_PAGE, "NO_PAGE is reserved");
        if page_addr == NO_PAGE {
            warn!(dev_id, "Refusing to flash the reserved page address");
            return Ok(());
        }

        let dev = self.devices.entry(dev_id).or_default();
        dev.pending_pages.insert(page_addr, data);

        if dev.selected_page.is_none() {
            send_select_page(can, dev_id, page_addr)?;
        }
        Ok(())
    }

    /// Feeds one inbound CAN frame into the state machine.
    ///
    /// Replies on the bus as the protocol requires and returns the resulting
    /// event, if the frame completed one of the high-level flows. Unknown
    /// message ids are ignored; malformed payloads are logged and never
    /// fatal.
    pub fn handle_frame<C: CanBackend>(
        &mut self,
        can: &mut C,
        raw_id: u32,
        payload: &[u8],
    ) -> Result<Option<CommsEvent>, CanError> {
        let (msg_id, dev_id) = unpack_driver_id(raw_id);
        let dev = self.devices.entry(dev_id).or_default();

        match msg_id {
            MSG_PROG_REQ_RESP => {
                // Payload: u8 pageSizePow2, u16 LE nFlashPages, u16 LE elfMachine
                if payload.len() != PROG_REQ_RESP_LEN {
                    warn!(
                        dev_id,
                        len = payload.len(),
                        "Dropping PROG_REQ_RESP with broken payload"
                    );
                    return Ok(None);
                }
                if payload[0] >= 32 {
                    warn!(
                        dev_id,
                        page_size_pow2 = payload[0],
                        "Dropping PROG_REQ_RESP with impossible page size"
                    );
                    return Ok(None);
                }

                dev.stats.page_size = 1u32 << payload[0];
                dev.stats.n_flash_pages = read_u16_le(&payload[1..3]);
                dev.stats.elf_machine = read_u16_le(&payload[3..5]);
                debug!(dev_id, stats = ?dev.stats, "Device stats received, unlocking");

                can.send_frame(driver_id(MSG_UNLOCK, dev_id), &[])?;
                Ok(None)
            }

            MSG_UNLOCKED => {
                // Stats are zeroed if the PROG_REQ_RESP never made it here.
                Ok(Some(CommsEvent::ProgStarted {
                    dev_id,
                    stats: dev.stats,
                }))
            }

            MSG_PROG_DONE_ACK => Ok(Some(CommsEvent::ProgEnded { dev_id })),

            MSG_PAGE_SELECTED => {
                if payload.len() != 4 {
                    warn!(
                        dev_id,
                        len = payload.len(),
                        "Dropping PAGE_SELECTED with broken payload"
                    );
                    return Ok(None);
                }

                let page_addr = read_u32_le(payload);
                dev.selected_page = Some(page_addr);

                if let Some(data) = dev.pending_pages.get(&page_addr) {
                    // Burst out the page data, then ask for its CRC16.
                    send_page_write_cmds(can, dev_id, data)?;
                    can.send_frame(driver_id(MSG_CHECK_WRITES, dev_id), &[])?;
                } else {
                    // Stale or duplicate selection; move on to a page that
                    // actually has data queued.
                    warn!(
                        dev_id,
                        page_addr = format!("0x{page_addr:08X}"),
                        "Page selected with nothing to write, advancing"
                    );
                    select_next_page(can, dev_id, dev)?;
                }
                Ok(None)
            }

            MSG_WRITES_CHECKED => {
                let received_crc = if payload.len() == 2 {
                    read_u16_le(payload)
                } else {
                    // Force a mismatch so the page is retried rather than
                    // committed blind.
                    warn!(
                        dev_id,
                        len = payload.len(),
                        "WRITES_CHECKED with broken payload, forcing CRC mismatch"
                    );
                    0xFFFF
                };

                let selected = dev.selected_page.filter(|a| dev.pending_pages.contains_key(a));
                let Some(page_addr) = selected else {
                    warn!(dev_id, "CRC received for a page we never queued, advancing");
                    select_next_page(can, dev_id, dev)?;
                    return Ok(None);
                };

                let expected_crc = crc16(&dev.pending_pages[&page_addr]);
                if received_crc == expected_crc {
                    can.send_frame(driver_id(MSG_COMMIT_WRITES, dev_id), &[])?;
                    Ok(None)
                } else {
                    // Give up on this page; the caller may re-enqueue it.
                    dev.pending_pages.remove(&page_addr);
                    dev.selected_page = None;
                    select_next_page(can, dev_id, dev)?;
                    Ok(Some(CommsEvent::PageFlashErrored {
                        dev_id,
                        page_addr,
                        expected_crc,
                        received_crc,
                    }))
                }
            }

            MSG_WRITES_COMMITTED => {
                let page_addr = if payload.len() == 4 {
                    read_u32_le(payload)
                } else {
                    // Worst case: trust that the commit applied to the page
                    // we selected. If that guess is wrong, flashing may never
                    // converge for the two pages involved.
                    let Some(selected) = dev.selected_page else {
                        warn!(
                            dev_id,
                            len = payload.len(),
                            "WRITES_COMMITTED with broken payload and no selected page, dropping"
                        );
                        return Ok(None);
                    };
                    warn!(
                        dev_id,
                        len = payload.len(),
                        assumed = format!("0x{selected:08X}"),
                        "WRITES_COMMITTED with broken payload, assuming selected page"
                    );
                    selected
                };

                if let Some(selected) = dev.selected_page.take() {
                    dev.pending_pages.remove(&selected);
                }
                select_next_page(can, dev_id, dev)?;
                Ok(Some(CommsEvent::PageFlashed { dev_id, page_addr }))
            }

            other => {
                trace!(
                    dev_id,
                    msg_id = format!("0x{other:08X}"),
                    "Ignored CAN message"
                );
                Ok(None)
            }
        }
    }
}

fn send_select_page<C: CanBackend>(can: &mut C, dev_id: u8, page_addr: u32) -> Result<(), CanError> {
    can.send_frame(driver_id(MSG_SELECT_PAGE, dev_id), &u32_le_bytes(page_addr))
}

/// Streams a page's bytes as WRITE frames of up to 8 bytes each, in order.
fn send_page_write_cmds<C: CanBackend>(
    can: &mut C,
    dev_id: u8,
    data: &[u8],
) -> Result<(), CanError> {
    let raw_id = driver_id(MSG_WRITE, dev_id);
    for chunk in data.chunks(WRITE_CHUNK) {
        can.send_frame(raw_id, chunk)?;
    }
    Ok(())
}

/// SELECT_PAGEs the first pending page that differs from the current
/// selection, or does nothing if the device has no work left.
fn select_next_page<C: CanBackend>(
    can: &mut C,
    dev_id: u8,
    dev: &mut DeviceState,
) -> Result<(), CanError> {
    for &addr in dev.pending_pages.keys() {
        if Some(addr) != dev.selected_page {
            return send_select_page(can, dev_id, addr);
        }
    }
    Ok(())
}
