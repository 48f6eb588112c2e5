//! CANnuccia wire protocol constants.
//!
//! Message ids live in the top 20 bits of a 29-bit CAN extended id laid out
//! the bxCAN way; the device id sits in bits 11..4. See [`super::eid`] for
//! the packing helpers.

// ============================================================================
// Extended id field layout (bxCAN register form)
// ============================================================================

/// Bits of the bxCAN-form id that hold the message id.
pub const MSGID_MASK: u32 = 0xFFFF_F000;

/// Bits of the bxCAN-form id that hold the device id.
pub const DEVID_MASK: u32 = 0x0000_0FF0;

/// IDE flag (bit 2): set on every CANnuccia frame, all ids are extended.
pub const IDE_FLAG: u32 = 0x0000_0004;

// ============================================================================
// Message ids (Host -> Device)
// ============================================================================

/// Request entry into programming mode.
pub const MSG_PROG_REQ: u32 = 0x0000_1000;

/// Unlock the bootloader's flash writes.
pub const MSG_UNLOCK: u32 = 0x0000_3000;

/// Select the flash page at the u32 LE address in the payload.
pub const MSG_SELECT_PAGE: u32 = 0x0000_5000;

/// Carry up to 8 bytes of page data, in order.
pub const MSG_WRITE: u32 = 0x0000_7000;

/// Ask the device for a CRC16 of the writes buffered so far.
pub const MSG_CHECK_WRITES: u32 = 0x0000_8000;

/// Commit the buffered writes to the selected page.
pub const MSG_COMMIT_WRITES: u32 = 0x0000_A000;

/// Leave programming mode and boot the application.
pub const MSG_PROG_DONE: u32 = 0x0000_C000;

// ============================================================================
// Message ids (Device -> Host)
// ============================================================================

/// Response to PROG_REQ: u8 pageSizePow2, u16 LE nFlashPages, u16 LE elfMachine.
pub const MSG_PROG_REQ_RESP: u32 = 0x0000_2000;

/// Flash writes are now unlocked.
pub const MSG_UNLOCKED: u32 = 0x0000_4000;

/// Acknowledges SELECT_PAGE; payload echoes the u32 LE page address.
pub const MSG_PAGE_SELECTED: u32 = 0x0000_6000;

/// Device-computed CRC16 of the buffered writes (u16 LE).
pub const MSG_WRITES_CHECKED: u32 = 0x0000_9000;

/// Writes committed; payload is the u32 LE address of the written page.
pub const MSG_WRITES_COMMITTED: u32 = 0x0000_B000;

/// Acknowledges PROG_DONE.
pub const MSG_PROG_DONE_ACK: u32 = 0x0000_D000;

// ============================================================================
// Sentinels and limits
// ============================================================================

/// Reserved page address meaning "no page selected".
///
/// Never valid on the wire; internally the engine models the unselected
/// state as `Option::None` and keeps this constant only to reject the
/// reserved value at the command boundary.
pub const NO_PAGE: u32 = 0xFFFF_FFFF;

/// Device id reserved for "no specific device" in error reporting.
pub const NO_DEVICE: u8 = 0xFF;

/// Maximum data bytes per WRITE frame (CAN 2.0B payload limit).
pub const WRITE_CHUNK: usize = 8;

/// Payload length of a well-formed PROG_REQ_RESP.
pub const PROG_REQ_RESP_LEN: usize = 5;
