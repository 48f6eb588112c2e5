//! Protocol module - CANnuccia wire protocol definitions.

pub mod constants;
pub mod eid;
pub mod wire;

pub use constants::*;
pub use eid::{driver_id, pack_eid, to_driver_id, unpack_driver_id};
pub use wire::{crc16, read_u16_le, read_u32_le, u32_le_bytes};
