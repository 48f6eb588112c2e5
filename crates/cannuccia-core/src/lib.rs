//! cannuccia-core: host-side programmer for the CANnuccia bootloader
//! network.
//!
//! Drives the CANnuccia protocol from the host end of a shared CAN bus:
//! unlocking device bootloaders, carving ELF firmware images into flash
//! pages, writing each page with a CRC-verified commit, and returning
//! devices to application mode.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: message id constants, extended-id packing, wire codec
//! - **Can**: CAN backend abstraction (SocketCAN, mock)
//! - **Elf / FlashMap**: firmware ingestion and page carving
//! - **Comms**: the per-device protocol state machine
//! - **Ops**: long-running operations (unlock set, lock set, flash ELF)
//! - **Engine**: the serial scheduler and event pump tying it together
//!
//! Everything runs on one thread: inbound frames enter the engine, the
//! state machine emits typed events, and the active operation reacts by
//! issuing further commands. Operations never block.
//!
//! # Example
//!
//! ```no_run
//! use cannuccia_core::config::Config;
//! use cannuccia_core::engine::Engine;
//! use cannuccia_core::ops::{Operation, StartDevicesOp};
//!
//! let config = Config {
//!     can_backend: "socketcan".to_string(),
//!     can_interface: "vcan0".to_string(),
//! };
//! let mut engine = Engine::from_config(&config).expect("CAN link");
//! engine.enqueue(Operation::StartDevices(StartDevicesOp::new(
//!     [0x42],
//!     Box::new(|msg, progress| println!("[{progress:>3}] {msg}")),
//! )));
//! engine.run().expect("bus error");
//! ```

pub mod can;
pub mod comms;
pub mod config;
pub mod elf;
pub mod engine;
pub mod events;
pub mod flash_map;
pub mod ops;
pub mod protocol;

// Re-exports for convenience
pub use can::{CanBackend, CanError, MockCan, RxFrame, SocketCanBackend};
pub use comms::{Comms, DeviceStats};
pub use config::{Config, ConfigError};
pub use elf::{ElfError, FirmwareElf, LoadableSegment};
pub use engine::{Engine, EngineError};
pub use events::{CommsEvent, LogHandler, LogLevel, ProgressHandler};
pub use flash_map::FlashMap;
pub use ops::{FlashElfOp, Operation, StartDevicesOp, StopDevicesOp};
