//! Event and callback types shared by the engine and its callers.
//!
//! Lets CLI/GUI layers observe protocol progress without coupling to the
//! core logic.

use std::fmt;

use crate::comms::DeviceStats;

/// Log level for messages forwarded to the user's log sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARNING"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Sink for engine log messages, invoked synchronously.
pub type LogHandler = Box<dyn FnMut(LogLevel, &str)>;

/// Per-operation progress callback.
///
/// Progress values 0..=99 mean "ongoing", 100 means "done, success", and a
/// negative value means "failed" with the magnitude as an error code. The
/// terminal values (100 or negative) are reported exactly once, as the
/// operation's last word.
pub type ProgressHandler = Box<dyn FnMut(&str, i32)>;

/// High-level events emitted by the protocol state machine, consumed by the
/// active operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommsEvent {
    /// PROG_REQ_RESP + UNLOCK + UNLOCKED completed: the device is in
    /// programming mode and reported its stats.
    ProgStarted { dev_id: u8, stats: DeviceStats },

    /// PROG_DONE_ACK received: the device is back in application mode.
    ProgEnded { dev_id: u8 },

    /// WRITES_COMMITTED received for this page.
    PageFlashed { dev_id: u8, page_addr: u32 },

    /// Device CRC disagreed with ours; the page was dropped from the
    /// pending set and may be re-enqueued by the caller.
    PageFlashErrored {
        dev_id: u8,
        page_addr: u32,
        expected_crc: u16,
        received_crc: u16,
    },
}

impl CommsEvent {
    /// The device this event concerns.
    pub fn dev_id(&self) -> u8 {
        match *self {
            CommsEvent::ProgStarted { dev_id, .. }
            | CommsEvent::ProgEnded { dev_id }
            | CommsEvent::PageFlashed { dev_id, .. }
            | CommsEvent::PageFlashErrored { dev_id, .. } => dev_id,
        }
    }
}
