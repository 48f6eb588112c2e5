//! CAN backend abstraction.
//!
//! Defines the `CanBackend` trait the engine drives, allowing different
//! implementations (SocketCAN, mock, future drivers).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CanError {
    #[error("Failed to open CAN interface {interface}: {message}")]
    OpenFailed { interface: String, message: String },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    RecvFailed(String),

    #[error("Payload is {0} bytes, CAN 2.0B frames carry at most 8")]
    PayloadTooLong(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One inbound CAN frame, id already in driver form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxFrame {
    pub raw_id: u32,
    pub payload: Vec<u8>,
}

/// Abstract CAN bus interface.
///
/// `raw_id` is always the driver-form extended id (see
/// [`crate::protocol::eid`]); the engine converts to and from
/// `(msg_id, dev_id)` tuples at this boundary. Implementations must preserve
/// send order per interface.
pub trait CanBackend {
    /// Queue one frame for transmission.
    fn send_frame(&mut self, raw_id: u32, payload: &[u8]) -> Result<(), CanError>;

    /// Fetch the next inbound frame, or `None` if none arrived within the
    /// backend's polling window.
    fn recv_frame(&mut self) -> Result<Option<RxFrame>, CanError>;
}

impl<B: CanBackend + ?Sized> CanBackend for Box<B> {
    fn send_frame(&mut self, raw_id: u32, payload: &[u8]) -> Result<(), CanError> {
        (**self).send_frame(raw_id, payload)
    }

    fn recv_frame(&mut self) -> Result<Option<RxFrame>, CanError> {
        (**self).recv_frame()
    }
}
