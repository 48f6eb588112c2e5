//! SocketCAN backend (Linux).

use std::time::Duration;

use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket};
use tracing::{debug, trace};

use super::traits::{CanBackend, CanError, RxFrame};

/// CAN backend over a Linux SocketCAN interface (e.g. `can0`, `vcan0`).
pub struct SocketCanBackend {
    socket: CanSocket,
    interface: String,
}

impl SocketCanBackend {
    /// Open a raw CAN socket on `interface`, non-blocking.
    pub fn open(interface: &str) -> Result<Self, CanError> {
        let socket = CanSocket::open(interface).map_err(|e| CanError::OpenFailed {
            interface: interface.to_string(),
            message: e.to_string(),
        })?;

        socket
            .set_nonblocking(true)
            .map_err(|e| CanError::OpenFailed {
                interface: interface.to_string(),
                message: format!("failed to set non-blocking: {e}"),
            })?;

        debug!(interface = %interface, "CAN socket opened");
        Ok(Self {
            socket,
            interface: interface.to_string(),
        })
    }

    /// Name of the interface this backend is bound to.
    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl CanBackend for SocketCanBackend {
    fn send_frame(&mut self, raw_id: u32, payload: &[u8]) -> Result<(), CanError> {
        if payload.len() > 8 {
            return Err(CanError::PayloadTooLong(payload.len()));
        }

        let id = ExtendedId::new(raw_id)
            .ok_or_else(|| CanError::SendFailed(format!("invalid extended id 0x{raw_id:08X}")))?;
        let frame = CanFrame::new(id, payload)
            .ok_or_else(|| CanError::SendFailed("could not build CAN frame".to_string()))?;

        self.socket
            .write_frame(&frame)
            .map_err(|e| CanError::SendFailed(e.to_string()))?;

        trace!(
            id = format!("0x{:08X}", raw_id),
            len = payload.len(),
            "TX frame"
        );
        Ok(())
    }

    fn recv_frame(&mut self) -> Result<Option<RxFrame>, CanError> {
        match self.socket.read_frame() {
            Ok(frame) => {
                let raw_id = frame.raw_id();
                trace!(
                    id = format!("0x{:08X}", raw_id),
                    len = frame.data().len(),
                    "RX frame"
                );
                Ok(Some(RxFrame {
                    raw_id,
                    payload: frame.data().to_vec(),
                }))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // Nothing pending; back off briefly so callers can poll in a loop.
                std::thread::sleep(Duration::from_millis(1));
                Ok(None)
            }
            Err(e) => Err(CanError::RecvFailed(e.to_string())),
        }
    }
}
