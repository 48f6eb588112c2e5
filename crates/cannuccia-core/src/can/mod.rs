//! CAN backend layer.

pub mod mock;
pub mod socketcan;
pub mod traits;

pub use mock::MockCan;
pub use socketcan::SocketCanBackend;
pub use traits::{CanBackend, CanError, RxFrame};

use crate::engine::EngineError;

/// Opens the CAN backend selected by name.
///
/// `"socketcan"` is the only driver currently shipped; the name indirection
/// keeps room for further drivers without touching callers.
pub fn open_backend(backend: &str, interface: &str) -> Result<Box<dyn CanBackend>, EngineError> {
    if interface.is_empty() {
        return Err(EngineError::NoInterface);
    }
    match backend {
        "socketcan" => Ok(Box::new(SocketCanBackend::open(interface)?)),
        other => Err(EngineError::UnknownBackend(other.to_string())),
    }
}
