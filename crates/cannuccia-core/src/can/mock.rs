//! Mock CAN backend for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::traits::{CanBackend, CanError, RxFrame};
use crate::protocol::eid::{driver_id, unpack_driver_id};

/// Mock backend for unit testing the engine and operations.
///
/// Clones share the same queues, so a test can keep a handle while the
/// engine owns another.
#[derive(Clone)]
pub struct MockCan {
    /// Queued inbound frames returned by `recv_frame`.
    rx_queue: Arc<Mutex<VecDeque<RxFrame>>>,
    /// Captured outbound frames.
    sent: Arc<Mutex<Vec<RxFrame>>>,
}

impl MockCan {
    pub fn new() -> Self {
        Self {
            rx_queue: Arc::new(Mutex::new(VecDeque::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue an inbound frame to be returned on the next read.
    pub fn queue_frame(&self, raw_id: u32, payload: &[u8]) {
        self.rx_queue.lock().unwrap().push_back(RxFrame {
            raw_id,
            payload: payload.to_vec(),
        });
    }

    /// Queue an inbound frame from a `(msg_id, dev_id)` pair.
    pub fn queue_msg(&self, msg_id: u32, dev_id: u8, payload: &[u8]) {
        self.queue_frame(driver_id(msg_id, dev_id), payload);
    }

    /// All captured outbound frames, raw.
    pub fn sent_frames(&self) -> Vec<RxFrame> {
        self.sent.lock().unwrap().clone()
    }

    /// All captured outbound frames, decoded to `(msg_id, dev_id, payload)`.
    pub fn sent_msgs(&self) -> Vec<(u32, u8, Vec<u8>)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|f| {
                let (msg_id, dev_id) = unpack_driver_id(f.raw_id);
                (msg_id, dev_id, f.payload.clone())
            })
            .collect()
    }

    /// Clear captured outbound frames.
    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl Default for MockCan {
    fn default() -> Self {
        Self::new()
    }
}

impl CanBackend for MockCan {
    fn send_frame(&mut self, raw_id: u32, payload: &[u8]) -> Result<(), CanError> {
        if payload.len() > 8 {
            return Err(CanError::PayloadTooLong(payload.len()));
        }
        self.sent.lock().unwrap().push(RxFrame {
            raw_id,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn recv_frame(&mut self) -> Result<Option<RxFrame>, CanError> {
        Ok(self.rx_queue.lock().unwrap().pop_front())
    }
}
