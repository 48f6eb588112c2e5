//! The engine: one CAN link, one protocol state machine, one serial queue
//! of operations.
//!
//! Everything is single-threaded and event-driven. Inbound frames enter
//! through [`Engine::handle_frame`] (or the [`Engine::run`] pump, which
//! reads them from the backend); the state machine turns them into events;
//! the head-of-queue operation consumes the events and issues commands back
//! through the same engine. Enqueueing from another thread must post into
//! this loop instead of touching the engine directly.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::can::{CanBackend, CanError};
use crate::comms::Comms;
use crate::config::Config;
use crate::events::{LogHandler, LogLevel};
use crate::ops::{OpCtx, OpFlow, Operation};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unknown CAN backend \"{0}\"")]
    UnknownBackend(String),

    #[error("No CAN interface specified")]
    NoInterface,

    #[error("CAN link error: {0}")]
    Can(#[from] CanError),
}

/// Owns the CAN backend, the protocol state and the operation queue.
///
/// The queue is strictly serial: the front operation is the only started
/// one, and a later enqueue observes every earlier operation's completion
/// before its own `start` runs.
pub struct Engine<C: CanBackend> {
    comms: Comms,
    can: C,
    queue: VecDeque<Operation>,
    log_handler: Option<LogHandler>,
}

impl Engine<Box<dyn CanBackend>> {
    /// Builds an engine from a configuration, opening the named backend.
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        let can = crate::can::open_backend(&config.can_backend, &config.can_interface)?;
        Ok(Self::new(can))
    }
}

impl<C: CanBackend> Engine<C> {
    pub fn new(can: C) -> Self {
        info!("CANnuccia engine init");
        Self {
            comms: Comms::new(),
            can,
            queue: VecDeque::new(),
            log_handler: None,
        }
    }

    /// Installs the user's log sink, invoked synchronously alongside
    /// `tracing`.
    pub fn set_log_handler(&mut self, handler: LogHandler) {
        self.log_handler = Some(handler);
    }

    /// Appends an operation; starts it immediately if the queue was idle.
    pub fn enqueue(&mut self, op: Operation) {
        debug!(op = op.name(), "Operation enqueued");
        self.queue.push_back(op);
        if self.queue.len() == 1 {
            self.start_head();
        }
    }

    /// No operation is queued or running.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Feeds one inbound frame through the state machine and dispatches the
    /// resulting event, if any, to the active operation.
    pub fn handle_frame(&mut self, raw_id: u32, payload: &[u8]) -> Result<(), EngineError> {
        let event = self.comms.handle_frame(&mut self.can, raw_id, payload)?;
        let Some(event) = event else {
            return Ok(());
        };
        debug!(?event, "Protocol event");

        let Some(op) = self.queue.front_mut() else {
            trace!(?event, "Event with no active operation, dropped");
            return Ok(());
        };

        let mut ctx = OpCtx {
            comms: &mut self.comms,
            can: &mut self.can,
            log: self.log_handler.as_mut(),
        };
        if op.handle_event(&mut ctx, &event) == OpFlow::Done {
            let done = self.queue.pop_front();
            if let Some(done) = done {
                debug!(op = done.name(), "Operation finished");
            }
            self.start_head();
        }
        Ok(())
    }

    /// Reads frames from the backend until the queue drains.
    ///
    /// There is no timeout anywhere: an operation waiting on a silent bus
    /// waits forever, exactly like the protocol it drives.
    pub fn run(&mut self) -> Result<(), EngineError> {
        while !self.queue.is_empty() {
            let Some(frame) = self.can.recv_frame()? else {
                continue;
            };
            self.handle_frame(frame.raw_id, &frame.payload)?;
        }
        Ok(())
    }

    /// Starts queued operations from the front until one stays pending.
    /// Operations that complete in `start` (empty device set, bad ELF)
    /// make room for the next one right away.
    fn start_head(&mut self) {
        while let Some(op) = self.queue.front_mut() {
            debug!(op = op.name(), "Operation started");
            let mut ctx = OpCtx {
                comms: &mut self.comms,
                can: &mut self.can,
                log: self.log_handler.as_mut(),
            };
            match op.start(&mut ctx) {
                OpFlow::Pending => break,
                OpFlow::Done => {
                    let done = self.queue.pop_front();
                    if let Some(done) = done {
                        debug!(op = done.name(), "Operation finished");
                    }
                }
            }
        }
    }

    /// Logs through the user's sink, if installed.
    pub fn log(&mut self, level: LogLevel, message: &str) {
        if let Some(handler) = self.log_handler.as_mut() {
            handler(level, message);
        }
    }
}

impl<C: CanBackend> Drop for Engine<C> {
    fn drop(&mut self) {
        info!("CANnuccia engine halt");
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::can::MockCan;
    use crate::elf::test_images::make_elf;
    use crate::events::ProgressHandler;
    use crate::ops::{FlashElfOp, StartDevicesOp, StopDevicesOp};
    use crate::protocol::constants::*;
    use crate::protocol::eid::driver_id;
    use crate::protocol::wire::{crc16, u32_le_bytes};

    /// Progress log shared between a test and the handler it hands out.
    type Progress = Rc<RefCell<Vec<(String, i32)>>>;

    fn progress_log() -> (Progress, ProgressHandler) {
        let log: Progress = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let handler: ProgressHandler =
            Box::new(move |msg, p| sink.borrow_mut().push((msg.to_string(), p)));
        (log, handler)
    }

    fn engine_with_mock() -> (Engine<MockCan>, MockCan) {
        let can = MockCan::new();
        (Engine::new(can.clone()), can)
    }

    fn inject(engine: &mut Engine<MockCan>, msg_id: u32, dev_id: u8, payload: &[u8]) {
        engine
            .handle_frame(driver_id(msg_id, dev_id), payload)
            .unwrap();
    }

    /// Walks a device through one complete page write on the mock bus,
    /// acking whatever the engine sent.
    fn ack_page(engine: &mut Engine<MockCan>, can: &MockCan, dev_id: u8) {
        let (_, _, select_payload) = can
            .sent_msgs()
            .into_iter()
            .rev()
            .find(|(m, d, _)| *m == MSG_SELECT_PAGE && *d == dev_id)
            .expect("engine sent SELECT_PAGE");
        can.clear_sent();
        inject(engine, MSG_PAGE_SELECTED, dev_id, &select_payload);

        let written: Vec<u8> = can
            .sent_msgs()
            .into_iter()
            .filter(|(m, d, _)| *m == MSG_WRITE && *d == dev_id)
            .flat_map(|(_, _, p)| p)
            .collect();
        let crc = crc16(&written);
        inject(engine, MSG_WRITES_CHECKED, dev_id, &crc.to_le_bytes());
        can.clear_sent();
        inject(engine, MSG_WRITES_COMMITTED, dev_id, &select_payload);
    }

    #[test]
    fn test_s1_single_device_unlock() {
        let (mut engine, can) = engine_with_mock();
        let (log, handler) = progress_log();

        engine.enqueue(Operation::StartDevices(StartDevicesOp::new([0x42], handler)));
        assert_eq!(can.sent_msgs(), vec![(MSG_PROG_REQ, 0x42, vec![])]);

        inject(
            &mut engine,
            MSG_PROG_REQ_RESP,
            0x42,
            &[0x08, 0x40, 0x00, 0x53, 0x00],
        );
        assert_eq!(can.sent_msgs()[1], (MSG_UNLOCK, 0x42, vec![]));

        inject(&mut engine, MSG_UNLOCKED, 0x42, &[]);

        let log = log.borrow();
        let (last_msg, last_progress) = log.last().unwrap();
        assert!(last_msg.contains("Unlocked"));
        assert_eq!(*last_progress, 100);
        assert!(engine.is_idle());
    }

    #[test]
    fn test_s4_bulk_stop_out_of_order() {
        let (mut engine, can) = engine_with_mock();
        let (log, handler) = progress_log();

        engine.enqueue(Operation::StopDevices(StopDevicesOp::new(
            [0x10, 0x11, 0x12],
            handler,
        )));
        let sent = can.sent_msgs();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(m, _, p)| *m == MSG_PROG_DONE && p.is_empty()));

        inject(&mut engine, MSG_PROG_DONE_ACK, 0x10, &[]);
        inject(&mut engine, MSG_PROG_DONE_ACK, 0x12, &[]);
        assert!(!engine.is_idle());
        inject(&mut engine, MSG_PROG_DONE_ACK, 0x11, &[]);
        assert!(engine.is_idle());

        {
            let log = log.borrow();
            let values: Vec<i32> = log.iter().map(|(_, p)| *p).collect();
            assert!(values.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(*values.last().unwrap(), 100);
            assert_eq!(values.iter().filter(|&&p| p == 100).count(), 1);
        }

        // A stray ack after completion reaches no handler.
        let before = log.borrow().len();
        inject(&mut engine, MSG_PROG_DONE_ACK, 0x10, &[]);
        assert_eq!(log.borrow().len(), before);
    }

    #[test]
    fn test_s5_malformed_prog_req_resp_keeps_op_pending() {
        let (mut engine, _can) = engine_with_mock();
        let (log, handler) = progress_log();

        engine.enqueue(Operation::StartDevices(StartDevicesOp::new([0x42], handler)));
        inject(
            &mut engine,
            MSG_PROG_REQ_RESP,
            0x42,
            &[0x08, 0x40, 0x00, 0x53],
        );

        assert!(!engine.is_idle());
        assert!(log.borrow().iter().all(|(_, p)| *p < 100));
    }

    #[test]
    fn test_empty_device_set_completes_immediately() {
        let (mut engine, can) = engine_with_mock();
        let (log, handler) = progress_log();

        engine.enqueue(Operation::StartDevices(StartDevicesOp::new([], handler)));
        assert!(engine.is_idle());
        assert!(can.sent_msgs().is_empty());
        assert_eq!(log.borrow().as_slice(), &[("No devices to unlock".into(), 100)]);
    }

    #[test]
    fn test_s3_elf_with_only_empty_segments_flashes_nothing() {
        let (mut engine, can) = engine_with_mock();
        let (log, handler) = progress_log();

        let image = make_elf(0x0053, &[(0x0800_0000, 0, 64), (0x0800_2000, 0, 32)]);
        engine.enqueue(Operation::FlashElf(FlashElfOp::new(0x01, image, handler)));

        inject(
            &mut engine,
            MSG_PROG_REQ_RESP,
            0x01,
            &[0x07, 0x40, 0x00, 0x53, 0x00],
        );
        inject(&mut engine, MSG_UNLOCKED, 0x01, &[]);

        assert!(engine.is_idle());
        assert_eq!(log.borrow().last().unwrap().1, 100);
        let writes = can
            .sent_msgs()
            .into_iter()
            .filter(|(m, _, _)| *m == MSG_WRITE)
            .count();
        assert_eq!(writes, 0);
    }

    #[test]
    fn test_flash_elf_machine_mismatch_fails() {
        let (mut engine, _can) = engine_with_mock();
        let (log, handler) = progress_log();

        let image = make_elf(0x0028, &[(0x0800_0000, 64, 64)]);
        engine.enqueue(Operation::FlashElf(FlashElfOp::new(0x01, image, handler)));

        inject(
            &mut engine,
            MSG_PROG_REQ_RESP,
            0x01,
            &[0x07, 0x40, 0x00, 0x53, 0x00],
        );
        inject(&mut engine, MSG_UNLOCKED, 0x01, &[]);

        assert!(engine.is_idle());
        assert_eq!(log.borrow().last().unwrap().1, -2);
    }

    #[test]
    fn test_flash_elf_garbage_image_fails_at_start() {
        let (mut engine, _can) = engine_with_mock();
        let (log, handler) = progress_log();

        engine.enqueue(Operation::FlashElf(FlashElfOp::new(
            0x01,
            b"not an elf".to_vec(),
            handler,
        )));

        assert!(engine.is_idle());
        assert_eq!(log.borrow().last().unwrap().1, -1);
    }

    #[test]
    fn test_flash_elf_full_run() {
        let (mut engine, can) = engine_with_mock();
        let (log, handler) = progress_log();

        // 300 bytes over 128-byte pages: pages at 0x0800_0000/0080/0100.
        let image = make_elf(0x0053, &[(0x0800_0000, 300, 300)]);
        engine.enqueue(Operation::FlashElf(FlashElfOp::new(0x05, image, handler)));

        // Unlock handshake; pageSizePow2 = 7 -> 128-byte pages.
        assert_eq!(can.sent_msgs(), vec![(MSG_PROG_REQ, 0x05, vec![])]);
        inject(
            &mut engine,
            MSG_PROG_REQ_RESP,
            0x05,
            &[0x07, 0x40, 0x00, 0x53, 0x00],
        );
        can.clear_sent();
        inject(&mut engine, MSG_UNLOCKED, 0x05, &[]);

        // First page goes out on its own; each ack pulls the next one.
        for expected_addr in [0x0800_0000u32, 0x0800_0080, 0x0800_0100] {
            let selects: Vec<_> = can
                .sent_msgs()
                .into_iter()
                .filter(|(m, _, _)| *m == MSG_SELECT_PAGE)
                .collect();
            assert_eq!(selects.len(), 1);
            assert_eq!(selects[0].2, u32_le_bytes(expected_addr).to_vec());

            inject(&mut engine, MSG_PAGE_SELECTED, 0x05, &selects[0].2);

            // Exactly ceil(128 / 8) = 16 WRITE frames per page.
            let writes: Vec<_> = can
                .sent_msgs()
                .into_iter()
                .filter(|(m, _, _)| *m == MSG_WRITE)
                .collect();
            assert_eq!(writes.len(), 16);
            assert!(writes.iter().all(|(_, _, p)| p.len() == 8));

            let written: Vec<u8> = writes.into_iter().flat_map(|(_, _, p)| p).collect();
            let crc = crc16(&written);
            inject(&mut engine, MSG_WRITES_CHECKED, 0x05, &crc.to_le_bytes());
            // Clear before the commit ack so the next page's SELECT_PAGE
            // lands in an empty capture buffer.
            can.clear_sent();
            inject(
                &mut engine,
                MSG_WRITES_COMMITTED,
                0x05,
                &u32_le_bytes(expected_addr),
            );
        }

        assert!(engine.is_idle());
        let log = log.borrow();
        assert_eq!(log.last().unwrap().1, 100);
        // No PROG_DONE: re-locking belongs to a following StopDevicesOp.
        assert!(log.iter().map(|(_, p)| *p).is_sorted());
    }

    #[test]
    fn test_flash_elf_retries_page_after_crc_mismatch() {
        let (mut engine, can) = engine_with_mock();
        let (_log, handler) = progress_log();

        let image = make_elf(0x0053, &[(0x0800_0000, 16, 16)]);
        engine.enqueue(Operation::FlashElf(FlashElfOp::new(0x01, image, handler)));

        inject(
            &mut engine,
            MSG_PROG_REQ_RESP,
            0x01,
            &[0x04, 0x40, 0x00, 0x53, 0x00],
        );
        inject(&mut engine, MSG_UNLOCKED, 0x01, &[]);
        can.clear_sent();

        // Device acks the selection, then reports a CRC we know is wrong.
        inject(
            &mut engine,
            MSG_PAGE_SELECTED,
            0x01,
            &u32_le_bytes(0x0800_0000),
        );
        inject(&mut engine, MSG_WRITES_CHECKED, 0x01, &[0xFF, 0xFF]);

        // The operation re-enqueued the page: a fresh SELECT_PAGE went out.
        let selects: Vec<_> = can
            .sent_msgs()
            .into_iter()
            .filter(|(m, _, _)| *m == MSG_SELECT_PAGE)
            .collect();
        assert_eq!(selects.last().unwrap().2, u32_le_bytes(0x0800_0000).to_vec());

        // Second attempt succeeds.
        ack_page(&mut engine, &can, 0x01);
        assert!(engine.is_idle());
    }

    #[test]
    fn test_scheduler_runs_operations_serially() {
        let (mut engine, can) = engine_with_mock();
        let (start_log, start_handler) = progress_log();
        let (stop_log, stop_handler) = progress_log();

        engine.enqueue(Operation::StartDevices(StartDevicesOp::new(
            [0x10],
            start_handler,
        )));
        engine.enqueue(Operation::StopDevices(StopDevicesOp::new(
            [0x10],
            stop_handler,
        )));

        // Only the first operation has spoken so far.
        assert_eq!(can.sent_msgs(), vec![(MSG_PROG_REQ, 0x10, vec![])]);
        assert!(stop_log.borrow().is_empty());

        inject(
            &mut engine,
            MSG_PROG_REQ_RESP,
            0x10,
            &[0x08, 0x40, 0x00, 0x53, 0x00],
        );
        inject(&mut engine, MSG_UNLOCKED, 0x10, &[]);

        // First finished; second started and sent its PROG_DONE.
        assert_eq!(start_log.borrow().last().unwrap().1, 100);
        assert_eq!(
            can.sent_msgs().last().unwrap(),
            &(MSG_PROG_DONE, 0x10, vec![])
        );

        inject(&mut engine, MSG_PROG_DONE_ACK, 0x10, &[]);
        assert_eq!(stop_log.borrow().last().unwrap().1, 100);
        assert!(engine.is_idle());
    }

    #[test]
    fn test_run_pumps_queued_frames() {
        let (mut engine, can) = engine_with_mock();
        let (log, handler) = progress_log();

        can.queue_msg(MSG_PROG_REQ_RESP, 0x42, &[0x08, 0x40, 0x00, 0x53, 0x00]);
        can.queue_msg(MSG_UNLOCKED, 0x42, &[]);

        engine.enqueue(Operation::StartDevices(StartDevicesOp::new([0x42], handler)));
        engine.run().unwrap();

        assert!(engine.is_idle());
        assert_eq!(log.borrow().last().unwrap().1, 100);
    }

    #[test]
    fn test_events_for_other_devices_are_filtered() {
        let (mut engine, _can) = engine_with_mock();
        let (log, handler) = progress_log();

        engine.enqueue(Operation::StartDevices(StartDevicesOp::new([0x42], handler)));

        // A different device unlocking is not our business.
        inject(
            &mut engine,
            MSG_PROG_REQ_RESP,
            0x07,
            &[0x08, 0x40, 0x00, 0x53, 0x00],
        );
        inject(&mut engine, MSG_UNLOCKED, 0x07, &[]);
        assert!(!engine.is_idle());
        assert!(log.borrow().iter().all(|(_, p)| *p < 100));
    }

    #[test]
    fn test_stats_decoded_end_to_end() {
        // S1's payload means 256-byte pages, 64 of them, machine 0x0053.
        // An ELF with machine 0x0000 must be rejected, proving the stats
        // made it from the wire to the operation.
        let (mut engine, _can) = engine_with_mock();
        let (log, handler) = progress_log();
        let image = make_elf(0x0000, &[(0x0800_0000, 16, 16)]);
        engine.enqueue(Operation::FlashElf(FlashElfOp::new(0x42, image, handler)));

        inject(
            &mut engine,
            MSG_PROG_REQ_RESP,
            0x42,
            &[0x08, 0x40, 0x00, 0x53, 0x00],
        );
        inject(&mut engine, MSG_UNLOCKED, 0x42, &[]);

        assert_eq!(log.borrow().last().unwrap().1, -2);
    }
}
