//! Bulk unlock / lock operations over a set of devices.

use std::collections::BTreeSet;

use tracing::{error, info};

use super::{OpCtx, OpFlow};
use crate::can::{CanBackend, CanError};
use crate::events::{CommsEvent, LogLevel, ProgressHandler};

/// Error code reported when the CAN link fails mid-operation.
const ERR_LINK: i32 = -3;

/// Shared bookkeeping for the two bulk operations: a waiting set, the
/// original cardinality for the progress denominator, and the callback.
struct BulkState {
    waiting: BTreeSet<u8>,
    total: usize,
    on_progress: ProgressHandler,
}

impl BulkState {
    fn new(devices: impl IntoIterator<Item = u8>, on_progress: ProgressHandler) -> Self {
        let waiting: BTreeSet<u8> = devices.into_iter().collect();
        let total = waiting.len();
        Self {
            waiting,
            total,
            on_progress,
        }
    }

    fn report(&mut self, message: &str, progress: i32) {
        (self.on_progress)(message, progress);
    }

    /// Marks `dev_id` complete. Reports progress and returns `Done` once the
    /// waiting set empties; events for devices outside the set are ignored.
    fn complete_one(&mut self, dev_id: u8, verb: &str) -> OpFlow {
        if !self.waiting.remove(&dev_id) {
            return OpFlow::Pending;
        }

        let completed = self.total - self.waiting.len();
        if self.waiting.is_empty() {
            self.report(&format!("{verb} {} devices", self.total), 100);
            OpFlow::Done
        } else {
            let progress = ((100 * completed / self.total) as i32).min(99);
            self.report(
                &format!("{verb} device 0x{dev_id:02X} ({completed} of {})", self.total),
                progress,
            );
            OpFlow::Pending
        }
    }

    fn fail_link(&mut self, err: &CanError) -> OpFlow {
        error!(error = %err, "CAN link failed during bulk operation");
        self.report(&format!("CAN link failed: {err}"), ERR_LINK);
        OpFlow::Done
    }
}

/// Unlocks every device in a set: PROG_REQ to each, done when each one's
/// [`CommsEvent::ProgStarted`] has arrived.
pub struct StartDevicesOp {
    state: BulkState,
}

impl StartDevicesOp {
    pub fn new(devices: impl IntoIterator<Item = u8>, on_progress: ProgressHandler) -> Self {
        Self {
            state: BulkState::new(devices, on_progress),
        }
    }

    pub(crate) fn start<C: CanBackend>(&mut self, ctx: &mut OpCtx<'_, C>) -> OpFlow {
        if self.state.waiting.is_empty() {
            self.state.report("No devices to unlock", 100);
            return OpFlow::Done;
        }

        info!(count = self.state.total, "Unlocking devices");
        ctx.log(
            LogLevel::Info,
            &format!("Unlocking {} devices", self.state.total),
        );

        for dev_id in self.state.waiting.clone() {
            if let Err(e) = ctx.comms.prog_start(ctx.can, dev_id) {
                return self.state.fail_link(&e);
            }
        }
        OpFlow::Pending
    }

    pub(crate) fn handle_event<C: CanBackend>(
        &mut self,
        _ctx: &mut OpCtx<'_, C>,
        event: &CommsEvent,
    ) -> OpFlow {
        match *event {
            CommsEvent::ProgStarted { dev_id, .. } => self.state.complete_one(dev_id, "Unlocked"),
            _ => OpFlow::Pending,
        }
    }
}

/// Locks every device in a set: PROG_DONE to each, done when each one's
/// [`CommsEvent::ProgEnded`] has arrived.
pub struct StopDevicesOp {
    state: BulkState,
}

impl StopDevicesOp {
    pub fn new(devices: impl IntoIterator<Item = u8>, on_progress: ProgressHandler) -> Self {
        Self {
            state: BulkState::new(devices, on_progress),
        }
    }

    pub(crate) fn start<C: CanBackend>(&mut self, ctx: &mut OpCtx<'_, C>) -> OpFlow {
        if self.state.waiting.is_empty() {
            self.state.report("No devices to lock", 100);
            return OpFlow::Done;
        }

        info!(count = self.state.total, "Locking devices");
        ctx.log(
            LogLevel::Info,
            &format!("Locking {} devices", self.state.total),
        );

        for dev_id in self.state.waiting.clone() {
            if let Err(e) = ctx.comms.prog_end(ctx.can, dev_id) {
                return self.state.fail_link(&e);
            }
        }
        OpFlow::Pending
    }

    pub(crate) fn handle_event<C: CanBackend>(
        &mut self,
        _ctx: &mut OpCtx<'_, C>,
        event: &CommsEvent,
    ) -> OpFlow {
        match *event {
            CommsEvent::ProgEnded { dev_id } => self.state.complete_one(dev_id, "Locked"),
            _ => OpFlow::Pending,
        }
    }
}
