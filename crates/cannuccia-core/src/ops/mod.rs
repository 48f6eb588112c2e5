//! Long-running host operations driven by protocol events.
//!
//! Operations are owned values queued on the engine. The scheduler calls
//! [`Operation::start`] exactly once when an operation reaches the head of
//! the queue, then feeds it every [`CommsEvent`] until it reports
//! [`OpFlow::Done`]. An operation "waits" by returning to the event loop;
//! there is no blocking anywhere.
//!
//! Each operation carries a progress callback with the contract documented
//! on [`crate::events::ProgressHandler`]: the terminal report (100 or a
//! negative error code) doubles as the done signal, and a done operation is
//! removed from the queue before any further event can reach it.

mod flash_elf;
mod start_stop;

pub use flash_elf::FlashElfOp;
pub use start_stop::{StartDevicesOp, StopDevicesOp};

use crate::can::CanBackend;
use crate::comms::Comms;
use crate::events::{CommsEvent, LogHandler, LogLevel};

/// Whether an operation is still running after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpFlow {
    Pending,
    Done,
}

/// The narrow engine view an operation acts through while being dispatched.
pub struct OpCtx<'a, C: CanBackend> {
    pub comms: &'a mut Comms,
    pub can: &'a mut C,
    pub(crate) log: Option<&'a mut LogHandler>,
}

impl<'a, C: CanBackend> OpCtx<'a, C> {
    /// Forwards a message to the user's log sink, if one is installed.
    pub fn log(&mut self, level: LogLevel, message: &str) {
        if let Some(handler) = self.log.as_mut() {
            handler(level, message);
        }
    }
}

/// A queued host operation.
pub enum Operation {
    StartDevices(StartDevicesOp),
    StopDevices(StopDevicesOp),
    FlashElf(FlashElfOp),
}

impl Operation {
    /// Kicks the operation off; called once by the scheduler.
    pub(crate) fn start<C: CanBackend>(&mut self, ctx: &mut OpCtx<'_, C>) -> OpFlow {
        match self {
            Operation::StartDevices(op) => op.start(ctx),
            Operation::StopDevices(op) => op.start(ctx),
            Operation::FlashElf(op) => op.start(ctx),
        }
    }

    /// Feeds one protocol event to the operation.
    pub(crate) fn handle_event<C: CanBackend>(
        &mut self,
        ctx: &mut OpCtx<'_, C>,
        event: &CommsEvent,
    ) -> OpFlow {
        match self {
            Operation::StartDevices(op) => op.handle_event(ctx, event),
            Operation::StopDevices(op) => op.handle_event(ctx, event),
            Operation::FlashElf(op) => op.handle_event(ctx, event),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Operation::StartDevices(_) => "StartDevices",
            Operation::StopDevices(_) => "StopDevices",
            Operation::FlashElf(_) => "FlashElf",
        }
    }
}
