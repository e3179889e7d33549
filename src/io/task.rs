// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Background hardware task interface.

use crate::device::{AudioDevice, DeviceError};
use crate::io::telemetry::{BridgeObserver, BridgeStats, FillReport, SharedLevels};
use std::sync::Arc;
use tracing::debug;
use uacbridge_rt::StopSignal;

/// Lifecycle of a background task.
///
/// `Created → WaitingForHardware ⇄ Transferring → Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    WaitingForHardware,
    Transferring,
    Stopped,
}

/// A task that moves audio between a device and the host channels.
///
/// The scheduler calls [`run_cycle`](Self::run_cycle) repeatedly once the
/// task has been triggered. Each call waits for the hardware once and
/// transfers every whole block it reports.
pub trait HardwareTask: Send {
    fn name(&self) -> &str;

    fn state(&self) -> TaskState;

    /// Run one wait-and-transfer cycle.
    ///
    /// Returns [`TaskState::Stopped`] once the stop signal has been observed.
    /// A device error ends the current run; the task can be run again.
    fn run_cycle(&mut self) -> Result<TaskState, DeviceError>;

    /// Halt the device. Idempotent.
    fn finish(&mut self);
}

/// Everything a background task shares with the orchestrator.
#[derive(Clone)]
pub struct TaskContext {
    /// Frames per hardware block.
    pub block_size: usize,
    pub stop: StopSignal,
    pub observer: Arc<dyn BridgeObserver>,
    pub levels: Arc<SharedLevels>,
    pub stats: Arc<BridgeStats>,
    /// Cycles between fill-level reports, 0 for none.
    pub telemetry_interval: u64,
}

/// State shared by every task implementation: the device, lifecycle and
/// cycle accounting.
pub(crate) struct TaskCore {
    pub name: String,
    pub device: Box<dyn AudioDevice>,
    pub state: TaskState,
    pub ctx: TaskContext,
    cycles: u64,
}

impl TaskCore {
    pub fn new(name: impl Into<String>, device: Box<dyn AudioDevice>, ctx: TaskContext) -> Self {
        Self {
            name: name.into(),
            device,
            state: TaskState::Created,
            ctx,
            cycles: 0,
        }
    }

    /// Wait for the device. `None` means stop was observed.
    pub fn wait(&mut self) -> Option<Result<usize, DeviceError>> {
        if self.ctx.stop.is_raised() {
            self.finish();
            return None;
        }
        self.state = TaskState::WaitingForHardware;
        let ready = self.device.wait_for_block();
        if ready.is_err() {
            self.ctx.stats.device_errors.increment();
        }
        Some(ready)
    }

    /// True when `frames` holds at least one block, logging if it doesn't.
    pub fn has_block(&mut self, frames: usize) -> bool {
        if frames < self.ctx.block_size {
            self.ctx.stats.short_waits.increment();
            debug!(
                "{}: device reported {} frames, less than a block of {}",
                self.name, frames, self.ctx.block_size
            );
            return false;
        }
        self.state = TaskState::Transferring;
        true
    }

    /// Count one hardware cycle and report fill levels when due.
    pub fn complete_cycle(&mut self, staging: Option<(f32, usize)>) {
        self.state = TaskState::WaitingForHardware;
        self.cycles += 1;
        self.ctx.stats.hardware_cycles.increment();

        let interval = self.ctx.telemetry_interval;
        if interval > 0 && self.cycles % interval == 0 {
            let report = FillReport {
                task: &self.name,
                cycle: self.cycles,
                inbound: self.ctx.levels.inbound.load(),
                outbound: self.ctx.levels.outbound.load(),
                staging,
            };
            self.ctx.observer.on_fill_levels(&report);
        }
    }

    pub fn finish(&mut self) {
        if self.state != TaskState::Stopped {
            self.device.stop();
            self.state = TaskState::Stopped;
            debug!("{}: stopped after {} cycles", self.name, self.cycles);
        }
    }
}
