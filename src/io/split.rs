// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Separate playback and capture tasks, each with its own device handle.

use crate::device::{open_stereo, AudioDevice, DeviceBackend, DeviceError, DeviceParams, STEREO};
use crate::io::task::{HardwareTask, TaskContext, TaskCore, TaskState};
use std::time::Duration;
use tracing::{debug, trace};
use uacbridge_rt::{ChannelError, HostEndpoint};

/// Plays blocks received from the real-time side.
///
/// Each block is read from the channel with a bounded blocking wait that
/// also observes the stop signal. A block that does not arrive in time is
/// played as silence.
pub struct OutputTask {
    core: TaskCore,
    to_host: HostEndpoint,
    playback: Box<[f32]>,
}

impl OutputTask {
    pub const NAME: &'static str = "pcm_output";

    pub fn open(
        backend: &dyn DeviceBackend,
        params: &DeviceParams,
        to_host: HostEndpoint,
        read_timeout: Duration,
        poll_interval: Duration,
        ctx: TaskContext,
    ) -> Result<Self, DeviceError> {
        let device = open_stereo(backend, &params.playback_only())?;
        Ok(Self::with_device(
            device,
            to_host,
            read_timeout,
            poll_interval,
            ctx,
        ))
    }

    pub fn with_device(
        device: Box<dyn AudioDevice>,
        mut to_host: HostEndpoint,
        read_timeout: Duration,
        poll_interval: Duration,
        ctx: TaskContext,
    ) -> Self {
        to_host.set_blocking(true);
        to_host.set_timeout(Some(read_timeout));
        to_host.set_poll_interval(poll_interval);
        to_host.observe(ctx.stop.clone());

        let block_samples = ctx.block_size * STEREO;
        Self {
            core: TaskCore::new(Self::NAME, device, ctx),
            to_host,
            playback: vec![0.0; block_samples].into_boxed_slice(),
        }
    }

    fn play_block(&mut self) -> Result<(), DeviceError> {
        let block = self.core.ctx.block_size;
        let wanted = self.playback.len();
        let received = match self.to_host.receive(&mut self.playback[..]) {
            Ok(count) => count,
            Err(ChannelError::WouldBlock) | Err(ChannelError::Closed) => 0,
            Err(err) => {
                self.core.ctx.stats.receive_failures.increment();
                debug!("{}: receive failed: {}", self.core.name, err);
                0
            }
        };
        if received < wanted {
            self.core.ctx.stats.channel_timeouts.increment();
            debug!(
                "{}: {} of {} samples arrived in time",
                self.core.name, received, wanted
            );
        }

        let device = &mut self.core.device;
        device.begin_playback(block);
        if received == 0 {
            device.clear_channel(0, block);
            device.clear_channel(1, block);
        } else {
            self.playback[received..].fill(0.0);
            device.play_channel(0, &self.playback, block, STEREO);
            device.play_channel(1, &self.playback[1..], block, STEREO);
        }
        device.end_playback(block)
    }
}

impl HardwareTask for OutputTask {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn state(&self) -> TaskState {
        self.core.state
    }

    fn run_cycle(&mut self) -> Result<TaskState, DeviceError> {
        let mut frames = match self.core.wait() {
            None => return Ok(TaskState::Stopped),
            Some(ready) => ready?,
        };
        if !self.core.has_block(frames) {
            return Ok(self.core.state);
        }

        let block = self.core.ctx.block_size;
        while frames >= block {
            self.play_block()?;
            frames -= block;
        }
        self.core.complete_cycle(None);
        Ok(self.core.state)
    }

    fn finish(&mut self) {
        self.core.finish();
    }
}

/// Captures blocks and sends them to the real-time side without waiting.
pub struct InputTask {
    core: TaskCore,
    from_host: HostEndpoint,
    capture: Box<[f32]>,
}

impl InputTask {
    pub const NAME: &'static str = "pcm_input";

    pub fn open(
        backend: &dyn DeviceBackend,
        params: &DeviceParams,
        from_host: HostEndpoint,
        ctx: TaskContext,
    ) -> Result<Self, DeviceError> {
        let device = open_stereo(backend, &params.capture_only())?;
        Ok(Self::with_device(device, from_host, ctx))
    }

    pub fn with_device(
        device: Box<dyn AudioDevice>,
        mut from_host: HostEndpoint,
        ctx: TaskContext,
    ) -> Self {
        from_host.set_blocking(false);
        let block_samples = ctx.block_size * STEREO;
        Self {
            core: TaskCore::new(Self::NAME, device, ctx),
            from_host,
            capture: vec![0.0; block_samples].into_boxed_slice(),
        }
    }

    fn capture_block(&mut self) -> Result<(), DeviceError> {
        let block = self.core.ctx.block_size;
        let device = &mut self.core.device;
        device.begin_capture(block)?;
        device.capture_channel(0, &mut self.capture, block, STEREO);
        device.capture_channel(1, &mut self.capture[1..], block, STEREO);
        device.end_capture(block);

        if let Err(err) = self.from_host.send(&self.capture[..]) {
            self.core.ctx.stats.send_failures.increment();
            trace!("{}: captured block not sent: {}", self.core.name, err);
        }
        Ok(())
    }
}

impl HardwareTask for InputTask {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn state(&self) -> TaskState {
        self.core.state
    }

    fn run_cycle(&mut self) -> Result<TaskState, DeviceError> {
        let mut frames = match self.core.wait() {
            None => return Ok(TaskState::Stopped),
            Some(ready) => ready?,
        };
        if !self.core.has_block(frames) {
            return Ok(self.core.state);
        }

        let block = self.core.ctx.block_size;
        while frames >= block {
            self.capture_block()?;
            frames -= block;
        }
        self.core.complete_cycle(None);
        Ok(self.core.state)
    }

    fn finish(&mut self) {
        self.core.finish();
    }
}
