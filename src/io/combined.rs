// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Single task driving capture and playback on one device.
//!
//! Samples from the real-time side arrive in channel-sized chunks, while the
//! device consumes fixed hardware blocks. A staging ring between the two
//! absorbs the difference in granularity.

use crate::device::{open_stereo, AudioDevice, DeviceBackend, DeviceError, DeviceParams, STEREO};
use crate::io::task::{HardwareTask, TaskContext, TaskCore, TaskState};
use tracing::{debug, trace};
use uacbridge_rt::{ChannelError, HostEndpoint, RingBuffer};

pub struct CombinedTask {
    core: TaskCore,
    to_host: HostEndpoint,
    from_host: HostEndpoint,
    staging: RingBuffer<f32>,
    drain: Box<[f32]>,
    playback: Box<[f32]>,
    capture: Box<[f32]>,
}

impl CombinedTask {
    pub const NAME: &'static str = "pcm_task";

    /// Open a full-duplex device and prime the staging ring half full.
    pub fn open(
        backend: &dyn DeviceBackend,
        params: &DeviceParams,
        to_host: HostEndpoint,
        from_host: HostEndpoint,
        staging_capacity: usize,
        drain_samples: usize,
        ctx: TaskContext,
    ) -> Result<Self, DeviceError> {
        let device = open_stereo(backend, params)?;
        Ok(Self::with_device(
            device,
            to_host,
            from_host,
            staging_capacity,
            drain_samples,
            ctx,
        ))
    }

    pub fn with_device(
        device: Box<dyn AudioDevice>,
        to_host: HostEndpoint,
        from_host: HostEndpoint,
        staging_capacity: usize,
        drain_samples: usize,
        ctx: TaskContext,
    ) -> Self {
        let block_samples = ctx.block_size * STEREO;
        let mut staging = RingBuffer::new(staging_capacity);
        staging.fill(0.0, staging_capacity / 2);

        Self {
            core: TaskCore::new(Self::NAME, device, ctx),
            to_host,
            from_host,
            staging,
            drain: vec![0.0; drain_samples.max(block_samples)].into_boxed_slice(),
            playback: vec![0.0; block_samples].into_boxed_slice(),
            capture: vec![0.0; block_samples].into_boxed_slice(),
        }
    }

    pub fn staging_level(&self) -> (f32, usize) {
        (self.staging.available(), self.staging.available_to_read())
    }

    /// Move everything queued on the host-bound channel into staging, then
    /// take one block for playback. False if staging is short of a block.
    fn stage_playback(&mut self) -> bool {
        let stats = &self.core.ctx.stats;
        loop {
            let received = match self.to_host.receive(&mut self.drain[..]) {
                Ok(count) => count,
                Err(ChannelError::WouldBlock) | Err(ChannelError::Closed) => break,
                Err(err) => {
                    stats.receive_failures.increment();
                    debug!("{}: receive failed: {}", self.core.name, err);
                    break;
                }
            };
            let stored = self.staging.write(&self.drain[..received]);
            if stored < received {
                stats.staging_overflows.increment();
                debug!(
                    "{}: staging full, dropped {} samples",
                    self.core.name,
                    received - stored
                );
            }
        }

        let wanted = self.playback.len();
        let staged = self.staging.available_to_read();
        if staged < wanted {
            stats.staging_underruns.increment();
            debug!(
                "{}: staging underrun, {} of {} samples",
                self.core.name, staged, wanted
            );
            return false;
        }
        self.staging.read(&mut self.playback);
        true
    }

    fn transfer_block(&mut self) -> Result<(), DeviceError> {
        let block = self.core.ctx.block_size;
        let staged = self.stage_playback();

        let device = &mut self.core.device;
        device.begin_capture(block)?;
        device.capture_channel(0, &mut self.capture, block, STEREO);
        device.capture_channel(1, &mut self.capture[1..], block, STEREO);
        device.end_capture(block);

        device.begin_playback(block);
        if staged {
            device.play_channel(0, &self.playback, block, STEREO);
            device.play_channel(1, &self.playback[1..], block, STEREO);
        } else {
            device.clear_channel(0, block);
            device.clear_channel(1, block);
        }
        device.end_playback(block)?;

        if let Err(err) = self.from_host.send(&self.capture[..]) {
            self.core.ctx.stats.send_failures.increment();
            trace!("{}: captured block not sent: {}", self.core.name, err);
        }
        Ok(())
    }
}

impl HardwareTask for CombinedTask {
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
            self.transfer_block()?;
            frames -= block;
        }

        let staging = self.staging_level();
        self.core.complete_cycle(Some(staging));
        Ok(self.core.state)
    }

    fn finish(&mut self) {
        self.core.finish();
    }
}
