// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! ALSA PCM backend.
//!
//! Opens one interleaved S32 stream per requested direction with the
//! configured period size and count. Samples are converted to and from
//! `f32` in per-stream scratch buffers sized at open time.

use super::{AudioDevice, DeviceBackend, DeviceError, DeviceParams};
use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use tracing::{debug, info, warn};

const I32_SCALE: f32 = 2_147_483_648.0;

/// How long one poll for readiness may take before it is retried.
const WAIT_TIMEOUT_MS: u32 = 1000;

fn io_err(err: alsa::Error) -> DeviceError {
    DeviceError::Io(err.to_string())
}

#[inline]
fn to_i32(sample: f32) -> i32 {
    (sample.clamp(-1.0, 1.0) * (I32_SCALE - 1.0)) as i32
}

#[inline]
fn to_f32(sample: i32) -> f32 {
    sample as f32 / I32_SCALE
}

struct Stream {
    pcm: PCM,
    channels: usize,
    buf: Vec<i32>,
}

impl Stream {
    fn open(name: &str, direction: Direction, params: &DeviceParams) -> Result<Self, DeviceError> {
        let open_err = |err: alsa::Error| DeviceError::Open {
            device: name.to_string(),
            reason: err.to_string(),
        };

        let pcm = PCM::new(name, direction, false).map_err(open_err)?;
        let channels = {
            let hwp = HwParams::any(&pcm).map_err(open_err)?;
            hwp.set_access(Access::RWInterleaved).map_err(open_err)?;
            hwp.set_format(Format::s32()).map_err(open_err)?;
            hwp.set_rate(params.sample_rate, ValueOr::Nearest)
                .map_err(open_err)?;
            let channels = hwp.set_channels_near(2).map_err(open_err)?;
            hwp.set_period_size_near(params.block_size as alsa::pcm::Frames, ValueOr::Nearest)
                .map_err(open_err)?;
            hwp.set_periods(params.periods, ValueOr::Nearest)
                .map_err(open_err)?;
            pcm.hw_params(&hwp).map_err(open_err)?;
            channels as usize
        };

        let max_frames = params.block_size * params.periods.max(1) as usize;
        if params.debug_level > 0 {
            info!(
                "ALSA {} {:?}: {} channels, {} frames per block",
                name, direction, channels, params.block_size
            );
        }
        Ok(Self {
            pcm,
            channels,
            buf: vec![0; max_frames * channels],
        })
    }

    /// Wait for the stream and return the frames it can transfer.
    fn ready(&self) -> Result<usize, DeviceError> {
        if let Err(err) = self.pcm.wait(Some(WAIT_TIMEOUT_MS)) {
            self.recover(err)?;
            return Ok(0);
        }
        match self.pcm.avail_update() {
            Ok(frames) => Ok(frames.max(0) as usize),
            Err(err) => {
                self.recover(err)?;
                Ok(0)
            }
        }
    }

    fn recover(&self, err: alsa::Error) -> Result<(), DeviceError> {
        warn!("ALSA stream error, recovering: {}", err);
        self.pcm.try_recover(err, true).map_err(io_err)?;
        if self.pcm.state() != alsa::pcm::State::Running {
            // Playback with an empty buffer refuses to start and restarts on
            // the next write instead.
            if let Err(err) = self.pcm.start() {
                debug!("ALSA stream not restarted after recovery: {}", err);
            }
        }
        Ok(())
    }
}

/// An ALSA device with an optional playback and an optional capture stream.
pub struct AlsaDevice {
    playback: Option<Stream>,
    capture: Option<Stream>,
    max_frames: usize,
    running: bool,
}

impl AudioDevice for AlsaDevice {
    fn capture_channels(&self) -> usize {
        self.capture.as_ref().map_or(0, |s| s.channels)
    }

    fn playback_channels(&self) -> usize {
        self.playback.as_ref().map_or(0, |s| s.channels)
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        if let Some(playback) = &mut self.playback {
            // Prime the whole buffer with silence so playback starts full.
            playback.buf.fill(0);
            let io = playback.pcm.io_i32().map_err(io_err)?;
            io.writei(&playback.buf).map_err(io_err)?;
        }
        if let Some(capture) = &self.capture {
            capture.pcm.start().map_err(io_err)?;
        }
        self.running = true;
        debug!("ALSA device started");
        Ok(())
    }

    fn wait_for_block(&mut self) -> Result<usize, DeviceError> {
        if !self.running {
            return Err(DeviceError::Stopped);
        }
        let mut ready = self.max_frames;
        if let Some(playback) = &self.playback {
            ready = ready.min(playback.ready()?);
        }
        if let Some(capture) = &self.capture {
            ready = ready.min(capture.ready()?);
        }
        Ok(ready)
    }

    fn begin_capture(&mut self, frames: usize) -> Result<(), DeviceError> {
        let Some(capture) = &mut self.capture else {
            return Ok(());
        };
        let len = frames.min(self.max_frames) * capture.channels;
        let io = capture.pcm.io_i32().map_err(io_err)?;
        if let Err(err) = io.readi(&mut capture.buf[..len]) {
            capture.recover(err)?;
            capture.buf[..len].fill(0);
        }
        Ok(())
    }

    fn capture_channel(&mut self, channel: usize, dst: &mut [f32], frames: usize, stride: usize) {
        let Some(capture) = &self.capture else {
            return;
        };
        let cc = capture.channels;
        let frames = frames.min(self.max_frames);
        for (i, sample) in dst.iter_mut().step_by(stride.max(1)).take(frames).enumerate() {
            *sample = if channel < cc {
                to_f32(capture.buf[i * cc + channel])
            } else {
                0.0
            };
        }
    }

    fn end_capture(&mut self, _frames: usize) {}

    fn begin_playback(&mut self, frames: usize) {
        if let Some(playback) = &mut self.playback {
            let len = frames.min(self.max_frames) * playback.channels;
            playback.buf[..len].fill(0);
        }
    }

    fn play_channel(&mut self, channel: usize, src: &[f32], frames: usize, stride: usize) {
        let Some(playback) = &mut self.playback else {
            return;
        };
        let pc = playback.channels;
        if channel >= pc {
            return;
        }
        let frames = frames.min(self.max_frames);
        for (i, &sample) in src.iter().step_by(stride.max(1)).take(frames).enumerate() {
            playback.buf[i * pc + channel] = to_i32(sample);
        }
    }

    fn clear_channel(&mut self, channel: usize, frames: usize) {
        let Some(playback) = &mut self.playback else {
            return;
        };
        let pc = playback.channels;
        if channel >= pc {
            return;
        }
        for i in 0..frames.min(self.max_frames) {
            playback.buf[i * pc + channel] = 0;
        }
    }

    fn end_playback(&mut self, frames: usize) -> Result<(), DeviceError> {
        let Some(playback) = &mut self.playback else {
            return Ok(());
        };
        let len = frames.min(self.max_frames) * playback.channels;
        let io = playback.pcm.io_i32().map_err(io_err)?;
        if let Err(err) = io.writei(&playback.buf[..len]) {
            playback.recover(err)?;
        }
        Ok(())
    }

    fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        for stream in [&self.playback, &self.capture].into_iter().flatten() {
            if let Err(err) = stream.pcm.drop() {
                debug!("ALSA stop: {}", err);
            }
        }
        info!("ALSA device stopped");
    }
}

/// Opens [`AlsaDevice`]s by PCM name.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlsaBackend;

impl DeviceBackend for AlsaBackend {
    fn open(&self, params: &DeviceParams) -> Result<Box<dyn AudioDevice>, DeviceError> {
        let playback = params
            .playback
            .as_deref()
            .map(|name| Stream::open(name, Direction::Playback, params))
            .transpose()?;
        let capture = params
            .capture
            .as_deref()
            .map(|name| Stream::open(name, Direction::Capture, params))
            .transpose()?;

        Ok(Box::new(AlsaDevice {
            playback,
            capture,
            max_frames: params.block_size * params.periods.max(1) as usize,
            running: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_conversion() {
        assert_eq!(to_i32(0.0), 0);
        assert!(to_i32(1.5) > 2_147_483_000);
        assert!(to_i32(-1.5) < -2_147_483_000);
        assert!((to_f32(to_i32(0.25)) - 0.25).abs() < 1e-6);
    }
}
