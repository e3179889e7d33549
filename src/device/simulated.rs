// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Software audio device driven by the system clock.
//!
//! Stands in for hardware in tests and in the daemon's dry-run mode. The clock
//! can be skewed by a few ppm to reproduce the drift between two real
//! oscillators, or disabled entirely so that every wait returns one block.

use super::{AudioDevice, DeviceBackend, DeviceError, DeviceParams, STEREO};
use crate::config::DeviceConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// How [`SimulatedDevice::wait_for_block`] paces itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pacing {
    /// Frames become ready at the (drifted) sample rate.
    RealTime,
    /// Every wait returns exactly one block without sleeping.
    Immediate,
}

/// What the capture stream delivers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureSource {
    Silence,
    /// Frame counter on the left channel, its negation on the right.
    Ramp,
    /// The last block submitted for playback.
    Loopback,
}

/// Shared record of every interleaved sample played.
#[derive(Debug, Clone, Default)]
pub struct PlaybackTap {
    samples: Arc<Mutex<Vec<f32>>>,
}

impl PlaybackTap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<f32> {
        std::mem::take(&mut *self.samples.lock())
    }

    fn record(&self, samples: &[f32]) {
        self.samples.lock().extend_from_slice(samples);
    }
}

/// Opens [`SimulatedDevice`]s.
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    pub pacing: Pacing,
    /// Clock error relative to the nominal sample rate.
    pub drift_ppm: f64,
    pub source: CaptureSource,
    pub capture_channels: usize,
    pub playback_channels: usize,
    pub tap: Option<PlaybackTap>,
    /// Fail every open with this reason.
    pub fail_open: Option<String>,
}

impl SimulatedBackend {
    /// A real-time backend skewed by the configured clock error.
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            drift_ppm: config.drift_ppm,
            ..Self::default()
        }
    }

    /// A backend whose devices never sleep.
    pub fn immediate() -> Self {
        Self {
            pacing: Pacing::Immediate,
            ..Self::default()
        }
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self {
            pacing: Pacing::RealTime,
            drift_ppm: 0.0,
            source: CaptureSource::Loopback,
            capture_channels: STEREO,
            playback_channels: STEREO,
            tap: None,
            fail_open: None,
        }
    }
}

impl DeviceBackend for SimulatedBackend {
    fn open(&self, params: &DeviceParams) -> Result<Box<dyn AudioDevice>, DeviceError> {
        if let Some(reason) = &self.fail_open {
            return Err(DeviceError::Open {
                device: params.describe(),
                reason: reason.clone(),
            });
        }
        if params.playback.is_none() && params.capture.is_none() {
            return Err(DeviceError::Open {
                device: params.describe(),
                reason: "no stream requested".to_string(),
            });
        }
        Ok(Box::new(SimulatedDevice::new(self, params)))
    }
}

pub struct SimulatedDevice {
    block_size: usize,
    max_frames: usize,
    /// Effective rate after drift.
    rate: f64,
    pacing: Pacing,
    source: CaptureSource,
    capture_channels: usize,
    playback_channels: usize,
    running: bool,
    origin: Option<Instant>,
    transferred: u64,
    capture_position: u64,
    capture_frame: Vec<f32>,
    playback_frame: Vec<f32>,
    loopback: Vec<f32>,
    loopback_frames: usize,
    tap: Option<PlaybackTap>,
}

impl SimulatedDevice {
    fn new(backend: &SimulatedBackend, params: &DeviceParams) -> Self {
        let capture_channels = if params.capture.is_some() {
            backend.capture_channels
        } else {
            0
        };
        let playback_channels = if params.playback.is_some() {
            backend.playback_channels
        } else {
            0
        };
        let max_frames = params.block_size * params.periods.max(1) as usize;

        Self {
            block_size: params.block_size,
            max_frames,
            rate: params.sample_rate as f64 * (1.0 + backend.drift_ppm * 1e-6),
            pacing: backend.pacing,
            source: backend.source,
            capture_channels,
            playback_channels,
            running: false,
            origin: None,
            transferred: 0,
            capture_position: 0,
            capture_frame: vec![0.0; max_frames * capture_channels],
            playback_frame: vec![0.0; max_frames * playback_channels],
            loopback: vec![0.0; max_frames * playback_channels],
            loopback_frames: 0,
            tap: backend.tap.clone(),
        }
    }

    fn advance(&mut self, frames: usize) {
        self.transferred += frames as u64;
    }

    fn generate(&mut self, frames: usize) {
        let cc = self.capture_channels;
        let pc = self.playback_channels;

        for i in 0..frames {
            let position = self.capture_position + i as u64;
            for ch in 0..cc {
                self.capture_frame[i * cc + ch] = match self.source {
                    CaptureSource::Silence => 0.0,
                    CaptureSource::Ramp if ch % 2 == 0 => position as f32,
                    CaptureSource::Ramp => -(position as f32),
                    CaptureSource::Loopback if i < self.loopback_frames && ch < pc => {
                        self.loopback[i * pc + ch]
                    }
                    CaptureSource::Loopback => 0.0,
                };
            }
        }
        self.capture_position += frames as u64;
    }
}

impl AudioDevice for SimulatedDevice {
    fn capture_channels(&self) -> usize {
        self.capture_channels
    }

    fn playback_channels(&self) -> usize {
        self.playback_channels
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.running = true;
        self.origin = None;
        self.transferred = 0;
        Ok(())
    }

    fn wait_for_block(&mut self) -> Result<usize, DeviceError> {
        if !self.running {
            return Err(DeviceError::Stopped);
        }
        if self.pacing == Pacing::Immediate {
            return Ok(self.block_size);
        }

        let block = self.block_size as u64;
        let limit = self.max_frames as u64;
        let origin = *self.origin.get_or_insert_with(Instant::now);
        loop {
            let produced = (origin.elapsed().as_secs_f64() * self.rate) as u64;
            let mut ready = produced.saturating_sub(self.transferred);
            if ready > limit {
                debug!("Simulated device xrun: {} frames late", ready - limit);
                self.transferred = produced - limit;
                ready = limit;
            }
            if ready >= block {
                return Ok(ready as usize);
            }
            thread::sleep(Duration::from_secs_f64((block - ready) as f64 / self.rate));
        }
    }

    fn begin_capture(&mut self, frames: usize) -> Result<(), DeviceError> {
        if !self.running {
            return Err(DeviceError::Stopped);
        }
        self.generate(frames.min(self.max_frames));
        Ok(())
    }

    fn capture_channel(&mut self, channel: usize, dst: &mut [f32], frames: usize, stride: usize) {
        let cc = self.capture_channels;
        let frames = frames.min(self.max_frames);
        for (i, sample) in dst.iter_mut().step_by(stride.max(1)).take(frames).enumerate() {
            *sample = if channel < cc {
                self.capture_frame[i * cc + channel]
            } else {
                0.0
            };
        }
    }

    fn end_capture(&mut self, frames: usize) {
        if self.playback_channels == 0 {
            self.advance(frames);
        }
    }

    fn begin_playback(&mut self, frames: usize) {
        let len = frames.min(self.max_frames) * self.playback_channels;
        self.playback_frame[..len].fill(0.0);
    }

    fn play_channel(&mut self, channel: usize, src: &[f32], frames: usize, stride: usize) {
        let pc = self.playback_channels;
        if channel >= pc {
            return;
        }
        let frames = frames.min(self.max_frames);
        for (i, &sample) in src.iter().step_by(stride.max(1)).take(frames).enumerate() {
            self.playback_frame[i * pc + channel] = sample;
        }
    }

    fn clear_channel(&mut self, channel: usize, frames: usize) {
        let pc = self.playback_channels;
        if channel >= pc {
            return;
        }
        for i in 0..frames.min(self.max_frames) {
            self.playback_frame[i * pc + channel] = 0.0;
        }
    }

    fn end_playback(&mut self, frames: usize) -> Result<(), DeviceError> {
        if !self.running {
            return Err(DeviceError::Stopped);
        }
        let frames = frames.min(self.max_frames);
        let len = frames * self.playback_channels;
        if let Some(tap) = &self.tap {
            tap.record(&self.playback_frame[..len]);
        }
        self.loopback[..len].copy_from_slice(&self.playback_frame[..len]);
        self.loopback_frames = frames;
        self.advance(frames);
        Ok(())
    }

    fn stop(&mut self) {
        if self.running {
            debug!("Simulated device stopped after {} frames", self.transferred);
        }
        self.running = false;
    }
}
