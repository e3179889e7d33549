// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Audio device abstraction.
//!
//! The background tasks drive hardware through [`AudioDevice`], which follows
//! the usual period-based PCM cycle: wait for a block, then copy each channel
//! in or out between a `begin_*` and an `end_*` call. Devices are produced by
//! a [`DeviceBackend`] so tests and the daemon can swap implementations.

#[cfg(feature = "alsa-device")]
pub mod alsa;
pub mod simulated;

pub use simulated::{CaptureSource, Pacing, PlaybackTap, SimulatedBackend, SimulatedDevice};

use crate::config::{BackendKind, DeviceConfig};
use thiserror::Error;
use tracing::info;

/// Channels carried by the bridge in each direction.
pub const STEREO: usize = 2;

/// Direction of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSide {
    Capture,
    Playback,
}

impl std::fmt::Display for StreamSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamSide::Capture => write!(f, "capture"),
            StreamSide::Playback => write!(f, "playback"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Can't open audio device {device}: {reason}")]
    Open { device: String, reason: String },
    #[error("Expected a stereo device, {side} has {found} channels")]
    ChannelCount { side: StreamSide, found: usize },
    #[error("Audio device I/O error: {0}")]
    Io(String),
    #[error("Audio device is not running")]
    Stopped,
    #[error("Device backend unavailable: {0}")]
    Unsupported(String),
}

/// What to open and how to configure it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceParams {
    pub playback: Option<String>,
    pub capture: Option<String>,
    pub control: Option<String>,
    pub sample_rate: u32,
    /// Frames per block.
    pub block_size: usize,
    pub periods: u32,
    pub debug_level: u32,
}

impl DeviceParams {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            playback: config.playback.clone(),
            capture: config.capture.clone(),
            control: config.control.clone(),
            sample_rate: config.sample_rate,
            block_size: config.block_size,
            periods: config.periods,
            debug_level: config.debug_level,
        }
    }

    /// The same device with only the playback stream.
    pub fn playback_only(&self) -> Self {
        Self {
            capture: None,
            ..self.clone()
        }
    }

    /// The same device with only the capture stream.
    pub fn capture_only(&self) -> Self {
        Self {
            playback: None,
            ..self.clone()
        }
    }

    /// Human-readable name for log lines.
    pub fn describe(&self) -> String {
        let side = |name: &Option<String>| name.as_deref().unwrap_or("-").to_string();
        format!(
            "playback={} capture={} rate={} block={} periods={}",
            side(&self.playback),
            side(&self.capture),
            self.sample_rate,
            self.block_size,
            self.periods
        )
    }
}

/// A period-based full-duplex PCM device.
///
/// Sample buffers passed to the per-channel calls are strided: frame `i` of
/// the channel lives at index `i * stride`.
pub trait AudioDevice: Send {
    /// Channels of the capture stream, 0 when capture is not open.
    fn capture_channels(&self) -> usize;

    /// Channels of the playback stream, 0 when playback is not open.
    fn playback_channels(&self) -> usize;

    fn start(&mut self) -> Result<(), DeviceError>;

    /// Block until at least one block is ready. Returns the frames ready.
    fn wait_for_block(&mut self) -> Result<usize, DeviceError>;

    /// Fetch `frames` captured frames for the per-channel reads that follow.
    fn begin_capture(&mut self, frames: usize) -> Result<(), DeviceError>;

    fn capture_channel(&mut self, channel: usize, dst: &mut [f32], frames: usize, stride: usize);

    fn end_capture(&mut self, frames: usize);

    fn begin_playback(&mut self, frames: usize);

    fn play_channel(&mut self, channel: usize, src: &[f32], frames: usize, stride: usize);

    fn clear_channel(&mut self, channel: usize, frames: usize);

    /// Submit the block assembled since `begin_playback`.
    fn end_playback(&mut self, frames: usize) -> Result<(), DeviceError>;

    fn stop(&mut self);
}

/// Opens [`AudioDevice`]s.
pub trait DeviceBackend: Send + Sync {
    fn open(&self, params: &DeviceParams) -> Result<Box<dyn AudioDevice>, DeviceError>;
}

/// Open a device, check both requested streams are stereo, and start it.
pub fn open_stereo(
    backend: &dyn DeviceBackend,
    params: &DeviceParams,
) -> Result<Box<dyn AudioDevice>, DeviceError> {
    let mut device = backend.open(params)?;
    info!("Opened audio device: {}", params.describe());

    if params.capture.is_some() && device.capture_channels() != STEREO {
        return Err(DeviceError::ChannelCount {
            side: StreamSide::Capture,
            found: device.capture_channels(),
        });
    }
    if params.playback.is_some() && device.playback_channels() != STEREO {
        return Err(DeviceError::ChannelCount {
            side: StreamSide::Playback,
            found: device.playback_channels(),
        });
    }

    device.start()?;
    Ok(device)
}

/// The backend selected by `config.backend`.
pub fn backend_for(config: &DeviceConfig) -> Result<Box<dyn DeviceBackend>, DeviceError> {
    match config.backend {
        BackendKind::Simulated => Ok(Box::new(SimulatedBackend::from_config(config))),
        #[cfg(feature = "alsa-device")]
        BackendKind::Alsa => Ok(Box::new(alsa::AlsaBackend)),
        #[cfg(not(feature = "alsa-device"))]
        BackendKind::Alsa => Err(DeviceError::Unsupported(
            "built without the alsa-device feature".to_string(),
        )),
    }
}
