// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration management for the bridge.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use uacbridge_rt::channel::{DEFAULT_REGISTRY_ROOT, MIN_CAPACITY};

/// Name of the configuration file inside the config directory.
pub const CONFIG_FILE: &str = "bridge.toml";

/// Identifier of the USB audio gadget's PCM device.
pub const DEFAULT_DEVICE: &str = "hw:CARD=UAC2Gadget,DEV=0";

/// Largest simulated clock error accepted.
pub const MAX_DRIFT_PPM: f64 = 100_000.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("No config directory found")]
    NoConfigDir,
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which device implementation to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Software clock, no hardware needed.
    #[default]
    Simulated,
    /// ALSA PCM through libasound.
    Alsa,
}

/// How hardware transfers are split across background tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// One task drives capture and playback on a single device.
    #[default]
    Combined,
    /// Separate output and input tasks, each with its own device.
    Split,
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topology::Combined => write!(f, "combined"),
            Topology::Split => write!(f, "split"),
        }
    }
}

/// Audio device parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: BackendKind,
    pub playback: Option<String>,
    pub capture: Option<String>,
    pub control: Option<String>,
    pub sample_rate: u32,
    /// Frames per hardware block.
    pub block_size: usize,
    pub periods: u32,
    pub debug_level: u32,
    /// Clock error of the simulated backend, in parts per million.
    pub drift_ppm: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            playback: Some(DEFAULT_DEVICE.to_string()),
            capture: Some(DEFAULT_DEVICE.to_string()),
            control: None,
            sample_rate: 48000,
            block_size: 128,
            periods: 2,
            debug_level: 0,
            drift_ppm: 0.0,
        }
    }
}

/// Ring buffer sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Interleaved channels carried end to end.
    pub channels: usize,
    /// Frames held by each of the inbound and outbound rings.
    pub ring_frames: usize,
    /// Hardware blocks held by the combined task's staging ring.
    pub staging_blocks: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            channels: 2,
            ring_frames: 2048,
            staging_blocks: 4,
        }
    }
}

/// Names and sizes of the two cross-domain channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub to_host: String,
    pub from_host: String,
    /// Bytes per direction.
    pub capacity_bytes: usize,
    /// Largest chunk the real-time side drains in one receive.
    pub chunk_samples: usize,
    pub registry_root: PathBuf,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            to_host: "UACToHost".to_string(),
            from_host: "UACFromHost".to_string(),
            capacity_bytes: 8192 * 16,
            chunk_samples: 4096,
            registry_root: PathBuf::from(DEFAULT_REGISTRY_ROOT),
        }
    }
}

/// Drift control thresholds, as fractions of the inbound ring capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub overrun_threshold: f32,
    pub underrun_threshold: f32,
    pub compensation: f32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            overrun_threshold: 0.2,
            underrun_threshold: 0.2,
            compensation: 0.3,
        }
    }
}

/// Background task configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadingConfig {
    pub topology: Topology,
    /// SCHED_FIFO priority requested for background tasks.
    pub priority: i32,
    /// Longest the split output task waits for one block from the channel.
    pub read_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            priority: 94,
            read_timeout_ms: 20,
            poll_interval_ms: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Hardware cycles between two fill-level reports. 0 disables them.
    pub interval_cycles: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_cycles: 100,
        }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub channels: ChannelConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub threading: ThreadingConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl BridgeConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Interleaved samples in one hardware block.
    pub fn block_samples(&self) -> usize {
        self.device.block_size * self.buffers.channels
    }

    /// Samples held by each of the inbound and outbound rings.
    pub fn ring_capacity(&self) -> usize {
        self.buffers.ring_frames * self.buffers.channels
    }

    /// Samples held by the combined task's staging ring.
    pub fn staging_capacity(&self) -> usize {
        self.block_samples() * self.buffers.staging_blocks
    }

    /// Check the configuration for values the bridge cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.device.sample_rate == 0 {
            return invalid("device.sample_rate must be positive".into());
        }
        if self.device.block_size == 0 {
            return invalid("device.block_size must be positive".into());
        }
        if self.device.periods == 0 {
            return invalid("device.periods must be positive".into());
        }
        if !self.device.drift_ppm.is_finite() || self.device.drift_ppm.abs() > MAX_DRIFT_PPM {
            return invalid(format!(
                "device.drift_ppm must be within +/-{}",
                MAX_DRIFT_PPM
            ));
        }
        if self.buffers.channels != 2 {
            return invalid(format!(
                "buffers.channels must be 2, got {}",
                self.buffers.channels
            ));
        }
        if self.buffers.ring_frames == 0 || self.buffers.ring_frames % self.device.block_size != 0
        {
            return invalid(format!(
                "buffers.ring_frames ({}) must be a positive multiple of device.block_size ({})",
                self.buffers.ring_frames, self.device.block_size
            ));
        }
        if self.buffers.staging_blocks < 2 {
            return invalid("buffers.staging_blocks must be at least 2".into());
        }

        if self.channels.to_host == self.channels.from_host {
            return invalid("channels.to_host and channels.from_host must differ".into());
        }
        if self.channels.capacity_bytes < MIN_CAPACITY {
            return invalid(format!(
                "channels.capacity_bytes must be at least {}",
                MIN_CAPACITY
            ));
        }
        if self.channels.chunk_samples < self.block_samples() {
            return invalid(format!(
                "channels.chunk_samples ({}) must hold one block ({} samples)",
                self.channels.chunk_samples,
                self.block_samples()
            ));
        }
        // One framed chunk must always fit in an empty channel.
        let chunk_bytes = self.channels.chunk_samples * std::mem::size_of::<f32>() + 4;
        if chunk_bytes > self.channels.capacity_bytes.next_power_of_two() {
            return invalid(format!(
                "channels.chunk_samples ({}) does not fit in {} channel bytes",
                self.channels.chunk_samples, self.channels.capacity_bytes
            ));
        }

        let control = &self.control;
        for (name, value) in [
            ("overrun_threshold", control.overrun_threshold),
            ("underrun_threshold", control.underrun_threshold),
            ("compensation", control.compensation),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return invalid(format!("control.{} must be in (0, 1), got {}", name, value));
            }
        }
        if control.overrun_threshold + control.underrun_threshold >= 1.0 {
            return invalid("control thresholds overlap".into());
        }
        // A burst must not push the occupancy across the opposite threshold.
        if control.compensation >= 1.0 - control.overrun_threshold
            || control.compensation >= 1.0 - control.underrun_threshold
        {
            return invalid(format!(
                "control.compensation ({}) would overshoot the opposite threshold",
                control.compensation
            ));
        }

        if self.threading.read_timeout_ms == 0 || self.threading.poll_interval_ms == 0 {
            return invalid("threading timeouts must be positive".into());
        }
        Ok(())
    }
}

/// Configuration manager handles loading and saving config files.
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Create a config manager for the user's config directory.
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = directories::ProjectDirs::from("org", "uacbridge", "uacbridge")
            .map(|d| d.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)?;
        Self::with_dir(config_dir)
    }

    /// Create a config manager rooted at `config_dir`.
    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let config_dir = config_dir.into();

        // Ensure config directory exists
        fs::create_dir_all(&config_dir)?;

        debug!("Config directory: {:?}", config_dir);
        Ok(Self { config_dir })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Get the path to a config file.
    fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(name)
    }

    /// Load the bridge configuration, falling back to defaults if absent.
    pub fn load_bridge_config(&self) -> Result<BridgeConfig, ConfigError> {
        let path = self.config_path(CONFIG_FILE);
        if !path.exists() {
            debug!("No bridge config found, using defaults");
            return Ok(BridgeConfig::default());
        }

        let content = fs::read_to_string(&path)?;
        let config = BridgeConfig::from_toml(&content)?;
        info!("Loaded bridge config from {:?}", path);
        Ok(config)
    }

    /// Save the bridge configuration.
    pub fn save_bridge_config(&self, config: &BridgeConfig) -> Result<(), ConfigError> {
        let path = self.config_path(CONFIG_FILE);
        let content = config.to_toml()?;
        fs::write(&path, content)?;
        debug!("Saved bridge config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = BridgeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.block_samples(), 256);
        assert_eq!(config.ring_capacity(), 4096);
        assert_eq!(config.staging_capacity(), 1024);
        assert_eq!(config.channels.capacity_bytes, 131072);
        assert_eq!(config.device.playback.as_deref(), Some(DEFAULT_DEVICE));
    }

    #[test]
    fn test_ring_must_be_block_multiple() {
        let mut config = BridgeConfig::default();
        config.buffers.ring_frames = 2000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_bad_fractions() {
        let mut config = BridgeConfig::default();
        config.control.overrun_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.control.compensation = 0.85;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.control.overrun_threshold = 0.6;
        config.control.underrun_threshold = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_stereo_and_small_chunks() {
        let mut config = BridgeConfig::default();
        config.buffers.channels = 4;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.channels.chunk_samples = 64;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.channels.capacity_bytes = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_drift_ppm_parsed_and_bounded() {
        let config = BridgeConfig::from_toml(
            r#"
            [device]
            drift_ppm = -250.5
            "#,
        )
        .unwrap();
        assert_eq!(config.device.drift_ppm, -250.5);
        config.validate().unwrap();

        let mut config = BridgeConfig::default();
        config.device.drift_ppm = 2.0 * MAX_DRIFT_PPM;
        assert!(config.validate().is_err());
        config.device.drift_ppm = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = BridgeConfig::from_toml(
            r#"
            [device]
            block_size = 64
            backend = "alsa"

            [threading]
            topology = "split"
            "#,
        )
        .unwrap();
        assert_eq!(config.device.block_size, 64);
        assert_eq!(config.device.backend, BackendKind::Alsa);
        assert_eq!(config.device.sample_rate, 48000);
        assert_eq!(config.threading.topology, Topology::Split);
        assert_eq!(config.threading.priority, 94);
        assert_eq!(config.channels.to_host, "UACToHost");
        config.validate().unwrap();
    }

    #[test]
    fn test_manager_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path().join("uacbridge")).unwrap();

        assert_eq!(manager.load_bridge_config().unwrap(), BridgeConfig::default());

        let mut config = BridgeConfig::default();
        config.device.control = Some("hw:CARD=PCH".to_string());
        config.threading.topology = Topology::Split;
        config.telemetry.interval_cycles = 10;
        manager.save_bridge_config(&config).unwrap();

        assert!(manager.config_dir().join(CONFIG_FILE).exists());
        assert_eq!(manager.load_bridge_config().unwrap(), config);
    }

    #[test]
    fn test_manager_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path()).unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "[device\nblock_size = ").unwrap();
        assert!(matches!(
            manager.load_bridge_config(),
            Err(ConfigError::TomlParse(_))
        ));
    }
}
