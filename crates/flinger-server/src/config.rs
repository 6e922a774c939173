//! Server configuration for flingerd
//!
//! Configuration is stored as YAML in the user's config directory.
//! Default location: ~/.config/flingerd/config.yaml

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use flinger_core::config::EngineConfig;
use flinger_core::devices::{InputDevices, OutputDevices};
use flinger_core::types::{AudioFormat, ChannelMask, OutputFlags, StreamConfig, StreamType};
use flinger_policy::{AudioMode, ForceUse, ForcedConfig};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Worker-thread timing and retry knobs
    pub engine: EngineConfig,
    /// Hardware outputs to open, in order
    pub outputs: Vec<OutputConfig>,
    /// Names of two mixer outputs to mirror through a duplicating thread
    pub duplicate: Option<(String, String)>,
    pub inputs: Vec<InputConfig>,
    pub routing: RoutingConfig,
    pub tone: ToneConfig,
    /// How long the demo plays before shutting down
    pub run_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            outputs: vec![OutputConfig::default()],
            duplicate: None,
            inputs: vec![InputConfig::default()],
            routing: RoutingConfig::default(),
            tone: ToneConfig::default(),
            run_seconds: 5,
        }
    }
}

/// Thread variant an output gets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    Mixer,
    Direct,
    Offload,
}

/// Where an output's audio ends up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    /// Discarded at real-time pace
    Null,
    /// Written to a 32-bit float WAV file
    Wav { path: PathBuf },
    /// Default system playback device (needs the `cpal-output` feature)
    Cpal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub name: String,
    pub mode: OutputMode,
    pub sink: SinkConfig,
    /// First mixer output opened as primary carries the call path
    pub primary: bool,
    pub sample_rate: u32,
    pub channels: u32,
    pub format: AudioFormat,
    /// HAL buffer size in frames
    pub frame_count: usize,
    /// Device names this output reaches, e.g. `SPEAKER`, `WIRED_HEADSET`
    pub devices: Vec<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            name: "primary".to_string(),
            mode: OutputMode::Mixer,
            sink: SinkConfig::Null,
            primary: true,
            sample_rate: 48000,
            channels: 2,
            format: AudioFormat::Pcm16,
            frame_count: 960,
            devices: vec!["SPEAKER".to_string()],
        }
    }
}

impl OutputConfig {
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            sample_rate: self.sample_rate,
            format: self.format,
            channel_mask: ChannelMask::out_mask_from_count(self.channels),
            frame_count: self.frame_count,
        }
    }

    pub fn flags(&self) -> OutputFlags {
        let mut flags = match self.mode {
            OutputMode::Mixer => OutputFlags::empty(),
            OutputMode::Direct => OutputFlags::DIRECT,
            OutputMode::Offload => OutputFlags::DIRECT | OutputFlags::COMPRESS_OFFLOAD | OutputFlags::NON_BLOCKING,
        };
        if self.primary {
            flags |= OutputFlags::PRIMARY;
        }
        flags
    }

    pub fn device_set(&self) -> Result<OutputDevices> {
        parse_devices(&self.devices, OutputDevices::from_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub name: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub frame_count: usize,
    /// Sine frequency produced by the software source; silence when unset
    pub tone_hz: Option<f32>,
    pub devices: Vec<String>,
    /// Captured audio is written here as WAV
    pub capture_path: Option<PathBuf>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            name: "mic".to_string(),
            sample_rate: 48000,
            channels: 1,
            frame_count: 480,
            tone_hz: Some(440.0),
            devices: vec!["BUILTIN_MIC".to_string()],
            capture_path: None,
        }
    }
}

impl InputConfig {
    pub fn stream_config(&self) -> StreamConfig {
        let channel_mask = if self.channels >= 2 {
            ChannelMask::IN_STEREO
        } else {
            ChannelMask::IN_MONO
        };
        StreamConfig {
            sample_rate: self.sample_rate,
            format: AudioFormat::Pcm16,
            channel_mask,
            frame_count: self.frame_count,
        }
    }

    pub fn device_set(&self) -> Result<InputDevices> {
        parse_devices(&self.devices, InputDevices::from_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceUseSetting {
    pub usage: ForceUse,
    pub config: ForcedConfig,
}

/// Initial routing-engine state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub phone_state: AudioMode,
    pub force_use: Vec<ForceUseSetting>,
    /// Device used when no rule matches
    pub default_output_device: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            phone_state: AudioMode::Normal,
            force_use: Vec::new(),
            default_output_device: "SPEAKER".to_string(),
        }
    }
}

/// Test tone played through a track on the selected output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneConfig {
    pub frequency_hz: f32,
    pub amplitude: f32,
    pub stream_type: StreamType,
    /// UI volume index fed through the stream's volume curve
    pub volume_index: i32,
    pub sample_rate: u32,
    pub channels: u32,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 440.0,
            amplitude: 0.5,
            stream_type: StreamType::Music,
            volume_index: 11,
            sample_rate: 44100,
            channels: 2,
        }
    }
}

fn parse_devices<T, F>(names: &[String], from_name: F) -> Result<T>
where
    T: std::ops::BitOr<Output = T> + Default,
    F: Fn(&str) -> Option<T>,
{
    names.iter().try_fold(T::default(), |acc, name| {
        from_name(name)
            .map(|d| acc | d)
            .ok_or_else(|| anyhow!("unknown device name {:?}", name))
    })
}

/// Parse a single output device name
pub fn output_device(name: &str) -> Result<OutputDevices> {
    OutputDevices::from_name(name).ok_or_else(|| anyhow!("unknown output device {:?}", name))
}

/// Get the default config file path
///
/// Returns: ~/.config/flingerd/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("flingerd")
        .join("config.yaml")
}
