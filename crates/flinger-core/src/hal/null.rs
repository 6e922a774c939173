//! Software streams with a wall-clock pace
//!
//! [`NullStreamOut`] swallows audio at the rate real hardware would consume
//! it, and [`NullStreamIn`] produces silence or a sine tone at the capture
//! rate. Both honour the reconfiguration keys so threads can be re-tuned at
//! runtime exactly as with a device stream.

use std::f32::consts::TAU;
use std::time::{Duration, Instant};

use crate::convert::float_to_pcm;
use crate::error::FlingerResult;
use crate::params::{AudioParameter, KEY_CHANNELS, KEY_FORMAT, KEY_FRAME_COUNT, KEY_SAMPLING_RATE};
use crate::types::StreamConfig;

use super::{apply_config_keys, StreamIn, StreamOut};

/// Sleeps so that `frames` frames at `rate` take real time, measured from `start`
fn pace(start: &mut Option<Instant>, frames: u64, rate: u32) {
    let origin = *start.get_or_insert_with(Instant::now);
    if rate == 0 {
        return;
    }
    let due = origin + Duration::from_micros(frames * 1_000_000 / rate as u64);
    let now = Instant::now();
    if due > now {
        std::thread::sleep(due - now);
    }
}

fn config_value(config: &StreamConfig, key: &str) -> Option<String> {
    match key {
        KEY_SAMPLING_RATE => Some(config.sample_rate.to_string()),
        KEY_FORMAT => Some(config.format.code().to_string()),
        KEY_CHANNELS => Some(config.channel_mask.0.to_string()),
        KEY_FRAME_COUNT => Some(config.frame_count.to_string()),
        _ => None,
    }
}

fn lookup(config: &StreamConfig, stored: &AudioParameter, keys: &str) -> String {
    let mut reply = AudioParameter::new();
    for key in AudioParameter::parse(keys).keys() {
        if let Some(v) = config_value(config, key) {
            reply.add(key, &v);
        } else if let Some(v) = stored.get(key) {
            reply.add(key, v);
        }
    }
    reply.to_string()
}

/// Output stream that discards audio
pub struct NullStreamOut {
    config: StreamConfig,
    latency_ms: u32,
    paced: bool,
    start: Option<Instant>,
    frames_since_start: u64,
    frames_rendered: u64,
    params: AudioParameter,
}

impl NullStreamOut {
    /// A sink that consumes audio in real time
    pub fn new(config: StreamConfig) -> Self {
        let latency_ms = (config.frame_count as u64 * 2 * 1000 / config.sample_rate.max(1) as u64) as u32;
        Self {
            config,
            latency_ms,
            paced: true,
            start: None,
            frames_since_start: 0,
            frames_rendered: 0,
            params: AudioParameter::new(),
        }
    }

    /// A sink that returns immediately from every write
    pub fn unpaced(config: StreamConfig) -> Self {
        Self {
            paced: false,
            ..Self::new(config)
        }
    }
}

impl StreamOut for NullStreamOut {
    fn config(&self) -> StreamConfig {
        self.config
    }

    fn latency_ms(&self) -> u32 {
        self.latency_ms
    }

    fn write(&mut self, data: &[u8]) -> FlingerResult<usize> {
        let frames = (data.len() / self.config.frame_size().max(1)) as u64;
        self.frames_since_start += frames;
        self.frames_rendered += frames;
        if self.paced {
            pace(&mut self.start, self.frames_since_start, self.config.sample_rate);
        }
        Ok(data.len())
    }

    fn standby(&mut self) -> FlingerResult<()> {
        self.start = None;
        self.frames_since_start = 0;
        Ok(())
    }

    fn set_parameters(&mut self, kv: &str) -> FlingerResult<()> {
        let mut param = AudioParameter::parse(kv);
        apply_config_keys(&mut self.config, &param)?;
        for key in [KEY_SAMPLING_RATE, KEY_FORMAT, KEY_CHANNELS, KEY_FRAME_COUNT] {
            param.remove(key);
        }
        for key in param.keys() {
            if let Some(v) = param.get(key) {
                self.params.add(key, v);
            }
        }
        Ok(())
    }

    fn get_parameters(&self, keys: &str) -> String {
        lookup(&self.config, &self.params, keys)
    }

    fn render_position(&self) -> FlingerResult<u64> {
        Ok(self.frames_rendered)
    }
}

/// Input stream producing silence or a sine tone
pub struct NullStreamIn {
    config: StreamConfig,
    paced: bool,
    tone_hz: Option<f32>,
    phase: f32,
    start: Option<Instant>,
    frames_since_start: u64,
    params: AudioParameter,
    scratch: Vec<f32>,
}

impl NullStreamIn {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            paced: true,
            tone_hz: None,
            phase: 0.0,
            start: None,
            frames_since_start: 0,
            params: AudioParameter::new(),
            scratch: Vec::new(),
        }
    }

    /// Generate a sine tone at `hz` instead of silence
    pub fn with_tone(mut self, hz: f32) -> Self {
        self.tone_hz = Some(hz);
        self
    }

    /// Return from reads immediately
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }
}

impl StreamIn for NullStreamIn {
    fn config(&self) -> StreamConfig {
        self.config
    }

    fn read(&mut self, buf: &mut [u8]) -> FlingerResult<usize> {
        let frame_size = self.config.frame_size().max(1);
        let channels = self.config.channel_count().max(1);
        let frames = buf.len() / frame_size;
        self.scratch.resize(frames * channels, 0.0);

        match self.tone_hz {
            Some(hz) => {
                let step = TAU * hz / self.config.sample_rate.max(1) as f32;
                for frame in self.scratch.chunks_exact_mut(channels) {
                    frame.fill(0.5 * self.phase.sin());
                    self.phase = (self.phase + step) % TAU;
                }
            }
            None => self.scratch.fill(0.0),
        }
        float_to_pcm(self.config.format, &self.scratch, &mut buf[..frames * frame_size]);

        self.frames_since_start += frames as u64;
        if self.paced {
            pace(&mut self.start, self.frames_since_start, self.config.sample_rate);
        }
        Ok(frames * frame_size)
    }

    fn standby(&mut self) -> FlingerResult<()> {
        self.start = None;
        self.frames_since_start = 0;
        Ok(())
    }

    fn set_parameters(&mut self, kv: &str) -> FlingerResult<()> {
        let mut param = AudioParameter::parse(kv);
        apply_config_keys(&mut self.config, &param)?;
        for key in [KEY_SAMPLING_RATE, KEY_FORMAT, KEY_CHANNELS, KEY_FRAME_COUNT] {
            param.remove(key);
        }
        for key in param.keys() {
            if let Some(v) = param.get(key) {
                self.params.add(key, v);
            }
        }
        Ok(())
    }

    fn get_parameters(&self, keys: &str) -> String {
        lookup(&self.config, &self.params, keys)
    }
}
