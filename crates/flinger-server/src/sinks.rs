//! Software HAL streams for the server
//!
//! - [`WavStreamOut`]: paced like a null sink, every mixed frame also lands in a WAV file
//! - [`CaptureFile`]: writes frames read from a record track to WAV
//! - `CpalStreamOut` (feature `cpal-output`): feeds the default playback device
//!   through a lock-free ring

use std::any::Any;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{bail, Context, Result};

use flinger_core::convert::pcm_to_float;
use flinger_core::error::{FlingerError, FlingerResult};
use flinger_core::hal::{NullStreamOut, StreamOut};
use flinger_core::params::{AudioParameter, KEY_CHANNELS, KEY_FORMAT, KEY_SAMPLING_RATE};
use flinger_core::types::StreamConfig;

use crate::config::{OutputConfig, SinkConfig};

type WavWriter = hound::WavWriter<BufWriter<File>>;

fn wav_spec(config: &StreamConfig) -> hound::WavSpec {
    hound::WavSpec {
        channels: config.channel_count() as u16,
        sample_rate: config.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    }
}

fn hal_error(e: hound::Error) -> FlingerError {
    FlingerError::Hal(format!("wav: {}", e))
}

/// Decode `data` and append it to `writer`
fn append(writer: &mut WavWriter, config: &StreamConfig, data: &[u8], scratch: &mut Vec<f32>) -> FlingerResult<()> {
    let samples = data.len() / config.format.bytes_per_sample();
    scratch.resize(samples, 0.0);
    let decoded = pcm_to_float(config.format, data, scratch);
    for &s in &scratch[..decoded] {
        writer.write_sample(s).map_err(hal_error)?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────
// WAV output
// ─────────────────────────────────────────────────────────────

/// Output stream recording everything it is given
pub struct WavStreamOut {
    inner: NullStreamOut,
    writer: WavWriter,
    config: StreamConfig,
    scratch: Vec<f32>,
}

impl WavStreamOut {
    pub fn create(path: &Path, config: StreamConfig) -> Result<Self> {
        if !config.format.is_linear_pcm() {
            bail!("WAV sink needs linear PCM, got {:?}", config.format);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        let writer = hound::WavWriter::create(path, wav_spec(&config))
            .with_context(|| format!("Failed to create WAV file: {:?}", path))?;
        log::info!("WavStreamOut: writing {:?} ({} Hz, {} ch)", path, config.sample_rate, config.channel_count());
        Ok(Self {
            inner: NullStreamOut::new(config),
            writer,
            config,
            scratch: Vec::new(),
        })
    }
}

impl StreamOut for WavStreamOut {
    fn config(&self) -> StreamConfig {
        self.config
    }

    fn latency_ms(&self) -> u32 {
        self.inner.latency_ms()
    }

    fn write(&mut self, data: &[u8]) -> FlingerResult<usize> {
        append(&mut self.writer, &self.config, data, &mut self.scratch)?;
        self.inner.write(data)
    }

    fn standby(&mut self) -> FlingerResult<()> {
        self.writer.flush().map_err(hal_error)?;
        self.inner.standby()
    }

    fn set_parameters(&mut self, kv: &str) -> FlingerResult<()> {
        let param = AudioParameter::parse(kv);
        if [KEY_SAMPLING_RATE, KEY_FORMAT, KEY_CHANNELS]
            .iter()
            .any(|key| param.contains(key))
        {
            return Err(FlingerError::invalid_operation("WAV sink format is fixed"));
        }
        self.inner.set_parameters(kv)
    }

    fn get_parameters(&self, keys: &str) -> String {
        self.inner.get_parameters(keys)
    }

    fn render_position(&self) -> FlingerResult<u64> {
        self.inner.render_position()
    }
}

// ─────────────────────────────────────────────────────────────
// Capture file
// ─────────────────────────────────────────────────────────────

/// WAV file fed from a record track
pub struct CaptureFile {
    writer: WavWriter,
    config: StreamConfig,
    scratch: Vec<f32>,
    frames: u64,
}

impl CaptureFile {
    pub fn create(path: &Path, config: StreamConfig) -> Result<Self> {
        let writer = hound::WavWriter::create(path, wav_spec(&config))
            .with_context(|| format!("Failed to create capture file: {:?}", path))?;
        Ok(Self {
            writer,
            config,
            scratch: Vec::new(),
            frames: 0,
        })
    }

    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        append(&mut self.writer, &self.config, data, &mut self.scratch)?;
        self.frames += (data.len() / self.config.frame_size().max(1)) as u64;
        Ok(())
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn finish(self) -> Result<()> {
        self.writer.finalize().context("Failed to finalize capture file")
    }
}

// ─────────────────────────────────────────────────────────────
// System device
// ─────────────────────────────────────────────────────────────

#[cfg(feature = "cpal-output")]
mod device {
    use std::time::Duration;

    use anyhow::{anyhow, Context, Result};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    use flinger_core::convert::pcm_to_float;
    use flinger_core::error::FlingerResult;
    use flinger_core::hal::StreamOut;
    use flinger_core::types::{AudioFormat, ChannelMask, StreamConfig};

    /// Ring capacity in sink periods
    const RING_PERIODS: usize = 4;

    /// Output stream pushing samples to a cpal callback
    pub struct CpalStreamOut {
        producer: rtrb::Producer<f32>,
        config: StreamConfig,
        scratch: Vec<f32>,
        frames_rendered: u64,
    }

    /// Open the default device; the returned stream must stay alive on this thread
    pub fn open(frame_count: usize) -> Result<(CpalStreamOut, cpal::Stream)> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("No default output device"))?;
        let supported = device
            .default_output_config()
            .context("Failed to query default output config")?;
        let stream_config: cpal::StreamConfig = supported.config();

        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        log::info!(
            "CpalStreamOut: using {} ({} Hz, {} ch)",
            device_name,
            stream_config.sample_rate.0,
            stream_config.channels
        );

        let config = StreamConfig {
            sample_rate: stream_config.sample_rate.0,
            format: AudioFormat::PcmFloat,
            channel_mask: ChannelMask::out_mask_from_count(stream_config.channels as u32),
            frame_count,
        };
        let (producer, mut consumer) =
            rtrb::RingBuffer::<f32>::new(frame_count * config.channel_count() * RING_PERIODS);

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        // silence when the mixer is behind
                        *sample = consumer.pop().unwrap_or(0.0);
                    }
                },
                move |err| {
                    log::error!("CpalStreamOut: stream error: {}", err);
                },
                None,
            )
            .context("Failed to build output stream")?;
        stream.play().context("Failed to start output stream")?;

        Ok((
            CpalStreamOut {
                producer,
                config,
                scratch: Vec::new(),
                frames_rendered: 0,
            },
            stream,
        ))
    }

    impl StreamOut for CpalStreamOut {
        fn config(&self) -> StreamConfig {
            self.config
        }

        fn latency_ms(&self) -> u32 {
            (self.config.frame_count * RING_PERIODS * 1000 / self.config.sample_rate.max(1) as usize) as u32
        }

        /// Blocks until the ring has taken every sample
        fn write(&mut self, data: &[u8]) -> FlingerResult<usize> {
            self.scratch.resize(data.len() / 4, 0.0);
            let decoded = pcm_to_float(self.config.format, data, &mut self.scratch);
            let mut pending = &self.scratch[..decoded];
            while !pending.is_empty() {
                let n = pending.len().min(self.producer.slots());
                if n == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                }
                for &s in &pending[..n] {
                    // slots() guaranteed room
                    let _ = self.producer.push(s);
                }
                pending = &pending[n..];
            }
            self.frames_rendered += (decoded / self.config.channel_count().max(1)) as u64;
            Ok(data.len())
        }

        fn standby(&mut self) -> FlingerResult<()> {
            Ok(())
        }

        fn set_parameters(&mut self, _kv: &str) -> FlingerResult<()> {
            Ok(())
        }

        fn get_parameters(&self, _keys: &str) -> String {
            String::new()
        }

        fn render_position(&self) -> FlingerResult<u64> {
            Ok(self.frames_rendered)
        }
    }
}

// ─────────────────────────────────────────────────────────────
// Factory
// ─────────────────────────────────────────────────────────────

/// An opened sink; `keep_alive` holds device resources that must outlive the output
pub struct OpenedSink {
    pub stream: Box<dyn StreamOut>,
    pub keep_alive: Option<Box<dyn Any>>,
}

/// Build the HAL stream an output configuration asks for
pub fn open_sink(output: &OutputConfig) -> Result<OpenedSink> {
    let config = output.stream_config();
    match &output.sink {
        SinkConfig::Null => Ok(OpenedSink {
            stream: Box::new(NullStreamOut::new(config)),
            keep_alive: None,
        }),
        SinkConfig::Wav { path } => Ok(OpenedSink {
            stream: Box::new(WavStreamOut::create(path, config)?),
            keep_alive: None,
        }),
        #[cfg(feature = "cpal-output")]
        SinkConfig::Cpal => {
            let (stream, handle) = device::open(output.frame_count)?;
            Ok(OpenedSink {
                stream: Box::new(stream),
                keep_alive: Some(Box::new(handle)),
            })
        }
        #[cfg(not(feature = "cpal-output"))]
        SinkConfig::Cpal => bail!(
            "output {:?} wants a cpal sink but flingerd was built without the cpal-output feature",
            output.name
        ),
    }
}
