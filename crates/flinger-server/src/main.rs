//! flingerd - software audio server
//!
//! Opens the configured outputs and inputs on software HAL streams, asks the
//! routing engine where a test tone belongs, plays it through a track and
//! captures from the first input while it runs. Per-output statistics and a
//! full thread dump are logged before shutdown.
//!
//! ## Command line
//!
//! - `flingerd [CONFIG]`: run with CONFIG (default ~/.config/flingerd/config.yaml)
//! - `--write-config`: save the effective configuration to the config path and exit

mod config;
mod sinks;
mod tone;

use std::any::Any;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use flinger_core::config::{load_config, save_config};
use flinger_core::devices::{InputDevices, OutputDevices};
use flinger_core::hal::NullStreamIn;
use flinger_core::thread::{RecordParams, TrackParams};
use flinger_core::track::{RecordHandle, TrackEvent};
use flinger_core::types::{AudioFormat, ChannelMask, IoHandle};
use flinger_core::AudioFlinger;
use flinger_policy::{AudioSource, Engine, OutputDescriptor};

use config::{OutputMode, ServerConfig};
use sinks::CaptureFile;
use tone::ToneGenerator;

/// Frames rendered per tone write
const TONE_CHUNK_FRAMES: usize = 1024;
/// Idle sleep of the demo loop
const POLL_INTERVAL: Duration = Duration::from_millis(5);
/// How long to wait for the tone to finish presenting after stop
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct OpenedOutput {
    io: IoHandle,
    name: String,
    mode: OutputMode,
    primary: bool,
    devices: OutputDevices,
}

struct OpenedInput {
    io: IoHandle,
    devices: InputDevices,
}

fn main() -> Result<()> {
    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let write_config = args.iter().any(|arg| arg == "--write-config");
    let config_path = args
        .iter()
        .find(|arg| !arg.starts_with("--"))
        .map(PathBuf::from)
        .unwrap_or_else(config::default_config_path);

    let config: ServerConfig = load_config(&config_path);
    if write_config {
        save_config(&config, &config_path)?;
        log::info!("flingerd: configuration written to {:?}", config_path);
        return Ok(());
    }

    log::info!("flingerd starting up ({} outputs, {} inputs)", config.outputs.len(), config.inputs.len());
    run(&config)
}

fn run(config: &ServerConfig) -> Result<()> {
    let flinger = AudioFlinger::new(config.engine.clone());
    let io_events = flinger.subscribe_io();

    // device streams (cpal) must outlive the outputs feeding them
    let mut keep_alive: Vec<Box<dyn Any>> = Vec::new();
    let mut outputs = Vec::with_capacity(config.outputs.len());
    for output in &config.outputs {
        let devices = output
            .device_set()
            .with_context(|| format!("Invalid devices for output {:?}", output.name))?;
        let sink = sinks::open_sink(output).with_context(|| format!("Failed to open sink for {:?}", output.name))?;
        let io = flinger
            .open_output(sink.stream, output.flags(), devices)
            .with_context(|| format!("Failed to open output {:?}", output.name))?;
        keep_alive.extend(sink.keep_alive);
        outputs.push(OpenedOutput {
            io,
            name: output.name.clone(),
            mode: output.mode,
            primary: output.primary,
            devices,
        });
    }

    if let Some((first, second)) = &config.duplicate {
        let find = |name: &str| {
            outputs
                .iter()
                .find(|o| o.name == name)
                .map(|o| o.io)
                .ok_or_else(|| anyhow!("duplicate refers to unknown output {:?}", name))
        };
        let io = flinger
            .open_duplicate_output(find(first)?, find(second)?)
            .context("Failed to open duplicating output")?;
        log::info!("flingerd: {} and {} duplicated on output {}", first, second, io.0);
    }

    let mut inputs = Vec::with_capacity(config.inputs.len());
    for input in &config.inputs {
        let devices = input
            .device_set()
            .with_context(|| format!("Invalid devices for input {:?}", input.name))?;
        let mut source = NullStreamIn::new(input.stream_config());
        if let Some(hz) = input.tone_hz {
            source = source.with_tone(hz);
        }
        let io = flinger
            .open_input(Box::new(source), devices)
            .with_context(|| format!("Failed to open input {:?}", input.name))?;
        inputs.push(OpenedInput { io, devices });
    }

    let mut engine = build_engine(config, &outputs, &inputs)?;
    play(&flinger, &mut engine, config, &outputs, &inputs)?;

    log_statistics(&flinger, &outputs);
    for event in io_events.try_iter() {
        log::debug!("flingerd: io event {:?} on {}", event.kind, event.desc.io.0);
    }

    flinger.shutdown();
    drop(keep_alive);
    log::info!("flingerd: done");
    Ok(())
}

/// Routing engine seeded with what was opened and the configured overrides
fn build_engine(config: &ServerConfig, outputs: &[OpenedOutput], inputs: &[OpenedInput]) -> Result<Engine> {
    let mut engine = Engine::new();

    let mut available = OutputDevices::empty();
    for output in outputs {
        let mut desc = OutputDescriptor::new(output.io, output.devices).routed_to(output.devices);
        if output.primary {
            desc = desc.primary();
        }
        engine.outputs_mut().add(desc);
        available |= output.devices;
    }
    engine.set_available_output_devices(available);
    engine.set_available_input_devices(inputs.iter().fold(InputDevices::empty(), |acc, i| acc | i.devices));

    let routing = &config.routing;
    engine.set_default_output_device(config::output_device(&routing.default_output_device)?);
    for setting in &routing.force_use {
        engine
            .set_force_use(setting.usage, setting.config)
            .with_context(|| format!("Invalid forced use {:?}", setting))?;
    }
    engine
        .set_phone_state(routing.phone_state)
        .context("Invalid phone state")?;
    Ok(engine)
}

/// Play the tone on the output the engine picks and capture alongside
fn play(
    flinger: &AudioFlinger,
    engine: &mut Engine,
    config: &ServerConfig,
    outputs: &[OpenedOutput],
    inputs: &[OpenedInput],
) -> Result<()> {
    let tone = &config.tone;
    let stream = tone.stream_type;
    let strategy = engine.strategy_for_stream(stream);
    let device = engine.device_for_strategy(strategy);

    let mixers = || outputs.iter().filter(|o| o.mode == OutputMode::Mixer);
    let target = mixers()
        .find(|o| o.devices.intersects(device))
        .or_else(|| mixers().next())
        .ok_or_else(|| anyhow!("no mixer output to play the tone on"))?;

    let volume = engine.stream_volume(stream, tone.volume_index, device);
    log::info!(
        "flingerd: {:?} routes as {:?} to {:?}, playing on {:?} at index {} (gain {:.3})",
        stream,
        strategy,
        device,
        target.name,
        tone.volume_index,
        volume
    );
    flinger.set_stream_volume(stream, volume, target.io)?;

    let params = TrackParams::new(
        stream,
        tone.sample_rate,
        AudioFormat::Pcm16,
        ChannelMask::out_mask_from_count(tone.channels),
    );
    let mut track = flinger.create_track(target.io, params)?;
    let mut generator = ToneGenerator::new(tone.frequency_hz, tone.sample_rate, tone.channels as usize, tone.amplitude);

    let mut capture = match inputs.first() {
        Some(input) => Some(start_capture(flinger, engine, config, input)?),
        None => None,
    };

    track.start()?;
    engine.outputs_mut().start_stream(target.io, stream)?;

    let deadline = Instant::now() + Duration::from_secs(config.run_seconds);
    let mut pcm = Vec::new();
    let mut underruns = 0u32;
    while Instant::now() < deadline {
        let frames = track.frames_available().min(TONE_CHUNK_FRAMES);
        if frames > 0 {
            generator.render(AudioFormat::Pcm16, frames, &mut pcm);
            track.write(&pcm);
        }
        if let Some(capture) = capture.as_mut() {
            capture.poll()?;
        }
        for event in track.events().try_iter() {
            match event {
                TrackEvent::Underrun => underruns += 1,
                other => log::info!("flingerd: tone track event {:?}", other),
            }
        }
        if frames == 0 {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    track.stop();
    engine.outputs_mut().stop_stream(target.io, stream, Instant::now())?;
    let drain_deadline = Instant::now() + DRAIN_TIMEOUT;
    loop {
        let remaining = drain_deadline.saturating_duration_since(Instant::now());
        match track.events().recv_timeout(remaining) {
            Ok(TrackEvent::StreamEnd) => {
                log::info!("flingerd: tone fully presented");
                break;
            }
            Ok(TrackEvent::Underrun) => underruns += 1,
            Ok(other) => log::info!("flingerd: tone track event {:?} after stop", other),
            Err(_) => {
                log::warn!("flingerd: tone did not drain within {:?}", DRAIN_TIMEOUT);
                break;
            }
        }
    }
    log::info!(
        "flingerd: tone consumed {} frames, {} underrun events, {} underrun frames",
        track.server_position(),
        underruns,
        track.track().cblk().underrun_frames()
    );

    if let Some(capture) = capture {
        capture.finish()?;
    }
    Ok(())
}

/// Record track on an input, optionally written to WAV
struct Capture {
    handle: RecordHandle,
    file: Option<CaptureFile>,
    buf: Vec<u8>,
    frame_size: usize,
    frames: u64,
}

fn start_capture(flinger: &AudioFlinger, engine: &Engine, config: &ServerConfig, input: &OpenedInput) -> Result<Capture> {
    let source_device = engine.device_for_input_source(AudioSource::Mic);
    let input_config = config
        .inputs
        .first()
        .ok_or_else(|| anyhow!("no input configured"))?;
    let stream_config = input_config.stream_config();
    log::info!(
        "flingerd: capturing input {} (mic source routes to {:?})",
        input.io.0,
        source_device
    );

    let params = RecordParams::new(stream_config.sample_rate, stream_config.format, stream_config.channel_mask);
    let handle = flinger.open_record(input.io, params)?;
    flinger.start_record(&handle, None)?;

    let file = match &input_config.capture_path {
        Some(path) => Some(CaptureFile::create(path, stream_config)?),
        None => None,
    };
    let frame_size = stream_config.frame_size();
    Ok(Capture {
        handle,
        file,
        buf: vec![0; frame_size * stream_config.frame_count.max(1) * 4],
        frame_size,
        frames: 0,
    })
}

impl Capture {
    fn poll(&mut self) -> Result<()> {
        loop {
            let frames = self.handle.read(&mut self.buf);
            if frames == 0 {
                return Ok(());
            }
            self.frames += frames as u64;
            if let Some(file) = self.file.as_mut() {
                file.append(&self.buf[..frames * self.frame_size])?;
            }
        }
    }

    fn finish(self) -> Result<()> {
        self.handle.stop();
        for event in self.handle.events().try_iter() {
            log::info!("flingerd: capture event {:?}", event);
        }
        log::info!("flingerd: captured {} frames", self.frames);
        if let Some(file) = self.file {
            file.finish()?;
        }
        Ok(())
    }
}

fn log_statistics(flinger: &AudioFlinger, outputs: &[OpenedOutput]) {
    for output in outputs {
        if let Some(thread) = flinger.playback_thread(output.io) {
            log::info!(
                "flingerd: output {:?} ({}) wrote {} frames, latency {} ms",
                output.name,
                output.io.0,
                thread.frames_written(),
                thread.latency_ms()
            );
        }
    }
    for line in flinger.dump().lines() {
        log::info!("{}", line);
    }
}
