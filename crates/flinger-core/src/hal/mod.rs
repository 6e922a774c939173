//! Hardware stream interfaces
//!
//! A playback thread owns exactly one [`StreamOut`] and a record thread one
//! [`StreamIn`]; nothing else touches them. Software implementations live in
//! [`null`]; real devices are adapted by the server binary.

pub mod null;
#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use crate::error::{FlingerError, FlingerResult};
use crate::types::StreamConfig;

pub use null::{NullStreamIn, NullStreamOut};

/// Completion notifications from a non-blocking output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// The stream can accept more data after a partial write
    WriteReady,
    /// A requested drain has finished
    DrainReady,
    /// The stream hit an unrecoverable error
    Error,
}

/// How much of the pipeline a drain waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainKind {
    /// Everything queued so far has been rendered
    All,
    /// Notify shortly before the end so the next track can be queued gaplessly
    EarlyNotify,
}

/// Callback handed to a non-blocking stream; may be invoked from any thread
pub type StreamCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// An output stream (speaker, headset, offload DSP, ...)
pub trait StreamOut: Send {
    /// Current stream configuration; re-read after a successful reconfiguration
    fn config(&self) -> StreamConfig;

    /// Pipeline latency in milliseconds
    fn latency_ms(&self) -> u32;

    /// Write raw frames; returns bytes accepted
    ///
    /// A blocking stream accepts everything. A stream with a callback set
    /// may accept less and fire [`StreamEvent::WriteReady`] later.
    fn write(&mut self, data: &[u8]) -> FlingerResult<usize>;

    /// Release hardware resources until the next write
    fn standby(&mut self) -> FlingerResult<()>;

    fn set_parameters(&mut self, kv: &str) -> FlingerResult<()>;

    fn get_parameters(&self, keys: &str) -> String;

    /// Frames rendered by the hardware since the stream left standby
    fn render_position(&self) -> FlingerResult<u64>;

    /// Hardware volume; streams without one report `InvalidOperation`
    fn set_volume(&mut self, _left: f32, _right: f32) -> FlingerResult<()> {
        Err(FlingerError::invalid_operation("stream has no hardware volume"))
    }

    /// Switch the stream to non-blocking mode; returns false if unsupported
    fn set_callback(&mut self, _callback: StreamCallback) -> bool {
        false
    }

    fn supports_drain(&self) -> bool {
        false
    }

    fn drain(&mut self, _kind: DrainKind) -> FlingerResult<()> {
        Err(FlingerError::invalid_operation("stream cannot drain"))
    }

    fn supports_pause(&self) -> bool {
        false
    }

    fn pause(&mut self) -> FlingerResult<()> {
        Err(FlingerError::invalid_operation("stream cannot pause"))
    }

    fn resume(&mut self) -> FlingerResult<()> {
        Err(FlingerError::invalid_operation("stream cannot resume"))
    }

    fn flush(&mut self) -> FlingerResult<()> {
        Err(FlingerError::invalid_operation("stream cannot flush"))
    }
}

/// An input stream (microphone, line in, ...)
pub trait StreamIn: Send {
    fn config(&self) -> StreamConfig;

    /// Read raw frames; blocks until `buf` is full or the stream fails
    fn read(&mut self, buf: &mut [u8]) -> FlingerResult<usize>;

    fn standby(&mut self) -> FlingerResult<()>;

    fn set_parameters(&mut self, kv: &str) -> FlingerResult<()>;

    fn get_parameters(&self, keys: &str) -> String;

    /// Frames dropped by the hardware since the last call
    fn input_frames_lost(&mut self) -> u32 {
        0
    }
}

/// Apply `sampling_rate`/`format`/`channels`/`frame_count` keys to a stream config
///
/// Returns `BadValue` for values the software streams cannot represent.
pub(crate) fn apply_config_keys(
    config: &mut StreamConfig,
    param: &crate::params::AudioParameter,
) -> FlingerResult<bool> {
    use crate::params::{KEY_CHANNELS, KEY_FORMAT, KEY_FRAME_COUNT, KEY_SAMPLING_RATE};
    use crate::types::{AudioFormat, ChannelMask};

    let mut next = *config;
    if let Some(rate) = param.get_int(KEY_SAMPLING_RATE)? {
        if rate <= 0 || rate > 384_000 {
            return Err(FlingerError::bad_value(format!("sampling_rate={}", rate)));
        }
        next.sample_rate = rate as u32;
    }
    if let Some(code) = param.get_int(KEY_FORMAT)? {
        next.format = u32::try_from(code)
            .ok()
            .and_then(AudioFormat::from_code)
            .ok_or_else(|| FlingerError::bad_value(format!("format={}", code)))?;
    }
    if let Some(mask) = param.get_int(KEY_CHANNELS)? {
        let mask = ChannelMask(u32::try_from(mask).map_err(|_| FlingerError::bad_value("channels"))?);
        if !mask.is_valid() {
            return Err(FlingerError::bad_value(format!("channels={:#x}", mask.0)));
        }
        next.channel_mask = mask;
    }
    if let Some(frames) = param.get_int(KEY_FRAME_COUNT)? {
        if frames <= 0 {
            return Err(FlingerError::bad_value(format!("frame_count={}", frames)));
        }
        next.frame_count = frames as usize;
    }
    let changed = next != *config;
    *config = next;
    Ok(changed)
}
