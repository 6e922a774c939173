//! Output activity model
//!
//! The routing engine needs to know which streams are playing, and which
//! played recently, on each open output. The policy manager bumps a
//! per-stream active count when a client starts and drops it on stop; the
//! time of the last stop is kept so "recently active" can be answered for a
//! window after playback ends.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use flinger_core::devices::{InputDevices, OutputDevices};
use flinger_core::types::{AudioFormat, IoHandle, StreamType};

use crate::error::{PolicyError, PolicyResult};

/// How long after music stops respectful sonification keeps following media
pub const SONIFICATION_RESPECTFUL_AFTER_MUSIC_DELAY: Duration = Duration::from_millis(5000);

/// Digital outputs that carry compressed passthrough
const DIGITAL_PASSTHROUGH: OutputDevices = OutputDevices::AUX_DIGITAL
    .union(OutputDevices::SPDIF)
    .union(OutputDevices::HDMI_ARC);

/// One open output as seen by policy
#[derive(Debug, Clone)]
pub struct OutputDescriptor {
    pub io: IoHandle,
    /// Devices the output's hardware module can reach
    pub supported: OutputDevices,
    /// Input devices on the same hardware module
    pub module_inputs: InputDevices,
    /// Current route
    pub device: OutputDevices,
    pub format: AudioFormat,
    pub primary: bool,
    active_count: [u32; StreamType::COUNT],
    stop_time: [Option<Instant>; StreamType::COUNT],
}

impl OutputDescriptor {
    pub fn new(io: IoHandle, supported: OutputDevices) -> Self {
        Self {
            io,
            supported,
            module_inputs: InputDevices::all(),
            device: OutputDevices::empty(),
            format: AudioFormat::Pcm16,
            primary: false,
            active_count: [0; StreamType::COUNT],
            stop_time: [None; StreamType::COUNT],
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn routed_to(mut self, device: OutputDevices) -> Self {
        self.device = device;
        self
    }

    pub fn with_format(mut self, format: AudioFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_module_inputs(mut self, inputs: InputDevices) -> Self {
        self.module_inputs = inputs;
        self
    }

    /// Playing now, or stopped less than `in_past` before `now`
    pub fn is_stream_active(&self, stream: StreamType, in_past: Duration, now: Instant) -> bool {
        let i = stream.index();
        if self.active_count[i] != 0 {
            return true;
        }
        if in_past.is_zero() {
            return false;
        }
        match self.stop_time[i] {
            Some(stopped) => now.saturating_duration_since(stopped) < in_past,
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_count.iter().any(|&count| count != 0)
    }

    pub fn active_count(&self, stream: StreamType) -> u32 {
        self.active_count[stream.index()]
    }

    /// Routed to a renderer outside the device (remote submix)
    #[inline]
    pub fn is_remote(&self) -> bool {
        self.device.contains(OutputDevices::REMOTE_SUBMIX)
    }
}

/// Every output policy knows about, keyed by handle
#[derive(Debug, Clone, Default)]
pub struct OutputCollection {
    outputs: BTreeMap<IoHandle, OutputDescriptor>,
}

impl OutputCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, desc: OutputDescriptor) {
        self.outputs.insert(desc.io, desc);
    }

    pub fn remove(&mut self, io: IoHandle) -> Option<OutputDescriptor> {
        self.outputs.remove(&io)
    }

    pub fn get(&self, io: IoHandle) -> Option<&OutputDescriptor> {
        self.outputs.get(&io)
    }

    pub fn get_mut(&mut self, io: IoHandle) -> Option<&mut OutputDescriptor> {
        self.outputs.get_mut(&io)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutputDescriptor> {
        self.outputs.values()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// A client of `stream` started on `io`
    pub fn start_stream(&mut self, io: IoHandle, stream: StreamType) -> PolicyResult<()> {
        let desc = self.lookup(io)?;
        desc.active_count[stream.index()] += 1;
        Ok(())
    }

    /// A client of `stream` stopped on `io`; the last one records the stop time
    pub fn stop_stream(&mut self, io: IoHandle, stream: StreamType, now: Instant) -> PolicyResult<()> {
        let desc = self.lookup(io)?;
        let i = stream.index();
        if desc.active_count[i] == 0 {
            log::warn!("stop_stream: {:?} not active on output {:?}", stream, io);
            return Err(PolicyError::bad_value(format!("{:?} not active on {:?}", stream, io)));
        }
        desc.active_count[i] -= 1;
        if desc.active_count[i] == 0 {
            desc.stop_time[i] = Some(now);
        }
        Ok(())
    }

    pub fn is_stream_active(&self, stream: StreamType, in_past: Duration, now: Instant) -> bool {
        self.outputs.values().any(|d| d.is_stream_active(stream, in_past, now))
    }

    /// Same as [`is_stream_active`](Self::is_stream_active), restricted to remote outputs
    pub fn is_stream_active_remotely(&self, stream: StreamType, in_past: Duration, now: Instant) -> bool {
        self.outputs
            .values()
            .any(|d| d.is_remote() && d.is_stream_active(stream, in_past, now))
    }

    /// An open output able to reach Bluetooth A2DP
    pub fn a2dp_output(&self) -> Option<IoHandle> {
        self.outputs
            .values()
            .find(|d| d.supported.intersects(OutputDevices::ALL_A2DP))
            .map(|d| d.io)
    }

    pub fn primary_output(&self) -> Option<&OutputDescriptor> {
        self.outputs.values().find(|d| d.primary)
    }

    /// Digital outputs currently playing a non-PCM format
    pub fn compressed_digital_devices(&self) -> OutputDevices {
        self.outputs
            .values()
            .filter(|d| d.is_active() && !d.format.is_linear_pcm())
            .fold(OutputDevices::empty(), |acc, d| acc | (d.device & DIGITAL_PASSTHROUGH))
    }

    fn lookup(&mut self, io: IoHandle) -> PolicyResult<&mut OutputDescriptor> {
        self.outputs
            .get_mut(&io)
            .ok_or_else(|| PolicyError::bad_value(format!("unknown output {:?}", io)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection() -> OutputCollection {
        let mut outputs = OutputCollection::new();
        outputs.add(
            OutputDescriptor::new(IoHandle(1), OutputDevices::SPEAKER | OutputDevices::WIRED_HEADSET)
                .primary()
                .routed_to(OutputDevices::SPEAKER),
        );
        outputs
    }

    #[test]
    fn test_recently_active_window() {
        let mut outputs = collection();
        let t0 = Instant::now();
        outputs.start_stream(IoHandle(1), StreamType::Music).unwrap();
        assert!(outputs.is_stream_active(StreamType::Music, Duration::ZERO, t0));

        outputs.stop_stream(IoHandle(1), StreamType::Music, t0).unwrap();
        assert!(!outputs.is_stream_active(StreamType::Music, Duration::ZERO, t0));

        let delay = SONIFICATION_RESPECTFUL_AFTER_MUSIC_DELAY;
        assert!(outputs.is_stream_active(StreamType::Music, delay, t0 + Duration::from_millis(4999)));
        assert!(!outputs.is_stream_active(StreamType::Music, delay, t0 + delay));
    }

    #[test]
    fn test_never_played_is_not_recent() {
        let outputs = collection();
        let delay = SONIFICATION_RESPECTFUL_AFTER_MUSIC_DELAY;
        assert!(!outputs.is_stream_active(StreamType::Music, delay, Instant::now()));
    }

    #[test]
    fn test_stop_without_start_refused() {
        let mut outputs = collection();
        let err = outputs
            .stop_stream(IoHandle(1), StreamType::Ring, Instant::now())
            .unwrap_err();
        assert!(matches!(err, PolicyError::BadValue(_)));
        assert!(outputs.start_stream(IoHandle(9), StreamType::Ring).is_err());
    }

    #[test]
    fn test_counts_nest() {
        let mut outputs = collection();
        let now = Instant::now();
        outputs.start_stream(IoHandle(1), StreamType::Alarm).unwrap();
        outputs.start_stream(IoHandle(1), StreamType::Alarm).unwrap();
        outputs.stop_stream(IoHandle(1), StreamType::Alarm, now).unwrap();
        assert_eq!(outputs.get(IoHandle(1)).unwrap().active_count(StreamType::Alarm), 1);
        assert!(outputs.is_stream_active(StreamType::Alarm, Duration::ZERO, now));
    }

    #[test]
    fn test_remote_and_a2dp_lookup() {
        let mut outputs = collection();
        assert_eq!(outputs.a2dp_output(), None);
        outputs.add(
            OutputDescriptor::new(IoHandle(2), OutputDevices::REMOTE_SUBMIX).routed_to(OutputDevices::REMOTE_SUBMIX),
        );
        outputs.add(OutputDescriptor::new(IoHandle(3), OutputDevices::ALL_A2DP));
        assert_eq!(outputs.a2dp_output(), Some(IoHandle(3)));
        assert_eq!(outputs.primary_output().map(|d| d.io), Some(IoHandle(1)));

        let now = Instant::now();
        outputs.start_stream(IoHandle(1), StreamType::Music).unwrap();
        assert!(!outputs.is_stream_active_remotely(StreamType::Music, Duration::ZERO, now));
        outputs.start_stream(IoHandle(2), StreamType::Music).unwrap();
        assert!(outputs.is_stream_active_remotely(StreamType::Music, Duration::ZERO, now));
    }

    #[test]
    fn test_compressed_digital_devices() {
        let mut outputs = collection();
        outputs.add(
            OutputDescriptor::new(IoHandle(4), OutputDevices::AUX_DIGITAL)
                .routed_to(OutputDevices::AUX_DIGITAL)
                .with_format(AudioFormat::Ac3),
        );
        assert!(outputs.compressed_digital_devices().is_empty());
        outputs.start_stream(IoHandle(4), StreamType::Music).unwrap();
        assert_eq!(outputs.compressed_digital_devices(), OutputDevices::AUX_DIGITAL);
    }
}
