//! Sine tone source for the playback demo

use std::f32::consts::TAU;

use flinger_core::convert::float_to_pcm;
use flinger_core::types::AudioFormat;

/// Interleaved sine generator with a continuous phase across calls
pub struct ToneGenerator {
    phase: f32,
    step: f32,
    amplitude: f32,
    channels: usize,
    scratch: Vec<f32>,
}

impl ToneGenerator {
    pub fn new(frequency_hz: f32, sample_rate: u32, channels: usize, amplitude: f32) -> Self {
        Self {
            phase: 0.0,
            step: TAU * frequency_hz / sample_rate.max(1) as f32,
            amplitude: amplitude.clamp(0.0, 1.0),
            channels: channels.max(1),
            scratch: Vec::new(),
        }
    }

    /// Fill whole frames of `out`
    pub fn fill(&mut self, out: &mut [f32]) {
        for frame in out.chunks_exact_mut(self.channels) {
            frame.fill(self.amplitude * self.phase.sin());
            self.phase = (self.phase + self.step) % TAU;
        }
    }

    /// Render `frames` frames encoded as `format` into `out`; returns bytes written
    pub fn render(&mut self, format: AudioFormat, frames: usize, out: &mut Vec<u8>) -> usize {
        let mut samples = std::mem::take(&mut self.scratch);
        samples.resize(frames * self.channels, 0.0);
        self.fill(&mut samples);
        out.resize(samples.len() * format.bytes_per_sample(), 0);
        let encoded = float_to_pcm(format, &samples, out);
        self.scratch = samples;
        encoded * format.bytes_per_sample()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amplitude_bound_and_channels_match() {
        let mut tone = ToneGenerator::new(1000.0, 48000, 2, 0.25);
        let mut out = vec![0.0; 960];
        tone.fill(&mut out);
        assert!(out.iter().all(|s| s.abs() <= 0.25 + 1e-6));
        for frame in out.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
        }
        assert!(out.iter().any(|s| s.abs() > 0.2));
    }

    #[test]
    fn test_phase_continues_across_calls() {
        let mut split = ToneGenerator::new(440.0, 48000, 1, 1.0);
        let mut whole = ToneGenerator::new(440.0, 48000, 1, 1.0);
        let mut a = vec![0.0; 100];
        let mut b = vec![0.0; 100];
        split.fill(&mut a);
        split.fill(&mut b);
        let mut c = vec![0.0; 200];
        whole.fill(&mut c);
        a.extend_from_slice(&b);
        for (x, y) in a.iter().zip(&c) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_render_pcm16_size() {
        let mut tone = ToneGenerator::new(440.0, 44100, 2, 0.5);
        let mut out = Vec::new();
        assert_eq!(tone.render(AudioFormat::Pcm16, 256, &mut out), 256 * 2 * 2);
        assert_eq!(out.len(), 1024);
    }
}
