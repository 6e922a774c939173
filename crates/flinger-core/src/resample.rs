//! Sample rate conversion for tracks whose rate differs from their thread
//!
//! [`StreamResampler`] wraps a rubato `SincFixedOut` and adds an input
//! accumulator so callers can push whatever frames they have and pull exactly
//! the number of output frames a mix cycle needs. Input arrives interleaved
//! and is split per channel internally.

use rubato::{
    Resampler, SincFixedOut, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::error::{FlingerError, FlingerResult};

/// Highest ratio of track rate to thread rate the mixer accepts
pub const MAX_RESAMPLE_RATIO: u32 = 256;

const SINC_LEN: usize = 64;
const OVERSAMPLING_FACTOR: usize = 128;
/// Allowed drift of the ratio after construction (playback rate changes)
const MAX_RELATIVE_RATIO: f64 = 2.0;

fn sinc_params() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: SINC_LEN,
        f_cutoff: rubato::calculate_cutoff(SINC_LEN, WindowFunction::BlackmanHarris2),
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: OVERSAMPLING_FACTOR,
        window: WindowFunction::BlackmanHarris2,
    }
}

/// Pull-driven resampler with an input accumulator
pub struct StreamResampler {
    inner: SincFixedOut<f32>,
    channels: usize,
    in_rate: u32,
    out_rate: u32,
    /// Pending input, one vector per channel
    accum: Vec<Vec<f32>>,
    /// Last resampler output, one vector per channel
    out: Vec<Vec<f32>>,
    out_len: usize,
    out_pos: usize,
}

impl StreamResampler {
    /// `chunk_frames` is the number of output frames produced per resampler pass
    pub fn new(in_rate: u32, out_rate: u32, channels: usize, chunk_frames: usize) -> FlingerResult<Self> {
        if in_rate == 0 || out_rate == 0 || channels == 0 || chunk_frames == 0 {
            return Err(FlingerError::bad_value(format!(
                "resampler {}Hz -> {}Hz, {} channels, chunk {}",
                in_rate, out_rate, channels, chunk_frames
            )));
        }
        let ratio = out_rate as f64 / in_rate as f64;
        let inner = SincFixedOut::<f32>::new(ratio, MAX_RELATIVE_RATIO, sinc_params(), chunk_frames, channels)?;
        let out = inner.output_buffer_allocate(true);
        Ok(Self {
            inner,
            channels,
            in_rate,
            out_rate,
            accum: vec![Vec::new(); channels],
            out,
            out_len: 0,
            out_pos: 0,
        })
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn input_rate(&self) -> u32 {
        self.in_rate
    }

    /// Change the input rate in place, if within the drift the resampler was built for
    pub fn set_input_rate(&mut self, in_rate: u32) -> FlingerResult<()> {
        if in_rate == self.in_rate {
            return Ok(());
        }
        if in_rate == 0 {
            return Err(FlingerError::bad_value("input rate 0"));
        }
        let ratio = self.out_rate as f64 / in_rate as f64;
        self.inner
            .set_resample_ratio(ratio, true)
            .map_err(|e| FlingerError::bad_value(format!("resample ratio {}: {}", ratio, e)))?;
        self.in_rate = in_rate;
        Ok(())
    }

    /// Input frames still missing before the next resampler pass can run
    pub fn input_frames_needed(&self) -> usize {
        self.inner
            .input_frames_next()
            .saturating_sub(self.accum.first().map_or(0, Vec::len))
    }

    /// Append interleaved input frames
    pub fn push_interleaved(&mut self, samples: &[f32]) {
        for frame in samples.chunks_exact(self.channels) {
            for (ch, s) in frame.iter().enumerate() {
                self.accum[ch].push(*s);
            }
        }
    }

    /// Render up to `frames` interleaved output frames into `dst`
    ///
    /// Stops early when the accumulator runs dry; returns frames rendered.
    pub fn render(&mut self, dst: &mut [f32], frames: usize) -> usize {
        let frames = frames.min(dst.len() / self.channels);
        let mut done = 0;
        while done < frames {
            if self.out_pos < self.out_len {
                let n = (frames - done).min(self.out_len - self.out_pos);
                for f in 0..n {
                    let base = (done + f) * self.channels;
                    for ch in 0..self.channels {
                        dst[base + ch] = self.out[ch][self.out_pos + f];
                    }
                }
                self.out_pos += n;
                done += n;
                continue;
            }

            let need = self.inner.input_frames_next();
            if self.accum[0].len() < need {
                break;
            }
            let mut input: Vec<Vec<f32>> = Vec::with_capacity(self.channels);
            for ch in 0..self.channels {
                let rest = self.accum[ch].split_off(need);
                input.push(std::mem::replace(&mut self.accum[ch], rest));
            }
            match self.inner.process_into_buffer(&input, &mut self.out, None) {
                Ok((_, produced)) => {
                    self.out_len = produced;
                    self.out_pos = 0;
                    if produced == 0 {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("StreamResampler: process failed: {}", e);
                    break;
                }
            }
        }
        done
    }

    /// Drop buffered input and output (after flush or a discontinuity)
    pub fn reset(&mut self) {
        self.inner.reset();
        for ch in &mut self.accum {
            ch.clear();
        }
        self.out_len = 0;
        self.out_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_zero_rate() {
        assert!(StreamResampler::new(0, 48000, 2, 256).is_err());
        assert!(StreamResampler::new(44100, 48000, 0, 256).is_err());
    }

    #[test]
    fn test_renders_requested_frames_once_fed() {
        let mut rs = StreamResampler::new(44100, 48000, 2, 256).unwrap();
        let mut out = vec![0.0f32; 512];
        assert_eq!(rs.render(&mut out, 256), 0);

        let need = rs.input_frames_needed();
        assert!(need > 0);
        rs.push_interleaved(&vec![0.25f32; need * 2]);
        assert_eq!(rs.input_frames_needed(), 0);
        assert_eq!(rs.render(&mut out, 256), 256);
    }

    #[test]
    fn test_partial_render_keeps_remainder() {
        let mut rs = StreamResampler::new(32000, 48000, 1, 128).unwrap();
        let need = rs.input_frames_needed();
        rs.push_interleaved(&vec![0.0f32; need]);
        let mut out = vec![0.0f32; 128];
        assert_eq!(rs.render(&mut out, 100), 100);
        assert_eq!(rs.render(&mut out, 100), 28);
    }

    #[test]
    fn test_reset_clears_accumulator() {
        let mut rs = StreamResampler::new(22050, 48000, 1, 64).unwrap();
        rs.push_interleaved(&[0.1; 10]);
        rs.reset();
        assert_eq!(rs.input_frames_needed(), rs.inner.input_frames_next());
    }
}
