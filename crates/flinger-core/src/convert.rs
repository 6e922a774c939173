//! PCM sample format and channel conversion
//!
//! The mixer works in interleaved `f32`. Track and sink buffers arrive as raw
//! bytes in any linear PCM format; these helpers move between the two.
//! Samples are in host byte order (little endian on every supported target).
//! Buffers coming out of a ring are not guaranteed to be aligned, so every
//! cast has an unaligned fallback.

use bytemuck::Pod;

use crate::types::AudioFormat;

const Q_15: f32 = 32768.0;
const Q_8_24: f32 = 16_777_216.0;
const Q_31: f32 = 2_147_483_648.0;

fn read_samples<T: Pod>(src: &[u8], dst: &mut [f32], convert: impl Fn(T) -> f32) -> usize {
    let size = std::mem::size_of::<T>();
    let n = (src.len() / size).min(dst.len());
    let bytes = &src[..n * size];
    match bytemuck::try_cast_slice::<u8, T>(bytes) {
        Ok(samples) => {
            for (d, s) in dst.iter_mut().zip(samples) {
                *d = convert(*s);
            }
        }
        Err(_) => {
            for (d, chunk) in dst.iter_mut().zip(bytes.chunks_exact(size)) {
                *d = convert(bytemuck::pod_read_unaligned(chunk));
            }
        }
    }
    n
}

fn write_samples<T: Pod>(src: &[f32], dst: &mut [u8], convert: impl Fn(f32) -> T) -> usize {
    let size = std::mem::size_of::<T>();
    let n = (dst.len() / size).min(src.len());
    let bytes = &mut dst[..n * size];
    match bytemuck::try_cast_slice_mut::<u8, T>(bytes) {
        Ok(samples) => {
            for (d, s) in samples.iter_mut().zip(src) {
                *d = convert(*s);
            }
        }
        Err(_) => {
            for (chunk, s) in bytes.chunks_exact_mut(size).zip(src) {
                chunk.copy_from_slice(bytemuck::bytes_of(&convert(*s)));
            }
        }
    }
    n
}

/// Decode `src` (raw PCM in `format`) into float samples; returns samples decoded
///
/// Compressed formats decode nothing.
pub fn pcm_to_float(format: AudioFormat, src: &[u8], dst: &mut [f32]) -> usize {
    match format {
        AudioFormat::Pcm16 => read_samples::<i16>(src, dst, |s| s as f32 / Q_15),
        AudioFormat::Pcm8_24 => read_samples::<i32>(src, dst, |s| s as f32 / Q_8_24),
        AudioFormat::Pcm32 => read_samples::<i32>(src, dst, |s| s as f32 / Q_31),
        AudioFormat::PcmFloat => read_samples::<f32>(src, dst, |s| s),
        AudioFormat::Mp3 | AudioFormat::Aac | AudioFormat::Ac3 => 0,
    }
}

/// Encode float samples into `dst` as `format`; returns samples encoded
///
/// Integer formats saturate; float output is passed through unclamped.
pub fn float_to_pcm(format: AudioFormat, src: &[f32], dst: &mut [u8]) -> usize {
    match format {
        AudioFormat::Pcm16 => write_samples::<i16>(src, dst, |s| (s * Q_15).round() as i16),
        AudioFormat::Pcm8_24 => write_samples::<i32>(src, dst, |s| (s * Q_8_24).round() as i32),
        AudioFormat::Pcm32 => write_samples::<i32>(src, dst, |s| (s * Q_31) as i32),
        AudioFormat::PcmFloat => write_samples::<f32>(src, dst, |s| s),
        AudioFormat::Mp3 | AudioFormat::Aac | AudioFormat::Ac3 => 0,
    }
}

/// Remap `frames` interleaved frames from `src_channels` to `dst_channels`
///
/// Mono is duplicated into every output channel; anything downmixed to mono
/// is averaged; otherwise shared channels are copied and extra output
/// channels are silenced.
pub fn adjust_channels(src: &[f32], src_channels: usize, dst: &mut [f32], dst_channels: usize, frames: usize) {
    let frames = frames
        .min(src.len() / src_channels.max(1))
        .min(dst.len() / dst_channels.max(1));
    if src_channels == dst_channels {
        let n = frames * src_channels;
        dst[..n].copy_from_slice(&src[..n]);
        return;
    }
    for f in 0..frames {
        let input = &src[f * src_channels..(f + 1) * src_channels];
        let output = &mut dst[f * dst_channels..(f + 1) * dst_channels];
        if src_channels == 1 {
            output.fill(input[0]);
        } else if dst_channels == 1 {
            output[0] = input.iter().sum::<f32>() / src_channels as f32;
        } else {
            let shared = src_channels.min(dst_channels);
            output[..shared].copy_from_slice(&input[..shared]);
            output[shared..].fill(0.0);
        }
    }
}

/// Add `src` into `dst` sample by sample
#[inline]
pub fn accumulate(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += *s;
    }
}
