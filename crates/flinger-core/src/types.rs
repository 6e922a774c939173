//! Core types shared across the engine
//!
//! Handles, sample formats, channel masks and stream types. Numeric codes
//! follow the values used on the HAL and parameter-string boundaries so a
//! `format=1` or `channels=3` key/value pair means the same thing everywhere.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────
// Handles
// ─────────────────────────────────────────────────────────────

/// Identifies an open input or output stream (and the thread serving it)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IoHandle(pub u32);

impl IoHandle {
    /// Placeholder for "no stream"
    pub const NONE: IoHandle = IoHandle(0);
}

/// Audio session; tracks and effect chains sharing a session are processed together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl SessionId {
    /// Effects attached to the final output mix of a thread
    pub const OUTPUT_MIX: SessionId = SessionId(0);
}

/// Client user id, used for wake-lock attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid(pub u32);

/// Track name, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u32);

/// Audio patch handle returned by `create_audio_patch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchHandle(pub u32);

// ─────────────────────────────────────────────────────────────
// Sample formats
// ─────────────────────────────────────────────────────────────

/// Sample format of a buffer or stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioFormat {
    /// Signed 16-bit little endian
    Pcm16,
    /// Signed 32-bit container with 8.24 fixed point
    Pcm8_24,
    /// Signed 32-bit little endian
    Pcm32,
    /// 32-bit float in [-1.0, 1.0]
    PcmFloat,
    /// MPEG-1 layer III
    Mp3,
    /// Advanced Audio Coding
    Aac,
    /// Dolby Digital
    Ac3,
}

impl AudioFormat {
    /// Wire code used in parameter strings
    pub fn code(self) -> u32 {
        match self {
            AudioFormat::Pcm16 => 0x1,
            AudioFormat::Pcm32 => 0x3,
            AudioFormat::Pcm8_24 => 0x4,
            AudioFormat::PcmFloat => 0x5,
            AudioFormat::Mp3 => 0x0100_0000,
            AudioFormat::Aac => 0x0400_0000,
            AudioFormat::Ac3 => 0x0900_0000,
        }
    }

    /// Parse a wire code
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x1 => Some(AudioFormat::Pcm16),
            0x3 => Some(AudioFormat::Pcm32),
            0x4 => Some(AudioFormat::Pcm8_24),
            0x5 => Some(AudioFormat::PcmFloat),
            0x0100_0000 => Some(AudioFormat::Mp3),
            0x0400_0000 => Some(AudioFormat::Aac),
            0x0900_0000 => Some(AudioFormat::Ac3),
            _ => None,
        }
    }

    /// Whether samples are uncompressed linear PCM
    #[inline]
    pub fn is_linear_pcm(self) -> bool {
        matches!(
            self,
            AudioFormat::Pcm16 | AudioFormat::Pcm8_24 | AudioFormat::Pcm32 | AudioFormat::PcmFloat
        )
    }

    /// Bytes per sample; compressed formats are treated as byte streams
    #[inline]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            AudioFormat::Pcm16 => 2,
            AudioFormat::Pcm8_24 | AudioFormat::Pcm32 | AudioFormat::PcmFloat => 4,
            AudioFormat::Mp3 | AudioFormat::Aac | AudioFormat::Ac3 => 1,
        }
    }
}

// ─────────────────────────────────────────────────────────────
// Channel masks
// ─────────────────────────────────────────────────────────────

/// Maximum channel count the mixer accepts on a track or sink
pub const MAX_CHANNEL_COUNT: u32 = 8;

/// Positional channel mask; the channel count is the number of bits set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelMask(pub u32);

impl ChannelMask {
    pub const NONE: ChannelMask = ChannelMask(0);
    pub const OUT_MONO: ChannelMask = ChannelMask(0x1);
    pub const OUT_STEREO: ChannelMask = ChannelMask(0x3);
    pub const OUT_QUAD: ChannelMask = ChannelMask(0x33);
    pub const OUT_5POINT1: ChannelMask = ChannelMask(0x3F);
    pub const OUT_7POINT1: ChannelMask = ChannelMask(0x63F);
    pub const IN_MONO: ChannelMask = ChannelMask(0x10);
    pub const IN_STEREO: ChannelMask = ChannelMask(0x0C);

    /// Number of channels in the mask
    #[inline]
    pub fn channel_count(self) -> u32 {
        self.0.count_ones()
    }

    /// A mask is usable when it has between 1 and [`MAX_CHANNEL_COUNT`] channels
    #[inline]
    pub fn is_valid(self) -> bool {
        (1..=MAX_CHANNEL_COUNT).contains(&self.channel_count())
    }

    /// Default output mask for a channel count
    pub fn out_mask_from_count(count: u32) -> ChannelMask {
        match count {
            1 => ChannelMask::OUT_MONO,
            2 => ChannelMask::OUT_STEREO,
            4 => ChannelMask::OUT_QUAD,
            6 => ChannelMask::OUT_5POINT1,
            8 => ChannelMask::OUT_7POINT1,
            n if n < 32 => ChannelMask((1u32 << n) - 1),
            _ => ChannelMask::NONE,
        }
    }
}

/// Size in bytes of one frame (one sample per channel)
#[inline]
pub fn frame_size(format: AudioFormat, channels: ChannelMask) -> usize {
    if format.is_linear_pcm() {
        format.bytes_per_sample() * channels.channel_count() as usize
    } else {
        1
    }
}

// ─────────────────────────────────────────────────────────────
// Stream types
// ─────────────────────────────────────────────────────────────

/// Legacy stream type of a playback track; selects per-stream volume and routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamType {
    VoiceCall,
    System,
    Ring,
    Music,
    Alarm,
    Notification,
    BluetoothSco,
    EnforcedAudible,
    Dtmf,
    Tts,
    Accessibility,
    Rerouting,
    Patch,
}

impl StreamType {
    /// Number of stream types
    pub const COUNT: usize = 13;

    /// All stream types in index order
    pub const ALL: [StreamType; StreamType::COUNT] = [
        StreamType::VoiceCall,
        StreamType::System,
        StreamType::Ring,
        StreamType::Music,
        StreamType::Alarm,
        StreamType::Notification,
        StreamType::BluetoothSco,
        StreamType::EnforcedAudible,
        StreamType::Dtmf,
        StreamType::Tts,
        StreamType::Accessibility,
        StreamType::Rerouting,
        StreamType::Patch,
    ];

    /// Position in per-stream tables
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Parse a numeric stream type (as sent in parameter strings)
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

// ─────────────────────────────────────────────────────────────
// Stream flags
// ─────────────────────────────────────────────────────────────

bitflags! {
    /// Flags requested when opening an output or creating a playback track
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OutputFlags: u32 {
        const DIRECT = 0x1;
        const PRIMARY = 0x2;
        const FAST = 0x4;
        const DEEP_BUFFER = 0x8;
        const COMPRESS_OFFLOAD = 0x10;
        const NON_BLOCKING = 0x20;
        const HW_AV_SYNC = 0x40;
    }
}

bitflags! {
    /// Flags requested when opening an input or creating a record track
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InputFlags: u32 {
        const FAST = 0x1;
        const HW_HOTWORD = 0x2;
        const RAW = 0x4;
    }
}

/// Stream configuration negotiated with a HAL stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub format: AudioFormat,
    pub channel_mask: ChannelMask,
    /// HAL buffer size in frames
    pub frame_count: usize,
}

impl StreamConfig {
    /// Bytes per frame for this configuration
    #[inline]
    pub fn frame_size(&self) -> usize {
        frame_size(self.format, self.channel_mask)
    }

    /// Channel count for this configuration
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channel_mask.channel_count() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        assert_eq!(frame_size(AudioFormat::Pcm16, ChannelMask::OUT_STEREO), 4);
        assert_eq!(frame_size(AudioFormat::PcmFloat, ChannelMask::OUT_5POINT1), 24);
        assert_eq!(frame_size(AudioFormat::Mp3, ChannelMask::OUT_STEREO), 1);
    }

    #[test]
    fn test_format_codes() {
        for fmt in [AudioFormat::Pcm16, AudioFormat::PcmFloat, AudioFormat::Aac] {
            assert_eq!(AudioFormat::from_code(fmt.code()), Some(fmt));
        }
        assert_eq!(AudioFormat::from_code(0xdead), None);
    }

    #[test]
    fn test_channel_mask_validity() {
        assert!(ChannelMask::OUT_7POINT1.is_valid());
        assert!(!ChannelMask::NONE.is_valid());
        assert_eq!(ChannelMask::IN_STEREO.channel_count(), 2);
        assert_eq!(ChannelMask::out_mask_from_count(2), ChannelMask::OUT_STEREO);
    }

    #[test]
    fn test_stream_type_index() {
        for (i, st) in StreamType::ALL.iter().enumerate() {
            assert_eq!(st.index(), i);
            assert_eq!(StreamType::from_index(i), Some(*st));
        }
    }
}
