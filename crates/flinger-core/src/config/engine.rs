//! Worker-thread tuning knobs

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing, retry and sizing parameters for playback and record threads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Idle time with no active track before the HAL stream enters standby
    pub standby_delay_ms: u64,
    /// Empty cycles tolerated for an active mixer track before it is disabled
    pub max_track_retries: u32,
    /// Same as `max_track_retries`, for a track that has never delivered data
    pub max_track_startup_retries: u32,
    /// Empty cycles tolerated for an offloaded or direct track
    pub max_track_retries_offload: u32,
    /// Retries granted to an offloaded track that has been asked to stop
    pub max_track_stop_retries_offload: u32,
    /// Default frame count for software sinks that do not report one
    pub mixer_frame_count: usize,
    /// Number of low-latency fast track slots on a mixer thread (slot 0 is reserved)
    pub fast_track_slots: usize,
    /// Length of the linear volume ramp applied on start, stop and pause
    pub ramp_frames: usize,
    /// Whether worker threads take a wake lock while tracks are active
    pub wake_lock_enabled: bool,
}

impl EngineConfig {
    #[inline]
    pub fn standby_delay(&self) -> Duration {
        Duration::from_millis(self.standby_delay_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            standby_delay_ms: 3000,
            max_track_retries: 50,
            max_track_startup_retries: 50,
            max_track_retries_offload: 20,
            max_track_stop_retries_offload: 4,
            mixer_frame_count: 960,
            fast_track_slots: 8,
            ramp_frames: 64,
            wake_lock_enabled: true,
        }
    }
}
