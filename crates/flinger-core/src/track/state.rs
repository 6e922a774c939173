//! Track lifecycle states
//!
//! ```text
//!  IDLE ──start──▶ ACTIVE ──pause──▶ PAUSING ──(worker)──▶ PAUSED
//!                    ▲  │                                      │
//!                    │  └──stop──▶ STOPPED ──flush──▶ FLUSHED   start
//!                    │          (fast/offload/direct:           │
//!                    │           STOPPING_1 ─▶ STOPPING_2 ─▶ STOPPED)
//!                    └────────(worker)────── RESUMING ◀─────────┘
//! ```
//!
//! Client calls move a track between the "requested" states; the owning
//! worker moves it through the transient ones (PAUSING, RESUMING,
//! STOPPING_1/2) at cycle boundaries.

use std::sync::atomic::{AtomicU8, Ordering};

/// State of a playback or record track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TrackState {
    Idle = 0,
    Flushed = 1,
    Stopped = 2,
    /// Waiting for the track's buffer to run dry
    Stopping1 = 3,
    /// Waiting for the sink to present the last frames
    Stopping2 = 4,
    Resuming = 5,
    Active = 6,
    Pausing = 7,
    Paused = 8,
}

impl TrackState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TrackState::Flushed,
            2 => TrackState::Stopped,
            3 => TrackState::Stopping1,
            4 => TrackState::Stopping2,
            5 => TrackState::Resuming,
            6 => TrackState::Active,
            7 => TrackState::Pausing,
            8 => TrackState::Paused,
            _ => TrackState::Idle,
        }
    }

    /// STOPPED and FLUSHED both mean "inactive, may restart"
    #[inline]
    pub fn is_stopped(self) -> bool {
        matches!(self, TrackState::Stopped | TrackState::Flushed)
    }

    #[inline]
    pub fn is_stopping(self) -> bool {
        matches!(self, TrackState::Stopping1 | TrackState::Stopping2)
    }

    /// The client has asked for audio to flow
    #[inline]
    pub fn is_playing(self) -> bool {
        matches!(self, TrackState::Active | TrackState::Resuming)
    }

    pub fn name(self) -> &'static str {
        match self {
            TrackState::Idle => "IDLE",
            TrackState::Flushed => "FLUSHED",
            TrackState::Stopped => "STOPPED",
            TrackState::Stopping1 => "STOPPING_1",
            TrackState::Stopping2 => "STOPPING_2",
            TrackState::Resuming => "RESUMING",
            TrackState::Active => "ACTIVE",
            TrackState::Pausing => "PAUSING",
            TrackState::Paused => "PAUSED",
        }
    }
}

/// Lock-free holder for a [`TrackState`]
///
/// Writes happen under the owning thread's lock; the atomic only makes the
/// current value readable from client threads without taking it.
#[derive(Debug)]
pub struct AtomicTrackState(AtomicU8);

impl AtomicTrackState {
    pub fn new(state: TrackState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[inline]
    pub fn load(&self) -> TrackState {
        TrackState::from_u8(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, state: TrackState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }
}
