//! Worker threads: one per open stream
//!
//! Each thread is split in two. The shared half ([`PlaybackThread`],
//! [`RecordThread`]) is what clients and the facade hold: it owns the lock,
//! the track lists and the config-event queue. The worker half
//! ([`PlaybackWorker`], [`RecordWorker`]) owns the HAL stream and runs on
//! its own OS thread, or is stepped by hand with `run_cycle`.

pub mod async_callback;
pub mod base;
pub mod config_event;
pub mod playback;
pub mod record;

pub use async_callback::{AsyncCallbackTarget, AsyncCallbackThread};
pub use base::{ThreadBase, ThreadContext, ThreadState, ThreadType};
pub use config_event::{
    AudioPatch, ConfigEventKind, ConfigReply, IoConfigEvent, IoDescriptor, IoEventKind, IoNotifier, PatchEndpoint,
    SchedulingPolicy,
};
pub use playback::{
    Cycle, MixerState, OutputKind, OutputTrack, PlaybackThread, PlaybackWorker, TrackParams, MAX_OVERFLOW_BUFFERS,
};
pub use record::{RecordParams, RecordThread, RecordWorker};
