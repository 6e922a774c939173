//! Client tracks
//!
//! A track is one client stream attached to a worker thread. The client
//! holds the producer (playback) or consumer (record) end of the track's
//! frame ring plus its [`ControlBlock`](crate::buffer::ControlBlock); the
//! worker holds the other end inside the track object.

mod base;
mod handle;
mod playback;
mod record;
mod state;

pub use base::{TrackBase, TrackEvent};
pub use handle::{RecordHandle, TrackHandle};
pub use playback::Track;
pub use record::RecordTrack;
pub use state::{AtomicTrackState, TrackState};
