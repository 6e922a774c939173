//! Flinger Core - audio server engine
//!
//! Per-output playback threads and per-input record threads, the client
//! track family feeding them, and the [`AudioFlinger`] facade that opens
//! streams and hands tracks to clients.

pub mod buffer;
pub mod config;
pub mod convert;
pub mod devices;
pub mod effects;
pub mod error;
pub mod flinger;
pub mod hal;
pub mod ids;
pub mod params;
pub mod resample;
pub mod sync_event;
pub mod thread;
pub mod track;
pub mod types;
pub mod wake_lock;

pub use error::{FlingerError, FlingerResult};
pub use flinger::AudioFlinger;
pub use types::*;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Take a mutex, recovering the guard if a holder panicked
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
