//! Unique id allocation
//!
//! One allocator is created per [`AudioFlinger`](crate::AudioFlinger) and
//! shared by reference with every thread it spawns. Ids are never reused.
//! The low bits of each id encode what it was allocated for, so a stray
//! session id can never be mistaken for an io handle.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::types::{IoHandle, PatchHandle, SessionId, TrackId};

/// What a unique id is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueIdUse {
    Effect = 1,
    Patch = 2,
    Output = 3,
    Input = 4,
    Session = 5,
    Track = 6,
    Client = 7,
}

const USE_MAX: u32 = 8;

/// Monotonic id source, one counter per [`UniqueIdUse`]
#[derive(Debug)]
pub struct IdAllocator {
    next: [AtomicU32; USE_MAX as usize],
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: std::array::from_fn(|_| AtomicU32::new(USE_MAX)),
        }
    }

    /// Allocate the next id for `id_use`
    pub fn next_unique_id(&self, id_use: UniqueIdUse) -> u32 {
        let base = self.next[id_use as usize].fetch_add(USE_MAX, Ordering::Relaxed);
        base | id_use as u32
    }

    pub fn new_session(&self) -> SessionId {
        SessionId(self.next_unique_id(UniqueIdUse::Session))
    }

    pub fn new_output(&self) -> IoHandle {
        IoHandle(self.next_unique_id(UniqueIdUse::Output))
    }

    pub fn new_input(&self) -> IoHandle {
        IoHandle(self.next_unique_id(UniqueIdUse::Input))
    }

    pub fn new_patch(&self) -> PatchHandle {
        PatchHandle(self.next_unique_id(UniqueIdUse::Patch))
    }

    pub fn new_track(&self) -> TrackId {
        TrackId(self.next_unique_id(UniqueIdUse::Track))
    }

    pub fn new_effect(&self) -> u32 {
        self.next_unique_id(UniqueIdUse::Effect)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
