//! State common to playback and record tracks

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::Sender;

use crate::buffer::ControlBlock;
use crate::error::FlingerError;
use crate::sync_event::{SyncEvent, SyncEventType};
use crate::types::{AudioFormat, ChannelMask, SessionId, StreamConfig, TrackId, Uid};

use super::state::{AtomicTrackState, TrackState};

/// Asynchronous notifications delivered to the owning client
#[derive(Debug, Clone, PartialEq)]
pub enum TrackEvent {
    /// The mixer found the track's buffer short during a cycle
    Underrun,
    /// The track starved past its retry budget and was removed; restart to resume
    Disabled,
    /// Every frame written before stop has been presented
    StreamEnd,
    /// The track must be recreated (output closed, stream invalidated)
    Invalidated,
    /// Captured frames were lost because the client did not read in time
    Overrun,
    /// A runtime failure removed the track
    Error(FlingerError),
}

/// Identity, format and lifecycle of a track
pub struct TrackBase {
    id: TrackId,
    session: SessionId,
    uid: Uid,
    config: StreamConfig,
    state: AtomicTrackState,
    terminated: AtomicBool,
    cblk: Arc<ControlBlock>,
    events: Sender<TrackEvent>,
    sync_events: Mutex<Vec<Arc<SyncEvent>>>,
}

impl TrackBase {
    pub fn new(
        id: TrackId,
        session: SessionId,
        uid: Uid,
        config: StreamConfig,
        cblk: Arc<ControlBlock>,
        events: Sender<TrackEvent>,
    ) -> Self {
        Self {
            id,
            session,
            uid,
            config,
            state: AtomicTrackState::new(TrackState::Idle),
            terminated: AtomicBool::new(false),
            cblk,
            events,
            sync_events: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn id(&self) -> TrackId {
        self.id
    }

    #[inline]
    pub fn session(&self) -> SessionId {
        self.session
    }

    #[inline]
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Format the track was created with; `frame_count` is the ring size
    #[inline]
    pub fn config(&self) -> StreamConfig {
        self.config
    }

    #[inline]
    pub fn format(&self) -> AudioFormat {
        self.config.format
    }

    #[inline]
    pub fn channel_mask(&self) -> ChannelMask {
        self.config.channel_mask
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.config.channel_count()
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.config.frame_size()
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.config.frame_count
    }

    /// Current sample rate; a client may retune it through the control block
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.cblk.sample_rate()
    }

    #[inline]
    pub fn state(&self) -> TrackState {
        self.state.load()
    }

    #[inline]
    pub(crate) fn set_state(&self, state: TrackState) {
        let old = self.state.load();
        if old != state {
            log::trace!("track {}: {} -> {}", self.id.0, old.name(), state.name());
        }
        self.state.store(state);
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Relaxed)
    }

    /// Mark the track dead; the worker drops it at the next cycle boundary
    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::Relaxed) {
            log::debug!("track {}: terminated", self.id.0);
        }
    }

    #[inline]
    pub fn cblk(&self) -> &Arc<ControlBlock> {
        &self.cblk
    }

    /// Post an event to the client; false once the client stopped listening
    pub(crate) fn notify(&self, event: TrackEvent) -> bool {
        match self.events.send(event) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("track {}: {:?} dropped, client hung up", self.id.0, e.into_inner());
                false
            }
        }
    }

    pub(crate) fn add_sync_event(&self, event: Arc<SyncEvent>) {
        crate::lock(&self.sync_events).push(event);
    }

    /// Fire and forget every registered event of `event_type`
    pub(crate) fn trigger_sync_events(&self, event_type: SyncEventType) {
        let fired: Vec<Arc<SyncEvent>> = {
            let mut events = crate::lock(&self.sync_events);
            let (fired, kept) = events.drain(..).partition(|e| e.event_type() == event_type);
            *events = kept;
            fired
        };
        for event in fired {
            log::debug!("track {}: trigger {:?}", self.id.0, event);
            event.trigger();
        }
    }

    pub(crate) fn sync_event_count(&self) -> usize {
        crate::lock(&self.sync_events).len()
    }
}

impl std::fmt::Debug for TrackBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackBase")
            .field("id", &self.id.0)
            .field("session", &self.session.0)
            .field("state", &self.state())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
