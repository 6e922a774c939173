//! Playback threads
//!
//! One [`PlaybackThread`] exists per open output stream. Client calls
//! (create, start, stop, volume, ...) lock the thread and move track state;
//! the [`PlaybackWorker`] owning the HAL stream picks those changes up at
//! the next cycle boundary.
//!
//! ```text
//!   client ──start_track──▶ [ requests ] ──┐
//!                                          ▼
//!   worker:  config events → requests → prepare → mix → write → sleep
//!                                          │
//!                           active set (worker-only)
//! ```
//!
//! The four output kinds share the thread and differ in their prepare and
//! mix steps:
//! - **Mixer**: any number of PCM tracks mixed in float at the sink rate
//! - **Direct**: one track copied to the sink unmodified
//! - **Offload**: Direct plus non-blocking writes, drain and hardware pause
//! - **Duplicating**: a mixer whose sink is a set of tracks on other threads

mod direct;
mod duplicating;
mod mixer;
mod worker;

use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crossbeam::channel::{unbounded, Receiver};

use crate::buffer::{frame_ring, ControlBlock, FrameWriter};
use crate::error::{FlingerError, FlingerResult};
use crate::resample::MAX_RESAMPLE_RATIO;
use crate::sync_event::{SyncEvent, SyncEventType};
use crate::track::{Track, TrackBase, TrackEvent, TrackState};
use crate::types::{
    AudioFormat, ChannelMask, IoHandle, OutputFlags, SessionId, StreamConfig, StreamType, TrackId, Uid,
};

use super::async_callback::AsyncCallbackTarget;
use super::base::{BaseState, ThreadBase, ThreadContext, ThreadState, ThreadType};
use super::config_event::IoDescriptor;

pub use duplicating::{OutputTrack, MAX_OVERFLOW_BUFFERS};
pub use worker::{Cycle, PlaybackWorker};

/// Tracks a mixer thread accepts
pub const MAX_TRACKS: usize = 32;

/// Priority requested for the client thread feeding a fast track
const FAST_TRACK_CLIENT_PRIORITY: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Mixer,
    Direct,
    Offload,
    Duplicating,
}

impl OutputKind {
    /// Kind of thread an output opened with `flags` gets
    pub fn from_flags(flags: OutputFlags) -> Self {
        if flags.contains(OutputFlags::COMPRESS_OFFLOAD) {
            OutputKind::Offload
        } else if flags.contains(OutputFlags::DIRECT) {
            OutputKind::Direct
        } else {
            OutputKind::Mixer
        }
    }

    pub fn thread_type(self) -> ThreadType {
        match self {
            OutputKind::Mixer => ThreadType::Mixer,
            OutputKind::Direct => ThreadType::Direct,
            OutputKind::Offload => ThreadType::Offload,
            OutputKind::Duplicating => ThreadType::Duplicating,
        }
    }

    /// Mixer and Duplicating threads mix; the others pass one track through
    #[inline]
    pub fn is_mixing(self) -> bool {
        matches!(self, OutputKind::Mixer | OutputKind::Duplicating)
    }
}

/// Classification of one cycle, recomputed from the active set every time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerState {
    /// No active track
    Idle,
    /// Active tracks, none with data
    TracksEnabled,
    /// At least one track contributes this cycle
    TracksReady,
    /// Offload: drain the stream, notify early
    DrainTrack,
    /// Offload: drain everything
    DrainAll,
}

impl MixerState {
    pub fn name(self) -> &'static str {
        match self {
            MixerState::Idle => "IDLE",
            MixerState::TracksEnabled => "TRACKS_ENABLED",
            MixerState::TracksReady => "TRACKS_READY",
            MixerState::DrainTrack => "DRAIN_TRACK",
            MixerState::DrainAll => "DRAIN_ALL",
        }
    }
}

/// What a client asks for when creating a playback track
#[derive(Debug, Clone)]
pub struct TrackParams {
    pub stream_type: StreamType,
    pub sample_rate: u32,
    pub format: AudioFormat,
    pub channel_mask: ChannelMask,
    /// Ring size in frames; 0 picks a size from the sink latency
    pub frame_count: usize,
    pub flags: OutputFlags,
    /// `None` allocates a new session
    pub session: Option<SessionId>,
    pub uid: Uid,
    pub pid: u32,
    /// Client thread to boost when the track gets a fast slot
    pub tid: Option<u32>,
}

impl TrackParams {
    pub fn new(stream_type: StreamType, sample_rate: u32, format: AudioFormat, channel_mask: ChannelMask) -> Self {
        Self {
            stream_type,
            sample_rate,
            format,
            channel_mask,
            frame_count: 0,
            flags: OutputFlags::empty(),
            session: None,
            uid: Uid(0),
            pid: 0,
            tid: None,
        }
    }

    pub fn with_flags(mut self, flags: OutputFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_uid(mut self, uid: Uid) -> Self {
        self.uid = uid;
        self
    }

    pub fn with_frame_count(mut self, frame_count: usize) -> Self {
        self.frame_count = frame_count;
        self
    }

    pub fn with_client_thread(mut self, pid: u32, tid: u32) -> Self {
        self.pid = pid;
        self.tid = Some(tid);
        self
    }
}

/// Client requests the worker applies at its next cycle
pub(crate) enum TrackRequest {
    Start(Arc<Track>),
    /// Discard frames written before `position`
    Flush { track: Arc<Track>, position: u64 },
}

// ─────────────────────────────────────────────────────────────
// Locked state
// ─────────────────────────────────────────────────────────────

pub struct PlaybackState {
    pub(crate) base: BaseState,
    /// Sink format; `frame_count` is the normal mix period
    pub(crate) config: StreamConfig,
    pub(crate) latency_ms: u32,
    pub(crate) tracks: Vec<Arc<Track>>,
    /// Mutated by the worker only
    pub(crate) active_tracks: Vec<Arc<Track>>,
    /// Most recently started track; owns the stream on Direct and Offload
    pub(crate) latest_active: Weak<Track>,
    pub(crate) requests: Vec<TrackRequest>,
    /// Bit per fast slot in use; slot 0 is reserved
    fast_slots: u32,
    pub(crate) master_volume: f32,
    pub(crate) master_mute: bool,
    stream_volumes: [f32; StreamType::COUNT],
    stream_mutes: [bool; StreamType::COUNT],
    pub(crate) mixer_state: MixerState,
    pub(crate) use_async_write: bool,
    /// Even: no write outstanding. Odd: waiting for the stream's callback
    pub(crate) write_ack_sequence: u32,
    pub(crate) drain_sequence: u32,
    pub(crate) output_tracks: Vec<Arc<Mutex<OutputTrack>>>,
    pub(crate) wait_time_ms: u64,
}

impl PlaybackState {
    fn new(base: BaseState, config: StreamConfig, latency_ms: u32) -> Self {
        Self {
            base,
            config,
            latency_ms,
            tracks: Vec::new(),
            active_tracks: Vec::new(),
            latest_active: Weak::new(),
            requests: Vec::new(),
            fast_slots: 1,
            master_volume: 1.0,
            master_mute: false,
            stream_volumes: [1.0; StreamType::COUNT],
            stream_mutes: [false; StreamType::COUNT],
            mixer_state: MixerState::Idle,
            use_async_write: false,
            write_ack_sequence: 0,
            drain_sequence: 0,
            output_tracks: Vec::new(),
            wait_time_ms: u64::MAX,
        }
    }

    /// The worker has something to do without waiting for a deadline
    pub(crate) fn has_work(&self) -> bool {
        !self.active_tracks.is_empty() || !self.requests.is_empty() || !self.base.config_events.is_empty()
    }

    /// A non-blocking write or drain has not completed yet
    pub(crate) fn waiting_async(&self) -> bool {
        self.use_async_write && (self.write_ack_sequence & 1 != 0 || self.drain_sequence & 1 != 0)
    }

    pub(crate) fn latency_frames(&self) -> u64 {
        self.latency_ms as u64 * self.config.sample_rate as u64 / 1000
    }

    pub(crate) fn stream_gain(&self, stream: StreamType) -> f32 {
        if stream == StreamType::Patch {
            return 1.0;
        }
        if self.stream_mutes[stream.index()] {
            0.0
        } else {
            self.stream_volumes[stream.index()]
        }
    }

    pub(crate) fn master_gain(&self) -> f32 {
        if self.master_mute {
            0.0
        } else {
            self.master_volume
        }
    }

    /// Target (left, right) gain of a track
    pub(crate) fn track_gain(&self, track: &Track) -> (f32, f32) {
        let v = self.master_gain() * self.stream_gain(track.stream_type());
        let (l, r) = track.cblk().volume();
        (v * l, v * r)
    }

    fn alloc_fast_slot(&mut self, slots: usize) -> Option<usize> {
        let slot = (1..slots.min(32)).find(|i| self.fast_slots & (1 << i) == 0)?;
        self.fast_slots |= 1 << slot;
        Some(slot)
    }

    fn free_fast_slot(&mut self, slot: usize) {
        if slot > 0 && slot < 32 {
            self.fast_slots &= !(1 << slot);
        }
    }

    pub(crate) fn fast_track_count(&self) -> usize {
        (self.fast_slots & !1).count_ones() as usize
    }

    /// Forget a track for good, giving its fast slot back
    pub(crate) fn remove_track_l(&mut self, track: &Arc<Track>) {
        let before = self.tracks.len();
        self.tracks.retain(|t| !Arc::ptr_eq(t, track));
        if self.tracks.len() != before {
            if let Some(slot) = track.fast_index() {
                self.free_fast_slot(slot);
                track.set_fast_index(None);
            }
            log::debug!("track {} removed", track.id().0);
        }
    }

    fn contains(&self, track: &Arc<Track>) -> bool {
        self.tracks.iter().any(|t| Arc::ptr_eq(t, track))
    }

    /// Shortest time a downstream output may block a duplicated write
    fn update_wait_time(&mut self) {
        self.wait_time_ms = self
            .output_tracks
            .iter()
            .map(|ot| {
                let ot = crate::lock(ot);
                let config = ot.thread().config();
                2 * config.frame_count as u64 * 1000 / config.sample_rate.max(1) as u64
            })
            .min()
            .unwrap_or(u64::MAX);
    }
}

impl ThreadState for PlaybackState {
    fn base(&self) -> &BaseState {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseState {
        &mut self.base
    }

    fn io_descriptor(&self, io: IoHandle) -> IoDescriptor {
        IoDescriptor {
            io,
            sample_rate: self.config.sample_rate,
            format: self.config.format,
            channel_mask: self.config.channel_mask,
            frame_count: self.config.frame_count,
            latency_ms: self.latency_ms,
        }
    }

    fn dump(&self, out: &mut String) {
        out.push_str(&format!(
            "  sink: {} Hz {:?} mask {:#x} frames {} latency {} ms\n",
            self.config.sample_rate,
            self.config.format,
            self.config.channel_mask.0,
            self.config.frame_count,
            self.latency_ms
        ));
        out.push_str(&format!(
            "  mixer state: {} master volume {:.3}{}\n",
            self.mixer_state.name(),
            self.master_volume,
            if self.master_mute { " (muted)" } else { "" }
        ));
        out.push_str(&format!(
            "  tracks: {} active: {} fast: {}\n",
            self.tracks.len(),
            self.active_tracks.len(),
            self.fast_track_count()
        ));
        for t in &self.tracks {
            out.push_str(&format!(
                "    {:>5} session {:>5} {:<10} {:?} ready {} underruns {}{}\n",
                t.id().0,
                t.session().0,
                t.state().name(),
                t.stream_type(),
                t.frames_ready(),
                t.cblk().underrun_frames(),
                if t.is_fast() { " fast" } else { "" }
            ));
        }
        if !self.output_tracks.is_empty() {
            out.push_str(&format!(
                "  output tracks: {} wait {} ms\n",
                self.output_tracks.len(),
                self.wait_time_ms
            ));
        }
    }
}

// ─────────────────────────────────────────────────────────────
// PlaybackThread
// ─────────────────────────────────────────────────────────────

pub struct PlaybackThread {
    base: ThreadBase<PlaybackState>,
    kind: OutputKind,
    frames_written: AtomicU64,
    suspended: AtomicU32,
}

impl Deref for PlaybackThread {
    type Target = ThreadBase<PlaybackState>;

    fn deref(&self) -> &ThreadBase<PlaybackState> {
        &self.base
    }
}

impl PlaybackThread {
    pub(crate) fn new(
        id: IoHandle,
        kind: OutputKind,
        ctx: ThreadContext,
        config: StreamConfig,
        latency_ms: u32,
    ) -> Arc<Self> {
        let name = format!("{}_{}", kind.thread_type().name(), id.0);
        let power = if ctx.config.wake_lock_enabled { ctx.power.clone() } else { None };
        let state = PlaybackState::new(BaseState::new(name, power), config, latency_ms);
        Arc::new(Self {
            base: ThreadBase::new(id, kind.thread_type(), ctx, state),
            kind,
            frames_written: AtomicU64::new(0),
            suspended: AtomicU32::new(0),
        })
    }

    #[inline]
    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    /// Frames handed to the sink since the thread started
    #[inline]
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    pub(crate) fn set_frames_written(&self, frames: u64) {
        self.frames_written.store(frames, Ordering::Relaxed);
    }

    pub fn config(&self) -> StreamConfig {
        self.lock().config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config().sample_rate
    }

    pub fn latency_ms(&self) -> u32 {
        self.lock().latency_ms
    }

    pub fn mixer_state(&self) -> MixerState {
        self.lock().mixer_state
    }

    pub fn track_count(&self) -> usize {
        self.lock().tracks.len()
    }

    pub fn active_track_count(&self) -> usize {
        self.lock().active_tracks.len()
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        let st = self.lock();
        let mut sessions: Vec<SessionId> = st.tracks.iter().map(|t| t.session()).collect();
        sessions.sort();
        sessions.dedup();
        sessions
    }

    // ─────────────────────────────────────────────────────────
    // Track creation
    // ─────────────────────────────────────────────────────────

    /// Validate `params` against the sink and attach a new track
    pub fn create_track(
        &self,
        params: TrackParams,
    ) -> FlingerResult<(Arc<Track>, FrameWriter, Receiver<TrackEvent>)> {
        let session = params.session.unwrap_or_else(|| self.ctx().ids.new_session());
        let mut st = self.lock();
        self.create_track_l(&mut st, params, session, false)
    }

    fn create_track_l(
        &self,
        st: &mut PlaybackState,
        mut params: TrackParams,
        session: SessionId,
        output_track: bool,
    ) -> FlingerResult<(Arc<Track>, FrameWriter, Receiver<TrackEvent>)> {
        let sink = st.config;
        let config = self.engine_config();
        if params.sample_rate == 0 {
            params.sample_rate = sink.sample_rate;
        }

        if self.kind.is_mixing() {
            if !params.format.is_linear_pcm() {
                return Err(FlingerError::bad_value(format!(
                    "{}: format {:?} cannot be mixed",
                    self.name(),
                    params.format
                )));
            }
            if !params.channel_mask.is_valid() {
                return Err(FlingerError::bad_value(format!(
                    "{}: channel mask {:#x}",
                    self.name(),
                    params.channel_mask.0
                )));
            }
            if params.sample_rate > sink.sample_rate.saturating_mul(MAX_RESAMPLE_RATIO) {
                return Err(FlingerError::bad_value(format!(
                    "{}: sample rate {} above {} x {}",
                    self.name(),
                    params.sample_rate,
                    MAX_RESAMPLE_RATIO,
                    sink.sample_rate
                )));
            }
            if st.tracks.len() >= MAX_TRACKS {
                return Err(FlingerError::NoMemory(format!("{}: no more track names", self.name())));
            }
        } else if params.sample_rate != sink.sample_rate
            || params.format != sink.format
            || params.channel_mask != sink.channel_mask
        {
            return Err(FlingerError::bad_value(format!(
                "{}: direct track must match the sink ({} Hz {:?} {:#x})",
                self.name(),
                sink.sample_rate,
                sink.format,
                sink.channel_mask.0
            )));
        }

        let mut fast_slot = None;
        if params.flags.contains(OutputFlags::FAST) {
            let mask_ok = params.channel_mask == sink.channel_mask
                || (params.channel_mask == ChannelMask::OUT_MONO && sink.channel_mask == ChannelMask::OUT_STEREO);
            let compatible = self.kind == OutputKind::Mixer
                && params.format.is_linear_pcm()
                && mask_ok
                && params.sample_rate == sink.sample_rate;
            fast_slot = if compatible { st.alloc_fast_slot(config.fast_track_slots) } else { None };
            if fast_slot.is_none() {
                log::debug!(
                    "{}: fast track denied (rate {} mask {:#x} free slots {})",
                    self.name(),
                    params.sample_rate,
                    params.channel_mask.0,
                    config.fast_track_slots.saturating_sub(1 + st.fast_track_count())
                );
                params.flags.remove(OutputFlags::FAST);
            }
        }
        if self.kind == OutputKind::Direct {
            params.flags.insert(OutputFlags::DIRECT);
        } else if self.kind == OutputKind::Offload {
            params.flags.insert(OutputFlags::COMPRESS_OFFLOAD);
        }

        let frame_count = if params.frame_count > 0 {
            params.frame_count
        } else if fast_slot.is_some() {
            2 * sink.frame_count
        } else if self.kind.is_mixing() {
            let period_ms = (sink.frame_count as u64 * 1000 / sink.sample_rate.max(1) as u64).max(1);
            let buffers = (st.latency_ms as u64 / period_ms).max(2) as usize;
            let scaled = sink.frame_count as u64 * params.sample_rate as u64 / sink.sample_rate.max(1) as u64;
            buffers * (scaled as usize).max(1)
        } else {
            2 * sink.frame_count
        };

        let track_config = StreamConfig {
            sample_rate: params.sample_rate,
            format: params.format,
            channel_mask: params.channel_mask,
            frame_count,
        };
        let (writer, reader) = frame_ring(frame_count, track_config.frame_size())?;
        let (tx, rx) = unbounded();
        let id: TrackId = self.ctx().ids.new_track();
        let base = TrackBase::new(
            id,
            session,
            params.uid,
            track_config,
            Arc::new(ControlBlock::new(params.sample_rate)),
            tx,
        );
        let track = Arc::new(Track::new(base, params.stream_type, params.flags, reader, output_track));
        track.set_fast_index(fast_slot);
        st.tracks.push(track.clone());

        if let (Some(_), Some(tid)) = (fast_slot, params.tid) {
            self.send_prio_config_event_l(st, params.pid, tid, FAST_TRACK_CLIENT_PRIORITY);
        }
        log::info!(
            "{}: track {} created (session {}, {} Hz {:?} {} ch, {} frames{})",
            self.name(),
            id.0,
            session.0,
            params.sample_rate,
            params.format,
            track_config.channel_count(),
            frame_count,
            if fast_slot.is_some() { ", fast" } else { "" }
        );
        Ok((track, writer, rx))
    }

    /// Track fed by a duplicating thread; mixed at unity stream gain
    pub(crate) fn create_output_track(
        &self,
        config: StreamConfig,
        uid: Uid,
    ) -> FlingerResult<(Arc<Track>, FrameWriter)> {
        let params = TrackParams {
            stream_type: StreamType::Patch,
            sample_rate: config.sample_rate,
            format: config.format,
            channel_mask: config.channel_mask,
            frame_count: config.frame_count,
            flags: OutputFlags::empty(),
            session: None,
            uid,
            pid: 0,
            tid: None,
        };
        let session = self.ctx().ids.new_session();
        let mut st = self.lock();
        let (track, writer, _events) = self.create_track_l(&mut st, params, session, true)?;
        Ok((track, writer))
    }

    // ─────────────────────────────────────────────────────────
    // Track lifecycle (client side)
    // ─────────────────────────────────────────────────────────

    pub fn start_track(&self, track: &Arc<Track>) -> FlingerResult<()> {
        let mut st = self.lock();
        if track.is_invalid() {
            return Err(FlingerError::DeadObject(format!("track {} was invalidated", track.id().0)));
        }
        if !st.contains(track) {
            return Err(FlingerError::bad_value(format!(
                "track {} is not attached to {}",
                track.id().0,
                self.name()
            )));
        }
        if track.start_l()? {
            st.requests.push(TrackRequest::Start(track.clone()));
        }
        self.broadcast();
        Ok(())
    }

    pub fn stop_track(&self, track: &Arc<Track>) {
        let _st = self.lock();
        track.stop_l();
        if track.is_offloaded() && track.state() == TrackState::Stopping1 {
            track.set_retry_count(self.engine_config().max_track_stop_retries_offload);
        }
        self.broadcast();
    }

    pub fn pause_track(&self, track: &Arc<Track>) {
        let _st = self.lock();
        if track.pause_l() {
            self.broadcast();
        }
    }

    /// Discard what the client wrote up to `position` (its writer's frame count)
    pub fn flush_track(&self, track: &Arc<Track>, position: u64) {
        let mut st = self.lock();
        if !track.flush_l() {
            return;
        }
        st.requests.push(TrackRequest::Flush {
            track: track.clone(),
            position,
        });
        if track.is_offloaded() && track.state() == TrackState::Active {
            track.set_retry_count(self.engine_config().max_track_retries_offload);
        }
        self.broadcast();
    }

    /// Terminate a track; the worker drops it if it is still active
    pub fn destroy_track(&self, track: &Arc<Track>) {
        let mut st = self.lock();
        track.terminate();
        if !track.is_in_active_set() {
            st.remove_track_l(track);
        }
        self.broadcast();
    }

    /// Tell every client of `stream` (all streams if `None`) to recreate its track
    pub fn invalidate_tracks(&self, stream: Option<StreamType>) {
        let st = self.lock();
        for track in &st.tracks {
            if stream.map_or(true, |s| track.stream_type() == s) {
                track.invalidate();
            }
        }
    }

    // ─────────────────────────────────────────────────────────
    // Volume
    // ─────────────────────────────────────────────────────────

    pub fn set_master_volume(&self, volume: f32) {
        self.lock().master_volume = volume.clamp(0.0, 1.0);
    }

    pub fn set_master_mute(&self, muted: bool) {
        self.lock().master_mute = muted;
    }

    pub fn set_stream_volume(&self, stream: StreamType, volume: f32) {
        self.lock().stream_volumes[stream.index()] = volume.clamp(0.0, 1.0);
    }

    pub fn set_stream_mute(&self, stream: StreamType, muted: bool) {
        self.lock().stream_mutes[stream.index()] = muted;
    }

    pub fn stream_volume(&self, stream: StreamType) -> f32 {
        self.lock().stream_volumes[stream.index()]
    }

    pub fn stream_mute(&self, stream: StreamType) -> bool {
        self.lock().stream_mutes[stream.index()]
    }

    // ─────────────────────────────────────────────────────────
    // Suspend
    // ─────────────────────────────────────────────────────────

    /// Keep mixing but stop writing to the stream; nests
    pub fn suspend(&self) {
        let _ = self
            .suspended
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1));
    }

    pub fn restore(&self) {
        let _ = self
            .suspended
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.broadcast();
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Relaxed) > 0
    }

    // ─────────────────────────────────────────────────────────
    // Sync events
    // ─────────────────────────────────────────────────────────

    /// Attach `event` to a track of its trigger session
    ///
    /// Returns false when no track of the session lives on this thread.
    pub fn set_sync_event(&self, event: &Arc<SyncEvent>) -> FlingerResult<bool> {
        if event.event_type() != SyncEventType::PresentationComplete {
            return Err(FlingerError::bad_value(format!("{:?}", event.event_type())));
        }
        let st = self.lock();
        match st.tracks.iter().find(|t| t.session() == event.trigger_session()) {
            Some(track) => {
                // a refused event is cancelled, which starts its listener at once
                let _ = track.set_sync_event(event.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ─────────────────────────────────────────────────────────
    // Duplication
    // ─────────────────────────────────────────────────────────

    /// Start feeding `downstream` from this duplicating thread
    pub fn add_output_track(&self, downstream: &Arc<PlaybackThread>) -> FlingerResult<()> {
        if self.kind != OutputKind::Duplicating {
            return Err(FlingerError::invalid_operation(format!("{} does not duplicate", self.name())));
        }
        let mut st = self.lock();
        if st.output_tracks.iter().any(|ot| crate::lock(ot).thread().id() == downstream.id()) {
            return Err(FlingerError::AlreadyExists(format!("output {}", downstream.id().0)));
        }
        let config = st.config;
        let downstream_rate = downstream.sample_rate().max(1);
        let frame_count =
            (3 * config.frame_count as u64 * config.sample_rate as u64 / downstream_rate as u64).max(1) as usize;
        let output = OutputTrack::new(
            downstream.clone(),
            StreamConfig { frame_count, ..config },
            Uid(0),
        )?;
        log::info!(
            "{}: output track {} added on {}",
            self.name(),
            output.track().id().0,
            downstream.name()
        );
        st.output_tracks.push(Arc::new(Mutex::new(output)));
        st.update_wait_time();
        Ok(())
    }

    /// Stop feeding the output `io`; returns false if it was not fed
    pub fn remove_output_track(&self, io: IoHandle) -> bool {
        let mut st = self.lock();
        let Some(pos) = st.output_tracks.iter().position(|ot| crate::lock(ot).thread().id() == io) else {
            return false;
        };
        let output = st.output_tracks.remove(pos);
        crate::lock(&output).destroy();
        st.update_wait_time();
        log::info!("{}: output track on {} removed", self.name(), io.0);
        true
    }

    /// Detach from every downstream output
    pub fn clear_output_tracks(&self) {
        let mut st = self.lock();
        for output in std::mem::take(&mut st.output_tracks) {
            crate::lock(&output).destroy();
        }
        st.update_wait_time();
    }

    /// Outputs this duplicating thread feeds
    pub fn output_track_ios(&self) -> Vec<IoHandle> {
        let st = self.lock();
        st.output_tracks.iter().map(|ot| crate::lock(ot).thread().id()).collect()
    }

    pub fn output_track_count(&self) -> usize {
        self.lock().output_tracks.len()
    }

    pub fn wait_time_ms(&self) -> u64 {
        self.lock().wait_time_ms
    }
}

impl AsyncCallbackTarget for PlaybackThread {
    fn reset_write_blocked(&self, sequence: u32) {
        let mut st = self.lock();
        // reject any ack older than the write in flight
        if st.write_ack_sequence & 1 != 0 && sequence == st.write_ack_sequence {
            st.write_ack_sequence &= !1;
            self.broadcast();
        }
    }

    fn reset_draining(&self, sequence: u32) {
        let mut st = self.lock();
        if st.drain_sequence & 1 != 0 && sequence == st.drain_sequence {
            st.drain_sequence &= !1;
            self.broadcast();
        }
    }

    fn on_async_error(&self) {
        log::warn!("{}: stream reported an error, invalidating tracks", self.name());
        self.invalidate_tracks(None);
    }
}

#[cfg(test)]
pub(crate) mod tests;
