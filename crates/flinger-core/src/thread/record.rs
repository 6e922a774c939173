//! Record threads
//!
//! One [`RecordThread`] exists per open input stream. The worker reads a
//! period from the stream into a float ring sized for several periods, then
//! each active track pulls from its own read position, converting rate and
//! channel count to what the client asked for. A track that falls more than
//! the ring behind loses the oldest frames and is told about the overrun.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver};

use crate::buffer::{frame_ring, ControlBlock, FrameReader};
use crate::convert::{adjust_channels, float_to_pcm, pcm_to_float};
use crate::devices::InputDevices;
use crate::effects::EffectChain;
use crate::error::{FlingerError, FlingerResult};
use crate::hal::StreamIn;
use crate::params::{
    AudioParameter, KEY_CHANNELS, KEY_FORMAT, KEY_FRAME_COUNT, KEY_INPUT_SOURCE, KEY_ROUTING, KEY_SAMPLING_RATE,
};
use crate::resample::{StreamResampler, MAX_RESAMPLE_RATIO};
use crate::sync_event::SyncEvent;
use crate::track::{RecordTrack, TrackBase, TrackEvent, TrackState};
use crate::types::{AudioFormat, ChannelMask, InputFlags, IoHandle, PatchHandle, SessionId, StreamConfig, TrackId, Uid};

use super::base::{BaseState, ThreadBase, ThreadContext, ThreadState, ThreadType};
use super::config_event::{AudioPatch, ConfigEventKind, ConfigReply, IoDescriptor, IoEventKind};
use super::playback::Cycle;

/// Periods of capture kept for slow tracks
pub const RECORD_BUFFER_PERIODS: usize = 7;

/// Pause after a failed read before trying again
const READ_ERROR_SLEEP: Duration = Duration::from_millis(5);

/// Record tracks an input accepts
pub const MAX_RECORD_TRACKS: usize = 16;

/// What a client asks for when opening a capture stream
#[derive(Debug, Clone)]
pub struct RecordParams {
    pub sample_rate: u32,
    pub format: AudioFormat,
    pub channel_mask: ChannelMask,
    /// Ring size in frames; 0 picks two input periods
    pub frame_count: usize,
    pub flags: InputFlags,
    pub session: Option<SessionId>,
    pub uid: Uid,
}

impl RecordParams {
    pub fn new(sample_rate: u32, format: AudioFormat, channel_mask: ChannelMask) -> Self {
        Self {
            sample_rate,
            format,
            channel_mask,
            frame_count: 0,
            flags: InputFlags::empty(),
            session: None,
            uid: Uid(0),
        }
    }

    pub fn with_flags(mut self, flags: InputFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_frame_count(mut self, frame_count: usize) -> Self {
        self.frame_count = frame_count;
        self
    }

    pub fn with_uid(mut self, uid: Uid) -> Self {
        self.uid = uid;
        self
    }
}

// ─────────────────────────────────────────────────────────────
// Locked state
// ─────────────────────────────────────────────────────────────

pub struct RecordState {
    pub(crate) base: BaseState,
    pub(crate) config: StreamConfig,
    pub(crate) tracks: Vec<Arc<RecordTrack>>,
    /// Mutated by the worker only
    pub(crate) active_tracks: Vec<Arc<RecordTrack>>,
    pub(crate) start_requests: Vec<Arc<RecordTrack>>,
    pub(crate) input_source: u32,
}

impl RecordState {
    fn new(base: BaseState, config: StreamConfig) -> Self {
        Self {
            base,
            config,
            tracks: Vec::new(),
            active_tracks: Vec::new(),
            start_requests: Vec::new(),
            input_source: 0,
        }
    }

    fn has_work(&self) -> bool {
        !self.active_tracks.is_empty() || !self.start_requests.is_empty() || !self.base.config_events.is_empty()
    }

    fn contains(&self, track: &Arc<RecordTrack>) -> bool {
        self.tracks.iter().any(|t| Arc::ptr_eq(t, track))
    }

    fn remove_track_l(&mut self, track: &Arc<RecordTrack>) {
        self.tracks.retain(|t| !Arc::ptr_eq(t, track));
    }
}

impl ThreadState for RecordState {
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
            latency_ms: 0,
        }
    }

    fn dump(&self, out: &mut String) {
        out.push_str(&format!(
            "  source: {} Hz {:?} mask {:#x} frames {} input source {}\n",
            self.config.sample_rate,
            self.config.format,
            self.config.channel_mask.0,
            self.config.frame_count,
            self.input_source
        ));
        out.push_str(&format!(
            "  tracks: {} active: {}\n",
            self.tracks.len(),
            self.active_tracks.len()
        ));
        for t in &self.tracks {
            out.push_str(&format!(
                "    {:>5} session {:>5} {:<10} {} Hz drop {}\n",
                t.id().0,
                t.session().0,
                t.state().name(),
                t.sample_rate(),
                t.frames_to_drop()
            ));
        }
    }
}

// ─────────────────────────────────────────────────────────────
// RecordThread
// ─────────────────────────────────────────────────────────────

pub struct RecordThread {
    base: ThreadBase<RecordState>,
    frames_lost: AtomicU64,
    frames_read: AtomicU64,
}

impl Deref for RecordThread {
    type Target = ThreadBase<RecordState>;

    fn deref(&self) -> &ThreadBase<RecordState> {
        &self.base
    }
}

impl RecordThread {
    fn new(id: IoHandle, ctx: ThreadContext, config: StreamConfig) -> Arc<Self> {
        let name = format!("{}_{}", ThreadType::Record.name(), id.0);
        let power = if ctx.config.wake_lock_enabled { ctx.power.clone() } else { None };
        let state = RecordState::new(BaseState::new(name, power), config);
        Arc::new(Self {
            base: ThreadBase::new(id, ThreadType::Record, ctx, state),
            frames_lost: AtomicU64::new(0),
            frames_read: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> StreamConfig {
        self.lock().config
    }

    pub fn track_count(&self) -> usize {
        self.lock().tracks.len()
    }

    pub fn active_track_count(&self) -> usize {
        self.lock().active_tracks.len()
    }

    pub fn input_source(&self) -> u32 {
        self.lock().input_source
    }

    /// Frames read from the stream since the thread started
    pub fn frames_read(&self) -> u64 {
        self.frames_read.load(Ordering::Relaxed)
    }

    /// Frames the stream reported lost since the last call
    pub fn take_input_frames_lost(&self) -> u64 {
        self.frames_lost.swap(0, Ordering::Relaxed)
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        let st = self.lock();
        let mut sessions: Vec<SessionId> = st.tracks.iter().map(|t| t.session()).collect();
        sessions.sort();
        sessions.dedup();
        sessions
    }

    /// Validate `params` against the input and attach a new capture track
    pub fn create_record_track(
        &self,
        mut params: RecordParams,
    ) -> FlingerResult<(Arc<RecordTrack>, FrameReader, Receiver<TrackEvent>)> {
        let session = params.session.unwrap_or_else(|| self.ctx().ids.new_session());
        let mut st = self.lock();
        let source = st.config;
        if params.sample_rate == 0 {
            params.sample_rate = source.sample_rate;
        }
        if !params.format.is_linear_pcm() {
            return Err(FlingerError::bad_value(format!(
                "{}: cannot capture to {:?}",
                self.name(),
                params.format
            )));
        }
        if !params.channel_mask.is_valid() || params.channel_mask.channel_count() > 2 {
            return Err(FlingerError::bad_value(format!(
                "{}: channel mask {:#x}",
                self.name(),
                params.channel_mask.0
            )));
        }
        let ratio_ok = params.sample_rate <= source.sample_rate.saturating_mul(MAX_RESAMPLE_RATIO)
            && source.sample_rate <= params.sample_rate.saturating_mul(MAX_RESAMPLE_RATIO);
        if !ratio_ok {
            return Err(FlingerError::bad_value(format!(
                "{}: sample rate {} too far from {}",
                self.name(),
                params.sample_rate,
                source.sample_rate
            )));
        }
        if st.tracks.len() >= MAX_RECORD_TRACKS {
            return Err(FlingerError::NoMemory(format!("{}: no more record tracks", self.name())));
        }

        if params.flags.contains(InputFlags::FAST)
            && (params.sample_rate != source.sample_rate || params.channel_mask != source.channel_mask)
        {
            log::debug!(
                "{}: fast capture denied (rate {} mask {:#x})",
                self.name(),
                params.sample_rate,
                params.channel_mask.0
            );
            params.flags.remove(InputFlags::FAST);
        }

        let frame_count = if params.frame_count > 0 {
            params.frame_count
        } else {
            let scaled =
                source.frame_count as u64 * params.sample_rate as u64 / source.sample_rate.max(1) as u64;
            2 * (scaled as usize).max(1)
        };
        let config = StreamConfig {
            sample_rate: params.sample_rate,
            format: params.format,
            channel_mask: params.channel_mask,
            frame_count,
        };
        let (writer, reader) = frame_ring(frame_count, config.frame_size())?;
        let (tx, rx) = unbounded();
        let id: TrackId = self.ctx().ids.new_track();
        let base = TrackBase::new(
            id,
            session,
            params.uid,
            config,
            Arc::new(ControlBlock::new(params.sample_rate)),
            tx,
        );
        let track = Arc::new(RecordTrack::new(base, params.flags, writer));
        st.tracks.push(track.clone());
        log::info!(
            "{}: record track {} created (session {}, {} Hz {:?} {} ch, {} frames)",
            self.name(),
            id.0,
            session.0,
            params.sample_rate,
            params.format,
            config.channel_count(),
            frame_count
        );
        Ok((track, reader, rx))
    }

    /// Begin capture, optionally waiting for `sync_event` before delivering
    pub fn start(&self, track: &Arc<RecordTrack>, sync_event: Option<Arc<SyncEvent>>) -> FlingerResult<()> {
        let mut st = self.lock();
        if !st.contains(track) {
            return Err(FlingerError::bad_value(format!(
                "record track {} is not attached to {}",
                track.id().0,
                self.name()
            )));
        }
        if track.start_l(sync_event)? {
            st.start_requests.push(track.clone());
        }
        self.broadcast();
        Ok(())
    }

    /// Returns false if the track was not capturing
    pub fn stop(&self, track: &Arc<RecordTrack>) -> bool {
        let _st = self.lock();
        let stopping = track.stop_l();
        if stopping {
            self.broadcast();
        }
        stopping
    }

    pub fn destroy_track(&self, track: &Arc<RecordTrack>) {
        let mut st = self.lock();
        track.terminate();
        if !track.is_in_active_set() {
            st.remove_track_l(track);
        }
        self.broadcast();
    }

    pub fn invalidate_tracks(&self) {
        let st = self.lock();
        for track in &st.tracks {
            track.invalidate();
        }
    }

    fn add_frames_lost(&self, frames: u64) {
        self.frames_lost.fetch_add(frames, Ordering::Relaxed);
    }
}

// ─────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────

/// Read position of one track in the capture ring
struct TrackReadState {
    front: u32,
    resampler: Option<StreamResampler>,
}

pub struct RecordWorker {
    thread: Arc<RecordThread>,
    input: Box<dyn StreamIn>,
    config: StreamConfig,
    read_buffer: Vec<u8>,
    /// Capture ring in float, `rsmp_p2 + frame_count` frames so a read never wraps
    rsmp: Vec<f32>,
    /// Frames a track may lag before it overruns
    rsmp_frames: usize,
    rsmp_p2: usize,
    /// Frames ever written into the ring, wrapping
    rear: u32,
    readers: HashMap<TrackId, TrackReadState>,
    convert_out: Vec<f32>,
    convert_in: Vec<f32>,
    encoded: Vec<u8>,
}

impl RecordWorker {
    pub fn open(id: IoHandle, ctx: ThreadContext, input: Box<dyn StreamIn>) -> FlingerResult<(Arc<RecordThread>, Self)> {
        let mut config = input.config();
        if config.frame_count == 0 {
            config.frame_count = ctx.config.mixer_frame_count;
        }
        if !config.format.is_linear_pcm() || !config.channel_mask.is_valid() {
            return Err(FlingerError::bad_value(format!(
                "input needs linear PCM, got {:?} mask {:#x}",
                config.format, config.channel_mask.0
            )));
        }
        let thread = RecordThread::new(id, ctx, config);
        let mut worker = Self {
            thread: thread.clone(),
            input,
            config,
            read_buffer: Vec::new(),
            rsmp: Vec::new(),
            rsmp_frames: 0,
            rsmp_p2: 0,
            rear: 0,
            readers: HashMap::new(),
            convert_out: Vec::new(),
            convert_in: Vec::new(),
            encoded: Vec::new(),
        };
        worker.allocate(config);
        Ok((thread, worker))
    }

    fn allocate(&mut self, config: StreamConfig) {
        self.config = config;
        let channels = config.channel_count();
        self.read_buffer = vec![0; config.frame_count * config.frame_size()];
        self.rsmp_frames = config.frame_count * RECORD_BUFFER_PERIODS;
        self.rsmp_p2 = self.rsmp_frames.next_power_of_two();
        self.rsmp = vec![0.0; (self.rsmp_p2 + config.frame_count) * channels];
        self.rear = 0;
        for reader in self.readers.values_mut() {
            reader.front = 0;
            reader.resampler = None;
        }
    }

    #[inline]
    pub fn thread(&self) -> &Arc<RecordThread> {
        &self.thread
    }

    /// Run one iteration of the capture loop
    pub fn run_cycle(&mut self) -> Cycle {
        let thread = self.thread.clone();
        let mut st = thread.lock();

        self.process_config_events(&thread, &mut st);
        if thread.exit_pending() {
            return Cycle::Exit;
        }
        self.apply_starts(&thread, &mut st);
        self.prune_abandoned(&mut st);

        let mut remove = Vec::new();
        for track in &st.active_tracks {
            if track.is_terminated() {
                remove.push(track.clone());
            } else if track.state() == TrackState::Pausing {
                track.set_state(TrackState::Stopped);
                remove.push(track.clone());
            }
        }
        self.remove_tracks_l(&thread, &mut st, remove);

        if st.active_tracks.is_empty() {
            if !thread.standby() {
                self.enter_standby(&thread);
            }
            if !st.has_work() {
                return Cycle::Idle;
            }
            return Cycle::Continue(Duration::ZERO);
        }
        let active = st.active_tracks.clone();
        let chains: Vec<Arc<Mutex<EffectChain>>> = st.base.effect_chains().to_vec();
        drop(st);

        let frames = match self.input.read(&mut self.read_buffer) {
            Ok(bytes) => bytes / self.config.frame_size().max(1),
            Err(e) => {
                log::warn!("{}: read failed: {}", thread.name(), e);
                self.enter_standby(&thread);
                return Cycle::Continue(READ_ERROR_SLEEP);
            }
        };
        thread.set_standby(false);
        let lost = self.input.input_frames_lost();
        if lost > 0 {
            log::debug!("{}: stream lost {} frames", thread.name(), lost);
            thread.add_frames_lost(lost as u64);
        }

        if frames > 0 {
            self.store(frames, &chains);
            thread.frames_read.fetch_add(frames as u64, Ordering::Relaxed);
        }
        for track in &active {
            self.deliver(track);
        }
        Cycle::Continue(Duration::ZERO)
    }

    /// Convert a read into the ring, run the pre-processing chains, advance the rear
    fn store(&mut self, frames: usize, chains: &[Arc<Mutex<EffectChain>>]) {
        let channels = self.config.channel_count();
        let index = self.rear as usize & (self.rsmp_p2 - 1);
        let bytes = frames * self.config.frame_size();
        let samples = &mut self.rsmp[index * channels..(index + frames) * channels];
        pcm_to_float(self.config.format, &self.read_buffer[..bytes], samples);
        for chain in chains {
            crate::lock(chain).process(samples, channels);
        }
        let past_end = (index + frames).saturating_sub(self.rsmp_p2);
        if past_end > 0 {
            // frames written beyond the power of two belong at the start
            let p2 = self.rsmp_p2 * channels;
            self.rsmp.copy_within(p2..p2 + past_end * channels, 0);
        }
        self.rear = self.rear.wrapping_add(frames as u32);
    }

    /// Frames available to a reader at `front`; resynchronises on overrun
    fn sync(rear: u32, rsmp_frames: usize, reader: &mut TrackReadState) -> (usize, bool) {
        let filled = rear.wrapping_sub(reader.front) as i32;
        if filled < 0 {
            reader.front = rear;
            (0, true)
        } else if filled as usize > rsmp_frames {
            reader.front = rear.wrapping_sub(rsmp_frames as u32);
            (rsmp_frames, true)
        } else {
            (filled as usize, false)
        }
    }

    fn deliver(&mut self, track: &Arc<RecordTrack>) {
        let Some(mut reader) = self.readers.remove(&track.id()) else {
            return;
        };
        let mut overrun: Option<bool> = None;
        loop {
            let (available, lost) = Self::sync(self.rear, self.rsmp_frames, &mut reader);
            if lost {
                overrun = Some(true);
            }
            let space = track.writer().frames_available();
            if space == 0 || available == 0 {
                break;
            }
            let produced = self.convert(track, &mut reader, available, space);
            if produced == 0 {
                break;
            }
            if overrun.is_none() {
                overrun = Some(false);
            }
            if track.frames_to_drop() == 0 {
                let bytes = produced * track.frame_size();
                if self.encoded.len() < bytes {
                    self.encoded.resize(bytes, 0);
                }
                float_to_pcm(
                    track.format(),
                    &self.convert_out[..produced * track.channel_count()],
                    &mut self.encoded[..bytes],
                );
                let written = track.writer().write(&self.encoded[..bytes]);
                track.cblk().advance_server_position(written as u64);
            } else {
                track.consume_dropped_frames(produced);
            }
        }
        match overrun {
            Some(true) => {
                if !track.set_overflow() {
                    log::debug!("record track {}: overrun", track.id().0);
                }
            }
            Some(false) => track.clear_overflow(),
            None => {}
        }
        self.readers.insert(track.id(), reader);
    }

    /// Produce at most `space` frames in the track's format into `convert_out`
    fn convert(&mut self, track: &RecordTrack, reader: &mut TrackReadState, available: usize, space: usize) -> usize {
        let in_channels = self.config.channel_count();
        let out_channels = track.channel_count();
        if self.convert_out.len() < space * out_channels {
            self.convert_out.resize(space * out_channels, 0.0);
        }

        if track.sample_rate() == self.config.sample_rate && reader.resampler.is_none() {
            let frames = available.min(space);
            copy_from_ring(
                &self.rsmp,
                self.rsmp_p2,
                in_channels,
                reader.front,
                frames,
                &mut self.convert_out,
                out_channels,
            );
            reader.front = reader.front.wrapping_add(frames as u32);
            return frames;
        }

        if reader.resampler.is_none() {
            match StreamResampler::new(self.config.sample_rate, track.sample_rate(), out_channels, self.config.frame_count) {
                Ok(r) => reader.resampler = Some(r),
                Err(e) => {
                    log::warn!("record track {}: no resampler: {}", track.id().0, e);
                    return 0;
                }
            }
        }
        let Some(resampler) = reader.resampler.as_mut() else {
            return 0;
        };
        let mut done = 0;
        let mut left = available;
        loop {
            done += resampler.render(&mut self.convert_out[done * out_channels..space * out_channels], space - done);
            if done >= space {
                break;
            }
            let take = resampler.input_frames_needed().min(left);
            if take == 0 {
                break;
            }
            if self.convert_in.len() < take * out_channels {
                self.convert_in.resize(take * out_channels, 0.0);
            }
            copy_from_ring(
                &self.rsmp,
                self.rsmp_p2,
                in_channels,
                reader.front,
                take,
                &mut self.convert_in,
                out_channels,
            );
            resampler.push_interleaved(&self.convert_in[..take * out_channels]);
            reader.front = reader.front.wrapping_add(take as u32);
            left -= take;
        }
        done
    }

    fn process_config_events(&mut self, thread: &RecordThread, st: &mut RecordState) {
        while let Some(event) = thread.pop_config_event_l(st) {
            let result = match &event.kind {
                ConfigEventKind::Io(_) | ConfigEventKind::Prio { .. } => thread.process_common_event_l(st, &event.kind),
                ConfigEventKind::SetParameter(kv) => self.set_parameters_l(thread, st, kv),
                ConfigEventKind::GetParameter(keys) => Ok(ConfigReply::Parameters(self.input.get_parameters(keys))),
                ConfigEventKind::CreateAudioPatch(patch) => self.create_patch_l(thread, st, patch),
                ConfigEventKind::ReleaseAudioPatch(handle) => self.release_patch_l(thread, st, *handle),
            };
            if let Err(e) = &result {
                log::warn!("{}: {} failed: {}", thread.name(), event.kind.name(), e);
            }
            event.complete(result);
        }
    }

    fn apply_starts(&mut self, thread: &RecordThread, st: &mut RecordState) {
        for track in std::mem::take(&mut st.start_requests) {
            if track.is_terminated() {
                track.set_active(false);
                st.remove_track_l(&track);
                continue;
            }
            if st.active_tracks.iter().any(|t| Arc::ptr_eq(t, &track)) {
                continue;
            }
            track.set_active(true);
            track.clear_overflow();
            st.base.wake_lock.acquire(track.uid());
            // capture starts now, nothing older
            self.readers.insert(
                track.id(),
                TrackReadState {
                    front: self.rear,
                    resampler: None,
                },
            );
            log::debug!("{}: record track {} joins the active set", thread.name(), track.id().0);
            st.active_tracks.push(track);
        }
    }

    fn prune_abandoned(&mut self, st: &mut RecordState) {
        let gone: Vec<Arc<RecordTrack>> = st
            .tracks
            .iter()
            .filter(|t| !t.is_terminated() && t.is_client_gone())
            .cloned()
            .collect();
        for track in gone {
            log::debug!("record track {}: client gone", track.id().0);
            track.terminate();
            if !track.is_in_active_set() {
                st.remove_track_l(&track);
            }
        }
    }

    fn remove_tracks_l(&mut self, thread: &RecordThread, st: &mut RecordState, tracks: Vec<Arc<RecordTrack>>) {
        for track in tracks {
            let Some(pos) = st.active_tracks.iter().position(|t| Arc::ptr_eq(t, &track)) else {
                continue;
            };
            st.active_tracks.remove(pos);
            track.set_active(false);
            track.clear_sync_start_event();
            st.base.wake_lock.release(track.uid());
            self.readers.remove(&track.id());
            log::trace!(
                "{}: record track {} leaves the active set ({})",
                thread.name(),
                track.id().0,
                track.state().name()
            );
            if track.is_terminated() {
                st.remove_track_l(&track);
            }
        }
    }

    fn enter_standby(&mut self, thread: &RecordThread) {
        log::debug!("{}: entering standby", thread.name());
        if let Err(e) = self.input.standby() {
            log::warn!("{}: standby failed: {}", thread.name(), e);
        }
        thread.set_standby(true);
    }

    fn set_parameters_l(&mut self, thread: &RecordThread, st: &mut RecordState, kv: &str) -> FlingerResult<ConfigReply> {
        let param = AudioParameter::parse(kv);
        let mut reconfig = false;
        for key in [KEY_SAMPLING_RATE, KEY_FORMAT, KEY_CHANNELS, KEY_FRAME_COUNT] {
            if param.get_int(key)?.is_some() {
                if !st.active_tracks.is_empty() {
                    return Err(FlingerError::invalid_operation(format!(
                        "{}: {} is fixed while capturing",
                        thread.name(),
                        key
                    )));
                }
                reconfig = true;
            }
        }
        if let Some(code) = param.get_int(KEY_FORMAT)? {
            let format = u32::try_from(code).ok().and_then(AudioFormat::from_code);
            if !format.map_or(false, AudioFormat::is_linear_pcm) {
                return Err(FlingerError::bad_value(format!("{}: format {} cannot be captured", thread.name(), code)));
            }
        }
        if let Some(routing) = param.get_int(KEY_ROUTING)? {
            let device = InputDevices::from_bits_truncate(u32::try_from(routing).unwrap_or(0));
            if device != thread.in_device() {
                log::info!("{}: capturing from {:?}", thread.name(), device);
            }
            thread.set_in_device(device);
        }
        if let Some(source) = param.get_int(KEY_INPUT_SOURCE)? {
            st.input_source = u32::try_from(source).unwrap_or(0);
        }

        self.input.set_parameters(kv)?;
        for key in param.keys() {
            if let Some(value) = param.get(key) {
                st.base.param_cache.add(key, value);
            }
        }
        if reconfig {
            self.reconfigure(thread, st);
        }
        Ok(ConfigReply::Done)
    }

    fn reconfigure(&mut self, thread: &RecordThread, st: &mut RecordState) {
        let mut config = self.input.config();
        if config.frame_count == 0 {
            config.frame_count = thread.engine_config().mixer_frame_count;
        }
        st.config = config;
        self.allocate(config);
        log::info!(
            "{}: reconfigured to {} Hz {:?} mask {:#x}, {} frames",
            thread.name(),
            config.sample_rate,
            config.format,
            config.channel_mask.0,
            config.frame_count
        );
        thread.send_io_config_event_l(st, IoEventKind::InputConfigChanged);
    }

    fn create_patch_l(&mut self, thread: &RecordThread, st: &mut RecordState, patch: &AudioPatch) -> FlingerResult<ConfigReply> {
        let device = patch.validate_record(thread.id())?;
        let mut param = AudioParameter::new();
        param.add_int(KEY_ROUTING, device.bits() as i64);
        self.input.set_parameters(&param.to_string())?;
        thread.set_in_device(device);
        let handle = thread.ctx().ids.new_patch();
        st.base.patch = Some(handle);
        log::info!("{}: patch {} from {:?}", thread.name(), handle.0, device);
        Ok(ConfigReply::Patch(handle))
    }

    fn release_patch_l(&mut self, thread: &RecordThread, st: &mut RecordState, handle: PatchHandle) -> FlingerResult<ConfigReply> {
        if st.base.patch != Some(handle) {
            return Err(FlingerError::bad_value(format!("{}: no patch {}", thread.name(), handle.0)));
        }
        let mut param = AudioParameter::new();
        param.add_int(KEY_ROUTING, 0);
        self.input.set_parameters(&param.to_string())?;
        thread.set_in_device(InputDevices::empty());
        st.base.patch = None;
        log::info!("{}: patch {} released", thread.name(), handle.0);
        Ok(ConfigReply::Done)
    }

    fn wait(&self) {
        let thread = self.thread.clone();
        let st = thread.lock();
        if thread.exit_pending() || st.has_work() {
            return;
        }
        log::debug!("{}: going to sleep", thread.name());
        drop(thread.wait_work(st));
        log::debug!("{}: waking up", thread.name());
    }

    pub fn run(mut self) {
        let thread = self.thread.clone();
        log::info!("{}: started", thread.name());
        loop {
            match self.run_cycle() {
                Cycle::Continue(sleep) => {
                    if !sleep.is_zero() {
                        thread::sleep(sleep);
                    }
                }
                Cycle::Idle | Cycle::WaitAsync => self.wait(),
                Cycle::Exit => break,
            }
        }
        self.shutdown();
        log::info!("{}: exited", thread.name());
    }

    fn shutdown(&mut self) {
        let thread = self.thread.clone();
        let mut st = thread.lock();
        st.base.abort_config_events();
        st.base.wake_lock.release_all();
        for track in std::mem::take(&mut st.active_tracks) {
            track.clear_sync_start_event();
            track.set_active(false);
        }
        self.readers.clear();
        if !thread.standby() {
            self.enter_standby(&thread);
        }
    }

    pub fn spawn(self) -> FlingerResult<JoinHandle<()>> {
        let name = self.thread.name().to_string();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run())
            .map_err(|e| FlingerError::NoInit(format!("cannot spawn {}: {}", name, e)))
    }
}

/// Copy `frames` frames starting at `front` out of the ring, remapping channels
fn copy_from_ring(
    ring: &[f32],
    p2: usize,
    in_channels: usize,
    front: u32,
    frames: usize,
    dst: &mut [f32],
    out_channels: usize,
) {
    let mut done = 0;
    while done < frames {
        let index = (front as usize).wrapping_add(done) & (p2 - 1);
        let n = (frames - done).min(p2 - index);
        adjust_channels(
            &ring[index * in_channels..(index + n) * in_channels],
            in_channels,
            &mut dst[done * out_channels..(done + n) * out_channels],
            out_channels,
            n,
        );
        done += n;
    }
}
