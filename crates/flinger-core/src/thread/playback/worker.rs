//! Playback worker: owns the output stream and runs the mix loop
//!
//! Each cycle takes the thread lock once to apply queued config events and
//! client requests and to prepare the active set, releases it, then mixes
//! and writes without holding it. A cycle that has nothing to write sleeps
//! for part of a period instead; after the standby delay with no active
//! track the stream goes to standby and the worker waits for work.

use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::devices::OutputDevices;
use crate::effects::EffectChain;
use crate::error::{FlingerError, FlingerResult};
use crate::hal::StreamOut;
use crate::params::{AudioParameter, KEY_CHANNELS, KEY_FORMAT, KEY_FRAME_COUNT, KEY_ROUTING, KEY_SAMPLING_RATE};
use crate::track::{Track, TrackEvent};
use crate::types::{AudioFormat, ChannelMask, IoHandle, OutputFlags, StreamConfig};

use super::super::async_callback::{AsyncCallbackTarget, AsyncCallbackThread};
use super::super::base::ThreadContext;
use super::super::config_event::{AudioPatch, ConfigEventKind, ConfigReply, IoEventKind};
use super::mixer::{MixInput, Mixer};
use super::{MixerState, OutputKind, OutputTrack, PlaybackState, PlaybackThread, TrackRequest};

/// What the caller of [`PlaybackWorker::run_cycle`] should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// Run again after sleeping this long (zero: right away)
    Continue(Duration),
    /// Nothing to do until a client or config event wakes the thread
    Idle,
    /// A non-blocking write or drain is outstanding
    WaitAsync,
    /// The thread was asked to exit
    Exit,
}

pub struct PlaybackWorker {
    pub(super) thread: Arc<PlaybackThread>,
    /// `None` on a duplicating thread
    pub(super) output: Option<Box<dyn StreamOut>>,
    pub(super) config: StreamConfig,
    pub(super) mixer: Mixer,
    pub(super) mix_inputs: Vec<MixInput>,
    pub(super) sink_buffer: Vec<u8>,
    pub(super) bytes_remaining: usize,
    pub(super) current_write_length: usize,
    pub(super) paused_write_length: usize,
    pub(super) paused_bytes_remaining: usize,
    /// Bytes written since the stream last left standby
    pub(super) bytes_written: u64,
    pub(super) hw_paused: bool,
    pub(super) flush_pending: bool,
    pub(super) previous_track: Weak<Track>,
    pub(super) direct_track: Option<Arc<Track>>,
    pub(super) last_volume: Option<(f32, f32)>,
    callback: Option<Arc<AsyncCallbackThread>>,
    standby_deadline: Instant,
    /// The last cycle slept instead of writing
    slept: bool,
    /// Frames handed to each output track by the next duplicating write
    dup_write_frames: usize,
    output_tracks: Vec<Arc<Mutex<OutputTrack>>>,
    dup_wait: Duration,
    total_frames_written: u64,
}

impl PlaybackWorker {
    /// Create the thread for an open output stream, with its worker
    ///
    /// A stream that accepts a completion callback is driven in
    /// non-blocking mode.
    pub fn open(
        id: IoHandle,
        ctx: ThreadContext,
        mut output: Box<dyn StreamOut>,
        flags: OutputFlags,
    ) -> FlingerResult<(Arc<PlaybackThread>, Self)> {
        let kind = OutputKind::from_flags(flags);
        let mut config = output.config();
        if config.frame_count == 0 {
            config.frame_count = ctx.config.mixer_frame_count;
        }
        if kind.is_mixing() && (!config.format.is_linear_pcm() || !config.channel_mask.is_valid()) {
            return Err(FlingerError::bad_value(format!(
                "mixer output needs linear PCM, got {:?} mask {:#x}",
                config.format, config.channel_mask.0
            )));
        }
        let latency_ms = output.latency_ms();
        let thread = PlaybackThread::new(id, kind, ctx, config, latency_ms);

        let mut callback = None;
        if kind == OutputKind::Offload || flags.contains(OutputFlags::NON_BLOCKING) {
            let target: Weak<PlaybackThread> = Arc::downgrade(&thread);
            let target: Weak<dyn AsyncCallbackTarget> = target;
            let cb = AsyncCallbackThread::new(target);
            if output.set_callback(cb.stream_callback()) {
                thread.lock().use_async_write = true;
                callback = Some(cb);
            } else {
                log::debug!("{}: stream has no callback, writing blocking", thread.name());
            }
        }

        let mut worker = Self::with_thread(thread.clone(), Some(output), config);
        worker.callback = callback;
        Ok((thread, worker))
    }

    /// Create a duplicating thread mixing in the format of `main`
    pub fn open_duplicating(id: IoHandle, ctx: ThreadContext, main: &PlaybackThread) -> (Arc<PlaybackThread>, Self) {
        let config = main.config();
        let thread = PlaybackThread::new(id, OutputKind::Duplicating, ctx, config, main.latency_ms());
        let worker = Self::with_thread(thread.clone(), None, config);
        (thread, worker)
    }

    fn with_thread(thread: Arc<PlaybackThread>, output: Option<Box<dyn StreamOut>>, config: StreamConfig) -> Self {
        let ramp_frames = thread.engine_config().ramp_frames;
        Self {
            output,
            config,
            mixer: Mixer::new(config, ramp_frames),
            mix_inputs: Vec::new(),
            sink_buffer: vec![0; config.frame_count * config.frame_size()],
            bytes_remaining: 0,
            current_write_length: 0,
            paused_write_length: 0,
            paused_bytes_remaining: 0,
            bytes_written: 0,
            hw_paused: false,
            flush_pending: false,
            previous_track: Weak::new(),
            direct_track: None,
            last_volume: None,
            callback: None,
            // a fresh stream starts in standby: no grace period
            standby_deadline: Instant::now(),
            slept: false,
            dup_write_frames: 0,
            output_tracks: Vec::new(),
            dup_wait: Duration::ZERO,
            total_frames_written: 0,
            thread,
        }
    }

    #[inline]
    pub fn thread(&self) -> &Arc<PlaybackThread> {
        &self.thread
    }

    /// Replay completions reported by a non-blocking stream; for driving the loop by hand
    pub fn poll_callbacks(&self) -> bool {
        self.callback.as_ref().map_or(false, |cb| cb.step())
    }

    #[inline]
    pub(super) fn local_frames_written(&self) -> u64 {
        self.bytes_written / self.config.frame_size().max(1) as u64
    }

    fn period(&self) -> Duration {
        let rate = self.config.sample_rate.max(1) as u64;
        Duration::from_micros(self.config.frame_count as u64 * 1_000_000 / rate)
    }

    fn active_sleep(&self) -> Duration {
        match self.thread.kind() {
            OutputKind::Duplicating => self.dup_wait / 2,
            OutputKind::Direct | OutputKind::Offload if !self.config.format.is_linear_pcm() => {
                Duration::from_millis(10)
            }
            _ => self.period(),
        }
    }

    fn idle_sleep(&self) -> Duration {
        if !self.config.format.is_linear_pcm() {
            return Duration::from_millis(10);
        }
        self.period() / 2
    }

    /// Tell the callback thread which sequences the stream must acknowledge
    pub(super) fn publish_sequences(&self, st: &PlaybackState) {
        if let Some(cb) = &self.callback {
            cb.set_write_blocked(st.write_ack_sequence);
            cb.set_draining(st.drain_sequence);
        }
    }

    // ─────────────────────────────────────────────────────────
    // Cycle
    // ─────────────────────────────────────────────────────────

    /// Run one iteration of the playback loop
    pub fn run_cycle(&mut self) -> Cycle {
        let thread = self.thread.clone();
        let mut st = thread.lock();

        self.process_config_events(&thread, &mut st);
        if thread.exit_pending() {
            return Cycle::Exit;
        }
        self.apply_requests(&thread, &mut st);
        self.prune_abandoned(&mut st);

        if st.waiting_async() {
            return Cycle::WaitAsync;
        }

        if (st.active_tracks.is_empty() && Instant::now() >= self.standby_deadline) || thread.is_suspended() {
            if !thread.standby() {
                self.enter_standby(&thread, &mut st);
            }
            if st.active_tracks.is_empty() && !st.has_work() {
                st.mixer_state = MixerState::Idle;
                return Cycle::Idle;
            }
        }

        let state = match thread.kind() {
            OutputKind::Mixer | OutputKind::Duplicating => self.prepare_mixer(&thread, &mut st),
            OutputKind::Direct | OutputKind::Offload => self.prepare_direct(&thread, &mut st),
        };
        st.mixer_state = state;
        let chains: Vec<Arc<Mutex<EffectChain>>> = st.base.effect_chains().to_vec();
        let use_async = st.use_async_write;
        if thread.kind() == OutputKind::Duplicating {
            self.output_tracks = st.output_tracks.clone();
            self.dup_wait = Duration::from_millis(st.wait_time_ms.min(1000));
        }
        drop(st);

        let mut sleep = Duration::ZERO;
        if self.bytes_remaining == 0 {
            self.current_write_length = 0;
            match state {
                MixerState::TracksReady => self.mix(&thread, &chains),
                MixerState::DrainTrack | MixerState::DrainAll => {}
                _ => sleep = self.sleep_time(state),
            }
        }

        if thread.is_suspended() && sleep.is_zero() && self.bytes_remaining > 0 {
            // pretend the stream took it
            self.account_written(self.bytes_remaining);
            self.bytes_remaining = 0;
            sleep = self.active_sleep();
        }

        if sleep.is_zero() {
            if self.bytes_remaining > 0 {
                self.write(&thread, use_async);
            } else if matches!(state, MixerState::DrainTrack | MixerState::DrainAll) {
                self.drain(&thread, state);
            }
        }
        self.slept = !sleep.is_zero();
        Cycle::Continue(sleep)
    }

    fn process_config_events(&mut self, thread: &PlaybackThread, st: &mut PlaybackState) {
        while let Some(event) = thread.pop_config_event_l(st) {
            let result = match &event.kind {
                ConfigEventKind::Io(_) | ConfigEventKind::Prio { .. } => thread.process_common_event_l(st, &event.kind),
                ConfigEventKind::SetParameter(kv) => self.set_parameters_l(thread, st, kv),
                ConfigEventKind::GetParameter(keys) => Ok(ConfigReply::Parameters(
                    self.output.as_ref().map(|o| o.get_parameters(keys)).unwrap_or_default(),
                )),
                ConfigEventKind::CreateAudioPatch(patch) => self.create_patch_l(thread, st, patch),
                ConfigEventKind::ReleaseAudioPatch(handle) => self.release_patch_l(thread, st, *handle),
            };
            if let Err(e) = &result {
                log::warn!("{}: {} failed: {}", thread.name(), event.kind.name(), e);
            }
            event.complete(result);
        }
    }

    fn apply_requests(&mut self, thread: &PlaybackThread, st: &mut PlaybackState) {
        let cfg = thread.engine_config();
        // an offloaded track starves on the offload budget from its first cycle
        let startup_retries = if thread.kind() == OutputKind::Offload {
            cfg.max_track_retries_offload
        } else {
            cfg.max_track_startup_retries
        };
        for request in std::mem::take(&mut st.requests) {
            match request {
                TrackRequest::Start(track) => {
                    if track.is_terminated() {
                        track.set_active(false);
                        st.remove_track_l(&track);
                        continue;
                    }
                    if st.active_tracks.iter().any(|t| Arc::ptr_eq(t, &track)) {
                        continue;
                    }
                    track.on_added_to_active(startup_retries);
                    st.base.wake_lock.acquire(track.uid());
                    st.latest_active = Arc::downgrade(&track);
                    self.mixer.forget(track.id());
                    log::debug!("{}: track {} joins the active set", thread.name(), track.id().0);
                    st.active_tracks.push(track);
                }
                TrackRequest::Flush { track, position } => {
                    let frames = track.reader().flush_to(position);
                    self.mixer.reset_track(track.id());
                    log::trace!("{}: track {} flushed {} frames", thread.name(), track.id().0, frames);
                }
            }
        }
    }

    /// Terminate tracks whose client went away without destroying them
    fn prune_abandoned(&mut self, st: &mut PlaybackState) {
        let gone: Vec<Arc<Track>> = st
            .tracks
            .iter()
            .filter(|t| !t.is_terminated() && !t.is_output_track() && t.is_client_gone())
            .cloned()
            .collect();
        for track in gone {
            log::debug!("track {}: client gone", track.id().0);
            track.terminate();
            if !track.is_in_active_set() {
                st.remove_track_l(&track);
            }
        }
    }

    /// Take finished tracks out of the active set; terminated ones are dropped
    pub(super) fn remove_tracks_l(&mut self, thread: &PlaybackThread, st: &mut PlaybackState, tracks: Vec<Arc<Track>>) {
        for track in tracks {
            let Some(pos) = st.active_tracks.iter().position(|t| Arc::ptr_eq(t, &track)) else {
                continue;
            };
            st.active_tracks.remove(pos);
            track.set_active(false);
            st.base.wake_lock.release(track.uid());
            self.mixer.forget(track.id());
            log::trace!(
                "{}: track {} leaves the active set ({})",
                thread.name(),
                track.id().0,
                track.state().name()
            );
            if track.is_terminated() {
                st.remove_track_l(&track);
            }
        }
    }

    /// How long to wait when there is nothing to mix; zero means write silence
    fn sleep_time(&mut self, state: MixerState) -> Duration {
        let kind = self.thread.kind();
        if !kind.is_mixing() && self.hw_paused {
            return self.idle_sleep();
        }
        if !self.slept {
            return if state == MixerState::TracksEnabled {
                self.active_sleep()
            } else {
                self.idle_sleep()
            };
        }
        let written = self.bytes_written > 0;
        let silence = match kind {
            OutputKind::Mixer => written || state == MixerState::TracksEnabled,
            OutputKind::Duplicating => written,
            OutputKind::Direct | OutputKind::Offload => written && self.config.format.is_linear_pcm(),
        };
        if !silence {
            return self.idle_sleep();
        }
        self.sink_buffer.fill(0);
        self.current_write_length = self.sink_buffer.len();
        self.bytes_remaining = self.current_write_length;
        if kind == OutputKind::Duplicating {
            // an idle duplicator only flushes its overflow queues
            self.dup_write_frames = if state == MixerState::TracksEnabled {
                self.config.frame_count
            } else {
                0
            };
        }
        Duration::ZERO
    }

    fn mix(&mut self, thread: &PlaybackThread, chains: &[Arc<Mutex<EffectChain>>]) {
        match thread.kind() {
            OutputKind::Mixer => {
                self.mixer.mix(&self.mix_inputs, chains, &mut self.sink_buffer);
                self.current_write_length = self.sink_buffer.len();
            }
            OutputKind::Duplicating => {
                if self.outputs_ready() {
                    self.mixer.mix(&self.mix_inputs, chains, &mut self.sink_buffer);
                } else {
                    self.sink_buffer.fill(0);
                }
                self.dup_write_frames = self.config.frame_count;
                self.current_write_length = self.sink_buffer.len();
            }
            OutputKind::Direct | OutputKind::Offload => self.mix_direct(),
        }
        self.mix_inputs.clear();
        self.bytes_remaining = self.current_write_length;
        self.standby_deadline = Instant::now() + thread.engine_config().standby_delay();
    }

    /// Every downstream output is awake (or deliberately suspended)
    fn outputs_ready(&self) -> bool {
        self.output_tracks.iter().all(|ot| {
            let ot = crate::lock(ot);
            let downstream = ot.thread();
            !downstream.standby() || downstream.is_suspended()
        })
    }

    fn account_written(&mut self, bytes: usize) {
        self.bytes_written += bytes as u64;
        self.total_frames_written += (bytes / self.config.frame_size().max(1)) as u64;
        self.thread.set_frames_written(self.total_frames_written);
    }

    fn write(&mut self, thread: &PlaybackThread, use_async: bool) {
        let start = self.current_write_length.saturating_sub(self.bytes_remaining);
        let end = self.current_write_length.min(self.sink_buffer.len());

        if thread.kind() == OutputKind::Duplicating {
            let frames = self.dup_write_frames.min((end - start) / self.config.frame_size().max(1));
            let data = &self.sink_buffer[start..start + frames * self.config.frame_size()];
            for ot in &self.output_tracks {
                crate::lock(ot).write(data, self.dup_wait);
            }
            thread.set_standby(false);
            let len = self.bytes_remaining;
            self.account_written(len);
            self.bytes_remaining = 0;
            return;
        }

        if self.output.is_none() {
            self.bytes_remaining = 0;
            return;
        }
        if use_async {
            let mut st = thread.lock();
            st.write_ack_sequence += 2;
            st.write_ack_sequence |= 1;
            self.publish_sequences(&st);
        }

        let result = match self.output.as_mut() {
            Some(output) => output.write(&self.sink_buffer[start..end]),
            None => return,
        };
        match result {
            Ok(n) => {
                if use_async && n >= self.bytes_remaining {
                    let mut st = thread.lock();
                    st.write_ack_sequence &= !1;
                    self.publish_sequences(&st);
                }
                let n = n.min(self.bytes_remaining);
                self.bytes_remaining -= n;
                self.account_written(n);
                thread.set_standby(false);
            }
            Err(e) => {
                log::warn!("{}: write failed: {}", thread.name(), e);
                self.bytes_remaining = 0;
                let mut st = thread.lock();
                if use_async {
                    st.write_ack_sequence &= !1;
                    self.publish_sequences(&st);
                }
                if let Some(track) = self.previous_track.upgrade() {
                    if thread.kind() == OutputKind::Offload && track.decrement_retry() <= 0 {
                        track.notify(TrackEvent::Error(e.clone()));
                        self.remove_tracks_l(thread, &mut st, vec![track]);
                    }
                }
                self.enter_standby(thread, &mut st);
            }
        }
    }

    /// Release the stream; pending completions are superseded
    pub(super) fn enter_standby(&mut self, thread: &PlaybackThread, st: &mut PlaybackState) {
        log::debug!("{}: entering standby", thread.name());
        match self.output.as_mut() {
            Some(output) => {
                if let Err(e) = output.standby() {
                    log::warn!("{}: standby failed: {}", thread.name(), e);
                }
            }
            None => {
                for ot in &st.output_tracks {
                    crate::lock(ot).stop();
                }
            }
        }
        thread.set_standby(true);
        if st.use_async_write {
            st.write_ack_sequence = (st.write_ack_sequence + 2) & !1;
            st.drain_sequence = (st.drain_sequence + 2) & !1;
            self.publish_sequences(st);
        }
        self.hw_paused = false;
    }

    // ─────────────────────────────────────────────────────────
    // Config events
    // ─────────────────────────────────────────────────────────

    fn set_parameters_l(&mut self, thread: &PlaybackThread, st: &mut PlaybackState, kv: &str) -> FlingerResult<ConfigReply> {
        let param = AudioParameter::parse(kv);
        let mut reconfig = false;

        if thread.kind().is_mixing() {
            if param.get_int(KEY_SAMPLING_RATE)?.is_some() {
                reconfig = true;
            }
            if let Some(code) = param.get_int(KEY_FORMAT)? {
                let format = u32::try_from(code).ok().and_then(AudioFormat::from_code);
                if !format.map_or(false, AudioFormat::is_linear_pcm) {
                    return Err(FlingerError::bad_value(format!("{}: format {} cannot be mixed", thread.name(), code)));
                }
                reconfig = true;
            }
            if let Some(mask) = param.get_int(KEY_CHANNELS)? {
                let valid = u32::try_from(mask).map(ChannelMask).map_or(false, ChannelMask::is_valid);
                if !valid {
                    return Err(FlingerError::bad_value(format!("{}: channel mask {:#x}", thread.name(), mask)));
                }
                reconfig = true;
            }
        }
        if param.get_int(KEY_FRAME_COUNT)?.is_some() {
            if !st.tracks.is_empty() {
                return Err(FlingerError::invalid_operation(format!(
                    "{}: frame count is fixed while tracks are attached",
                    thread.name()
                )));
            }
            reconfig = true;
        }
        if let Some(routing) = param.get_int(KEY_ROUTING)? {
            let devices = OutputDevices::from_bits_truncate(u32::try_from(routing).unwrap_or(0));
            if devices != thread.out_device() {
                log::info!("{}: routing {:?}", thread.name(), devices);
            }
            thread.set_out_device(devices);
        }

        if self.output.is_some() {
            let mut status = self.output.as_mut().map_or(Ok(()), |o| o.set_parameters(kv));
            if matches!(status, Err(FlingerError::InvalidOperation(_))) && !thread.standby() {
                // the stream refuses while running: release it and retry
                self.enter_standby(thread, st);
                status = self.output.as_mut().map_or(Ok(()), |o| o.set_parameters(kv));
            }
            status?;
        } else if reconfig {
            return Err(FlingerError::invalid_operation(format!(
                "{}: format follows the duplicated outputs",
                thread.name()
            )));
        }

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

    /// Re-read the stream format and rebuild everything sized by it
    fn reconfigure(&mut self, thread: &PlaybackThread, st: &mut PlaybackState) {
        let Some(output) = self.output.as_ref() else {
            return;
        };
        let mut config = output.config();
        if config.frame_count == 0 {
            config.frame_count = thread.engine_config().mixer_frame_count;
        }
        st.config = config;
        st.latency_ms = output.latency_ms();
        self.config = config;
        self.sink_buffer = vec![0; config.frame_count * config.frame_size()];
        self.mixer.reconfigure(config);
        self.bytes_remaining = 0;
        self.current_write_length = 0;
        log::info!(
            "{}: reconfigured to {} Hz {:?} mask {:#x}, {} frames",
            thread.name(),
            config.sample_rate,
            config.format,
            config.channel_mask.0,
            config.frame_count
        );
        thread.send_io_config_event_l(st, IoEventKind::OutputConfigChanged);
    }

    fn create_patch_l(&mut self, thread: &PlaybackThread, st: &mut PlaybackState, patch: &AudioPatch) -> FlingerResult<ConfigReply> {
        let devices = patch.validate_playback(thread.id())?;
        if let Some(output) = self.output.as_mut() {
            let mut param = AudioParameter::new();
            param.add_int(KEY_ROUTING, devices.bits() as i64);
            output.set_parameters(&param.to_string())?;
        }
        thread.set_out_device(devices);
        let handle = thread.ctx().ids.new_patch();
        st.base.patch = Some(handle);
        log::info!("{}: patch {} to {:?}", thread.name(), handle.0, devices);
        Ok(ConfigReply::Patch(handle))
    }

    fn release_patch_l(
        &mut self,
        thread: &PlaybackThread,
        st: &mut PlaybackState,
        handle: crate::types::PatchHandle,
    ) -> FlingerResult<ConfigReply> {
        if st.base.patch != Some(handle) {
            return Err(FlingerError::bad_value(format!("{}: no patch {}", thread.name(), handle.0)));
        }
        if let Some(output) = self.output.as_mut() {
            let mut param = AudioParameter::new();
            param.add_int(KEY_ROUTING, 0);
            output.set_parameters(&param.to_string())?;
        }
        thread.set_out_device(OutputDevices::empty());
        st.base.patch = None;
        log::info!("{}: patch {} released", thread.name(), handle.0);
        Ok(ConfigReply::Done)
    }

    // ─────────────────────────────────────────────────────────
    // Loop
    // ─────────────────────────────────────────────────────────

    /// Block until a client, config event or stream callback has work
    fn wait(&mut self, for_async: bool) {
        let thread = self.thread.clone();
        let st = thread.lock();
        if thread.exit_pending() {
            return;
        }
        if for_async {
            if st.waiting_async() {
                drop(thread.wait_work(st));
            }
            return;
        }
        if st.has_work() {
            return;
        }
        log::debug!("{}: going to sleep", thread.name());
        drop(thread.wait_work(st));
        log::debug!("{}: waking up", thread.name());
        self.bytes_written = 0;
        self.bytes_remaining = 0;
        self.standby_deadline = Instant::now() + thread.engine_config().standby_delay();
        self.slept = true;
    }

    pub fn run(mut self) {
        let thread = self.thread.clone();
        log::info!("{}: started ({:?})", thread.name(), thread.kind());
        let callback_thread = match &self.callback {
            Some(cb) => match cb.spawn(thread.name()) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    log::error!("{}: {}", thread.name(), e);
                    None
                }
            },
            None => None,
        };

        loop {
            match self.run_cycle() {
                Cycle::Continue(sleep) => {
                    if !sleep.is_zero() {
                        thread::sleep(sleep);
                    }
                }
                Cycle::Idle => self.wait(false),
                Cycle::WaitAsync => self.wait(true),
                Cycle::Exit => break,
            }
        }

        self.shutdown();
        if let (Some(cb), Some(handle)) = (&self.callback, callback_thread) {
            cb.exit();
            let _ = handle.join();
        }
        log::info!("{}: exited", thread.name());
    }

    /// Leave nothing behind: abort waiters, drop the wake lock, release the stream
    fn shutdown(&mut self) {
        let thread = self.thread.clone();
        let mut st = thread.lock();
        st.base.abort_config_events();
        st.base.wake_lock.release_all();
        for track in std::mem::take(&mut st.active_tracks) {
            track.set_active(false);
        }
        if !thread.standby() {
            self.enter_standby(&thread, &mut st);
        }
    }

    /// Run the loop on a named OS thread
    pub fn spawn(self) -> FlingerResult<JoinHandle<()>> {
        let name = self.thread.name().to_string();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run())
            .map_err(|e| FlingerError::NoInit(format!("cannot spawn {}: {}", name, e)))
    }
}
