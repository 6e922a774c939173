//! The engine facade
//!
//! [`AudioFlinger`] owns every open stream thread, keyed by io handle. It
//! opens and closes streams, creates tracks on them and fans global settings
//! (master volume, stream volume, parameters) out to the threads. Each call
//! takes the facade lock only to look threads up; anything that waits on a
//! worker runs after it is released.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use crossbeam::channel::Receiver;

use crate::config::EngineConfig;
use crate::devices::{InputDevices, OutputDevices};
use crate::effects::AudioEffect;
use crate::error::{FlingerError, FlingerResult};
use crate::hal::{StreamIn, StreamOut};
use crate::ids::UniqueIdUse;
use crate::sync_event::{SyncEvent, SyncEventCallback, SyncEventType};
use crate::thread::{
    AudioPatch, IoConfigEvent, IoEventKind, OutputKind, PatchEndpoint, PlaybackThread, PlaybackWorker, RecordParams,
    RecordThread, RecordWorker, ThreadContext, ThreadState, TrackParams,
};
use crate::track::{RecordHandle, RecordTrack, TrackHandle};
use crate::types::{IoHandle, OutputFlags, PatchHandle, SessionId, StreamType};

struct OutputEntry {
    thread: Arc<PlaybackThread>,
    join: Option<JoinHandle<()>>,
}

struct InputEntry {
    thread: Arc<RecordThread>,
    join: Option<JoinHandle<()>>,
}

struct FlingerState {
    outputs: BTreeMap<IoHandle, OutputEntry>,
    inputs: BTreeMap<IoHandle, InputEntry>,
    master_volume: f32,
    master_mute: bool,
    stream_volumes: [f32; StreamType::COUNT],
    stream_mutes: [bool; StreamType::COUNT],
    /// Events whose trigger session has no playback track yet
    pending_sync_events: Vec<Arc<SyncEvent>>,
    patches: BTreeMap<PatchHandle, IoHandle>,
}

pub struct AudioFlinger {
    ctx: ThreadContext,
    state: Mutex<FlingerState>,
}

impl AudioFlinger {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_context(ThreadContext::new(config))
    }

    /// Build on a context carrying a power manager or scheduling policy
    pub fn with_context(ctx: ThreadContext) -> Self {
        log::info!("AudioFlinger: starting");
        Self {
            ctx,
            state: Mutex::new(FlingerState {
                outputs: BTreeMap::new(),
                inputs: BTreeMap::new(),
                master_volume: 1.0,
                master_mute: false,
                stream_volumes: [1.0; StreamType::COUNT],
                stream_mutes: [false; StreamType::COUNT],
                pending_sync_events: Vec::new(),
                patches: BTreeMap::new(),
            }),
        }
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FlingerState> {
        crate::lock(&self.state)
    }

    pub fn playback_thread(&self, io: IoHandle) -> Option<Arc<PlaybackThread>> {
        self.lock().outputs.get(&io).map(|e| e.thread.clone())
    }

    pub fn record_thread(&self, io: IoHandle) -> Option<Arc<RecordThread>> {
        self.lock().inputs.get(&io).map(|e| e.thread.clone())
    }

    fn output(&self, io: IoHandle) -> FlingerResult<Arc<PlaybackThread>> {
        self.playback_thread(io)
            .ok_or_else(|| FlingerError::bad_value(format!("no output {}", io.0)))
    }

    fn input(&self, io: IoHandle) -> FlingerResult<Arc<RecordThread>> {
        self.record_thread(io)
            .ok_or_else(|| FlingerError::bad_value(format!("no input {}", io.0)))
    }

    pub fn outputs(&self) -> Vec<IoHandle> {
        self.lock().outputs.keys().copied().collect()
    }

    pub fn inputs(&self) -> Vec<IoHandle> {
        self.lock().inputs.keys().copied().collect()
    }

    /// I/O configuration notifications from every thread
    pub fn subscribe_io(&self) -> Receiver<IoConfigEvent> {
        self.ctx.io.subscribe()
    }

    pub fn new_audio_unique_id(&self, id_use: UniqueIdUse) -> u32 {
        self.ctx.ids.next_unique_id(id_use)
    }

    // ─────────────────────────────────────────────────────────
    // Outputs
    // ─────────────────────────────────────────────────────────

    /// Start a playback thread on `stream`, routed to `devices`
    pub fn open_output(
        &self,
        stream: Box<dyn StreamOut>,
        flags: OutputFlags,
        devices: OutputDevices,
    ) -> FlingerResult<IoHandle> {
        let id = self.ctx.ids.new_output();
        let (thread, worker) = PlaybackWorker::open(id, self.ctx.clone(), stream, flags)?;
        thread.set_out_device(devices);
        let mut st = self.lock();
        self.apply_volumes(&st, &thread);
        let join = worker.spawn()?;
        {
            let mut ts = thread.lock();
            thread.send_io_config_event_l(&mut ts, IoEventKind::OutputOpened);
        }
        log::info!("AudioFlinger: output {} opened ({:?}, {:?})", id.0, thread.kind(), devices);
        st.outputs.insert(
            id,
            OutputEntry {
                thread,
                join: Some(join),
            },
        );
        Ok(id)
    }

    /// Mirror the mix of `output1` onto `output2` through a duplicating thread
    pub fn open_duplicate_output(&self, output1: IoHandle, output2: IoHandle) -> FlingerResult<IoHandle> {
        let first = self.output(output1)?;
        let second = self.output(output2)?;
        if first.kind() != OutputKind::Mixer || second.kind() != OutputKind::Mixer {
            return Err(FlingerError::invalid_operation(format!(
                "outputs {} and {} must both be mixers",
                output1.0, output2.0
            )));
        }
        let id = self.ctx.ids.new_output();
        let (thread, worker) = PlaybackWorker::open_duplicating(id, self.ctx.clone(), &first);
        thread.add_output_track(&first)?;
        thread.add_output_track(&second)?;
        thread.set_out_device(first.out_device() | second.out_device());
        let mut st = self.lock();
        self.apply_volumes(&st, &thread);
        let join = worker.spawn()?;
        {
            let mut ts = thread.lock();
            thread.send_io_config_event_l(&mut ts, IoEventKind::OutputOpened);
        }
        log::info!(
            "AudioFlinger: duplicating output {} on {} and {}",
            id.0,
            output1.0,
            output2.0
        );
        st.outputs.insert(
            id,
            OutputEntry {
                thread,
                join: Some(join),
            },
        );
        Ok(id)
    }

    pub fn close_output(&self, io: IoHandle) -> FlingerResult<()> {
        let (entry, duplicators) = {
            let mut st = self.lock();
            let entry = st
                .outputs
                .remove(&io)
                .ok_or_else(|| FlingerError::bad_value(format!("no output {}", io.0)))?;
            let duplicators: Vec<Arc<PlaybackThread>> = st
                .outputs
                .values()
                .filter(|e| e.thread.kind() == OutputKind::Duplicating)
                .map(|e| e.thread.clone())
                .collect();
            (entry, duplicators)
        };
        log::info!("AudioFlinger: closing output {}", io.0);

        for dup in &duplicators {
            dup.remove_output_track(io);
        }
        let thread = entry.thread;
        if thread.kind() == OutputKind::Duplicating {
            thread.clear_output_tracks();
        }
        let desc = thread.lock().io_descriptor(io);
        thread.invalidate_tracks(None);
        thread.exit();
        if let Some(join) = entry.join {
            if join.join().is_err() {
                log::error!("AudioFlinger: output {} worker panicked", io.0);
            }
        }
        self.ctx.io.publish(IoConfigEvent {
            kind: IoEventKind::OutputClosed,
            desc,
        });
        Ok(())
    }

    /// Keep the thread mixing but stop writing to its stream
    pub fn suspend_output(&self, io: IoHandle) -> FlingerResult<()> {
        self.output(io)?.suspend();
        Ok(())
    }

    pub fn restore_output(&self, io: IoHandle) -> FlingerResult<()> {
        self.output(io)?.restore();
        Ok(())
    }

    // ─────────────────────────────────────────────────────────
    // Inputs
    // ─────────────────────────────────────────────────────────

    pub fn open_input(&self, stream: Box<dyn StreamIn>, device: InputDevices) -> FlingerResult<IoHandle> {
        let id = self.ctx.ids.new_input();
        let (thread, worker) = RecordWorker::open(id, self.ctx.clone(), stream)?;
        thread.set_in_device(device);
        let join = worker.spawn()?;
        {
            let mut ts = thread.lock();
            thread.send_io_config_event_l(&mut ts, IoEventKind::InputOpened);
        }
        log::info!("AudioFlinger: input {} opened ({:?})", id.0, device);
        self.lock().inputs.insert(
            id,
            InputEntry {
                thread,
                join: Some(join),
            },
        );
        Ok(id)
    }

    pub fn close_input(&self, io: IoHandle) -> FlingerResult<()> {
        let entry = self
            .lock()
            .inputs
            .remove(&io)
            .ok_or_else(|| FlingerError::bad_value(format!("no input {}", io.0)))?;
        log::info!("AudioFlinger: closing input {}", io.0);
        let thread = entry.thread;
        let desc = thread.lock().io_descriptor(io);
        thread.invalidate_tracks();
        thread.exit();
        if let Some(join) = entry.join {
            if join.join().is_err() {
                log::error!("AudioFlinger: input {} worker panicked", io.0);
            }
        }
        self.ctx.io.publish(IoConfigEvent {
            kind: IoEventKind::InputClosed,
            desc,
        });
        Ok(())
    }

    // ─────────────────────────────────────────────────────────
    // Tracks
    // ─────────────────────────────────────────────────────────

    /// Create a playback track on `output`
    ///
    /// Sync events waiting for the track's session are attached to it.
    pub fn create_track(&self, output: IoHandle, params: TrackParams) -> FlingerResult<TrackHandle> {
        let thread = self.output(output)?;
        let (track, writer, events) = thread.create_track(params)?;

        let waiting: Vec<Arc<SyncEvent>> = {
            let mut st = self.lock();
            st.pending_sync_events.retain(|e| !e.is_cancelled() && !e.is_triggered());
            let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut st.pending_sync_events)
                .into_iter()
                .partition(|e| e.trigger_session() == track.session());
            st.pending_sync_events = rest;
            matching
        };
        for event in waiting {
            thread.set_sync_event(&event)?;
        }
        Ok(TrackHandle::new(track, writer, events, thread))
    }

    /// Create a capture track on `input`
    pub fn open_record(&self, input: IoHandle, params: RecordParams) -> FlingerResult<RecordHandle> {
        let thread = self.input(input)?;
        let (track, reader, events) = thread.create_record_track(params)?;
        Ok(RecordHandle::new(track, reader, events, thread))
    }

    /// Start capture; with `trigger`, delivery waits until that session's playback completes
    pub fn start_record(&self, handle: &RecordHandle, trigger: Option<SessionId>) -> FlingerResult<()> {
        let Some(trigger) = trigger else {
            return handle.start(None);
        };
        let track: Weak<RecordTrack> = Arc::downgrade(handle.track());
        let drop_frames = 2 * handle.thread().config().frame_count as i64;
        let callback: SyncEventCallback = Box::new(move |event: &SyncEvent| {
            if let Some(track) = track.upgrade() {
                track.handle_sync_start_event(event, drop_frames);
            }
        });
        let event = self.create_sync_event(
            SyncEventType::PresentationComplete,
            trigger,
            handle.track().session(),
            callback,
        )?;
        handle.start(Some(event))
    }

    /// Register an event on the playback track of `trigger`, or park it until one exists
    pub fn create_sync_event(
        &self,
        event_type: SyncEventType,
        trigger: SessionId,
        listener: SessionId,
        callback: SyncEventCallback,
    ) -> FlingerResult<Arc<SyncEvent>> {
        let event = Arc::new(SyncEvent::new(event_type, trigger, listener, callback));
        let threads: Vec<Arc<PlaybackThread>> = self.lock().outputs.values().map(|e| e.thread.clone()).collect();
        for thread in threads {
            if thread.set_sync_event(&event)? {
                return Ok(event);
            }
        }
        log::debug!("AudioFlinger: sync event on session {} pending", trigger.0);
        self.lock().pending_sync_events.push(event.clone());
        Ok(event)
    }

    /// Ask every track of `stream` to be recreated
    pub fn invalidate_stream(&self, stream: StreamType) {
        for thread in self.playback_threads() {
            thread.invalidate_tracks(Some(stream));
        }
    }

    fn playback_threads(&self) -> Vec<Arc<PlaybackThread>> {
        self.lock().outputs.values().map(|e| e.thread.clone()).collect()
    }

    // ─────────────────────────────────────────────────────────
    // Volume
    // ─────────────────────────────────────────────────────────

    fn apply_volumes(&self, st: &FlingerState, thread: &PlaybackThread) {
        thread.set_master_volume(st.master_volume);
        thread.set_master_mute(st.master_mute);
        for stream in StreamType::ALL {
            thread.set_stream_volume(stream, st.stream_volumes[stream.index()]);
            thread.set_stream_mute(stream, st.stream_mutes[stream.index()]);
        }
    }

    pub fn set_master_volume(&self, volume: f32) -> FlingerResult<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(FlingerError::bad_value(format!("master volume {}", volume)));
        }
        let mut st = self.lock();
        st.master_volume = volume;
        for entry in st.outputs.values() {
            entry.thread.set_master_volume(volume);
        }
        Ok(())
    }

    pub fn master_volume(&self) -> f32 {
        self.lock().master_volume
    }

    pub fn set_master_mute(&self, muted: bool) {
        let mut st = self.lock();
        st.master_mute = muted;
        for entry in st.outputs.values() {
            entry.thread.set_master_mute(muted);
        }
    }

    pub fn master_mute(&self) -> bool {
        self.lock().master_mute
    }

    /// Set `stream` volume on `output`, or on every output for [`IoHandle::NONE`]
    pub fn set_stream_volume(&self, stream: StreamType, volume: f32, output: IoHandle) -> FlingerResult<()> {
        if stream == StreamType::Patch {
            return Err(FlingerError::bad_value("patch stream volume is fixed"));
        }
        if !(0.0..=1.0).contains(&volume) {
            return Err(FlingerError::bad_value(format!("stream volume {}", volume)));
        }
        let mut st = self.lock();
        if output == IoHandle::NONE {
            st.stream_volumes[stream.index()] = volume;
            for entry in st.outputs.values() {
                entry.thread.set_stream_volume(stream, volume);
            }
            return Ok(());
        }
        let entry = st
            .outputs
            .get(&output)
            .ok_or_else(|| FlingerError::bad_value(format!("no output {}", output.0)))?;
        entry.thread.set_stream_volume(stream, volume);
        Ok(())
    }

    /// Volume of `stream` on `output`, or the default for [`IoHandle::NONE`]
    pub fn stream_volume(&self, stream: StreamType, output: IoHandle) -> f32 {
        let st = self.lock();
        match st.outputs.get(&output) {
            Some(entry) => entry.thread.stream_volume(stream),
            None => st.stream_volumes[stream.index()],
        }
    }

    pub fn set_stream_mute(&self, stream: StreamType, muted: bool) -> FlingerResult<()> {
        if stream == StreamType::Patch {
            return Err(FlingerError::bad_value("patch stream cannot be muted"));
        }
        let mut st = self.lock();
        st.stream_mutes[stream.index()] = muted;
        for entry in st.outputs.values() {
            entry.thread.set_stream_mute(stream, muted);
        }
        Ok(())
    }

    pub fn stream_mute(&self, stream: StreamType) -> bool {
        self.lock().stream_mutes[stream.index()]
    }

    // ─────────────────────────────────────────────────────────
    // Parameters and patches
    // ─────────────────────────────────────────────────────────

    /// Apply `kv` to the thread serving `io`, or to every thread for [`IoHandle::NONE`]
    pub fn set_parameters(&self, io: IoHandle, kv: &str) -> FlingerResult<()> {
        if io == IoHandle::NONE {
            let (outputs, inputs) = {
                let st = self.lock();
                let outputs: Vec<_> = st.outputs.values().map(|e| e.thread.clone()).collect();
                let inputs: Vec<_> = st.inputs.values().map(|e| e.thread.clone()).collect();
                (outputs, inputs)
            };
            let mut result = Ok(());
            for thread in outputs {
                if let Err(e) = thread.set_parameters(kv) {
                    result = Err(e);
                }
            }
            for thread in inputs {
                if let Err(e) = thread.set_parameters(kv) {
                    result = Err(e);
                }
            }
            return result;
        }
        if let Some(thread) = self.playback_thread(io) {
            return thread.set_parameters(kv);
        }
        self.input(io)?.set_parameters(kv)
    }

    pub fn get_parameters(&self, io: IoHandle, keys: &str) -> FlingerResult<String> {
        if io == IoHandle::NONE {
            let mut replies = Vec::new();
            for thread in self.playback_threads() {
                let reply = thread.get_parameters(keys)?;
                if !reply.is_empty() {
                    replies.push(reply);
                }
            }
            return Ok(replies.join(";"));
        }
        if let Some(thread) = self.playback_thread(io) {
            return thread.get_parameters(keys);
        }
        self.input(io)?.get_parameters(keys)
    }

    /// Route a thread to devices; the thread is the mix endpoint of `patch`
    pub fn create_audio_patch(&self, patch: AudioPatch) -> FlingerResult<PatchHandle> {
        let playback = patch.sources.iter().find_map(|e| match e {
            PatchEndpoint::Mix(io) => Some(*io),
            _ => None,
        });
        let record = patch.sinks.iter().find_map(|e| match e {
            PatchEndpoint::Mix(io) => Some(*io),
            _ => None,
        });
        let (io, handle) = match (playback, record) {
            (Some(io), None) => (io, self.output(io)?.create_audio_patch(patch)?),
            (None, Some(io)) => (io, self.input(io)?.create_audio_patch(patch)?),
            _ => return Err(FlingerError::bad_value(format!("patch {:?} has no single mix end", patch))),
        };
        self.lock().patches.insert(handle, io);
        Ok(handle)
    }

    pub fn release_audio_patch(&self, handle: PatchHandle) -> FlingerResult<()> {
        let io = self
            .lock()
            .patches
            .remove(&handle)
            .ok_or_else(|| FlingerError::bad_value(format!("no patch {}", handle.0)))?;
        if let Some(thread) = self.playback_thread(io) {
            return thread.release_audio_patch(handle);
        }
        self.input(io)?.release_audio_patch(handle)
    }

    // ─────────────────────────────────────────────────────────
    // Effects
    // ─────────────────────────────────────────────────────────

    pub fn add_effect(&self, io: IoHandle, session: SessionId, effect: Box<dyn AudioEffect>) -> FlingerResult<u32> {
        if let Some(thread) = self.playback_thread(io) {
            return thread.add_effect(session, effect);
        }
        self.input(io)?.add_effect(session, effect)
    }

    pub fn remove_effect(&self, io: IoHandle, session: SessionId, id: u32) -> FlingerResult<()> {
        if let Some(thread) = self.playback_thread(io) {
            return thread.remove_effect(session, id);
        }
        self.input(io)?.remove_effect(session, id)
    }

    // ─────────────────────────────────────────────────────────
    // Diagnostics and shutdown
    // ─────────────────────────────────────────────────────────

    pub fn dump(&self) -> String {
        let (outputs, inputs, pending, master) = {
            let st = self.lock();
            let outputs: Vec<_> = st.outputs.values().map(|e| e.thread.clone()).collect();
            let inputs: Vec<_> = st.inputs.values().map(|e| e.thread.clone()).collect();
            (outputs, inputs, st.pending_sync_events.len(), (st.master_volume, st.master_mute))
        };
        let mut out = format!(
            "AudioFlinger: master volume {:.3}{} outputs {} inputs {} pending sync events {}\n",
            master.0,
            if master.1 { " (muted)" } else { "" },
            outputs.len(),
            inputs.len(),
            pending
        );
        for thread in outputs {
            out.push_str(&thread.dump());
        }
        for thread in inputs {
            out.push_str(&thread.dump());
        }
        out
    }

    /// Close every stream; duplicating outputs go first
    pub fn shutdown(&self) {
        let (outputs, inputs) = {
            let st = self.lock();
            let mut outputs: Vec<(IoHandle, OutputKind)> =
                st.outputs.iter().map(|(io, e)| (*io, e.thread.kind())).collect();
            outputs.sort_by_key(|(_, kind)| *kind != OutputKind::Duplicating);
            (outputs, st.inputs.keys().copied().collect::<Vec<_>>())
        };
        for (io, _) in outputs {
            if let Err(e) = self.close_output(io) {
                log::warn!("AudioFlinger: closing output {}: {}", io.0, e);
            }
        }
        for io in inputs {
            if let Err(e) = self.close_input(io) {
                log::warn!("AudioFlinger: closing input {}: {}", io.0, e);
            }
        }
    }
}

impl Drop for AudioFlinger {
    fn drop(&mut self) {
        self.shutdown();
        log::info!("AudioFlinger: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::hal::mock::{MockOutHandle, MockStreamIn, MockStreamOut};
    use crate::track::TrackEvent;
    use crate::types::{AudioFormat, ChannelMask, StreamConfig};

    fn stereo() -> StreamConfig {
        StreamConfig {
            sample_rate: 48000,
            format: AudioFormat::Pcm16,
            channel_mask: ChannelMask::OUT_STEREO,
            frame_count: 480,
        }
    }

    fn flinger() -> AudioFlinger {
        AudioFlinger::new(EngineConfig::default())
    }

    fn open_speaker(af: &AudioFlinger) -> (IoHandle, MockOutHandle) {
        let (out, handle) = MockStreamOut::new(stereo());
        let io = af
            .open_output(Box::new(out), OutputFlags::PRIMARY, OutputDevices::SPEAKER)
            .unwrap();
        (io, handle)
    }

    fn music() -> TrackParams {
        TrackParams::new(StreamType::Music, 48000, AudioFormat::Pcm16, ChannelMask::OUT_STEREO)
    }

    #[test]
    fn test_open_and_close_output_notify() {
        let af = flinger();
        let events = af.subscribe_io();
        let (io, _h) = open_speaker(&af);

        let opened = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(opened.kind, IoEventKind::OutputOpened);
        assert_eq!(opened.desc.io, io);
        assert_eq!(af.playback_thread(io).unwrap().out_device(), OutputDevices::SPEAKER);

        af.close_output(io).unwrap();
        let closed = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(closed.kind, IoEventKind::OutputClosed);
        assert!(af.outputs().is_empty());
        assert!(matches!(af.close_output(io), Err(FlingerError::BadValue(_))));
    }

    #[test]
    fn test_track_on_unknown_output_is_refused() {
        let af = flinger();
        assert!(matches!(
            af.create_track(IoHandle(12345), music()),
            Err(FlingerError::BadValue(_))
        ));
    }

    #[test]
    fn test_stream_volume_reaches_new_and_existing_outputs() {
        let af = flinger();
        af.set_stream_volume(StreamType::Music, 0.25, IoHandle::NONE).unwrap();
        let (io, _h) = open_speaker(&af);
        assert_eq!(af.stream_volume(StreamType::Music, io), 0.25);

        af.set_stream_volume(StreamType::Music, 0.5, io).unwrap();
        assert_eq!(af.stream_volume(StreamType::Music, io), 0.5);
        assert_eq!(af.stream_volume(StreamType::Music, IoHandle::NONE), 0.25);

        af.set_stream_mute(StreamType::Ring, true).unwrap();
        assert!(af.playback_thread(io).unwrap().stream_mute(StreamType::Ring));
    }

    #[test]
    fn test_volume_range_and_patch_stream_checked() {
        let af = flinger();
        assert!(af.set_master_volume(1.5).is_err());
        assert!(af.set_stream_volume(StreamType::Music, -0.1, IoHandle::NONE).is_err());
        assert!(af.set_stream_volume(StreamType::Patch, 0.5, IoHandle::NONE).is_err());
        assert!(af.set_stream_mute(StreamType::Patch, true).is_err());
        af.set_master_volume(0.75).unwrap();
        af.set_master_mute(true);
        assert_eq!(af.master_volume(), 0.75);
        assert!(af.master_mute());
    }

    #[test]
    fn test_parameters_fan_out_to_every_output() {
        let af = flinger();
        let (first, h1) = open_speaker(&af);
        let (_second, h2) = open_speaker(&af);
        af.set_parameters(IoHandle::NONE, "bt_headset_name=car").unwrap();
        assert!(h1.lock().unwrap().param_log.contains(&"bt_headset_name=car".to_string()));
        assert!(h2.lock().unwrap().param_log.contains(&"bt_headset_name=car".to_string()));
        assert_eq!(af.get_parameters(first, "bt_headset_name").unwrap(), "bt_headset_name=car");
    }

    #[test]
    fn test_duplicate_output_follows_closed_downstream() {
        let af = flinger();
        let (a, _ha) = open_speaker(&af);
        let (b, _hb) = open_speaker(&af);
        let dup = af.open_duplicate_output(a, b).unwrap();
        let thread = af.playback_thread(dup).unwrap();
        assert_eq!(thread.kind(), OutputKind::Duplicating);
        assert_eq!(thread.output_track_count(), 2);

        af.close_output(b).unwrap();
        assert_eq!(thread.output_track_ios(), vec![a]);
        assert!(af.open_duplicate_output(dup, a).is_err());
    }

    #[test]
    fn test_pending_sync_event_attaches_to_later_track() {
        let af = flinger();
        let (io, _h) = open_speaker(&af);
        let event = af
            .create_sync_event(
                SyncEventType::PresentationComplete,
                SessionId(4242),
                SessionId(7),
                Box::new(|_| {}),
            )
            .unwrap();
        assert!(af.dump().contains("pending sync events 1"));

        let handle = af.create_track(io, music().with_session(SessionId(4242))).unwrap();
        assert_eq!(handle.track().sync_event_count(), 1);
        assert!(af.dump().contains("pending sync events 0"));
        assert!(!event.is_triggered());
    }

    #[test]
    fn test_synced_record_start_arms_on_playback_track() {
        let af = flinger();
        let (out, _h) = open_speaker(&af);
        let (input, _ih) = MockStreamIn::new(StreamConfig {
            sample_rate: 16000,
            format: AudioFormat::Pcm16,
            channel_mask: ChannelMask::IN_MONO,
            frame_count: 160,
        });
        let inp = af.open_input(Box::new(input), InputDevices::BUILTIN_MIC).unwrap();
        assert_eq!(af.record_thread(inp).unwrap().in_device(), InputDevices::BUILTIN_MIC);

        let prompt = af.create_track(out, music().with_session(SessionId(900))).unwrap();
        let rec = af
            .open_record(inp, RecordParams::new(16000, AudioFormat::Pcm16, ChannelMask::IN_MONO))
            .unwrap();
        af.start_record(&rec, Some(SessionId(900))).unwrap();
        assert_eq!(prompt.track().sync_event_count(), 1);
    }

    #[test]
    fn test_invalidate_stream_only_hits_that_stream() {
        let af = flinger();
        let (io, _h) = open_speaker(&af);
        let song = af.create_track(io, music()).unwrap();
        let ring = af
            .create_track(
                io,
                TrackParams::new(StreamType::Ring, 48000, AudioFormat::Pcm16, ChannelMask::OUT_STEREO),
            )
            .unwrap();
        af.invalidate_stream(StreamType::Music);
        assert_eq!(song.events().try_recv().unwrap(), TrackEvent::Invalidated);
        assert!(ring.events().try_recv().is_err());
    }

    #[test]
    fn test_patch_routes_output() {
        let af = flinger();
        let (io, _h) = open_speaker(&af);
        let patch = af
            .create_audio_patch(AudioPatch::playback(io, OutputDevices::WIRED_HEADSET))
            .unwrap();
        assert_eq!(af.playback_thread(io).unwrap().out_device(), OutputDevices::WIRED_HEADSET);
        af.release_audio_patch(patch).unwrap();
        assert!(af.release_audio_patch(patch).is_err());
    }

    #[test]
    fn test_unique_ids_are_distinct() {
        let af = flinger();
        let a = af.new_audio_unique_id(UniqueIdUse::Session);
        let b = af.new_audio_unique_id(UniqueIdUse::Session);
        let c = af.new_audio_unique_id(UniqueIdUse::Output);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, 0);
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let af = flinger();
        let (a, _ha) = open_speaker(&af);
        let (b, _hb) = open_speaker(&af);
        af.open_duplicate_output(a, b).unwrap();
        assert_eq!(af.outputs().len(), 3);
        af.shutdown();
        assert!(af.outputs().is_empty());
        assert!(af.dump().contains("outputs 0"));
    }
}
