//! Direct and offload prepare step
//!
//! Only the most recently started track owns the stream. Pause, resume and
//! flush are forwarded to the hardware when it supports them, in that order
//! within one cycle. An offloaded track that is asked to stop first drains
//! the stream, then completes its presentation.

use std::sync::Arc;

use crate::hal::DrainKind;
use crate::track::{Track, TrackState};

use super::worker::PlaybackWorker;
use super::{MixerState, OutputKind, PlaybackState, PlaybackThread};

impl PlaybackWorker {
    pub(super) fn prepare_direct(&mut self, thread: &PlaybackThread, st: &mut PlaybackState) -> MixerState {
        let cfg = thread.engine_config();
        let offload = thread.kind() == OutputKind::Offload;
        let pcm = st.config.format.is_linear_pcm();
        let standby = thread.standby();
        let supports_pause = self.output.as_ref().map_or(false, |o| o.supports_pause());
        let latest = st.latest_active.upgrade();
        let count = st.active_tracks.len();
        let mut state = MixerState::Idle;
        let mut do_hw_pause = false;
        let mut do_hw_resume = false;
        let mut remove: Vec<Arc<Track>> = Vec::new();
        self.direct_track = None;

        for track in st.active_tracks.clone() {
            if track.is_invalid() {
                log::warn!("{}: invalidated track {} still active", thread.name(), track.id().0);
                remove.push(track);
                continue;
            }
            let last = latest.as_ref().map_or(false, |l| Arc::ptr_eq(l, &track));

            if track.state() == TrackState::Pausing {
                track.set_paused();
                if last {
                    if supports_pause && !self.hw_paused {
                        do_hw_pause = true;
                        self.hw_paused = true;
                    }
                    if offload {
                        // finish the interrupted write after resuming
                        self.paused_write_length = self.current_write_length;
                        self.paused_bytes_remaining = self.bytes_remaining;
                        self.bytes_remaining = 0;
                    }
                }
                remove.push(track.clone());
                if offload {
                    continue;
                }
            } else if track.is_flush_pending() {
                if offload {
                    let retries = if track.state() == TrackState::Stopping1 {
                        cfg.max_track_stop_retries_offload
                    } else {
                        cfg.max_track_retries_offload
                    };
                    track.set_retry_count(retries);
                }
                track.flush_ack();
                if last {
                    self.flush_pending = true;
                }
                if offload {
                    continue;
                }
            } else if track.is_resume_pending() {
                track.resume_ack();
                if last {
                    self.last_volume = None;
                    if offload && self.paused_bytes_remaining > 0 {
                        self.current_write_length = self.paused_write_length;
                        self.bytes_remaining = self.paused_bytes_remaining;
                        self.paused_bytes_remaining = 0;
                    }
                    if self.hw_paused {
                        do_hw_resume = true;
                        self.hw_paused = false;
                    }
                    if offload {
                        // write what is pending, take new data next cycle
                        state = MixerState::TracksEnabled;
                        continue;
                    }
                }
                if offload {
                    continue;
                }
            }

            let track_state = track.state();
            let min_frames = if !offload
                && pcm
                && track_state != TrackState::Stopping1
                && track_state != TrackState::Pausing
                && track.retry_count() > 1
            {
                st.config.frame_count
            } else {
                1
            };
            let ready = track.frames_ready() >= min_frames
                && track_state != TrackState::Paused
                && track_state != TrackState::Stopping2
                && !track_state.is_stopped()
                && !track.is_terminated();

            if ready {
                if last {
                    self.apply_volume(thread, st, &track);
                    if let Some(previous) = self.previous_track.upgrade() {
                        if !Arc::ptr_eq(&previous, &track) {
                            // drop what is left of the previous track's data
                            self.bytes_remaining = 0;
                            if offload && self.paused_bytes_remaining > 0 {
                                self.paused_bytes_remaining = 0;
                                previous.invalidate();
                            }
                            if !offload || previous.session() != track.session() {
                                previous.invalidate();
                            }
                        }
                    }
                    self.previous_track = Arc::downgrade(&track);
                    track.set_retry_count(cfg.max_track_retries_offload);
                    self.direct_track = Some(track.clone());
                    state = MixerState::TracksReady;
                    if !offload && self.hw_paused {
                        do_hw_resume = true;
                        self.hw_paused = false;
                    }
                }
                continue;
            }

            if offload {
                match track.state() {
                    TrackState::Stopping1 => {
                        if track.decrement_retry() <= 0 && self.bytes_remaining == 0 {
                            track.set_state(TrackState::Stopping2);
                            if last && !standby {
                                // a drain already in flight survives a resume
                                if st.drain_sequence & 1 == 0 {
                                    state = MixerState::DrainTrack;
                                    st.drain_sequence += 2;
                                }
                                if self.hw_paused {
                                    do_hw_resume = true;
                                    self.hw_paused = false;
                                }
                            }
                        }
                    }
                    TrackState::Stopping2 => {
                        if st.drain_sequence & 1 == 0 || !last || standby {
                            track.set_state(TrackState::Stopped);
                            track.presentation_complete(self.local_frames_written(), st.latency_frames());
                            track.reset();
                            remove.push(track);
                        }
                    }
                    _ if track.is_terminated() || track.state().is_stopped() || track.state() == TrackState::Paused => {
                        remove.push(track);
                    }
                    _ => {
                        if track.decrement_retry() <= 0 {
                            log::info!("{}: offload track {} timed out", thread.name(), track.id().0);
                            track.disable();
                            remove.push(track);
                        } else if last {
                            state = MixerState::TracksEnabled;
                        }
                    }
                }
                continue;
            }

            if track.state() == TrackState::Stopping1 {
                track.set_state(TrackState::Stopping2);
                if last && self.hw_paused {
                    do_hw_resume = true;
                    self.hw_paused = false;
                }
            }
            let track_state = track.state();
            if track.is_terminated() || track_state.is_stopped() || track_state == TrackState::Paused {
                let latency_frames = if pcm { st.latency_frames() } else { 0 };
                if standby || !last || track.presentation_complete(self.local_frames_written(), latency_frames) {
                    if track_state == TrackState::Stopping2 {
                        track.set_state(TrackState::Stopped);
                    }
                    if track.state().is_stopped() {
                        track.reset();
                    }
                    remove.push(track);
                }
            } else if track.decrement_retry() <= 0 {
                log::info!("{}: direct track {} timed out", thread.name(), track.id().0);
                track.disable();
                remove.push(track);
            } else if last {
                state = MixerState::TracksEnabled;
                if supports_pause && !self.hw_paused && !standby {
                    do_hw_pause = true;
                    self.hw_paused = true;
                }
            }
        }

        // a flush on a track that is no longer active
        if !self.flush_pending {
            for track in &st.tracks {
                if track.is_flush_pending() {
                    track.flush_ack();
                    self.flush_pending = true;
                }
            }
        }

        if supports_pause && !standby && (do_hw_pause || (self.flush_pending && !self.hw_paused && count > 0)) {
            if let Some(output) = self.output.as_mut() {
                if let Err(e) = output.pause() {
                    log::warn!("{}: hardware pause failed: {}", thread.name(), e);
                }
            }
        }
        if self.flush_pending {
            self.flush_hw(thread, st);
        }
        if supports_pause && !standby && do_hw_resume {
            if let Some(output) = self.output.as_mut() {
                if let Err(e) = output.resume() {
                    log::warn!("{}: hardware resume failed: {}", thread.name(), e);
                }
            }
        }

        self.remove_tracks_l(thread, st, remove);
        state
    }

    /// Forward the latest track's gain to the stream when it changed
    fn apply_volume(&mut self, thread: &PlaybackThread, st: &PlaybackState, track: &Track) {
        let (l, r) = st.track_gain(track);
        let gain = (l.min(1.0), r.min(1.0));
        if self.last_volume == Some(gain) {
            return;
        }
        self.last_volume = Some(gain);
        if let Some(output) = self.output.as_mut() {
            if let Err(e) = output.set_volume(gain.0, gain.1) {
                log::trace!("{}: no hardware volume: {}", thread.name(), e);
            }
        }
    }

    /// Throw away everything queued in the stream and in the sink buffer
    pub(super) fn flush_hw(&mut self, thread: &PlaybackThread, st: &mut PlaybackState) {
        log::debug!("{}: flushing stream", thread.name());
        if let Some(output) = self.output.as_mut() {
            if let Err(e) = output.flush() {
                log::warn!("{}: stream flush failed: {}", thread.name(), e);
            }
        }
        self.hw_paused = false;
        self.flush_pending = false;
        if thread.kind() != OutputKind::Offload {
            return;
        }
        self.current_write_length = 0;
        self.bytes_remaining = 0;
        self.paused_write_length = 0;
        self.paused_bytes_remaining = 0;
        // the DSP buffers are empty again
        self.bytes_written = 0;
        if st.use_async_write {
            // supersede any outstanding ack
            st.write_ack_sequence = (st.write_ack_sequence + 2) & !1;
            st.drain_sequence = (st.drain_sequence + 2) & !1;
            self.publish_sequences(st);
        }
    }

    /// Copy the owning track's frames into the sink buffer
    pub(super) fn mix_direct(&mut self) {
        let Some(track) = self.direct_track.take() else {
            self.current_write_length = 0;
            return;
        };
        let frame_size = track.frame_size();
        let frames = {
            let mut reader = track.reader();
            reader.read(&mut self.sink_buffer)
        };
        track.cblk().advance_server_position(frames as u64);
        let length = frames * frame_size;
        if self.config.format.is_linear_pcm() && length < self.sink_buffer.len() {
            // short read: pad with silence but only send what was read
            self.sink_buffer[length..].fill(0);
        }
        self.current_write_length = length;
        self.bytes_remaining = length;
    }

    /// Ask the stream to drain; completion arrives through the callback
    pub(super) fn drain(&mut self, thread: &PlaybackThread, state: MixerState) {
        let Some(output) = self.output.as_mut() else {
            return;
        };
        if !output.supports_drain() {
            return;
        }
        let kind = if state == MixerState::DrainTrack {
            DrainKind::EarlyNotify
        } else {
            DrainKind::All
        };
        {
            let mut st = thread.lock();
            if st.use_async_write {
                if st.drain_sequence & 1 != 0 {
                    log::warn!("{}: drain requested while one is pending", thread.name());
                }
                st.drain_sequence |= 1;
                self.publish_sequences(&st);
            }
        }
        log::debug!("{}: draining ({:?})", thread.name(), kind);
        if let Some(output) = self.output.as_mut() {
            if let Err(e) = output.drain(kind) {
                log::warn!("{}: drain failed: {}", thread.name(), e);
            }
        }
    }
}
