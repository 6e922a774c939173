//! Software mixer and the mixer-thread prepare step
//!
//! Tracks are decoded to float, remapped to the sink channel count,
//! resampled when their rate differs from the sink, scaled by a ramped
//! gain and summed. Sessions that own an effect chain are summed into
//! their own buffer and run through the chain before joining the output
//! mix; the output-mix chain runs last, then the sum is encoded into the
//! sink format.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::buffer::CBLK_UNDERRUN;
use crate::convert::{accumulate, adjust_channels, float_to_pcm, pcm_to_float};
use crate::effects::EffectChain;
use crate::resample::StreamResampler;
use crate::track::{Track, TrackEvent, TrackState};
use crate::types::{SessionId, StreamConfig, TrackId};

use super::worker::PlaybackWorker;
use super::{MixerState, PlaybackState, PlaybackThread};

/// A track selected for this cycle's mix
pub(crate) struct MixInput {
    pub track: Arc<Track>,
    /// Target (left, right) gain
    pub gain: (f32, f32),
}

#[derive(Default)]
struct TrackMixState {
    prev_gain: (f32, f32),
    resampler: Option<StreamResampler>,
}

pub(crate) struct Mixer {
    sink: StreamConfig,
    ramp_frames: usize,
    states: HashMap<TrackId, TrackMixState>,
    /// Output mix, sink frame count x sink channels
    mix: Vec<f32>,
    /// Per-session sums for sessions with an effect chain
    session_mix: HashMap<SessionId, Vec<f32>>,
    track_out: Vec<f32>,
    decode: Vec<f32>,
    remap: Vec<f32>,
}

impl Mixer {
    pub fn new(sink: StreamConfig, ramp_frames: usize) -> Self {
        let mut mixer = Self {
            sink,
            ramp_frames,
            states: HashMap::new(),
            mix: Vec::new(),
            session_mix: HashMap::new(),
            track_out: Vec::new(),
            decode: Vec::new(),
            remap: Vec::new(),
        };
        mixer.reconfigure(sink);
        mixer
    }

    /// Adopt a new sink format; every per-track state starts over
    pub fn reconfigure(&mut self, sink: StreamConfig) {
        self.sink = sink;
        let samples = sink.frame_count * sink.channel_count();
        self.mix = vec![0.0; samples];
        self.track_out = vec![0.0; samples];
        self.session_mix.clear();
        self.states.clear();
    }

    /// Drop everything known about a track (it left or re-entered the active set)
    pub fn forget(&mut self, id: TrackId) {
        self.states.remove(&id);
    }

    /// Discontinuity on a track: keep its gain, drop resampler history
    pub fn reset_track(&mut self, id: TrackId) {
        if let Some(state) = self.states.get_mut(&id) {
            if let Some(resampler) = state.resampler.as_mut() {
                resampler.reset();
            }
        }
    }

    /// Mix `inputs` into `out`, encoded in the sink format
    pub fn mix(&mut self, inputs: &[MixInput], chains: &[Arc<Mutex<EffectChain>>], out: &mut [u8]) {
        let channels = self.sink.channel_count();
        self.mix.fill(0.0);
        for buffer in self.session_mix.values_mut() {
            buffer.fill(0.0);
        }

        // Phase 1: render each track and sum into its session or the output mix
        for input in inputs {
            let session = input.track.session();
            let chained = session != SessionId::OUTPUT_MIX
                && chains.iter().any(|c| crate::lock(c).session() == session);
            self.render_track(input);
            let target = if chained {
                let len = self.mix.len();
                self.session_mix.entry(session).or_insert_with(|| vec![0.0; len])
            } else {
                &mut self.mix
            };
            accumulate(target, &self.track_out);
        }

        // Phase 2: session chains, then the output-mix chain
        for chain in chains {
            let mut chain = crate::lock(chain);
            if chain.session() == SessionId::OUTPUT_MIX {
                continue;
            }
            if let Some(buffer) = self.session_mix.get_mut(&chain.session()) {
                chain.process(buffer, channels);
                accumulate(&mut self.mix, buffer);
            }
        }
        for chain in chains {
            let mut chain = crate::lock(chain);
            if chain.session() == SessionId::OUTPUT_MIX {
                chain.process(&mut self.mix, channels);
            }
        }

        float_to_pcm(self.sink.format, &self.mix, out);
    }

    /// Render one track into `track_out`, gain applied; returns frames consumed
    fn render_track(&mut self, input: &MixInput) -> usize {
        let track = &input.track;
        let frames = self.sink.frame_count;
        let sink_channels = self.sink.channel_count();
        let track_channels = track.channel_count();
        let format = track.format();
        let rate = track.sample_rate();
        self.track_out.fill(0.0);

        let Self {
            sink,
            ramp_frames,
            states,
            track_out,
            decode,
            remap,
            ..
        } = self;
        let state = states.entry(track.id()).or_default();
        let mut reader = track.reader();

        // pull up to `max` frames from the ring into `dst`, remapped to the sink channels
        let mut pull = |dst: &mut [f32], max: usize| -> usize {
            let mut done = 0;
            while done < max {
                let Some(buffer) = reader.get_next_buffer(max - done) else {
                    break;
                };
                let n = buffer.frames();
                let samples = n * track_channels;
                if decode.len() < samples {
                    decode.resize(samples, 0.0);
                }
                pcm_to_float(format, buffer.data(), &mut decode[..samples]);
                adjust_channels(
                    &decode[..samples],
                    track_channels,
                    &mut dst[done * sink_channels..],
                    sink_channels,
                    n,
                );
                buffer.release(n);
                done += n;
            }
            done
        };

        let mut consumed = 0;
        let rendered;
        if rate == sink.sample_rate && state.resampler.is_none() {
            consumed = pull(track_out, frames);
            rendered = consumed;
        } else {
            if state.resampler.is_none() {
                match StreamResampler::new(rate, sink.sample_rate, sink_channels, frames) {
                    Ok(r) => state.resampler = Some(r),
                    Err(e) => {
                        log::warn!("track {}: no resampler: {}", track.id().0, e);
                        return 0;
                    }
                }
            }
            let Some(resampler) = state.resampler.as_mut() else {
                return 0;
            };
            if let Err(e) = resampler.set_input_rate(rate) {
                log::warn!("track {}: rate {} refused: {}", track.id().0, rate, e);
            }
            let mut done = 0;
            loop {
                done += resampler.render(&mut track_out[done * sink_channels..], frames - done);
                if done >= frames {
                    break;
                }
                let need = resampler.input_frames_needed();
                if need == 0 {
                    break;
                }
                if remap.len() < need * sink_channels {
                    remap.resize(need * sink_channels, 0.0);
                }
                let got = pull(&mut remap[..need * sink_channels], need);
                if got == 0 {
                    break;
                }
                resampler.push_interleaved(&remap[..got * sink_channels]);
                consumed += got;
            }
            rendered = done;
        }
        drop(pull);
        drop(reader);
        track.cblk().advance_server_position(consumed as u64);

        // ramp from the previous gain to the target over the first frames
        let (from, to) = (state.prev_gain, input.gain);
        let ramp = if from == to { 0 } else { (*ramp_frames).min(rendered.max(1)) };
        for f in 0..rendered {
            let t = if f < ramp { (f + 1) as f32 / ramp as f32 } else { 1.0 };
            let l = from.0 + (to.0 - from.0) * t;
            let r = from.1 + (to.1 - from.1) * t;
            let frame = &mut track_out[f * sink_channels..(f + 1) * sink_channels];
            if sink_channels == 1 {
                frame[0] *= (l + r) * 0.5;
            } else {
                for (c, s) in frame.iter_mut().enumerate() {
                    *s *= if c % 2 == 0 { l } else { r };
                }
            }
        }
        state.prev_gain = to;
        consumed
    }
}

// ─────────────────────────────────────────────────────────────
// Prepare
// ─────────────────────────────────────────────────────────────

impl PlaybackWorker {
    /// Walk the active set, pick what mixes this cycle and retire finished tracks
    pub(super) fn prepare_mixer(&mut self, thread: &PlaybackThread, st: &mut PlaybackState) -> MixerState {
        let cfg = thread.engine_config();
        let frame_count = st.config.frame_count as u64;
        let frames_written = self.local_frames_written();
        let latency_frames = st.latency_frames();
        let standby = thread.standby();
        let mut remove: Vec<Arc<Track>> = Vec::new();
        self.mix_inputs.clear();

        for track in st.active_tracks.clone() {
            let ready = track.frames_ready();

            if track.is_fast() {
                if track.state() == TrackState::Stopping1 && (ready == 0 || track.is_terminated()) {
                    track.set_state(TrackState::Stopping2);
                }
                if track.state() == TrackState::Pausing {
                    track.set_paused();
                } else if track.is_resume_pending() {
                    track.resume_ack();
                }
                match track.state() {
                    TrackState::Active | TrackState::Resuming | TrackState::Stopping1 => {
                        if ready > 0 {
                            track.cblk().clear_flags(CBLK_UNDERRUN);
                            track.set_retry_count(cfg.max_track_retries);
                            let gain = st.track_gain(&track);
                            self.mix_inputs.push(MixInput { track, gain });
                        } else if track.is_terminated() {
                            if standby || track.presentation_complete(frames_written, latency_frames) {
                                remove.push(track);
                            }
                        } else {
                            self.underrun(&track, frame_count);
                            if track.decrement_retry() <= 0 {
                                track.disable();
                                remove.push(track);
                            }
                        }
                    }
                    TrackState::Stopping2 | TrackState::Paused | TrackState::Stopped | TrackState::Flushed => {
                        if standby || track.presentation_complete(frames_written, latency_frames) {
                            if track.state() == TrackState::Stopping2 {
                                track.set_state(TrackState::Stopped);
                            }
                            track.reset();
                            remove.push(track);
                        }
                    }
                    state => {
                        log::warn!("{}: track {} active while {}", thread.name(), track.id().0, state.name());
                        remove.push(track);
                    }
                }
                continue;
            }

            let paused = matches!(track.state(), TrackState::Paused);
            if ready > 0 && !paused && !track.is_terminated() {
                let mut gain = st.track_gain(&track);
                if track.state() == TrackState::Pausing {
                    gain = (0.0, 0.0);
                    track.set_paused();
                } else if track.is_resume_pending() {
                    track.resume_ack();
                }
                track.cblk().clear_flags(CBLK_UNDERRUN);
                track.set_retry_count(cfg.max_track_retries);
                self.mix_inputs.push(MixInput { track, gain });
                continue;
            }

            let track_state = track.state();
            if !track_state.is_stopped() && !paused && track_state != TrackState::Pausing && !track.is_terminated() {
                self.underrun(&track, frame_count);
            }
            if track_state == TrackState::Pausing {
                track.set_paused();
            }
            let track_state = track.state();
            if track.is_terminated() || track_state.is_stopped() || track_state == TrackState::Paused {
                if standby || track.presentation_complete(frames_written, latency_frames) {
                    if track_state.is_stopped() {
                        track.reset();
                    }
                    remove.push(track);
                }
            } else if track.decrement_retry() <= 0 {
                log::info!("{}: buffer timeout, track {} leaves the mix", thread.name(), track.id().0);
                track.disable();
                remove.push(track);
            }
        }

        self.remove_tracks_l(thread, st, remove);
        if !self.mix_inputs.is_empty() {
            MixerState::TracksReady
        } else if !st.active_tracks.is_empty() {
            MixerState::TracksEnabled
        } else {
            MixerState::Idle
        }
    }

    /// Count a starved cycle; the client hears about it once per episode
    fn underrun(&self, track: &Track, frames: u64) {
        track.cblk().add_underrun_frames(frames);
        if !track.cblk().has_flag(CBLK_UNDERRUN) {
            track.cblk().set_flags(CBLK_UNDERRUN);
            track.notify(TrackEvent::Underrun);
        }
    }
}
