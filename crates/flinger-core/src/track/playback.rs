//! Playback track: the server side of one client output stream

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::buffer::{FrameReader, CBLK_DISABLED, CBLK_FORCEREADY, CBLK_INVALID, CBLK_STREAM_END_DONE};
use crate::error::{FlingerError, FlingerResult};
use crate::sync_event::{SyncEvent, SyncEventType};
use crate::types::{OutputFlags, StreamType};

use super::base::{TrackBase, TrackEvent};
use super::state::TrackState;

/// Server side of a client output stream
///
/// Lifecycle calls (`start_l`, `stop_l`, ...) must be made with the owning
/// thread's lock held; they only move the state machine and report whether
/// the worker has something to do. Buffer access goes through [`Track::reader`]
/// and is reserved to the worker.
pub struct Track {
    base: TrackBase,
    stream_type: StreamType,
    flags: OutputFlags,
    /// Fast mixer slot, or -1
    fast_index: AtomicI32,
    reader: Mutex<FrameReader>,
    /// Empty cycles left before the worker gives up on the track
    retry_count: AtomicI32,
    /// Sink frame position at which the last released frame will have played
    presentation_complete_frames: AtomicU64,
    resume_to_stopping: AtomicBool,
    flush_hw_pending: AtomicBool,
    reset_done: AtomicBool,
    /// Member of the worker's active set
    active: AtomicBool,
    /// A start request is queued for the worker
    start_queued: AtomicBool,
    /// Feeds a downstream thread on behalf of a duplicating thread
    output_track: bool,
}

impl Deref for Track {
    type Target = TrackBase;

    fn deref(&self) -> &TrackBase {
        &self.base
    }
}

impl Track {
    pub(crate) fn new(
        base: TrackBase,
        stream_type: StreamType,
        flags: OutputFlags,
        reader: FrameReader,
        output_track: bool,
    ) -> Self {
        Self {
            base,
            stream_type,
            flags,
            fast_index: AtomicI32::new(-1),
            reader: Mutex::new(reader),
            retry_count: AtomicI32::new(0),
            presentation_complete_frames: AtomicU64::new(0),
            resume_to_stopping: AtomicBool::new(false),
            flush_hw_pending: AtomicBool::new(false),
            reset_done: AtomicBool::new(false),
            active: AtomicBool::new(false),
            start_queued: AtomicBool::new(false),
            output_track,
        }
    }

    #[inline]
    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    #[inline]
    pub fn flags(&self) -> OutputFlags {
        self.flags
    }

    #[inline]
    pub fn fast_index(&self) -> Option<usize> {
        usize::try_from(self.fast_index.load(Ordering::Relaxed)).ok()
    }

    pub(crate) fn set_fast_index(&self, slot: Option<usize>) {
        let v = slot.map_or(-1, |s| s as i32);
        self.fast_index.store(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_fast(&self) -> bool {
        self.fast_index().is_some()
    }

    #[inline]
    pub fn is_offloaded(&self) -> bool {
        self.flags.contains(OutputFlags::COMPRESS_OFFLOAD)
    }

    #[inline]
    pub fn is_direct(&self) -> bool {
        self.flags.contains(OutputFlags::DIRECT) && !self.is_offloaded()
    }

    #[inline]
    pub fn is_output_track(&self) -> bool {
        self.output_track
    }

    #[inline]
    pub fn is_invalid(&self) -> bool {
        self.cblk().has_flag(CBLK_INVALID)
    }

    /// Frames the client has written and the worker has not yet consumed
    pub fn frames_ready(&self) -> usize {
        self.reader().frames_ready()
    }

    /// The client dropped its writer without destroying the track
    pub(crate) fn is_client_gone(&self) -> bool {
        self.reader().is_writer_gone()
    }

    pub(crate) fn reader(&self) -> MutexGuard<'_, FrameReader> {
        crate::lock(&self.reader)
    }

    #[inline]
    pub(crate) fn is_in_active_set(&self) -> bool {
        self.active.load(Ordering::Relaxed) || self.start_queued.load(Ordering::Relaxed)
    }

    /// Worker side: the start request, if any, has been handled
    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
        self.start_queued.store(false, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn retry_count(&self) -> i32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_retry_count(&self, count: u32) {
        self.retry_count.store(count as i32, Ordering::Relaxed);
    }

    /// Spend one retry; returns the retries left
    #[inline]
    pub(crate) fn decrement_retry(&self) -> i32 {
        self.retry_count.fetch_sub(1, Ordering::Relaxed) - 1
    }

    #[inline]
    pub(crate) fn is_flush_pending(&self) -> bool {
        self.flush_hw_pending.load(Ordering::Relaxed)
    }

    pub(crate) fn flush_ack(&self) {
        self.flush_hw_pending.store(false, Ordering::Relaxed);
    }

    /// A paused track asked to play again but the worker has not caught up yet
    pub(crate) fn is_resume_pending(&self) -> bool {
        let state = self.state();
        state == TrackState::Resuming
            || (state == TrackState::Stopping1 && self.resume_to_stopping.load(Ordering::Relaxed))
    }

    pub(crate) fn resume_ack(&self) {
        match self.state() {
            TrackState::Resuming => self.set_state(TrackState::Active),
            // keep draining: moving out of STOPPING_1 would skip the drain
            TrackState::Stopping1 => self.resume_to_stopping.store(false, Ordering::Relaxed),
            _ => {}
        }
    }

    // ─────────────────────────────────────────────────────────
    // Client lifecycle (thread lock held)
    // ─────────────────────────────────────────────────────────

    /// Returns true if the worker must add the track to its active set
    pub(crate) fn start_l(&self) -> FlingerResult<bool> {
        if self.is_terminated() {
            return Err(FlingerError::DeadObject(format!("track {} is terminated", self.id().0)));
        }
        let next = match self.state() {
            TrackState::Paused | TrackState::Pausing => {
                if self.resume_to_stopping.load(Ordering::Relaxed) {
                    TrackState::Stopping1
                } else {
                    TrackState::Resuming
                }
            }
            _ => TrackState::Active,
        };
        self.set_state(next);
        self.cblk().clear_flags(CBLK_DISABLED | CBLK_STREAM_END_DONE);

        if self.is_in_active_set() {
            return Ok(false);
        }
        self.start_queued.store(true, Ordering::Relaxed);
        Ok(true)
    }

    /// Move towards STOPPED; tracks outside the active set stop at once
    pub(crate) fn stop_l(&self) {
        match self.state() {
            TrackState::Resuming | TrackState::Active | TrackState::Pausing | TrackState::Paused => {}
            _ => return,
        }
        if !self.is_in_active_set() {
            self.reset();
            self.set_state(TrackState::Stopped);
        } else if !self.is_fast() && !self.is_offloaded() && !self.is_direct() {
            // drained by the mixer, then removed once presented
            self.set_state(TrackState::Stopped);
        } else {
            self.set_state(TrackState::Stopping1);
        }
    }

    /// Returns true if the state changed
    pub(crate) fn pause_l(&self) -> bool {
        match self.state() {
            TrackState::Stopping1 | TrackState::Stopping2 => {
                if !self.is_offloaded() {
                    return false;
                }
                // an offloaded track carries on draining once resumed
                self.resume_to_stopping.store(true, Ordering::Relaxed);
                self.set_state(TrackState::Pausing);
                true
            }
            TrackState::Active | TrackState::Resuming => {
                self.set_state(TrackState::Pausing);
                true
            }
            _ => false,
        }
    }

    /// Returns true if the worker must discard the track's buffered frames
    pub(crate) fn flush_l(&self) -> bool {
        if self.is_offloaded() {
            // any state: seeking must not wait for a pause to land
            if self.is_terminated() {
                return false;
            }
            self.reset();
            if self.state().is_stopping() {
                self.set_state(TrackState::Active);
            }
            self.flush_hw_pending.store(true, Ordering::Relaxed);
            self.resume_to_stopping.store(false, Ordering::Relaxed);
            return true;
        }

        match self.state() {
            TrackState::Stopping1
            | TrackState::Stopping2
            | TrackState::Stopped
            | TrackState::Paused
            | TrackState::Pausing
            | TrackState::Idle
            | TrackState::Flushed => {}
            _ => return false,
        }
        self.set_state(TrackState::Flushed);
        if self.is_direct() {
            self.flush_hw_pending.store(true, Ordering::Relaxed);
        }
        if !self.is_in_active_set() {
            self.reset();
        }
        true
    }

    // ─────────────────────────────────────────────────────────
    // Worker side
    // ─────────────────────────────────────────────────────────

    /// Prepare for a fresh run in the active set
    pub(crate) fn on_added_to_active(&self, startup_retries: u32) {
        self.set_active(true);
        self.set_retry_count(startup_retries);
        self.reset_done.store(false, Ordering::Relaxed);
        self.presentation_complete_frames.store(0, Ordering::Relaxed);
    }

    /// Force an underrun until new data arrives; FLUSHED settles to IDLE
    ///
    /// Runs once per stop so frames written right after a flush survive.
    pub(crate) fn reset(&self) {
        if self.reset_done.swap(true, Ordering::Relaxed) {
            return;
        }
        self.cblk().clear_flags(CBLK_FORCEREADY);
        if self.state() == TrackState::Flushed {
            self.set_state(TrackState::Idle);
        }
    }

    pub(crate) fn set_paused(&self) {
        if self.state() == TrackState::Pausing {
            self.set_state(TrackState::Paused);
        }
    }

    /// True once the sink has played everything released from this track
    ///
    /// The first call pins the target at `frames_written + latency_frames`.
    /// Completion fires presentation sync events and reports end of stream.
    pub(crate) fn presentation_complete(&self, frames_written: u64, latency_frames: u64) -> bool {
        let mut target = self.presentation_complete_frames.load(Ordering::Relaxed);
        if target == 0 {
            target = frames_written + latency_frames;
            self.presentation_complete_frames.store(target, Ordering::Relaxed);
            log::trace!(
                "track {}: presentation complete at {} (written {})",
                self.id().0,
                target,
                frames_written
            );
        }
        if frames_written >= target || self.is_offloaded() {
            self.trigger_sync_events(SyncEventType::PresentationComplete);
            self.cblk().set_flags(CBLK_STREAM_END_DONE);
            self.notify(TrackEvent::StreamEnd);
            return true;
        }
        false
    }

    /// Attach an event fired when this track finishes presenting
    ///
    /// Refused (and the event cancelled) when the track will never complete.
    pub(crate) fn set_sync_event(&self, event: std::sync::Arc<SyncEvent>) -> FlingerResult<()> {
        let state = self.state();
        if self.is_terminated()
            || state == TrackState::Paused
            || (state == TrackState::Stopped && self.frames_ready() == 0)
        {
            log::warn!(
                "track {}: sync event refused in state {} on session {}",
                self.id().0,
                state.name(),
                self.session().0
            );
            event.cancel();
            return Err(FlingerError::invalid_operation("track cannot complete presentation"));
        }
        self.add_sync_event(event);
        Ok(())
    }

    /// The client must recreate the track
    pub fn invalidate(&self) {
        self.cblk().set_flags(CBLK_INVALID);
        self.notify(TrackEvent::Invalidated);
    }

    /// Starved past the retry budget
    pub(crate) fn disable(&self) {
        log::debug!("track {}: buffer timeout, disabled", self.id().0);
        self.cblk().set_flags(CBLK_DISABLED);
        self.notify(TrackEvent::Disabled);
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("base", &self.base)
            .field("stream", &self.stream_type)
            .field("flags", &self.flags)
            .field("fast_index", &self.fast_index())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{frame_ring, ControlBlock, FrameWriter};
    use crate::types::{AudioFormat, ChannelMask, SessionId, StreamConfig, TrackId, Uid};
    use crossbeam::channel::{unbounded, Receiver};
    use std::sync::Arc;

    fn make(flags: OutputFlags) -> (Track, FrameWriter, Receiver<TrackEvent>) {
        let config = StreamConfig {
            sample_rate: 48000,
            format: AudioFormat::Pcm16,
            channel_mask: ChannelMask::OUT_STEREO,
            frame_count: 256,
        };
        let (writer, reader) = frame_ring(256, config.frame_size()).unwrap();
        let (tx, rx) = unbounded();
        let base = TrackBase::new(
            TrackId(1),
            SessionId(9),
            Uid(1000),
            config,
            Arc::new(ControlBlock::new(48000)),
            tx,
        );
        (Track::new(base, StreamType::Music, flags, reader, false), writer, rx)
    }

    /// Simulate the worker picking up a queued start
    fn worker_adds(track: &Track) {
        track.on_added_to_active(50);
    }

    #[test]
    fn test_full_lifecycle_of_fast_track() {
        let (t, _w, _rx) = make(OutputFlags::FAST);
        t.set_fast_index(Some(1));
        assert_eq!(t.state(), TrackState::Idle);

        assert!(t.start_l().unwrap());
        assert_eq!(t.state(), TrackState::Active);
        worker_adds(&t);

        assert!(t.pause_l());
        assert_eq!(t.state(), TrackState::Pausing);
        t.set_paused();
        assert_eq!(t.state(), TrackState::Paused);

        assert!(!t.start_l().unwrap(), "still in the active set");
        assert_eq!(t.state(), TrackState::Resuming);
        t.resume_ack();
        assert_eq!(t.state(), TrackState::Active);

        t.stop_l();
        assert_eq!(t.state(), TrackState::Stopping1);
    }

    #[test]
    fn test_event_to_departed_client_reports_undelivered() {
        let (t, _w, rx) = make(OutputFlags::empty());
        assert!(t.notify(TrackEvent::Underrun));
        assert_eq!(rx.try_recv().unwrap(), TrackEvent::Underrun);
        drop(rx);
        assert!(!t.notify(TrackEvent::Underrun));
    }

    #[test]
    fn test_stop_from_idle_is_noop() {
        let (t, _w, _rx) = make(OutputFlags::empty());
        t.stop_l();
        assert_eq!(t.state(), TrackState::Idle);
        assert!(!t.pause_l());
        assert_eq!(t.state(), TrackState::Idle);
    }

    #[test]
    fn test_normal_track_stops_directly() {
        let (t, _w, _rx) = make(OutputFlags::empty());
        t.start_l().unwrap();
        worker_adds(&t);
        t.stop_l();
        assert_eq!(t.state(), TrackState::Stopped);
        assert!(t.flush_l());
        assert_eq!(t.state(), TrackState::Flushed);
    }

    #[test]
    fn test_flush_ignored_while_playing() {
        let (t, _w, _rx) = make(OutputFlags::empty());
        t.start_l().unwrap();
        assert!(!t.flush_l());
        assert_eq!(t.state(), TrackState::Active);
    }

    #[test]
    fn test_flush_of_inactive_track_settles_idle() {
        let (t, _w, _rx) = make(OutputFlags::empty());
        assert!(t.flush_l());
        // reset ran immediately: FLUSHED -> IDLE
        assert_eq!(t.state(), TrackState::Idle);
    }

    #[test]
    fn test_terminated_track_cannot_start() {
        let (t, _w, _rx) = make(OutputFlags::empty());
        t.terminate();
        assert!(matches!(t.start_l(), Err(FlingerError::DeadObject(_))));
    }

    #[test]
    fn test_offload_pause_while_stopping_resumes_to_stopping() {
        let (t, _w, _rx) = make(OutputFlags::COMPRESS_OFFLOAD);
        t.start_l().unwrap();
        worker_adds(&t);
        t.stop_l();
        assert_eq!(t.state(), TrackState::Stopping1);
        assert!(t.pause_l());
        t.set_paused();
        t.start_l().unwrap();
        assert_eq!(t.state(), TrackState::Stopping1);
        assert!(t.is_resume_pending());
        t.resume_ack();
        assert_eq!(t.state(), TrackState::Stopping1);
        assert!(!t.is_resume_pending());
    }

    #[test]
    fn test_offload_flush_while_stopping_reactivates() {
        let (t, _w, _rx) = make(OutputFlags::COMPRESS_OFFLOAD);
        t.start_l().unwrap();
        worker_adds(&t);
        t.stop_l();
        assert!(t.flush_l());
        assert_eq!(t.state(), TrackState::Active);
        assert!(t.is_flush_pending());
        t.flush_ack();
        assert!(!t.is_flush_pending());
    }

    #[test]
    fn test_presentation_complete_waits_for_latency() {
        let (t, _w, rx) = make(OutputFlags::empty());
        assert!(!t.presentation_complete(1000, 480));
        assert!(!t.presentation_complete(1400, 0));
        assert!(t.presentation_complete(1480, 0));
        assert_eq!(rx.try_recv().unwrap(), TrackEvent::StreamEnd);
        assert!(t.cblk().has_flag(CBLK_STREAM_END_DONE));
    }

    #[test]
    fn test_sync_event_refused_when_paused() {
        let (t, _w, _rx) = make(OutputFlags::empty());
        t.start_l().unwrap();
        t.pause_l();
        t.set_paused();
        let event = Arc::new(SyncEvent::new(
            SyncEventType::PresentationComplete,
            SessionId(9),
            SessionId(10),
            Box::new(|_| {}),
        ));
        assert!(t.set_sync_event(event.clone()).is_err());
        assert!(event.is_cancelled());
    }

    #[test]
    fn test_restart_clears_disabled_flag() {
        let (t, _w, rx) = make(OutputFlags::empty());
        t.start_l().unwrap();
        t.disable();
        assert_eq!(rx.try_recv().unwrap(), TrackEvent::Disabled);
        t.start_l().unwrap();
        assert!(!t.cblk().has_flag(CBLK_DISABLED));
    }
}
