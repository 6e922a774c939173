//! Record track: the server side of one client capture stream

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::buffer::{FrameWriter, CBLK_OVERRUN};
use crate::error::{FlingerError, FlingerResult};
use crate::sync_event::{SyncEvent, SYNC_RECORD_START_TIMEOUT_MS};
use crate::types::InputFlags;

use super::base::{TrackBase, TrackEvent};
use super::state::TrackState;

/// Server side of a client capture stream
pub struct RecordTrack {
    base: TrackBase,
    flags: InputFlags,
    writer: Mutex<FrameWriter>,
    /// Positive: frames still to discard. Negative: waiting for the sync
    /// start event, with the timeout expressed as minus the frames left.
    frames_to_drop: AtomicI64,
    sync_start_event: Mutex<Option<Arc<SyncEvent>>>,
    active: AtomicBool,
    start_queued: AtomicBool,
    overflow: AtomicBool,
}

impl Deref for RecordTrack {
    type Target = TrackBase;

    fn deref(&self) -> &TrackBase {
        &self.base
    }
}

impl RecordTrack {
    pub(crate) fn new(base: TrackBase, flags: InputFlags, writer: FrameWriter) -> Self {
        Self {
            base,
            flags,
            writer: Mutex::new(writer),
            frames_to_drop: AtomicI64::new(0),
            sync_start_event: Mutex::new(None),
            active: AtomicBool::new(false),
            start_queued: AtomicBool::new(false),
            overflow: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn flags(&self) -> InputFlags {
        self.flags
    }

    pub(crate) fn writer(&self) -> MutexGuard<'_, FrameWriter> {
        crate::lock(&self.writer)
    }

    pub(crate) fn is_client_gone(&self) -> bool {
        self.writer().is_reader_gone()
    }

    #[inline]
    pub fn frames_to_drop(&self) -> i64 {
        self.frames_to_drop.load(Ordering::Relaxed)
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

    /// Begin capture, optionally gated on `sync_event`
    ///
    /// Returns true if the worker must add the track to its active set. An
    /// already cancelled event starts capture at once.
    pub(crate) fn start_l(&self, sync_event: Option<Arc<SyncEvent>>) -> FlingerResult<bool> {
        if self.is_terminated() {
            return Err(FlingerError::DeadObject(format!("record track {} is terminated", self.id().0)));
        }
        self.clear_sync_start_event();
        if let Some(event) = sync_event {
            if !event.is_cancelled() {
                let timeout = SYNC_RECORD_START_TIMEOUT_MS as i64 * self.sample_rate() as i64 / 1000;
                self.frames_to_drop.store(-timeout, Ordering::Relaxed);
                *crate::lock(&self.sync_start_event) = Some(event);
            }
        }

        if self.is_in_active_set() {
            if self.state() == TrackState::Pausing {
                self.set_state(TrackState::Active);
            }
            return Ok(false);
        }
        self.set_state(TrackState::Active);
        self.start_queued.store(true, Ordering::Relaxed);
        Ok(true)
    }

    /// Returns true if the worker has to take the track out of its active set
    pub(crate) fn stop_l(&self) -> bool {
        if !self.is_in_active_set() {
            return false;
        }
        if self.state() != TrackState::Pausing {
            self.set_state(TrackState::Pausing);
        }
        true
    }

    /// Called from the trigger session's worker when the awaited event fires
    pub(crate) fn handle_sync_start_event(&self, event: &SyncEvent, frames_to_drop: i64) {
        let ours = crate::lock(&self.sync_start_event)
            .as_ref()
            .map_or(false, |e| std::ptr::eq(Arc::as_ptr(e), event));
        if ours {
            log::debug!(
                "record track {}: sync start, dropping {} more frames",
                self.id().0,
                frames_to_drop
            );
            self.frames_to_drop.store(frames_to_drop, Ordering::Relaxed);
        }
    }

    pub(crate) fn clear_sync_start_event(&self) {
        if let Some(event) = crate::lock(&self.sync_start_event).take() {
            event.cancel();
        }
        self.frames_to_drop.store(0, Ordering::Relaxed);
    }

    /// Account for `frames` captured frames discarded instead of delivered
    pub(crate) fn consume_dropped_frames(&self, frames: usize) {
        let frames = frames as i64;
        let left = self.frames_to_drop();
        if left > 0 {
            let left = left - frames;
            self.frames_to_drop.store(left, Ordering::Relaxed);
            if left <= 0 {
                self.clear_sync_start_event();
            }
        } else if left < 0 {
            let left = left + frames;
            self.frames_to_drop.store(left, Ordering::Relaxed);
            let cancelled = crate::lock(&self.sync_start_event)
                .as_ref()
                .map_or(true, |e| e.is_cancelled());
            if left >= 0 || cancelled {
                log::warn!(
                    "record track {}: synced start {}, session {}",
                    self.id().0,
                    if left >= 0 { "timed out" } else { "cancelled" },
                    self.session().0
                );
                self.clear_sync_start_event();
            }
        }
    }

    /// Flag an overrun; returns true if it was already flagged
    pub(crate) fn set_overflow(&self) -> bool {
        let was = self.overflow.swap(true, Ordering::Relaxed);
        if !was {
            self.cblk().set_flags(CBLK_OVERRUN);
            self.notify(TrackEvent::Overrun);
        }
        was
    }

    pub(crate) fn clear_overflow(&self) {
        if self.overflow.swap(false, Ordering::Relaxed) {
            self.cblk().clear_flags(CBLK_OVERRUN);
        }
    }

    pub fn invalidate(&self) {
        self.cblk().set_flags(crate::buffer::CBLK_INVALID);
        self.notify(TrackEvent::Invalidated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{frame_ring, ControlBlock};
    use crate::sync_event::SyncEventType;
    use crate::types::{AudioFormat, ChannelMask, SessionId, StreamConfig, TrackId, Uid};
    use crossbeam::channel::unbounded;

    fn make() -> (Arc<RecordTrack>, crate::buffer::FrameReader) {
        let config = StreamConfig {
            sample_rate: 16000,
            format: AudioFormat::Pcm16,
            channel_mask: ChannelMask::IN_MONO,
            frame_count: 320,
        };
        let (writer, reader) = frame_ring(320, config.frame_size()).unwrap();
        let (tx, _rx) = unbounded();
        let base = TrackBase::new(
            TrackId(2),
            SessionId(5),
            Uid(10),
            config,
            Arc::new(ControlBlock::new(16000)),
            tx,
        );
        (Arc::new(RecordTrack::new(base, InputFlags::empty(), writer)), reader)
    }

    fn event() -> Arc<SyncEvent> {
        Arc::new(SyncEvent::new(
            SyncEventType::PresentationComplete,
            SessionId(1),
            SessionId(5),
            Box::new(|_| {}),
        ))
    }

    #[test]
    fn test_armed_start_waits_with_timeout_in_frames() {
        let (t, _r) = make();
        assert!(t.start_l(Some(event())).unwrap());
        assert_eq!(t.frames_to_drop(), -(30 * 16000));
    }

    #[test]
    fn test_sync_event_switches_to_countdown() {
        let (t, _r) = make();
        let ev = event();
        t.start_l(Some(ev.clone())).unwrap();
        t.handle_sync_start_event(&ev, 640);
        assert_eq!(t.frames_to_drop(), 640);
        t.consume_dropped_frames(320);
        assert_eq!(t.frames_to_drop(), 320);
        t.consume_dropped_frames(320);
        assert_eq!(t.frames_to_drop(), 0);
    }

    #[test]
    fn test_foreign_event_is_ignored() {
        let (t, _r) = make();
        t.start_l(Some(event())).unwrap();
        t.handle_sync_start_event(&event(), 640);
        assert!(t.frames_to_drop() < 0);
    }

    #[test]
    fn test_timeout_releases_capture() {
        let (t, _r) = make();
        t.start_l(Some(event())).unwrap();
        t.consume_dropped_frames(30 * 16000);
        assert_eq!(t.frames_to_drop(), 0);
    }

    #[test]
    fn test_cancelled_trigger_starts_immediately() {
        let (t, _r) = make();
        let ev = event();
        t.start_l(Some(ev.clone())).unwrap();
        ev.cancel();
        t.consume_dropped_frames(1);
        assert_eq!(t.frames_to_drop(), 0);
    }

    #[test]
    fn test_stop_then_restart_while_pausing() {
        let (t, _r) = make();
        t.start_l(None).unwrap();
        t.set_active(true);
        assert!(t.stop_l());
        assert_eq!(t.state(), TrackState::Pausing);
        assert!(!t.start_l(None).unwrap());
        assert_eq!(t.state(), TrackState::Active);
    }

    #[test]
    fn test_overflow_flag_roundtrip() {
        let (t, _r) = make();
        assert!(!t.set_overflow());
        assert!(t.set_overflow());
        assert!(t.cblk().has_flag(CBLK_OVERRUN));
        t.clear_overflow();
        assert!(!t.cblk().has_flag(CBLK_OVERRUN));
    }
}
