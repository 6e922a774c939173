//! Client handles
//!
//! What [`AudioFlinger`](crate::AudioFlinger) hands out for a created track:
//! the client end of the frame ring, the event receiver and a reference to
//! the owning thread. Dropping a handle destroys the track.

use std::sync::Arc;

use crossbeam::channel::Receiver;

use crate::buffer::{FrameReader, FrameWriter};
use crate::error::FlingerResult;
use crate::sync_event::SyncEvent;
use crate::thread::{PlaybackThread, RecordThread};

use super::base::TrackEvent;
use super::playback::Track;
use super::record::RecordTrack;

/// A playback stream as seen by its client
pub struct TrackHandle {
    track: Arc<Track>,
    writer: FrameWriter,
    events: Receiver<TrackEvent>,
    thread: Arc<PlaybackThread>,
}

impl TrackHandle {
    pub(crate) fn new(
        track: Arc<Track>,
        writer: FrameWriter,
        events: Receiver<TrackEvent>,
        thread: Arc<PlaybackThread>,
    ) -> Self {
        Self {
            track,
            writer,
            events,
            thread,
        }
    }

    #[inline]
    pub fn track(&self) -> &Arc<Track> {
        &self.track
    }

    #[inline]
    pub fn thread(&self) -> &Arc<PlaybackThread> {
        &self.thread
    }

    pub fn start(&self) -> FlingerResult<()> {
        self.thread.start_track(&self.track)
    }

    pub fn stop(&self) {
        self.thread.stop_track(&self.track);
    }

    pub fn pause(&self) {
        self.thread.pause_track(&self.track);
    }

    /// Discard everything written so far
    pub fn flush(&self) {
        self.thread.flush_track(&self.track, self.writer.frames_written());
    }

    /// Queue frames; returns whole frames accepted
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.writer.write(data)
    }

    #[inline]
    pub fn frames_available(&self) -> usize {
        self.writer.frames_available()
    }

    pub fn set_volume(&self, left: f32, right: f32) {
        self.track.cblk().set_volume(left.clamp(0.0, 1.0), right.clamp(0.0, 1.0));
    }

    /// Frames the thread has consumed
    #[inline]
    pub fn server_position(&self) -> u64 {
        self.track.cblk().server_position()
    }

    #[inline]
    pub fn events(&self) -> &Receiver<TrackEvent> {
        &self.events
    }
}

impl Drop for TrackHandle {
    fn drop(&mut self) {
        self.thread.destroy_track(&self.track);
    }
}

/// A capture stream as seen by its client
pub struct RecordHandle {
    track: Arc<RecordTrack>,
    reader: FrameReader,
    events: Receiver<TrackEvent>,
    thread: Arc<RecordThread>,
}

impl RecordHandle {
    pub(crate) fn new(
        track: Arc<RecordTrack>,
        reader: FrameReader,
        events: Receiver<TrackEvent>,
        thread: Arc<RecordThread>,
    ) -> Self {
        Self {
            track,
            reader,
            events,
            thread,
        }
    }

    #[inline]
    pub fn track(&self) -> &Arc<RecordTrack> {
        &self.track
    }

    #[inline]
    pub fn thread(&self) -> &Arc<RecordThread> {
        &self.thread
    }

    /// Start capturing; with `sync_event`, frames are dropped until it fires
    pub fn start(&self, sync_event: Option<Arc<SyncEvent>>) -> FlingerResult<()> {
        self.thread.start(&self.track, sync_event)
    }

    pub fn stop(&self) -> bool {
        self.thread.stop(&self.track)
    }

    /// Copy captured frames into `buf`; returns whole frames read
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.reader.read(buf)
    }

    #[inline]
    pub fn frames_ready(&self) -> usize {
        self.reader.frames_ready()
    }

    #[inline]
    pub fn events(&self) -> &Receiver<TrackEvent> {
        &self.events
    }
}

impl Drop for RecordHandle {
    fn drop(&mut self) {
        self.thread.destroy_track(&self.track);
    }
}
