//! Output tracks: the duplicating thread's sinks
//!
//! An [`OutputTrack`] is an ordinary mixer track on a downstream playback
//! thread, fed by a duplicating thread instead of a client. When the
//! downstream ring is full the write waits a bounded time, then parks the
//! rest in a small overflow queue that the next write drains first.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::buffer::{FrameWriter, CBLK_DISABLED};
use crate::error::FlingerResult;
use crate::track::Track;
use crate::types::{StreamConfig, Uid};

use super::PlaybackThread;

/// Overflow buffers kept per output track before data is dropped
pub const MAX_OVERFLOW_BUFFERS: usize = 10;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

struct OverflowBuffer {
    data: Vec<u8>,
    offset: usize,
}

impl OverflowBuffer {
    fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }
}

pub struct OutputTrack {
    thread: Arc<PlaybackThread>,
    track: Arc<Track>,
    writer: FrameWriter,
    overflow: VecDeque<OverflowBuffer>,
    active: bool,
}

impl OutputTrack {
    pub(crate) fn new(thread: Arc<PlaybackThread>, config: StreamConfig, uid: Uid) -> FlingerResult<Self> {
        let (track, writer) = thread.create_output_track(config, uid)?;
        Ok(Self {
            thread,
            track,
            writer,
            overflow: VecDeque::new(),
            active: false,
        })
    }

    /// Downstream thread this track feeds
    #[inline]
    pub fn thread(&self) -> &Arc<PlaybackThread> {
        &self.thread
    }

    #[inline]
    pub fn track(&self) -> &Arc<Track> {
        &self.track
    }

    #[inline]
    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    fn start(&mut self) -> bool {
        match self.thread.start_track(&self.track) {
            Ok(()) => {
                self.active = true;
                true
            }
            Err(e) => {
                log::warn!("output track {}: start failed: {}", self.track.id().0, e);
                false
            }
        }
    }

    /// Queue a copy of `data` unless the overflow is full or the sink sleeps
    fn queue(&mut self, data: &[u8]) {
        if data.is_empty() || self.thread.standby() {
            return;
        }
        if self.overflow.len() >= MAX_OVERFLOW_BUFFERS {
            log::warn!(
                "output track {} on {}: no more overflow buffers",
                self.track.id().0,
                self.thread.name()
            );
            return;
        }
        self.overflow.push_back(OverflowBuffer {
            data: data.to_vec(),
            offset: 0,
        });
    }

    /// Push `data` downstream, waiting at most `wait` for ring space
    ///
    /// An empty `data` with nothing queued means the source went quiet and
    /// stops the downstream track. Returns true if the ring filled up before
    /// everything was delivered.
    pub fn write(&mut self, data: &[u8], wait: Duration) -> bool {
        let frame_size = self.writer.frame_size();
        let frames = data.len() / frame_size;

        if !self.active && frames > 0 {
            if !self.start() {
                return false;
            }
            // prime the downstream ring so it does not underrun right away
            let lead = self.track.frame_count().saturating_sub(frames);
            if lead > 0 && self.overflow.len() < MAX_OVERFLOW_BUFFERS {
                let silence = vec![0u8; lead * frame_size];
                let written = self.writer.write(&silence);
                if written < lead {
                    self.queue(&silence[written * frame_size..]);
                }
            }
        }

        let deadline = Instant::now() + wait;
        let mut input = &data[..frames * frame_size];
        let mut full = false;
        loop {
            let from_queue = !self.overflow.is_empty();
            let pending = match self.overflow.front() {
                Some(buffer) => buffer.remaining(),
                None => input,
            };
            if pending.is_empty() {
                break;
            }

            if self.writer.frames_available() == 0 {
                if self.track.cblk().has_flag(CBLK_DISABLED) {
                    // starved downstream; a new start re-arms it
                    let _ = self.start();
                }
                if Instant::now() >= deadline {
                    full = true;
                    break;
                }
                thread::sleep(POLL_INTERVAL);
                continue;
            }

            let written = self.writer.write(pending) * frame_size;
            if from_queue {
                if let Some(front) = self.overflow.front_mut() {
                    front.offset += written;
                    if front.offset >= front.data.len() {
                        self.overflow.pop_front();
                    }
                }
            } else {
                input = &input[written..];
            }
        }

        if !input.is_empty() {
            self.queue(input);
        }
        if frames == 0 && self.overflow.is_empty() && self.active {
            self.stop();
        }
        full
    }

    /// Let the downstream track play out and drop anything queued
    pub fn stop(&mut self) {
        self.thread.stop_track(&self.track);
        self.overflow.clear();
        self.active = false;
    }

    /// Detach from the downstream thread
    pub fn destroy(&mut self) {
        self.stop();
        self.thread.destroy_track(&self.track);
    }
}

impl std::fmt::Debug for OutputTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputTrack")
            .field("thread", &self.thread.name())
            .field("track", &self.track.id().0)
            .field("overflow", &self.overflow.len())
            .field("active", &self.active)
            .finish()
    }
}
