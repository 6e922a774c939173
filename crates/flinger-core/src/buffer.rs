//! Track shared buffer and control block
//!
//! Every track owns one bounded frame ring. The ring is split into two
//! capabilities at creation time:
//!
//! ```text
//!   playback:  client ──FrameWriter──▶ [ ring ] ──FrameReader──▶ worker (mix)
//!   record:    worker ──FrameWriter──▶ [ ring ] ──FrameReader──▶ client
//! ```
//!
//! Each side can only move its own cursor, so the consumer can never pass
//! the producer. The worker-side reader hands out contiguous runs through
//! [`FrameReader::get_next_buffer`]; the run is given back with
//! [`TrackBuffer::release`], which commits at most the frames it handed out.
//!
//! The [`ControlBlock`] carries the small amount of state both sides read
//! without locking: client volume, status flags and the server position.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use rtrb::chunks::{ReadChunk, WriteChunk};
use rtrb::{Consumer, Producer, RingBuffer};

use crate::error::{FlingerError, FlingerResult};

// ─────────────────────────────────────────────────────────────
// Control block
// ─────────────────────────────────────────────────────────────

/// The server observed an underrun on this track
pub const CBLK_UNDERRUN: u32 = 0x01;
/// Treat the track as filled even if the buffer is not full
pub const CBLK_FORCEREADY: u32 = 0x02;
/// The track was invalidated and must be recreated by the client
pub const CBLK_INVALID: u32 = 0x04;
/// The track was removed from the active set after running out of retries
pub const CBLK_DISABLED: u32 = 0x08;
/// All frames of the stream have been presented
pub const CBLK_STREAM_END_DONE: u32 = 0x10;
/// A record track fell behind and captured frames were lost
pub const CBLK_OVERRUN: u32 = 0x20;

/// State shared between a track's client and the worker thread
///
/// All fields are atomics with relaxed ordering: values are advisory and
/// only need to become visible eventually.
#[derive(Debug)]
pub struct ControlBlock {
    flags: AtomicU32,
    volume_l: AtomicU32,
    volume_r: AtomicU32,
    sample_rate: AtomicU32,
    server_position: AtomicU64,
    underrun_frames: AtomicU64,
}

impl ControlBlock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            flags: AtomicU32::new(0),
            volume_l: AtomicU32::new(1.0f32.to_bits()),
            volume_r: AtomicU32::new(1.0f32.to_bits()),
            sample_rate: AtomicU32::new(sample_rate),
            server_position: AtomicU64::new(0),
            underrun_frames: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags() & flag != 0
    }

    #[inline]
    pub fn set_flags(&self, flags: u32) {
        self.flags.fetch_or(flags, Ordering::Relaxed);
    }

    #[inline]
    pub fn clear_flags(&self, flags: u32) {
        self.flags.fetch_and(!flags, Ordering::Relaxed);
    }

    /// Client volume (left, right), each clamped to [0.0, 1.0]
    pub fn volume(&self) -> (f32, f32) {
        (
            f32::from_bits(self.volume_l.load(Ordering::Relaxed)),
            f32::from_bits(self.volume_r.load(Ordering::Relaxed)),
        )
    }

    pub fn set_volume(&self, left: f32, right: f32) {
        self.volume_l.store(left.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        self.volume_r.store(right.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate, Ordering::Relaxed);
    }

    /// Frames consumed (playback) or produced (record) by the server
    #[inline]
    pub fn server_position(&self) -> u64 {
        self.server_position.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn advance_server_position(&self, frames: u64) {
        self.server_position.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn underrun_frames(&self) -> u64 {
        self.underrun_frames.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn add_underrun_frames(&self, frames: u64) {
        self.underrun_frames.fetch_add(frames, Ordering::Relaxed);
    }
}

// ─────────────────────────────────────────────────────────────
// Frame ring
// ─────────────────────────────────────────────────────────────

/// Create a ring of `frame_count` frames of `frame_size` bytes
pub fn frame_ring(frame_count: usize, frame_size: usize) -> FlingerResult<(FrameWriter, FrameReader)> {
    if frame_count == 0 || frame_size == 0 {
        return Err(FlingerError::bad_value(format!(
            "frame ring needs a non-zero size (frames={}, frame_size={})",
            frame_count, frame_size
        )));
    }
    let capacity = frame_count
        .checked_mul(frame_size)
        .ok_or_else(|| FlingerError::NoMemory(format!("{} frames of {} bytes", frame_count, frame_size)))?;
    let (producer, consumer) = RingBuffer::<u8>::new(capacity);
    Ok((
        FrameWriter {
            producer,
            frame_size,
            frame_count,
            written: 0,
        },
        FrameReader {
            consumer,
            frame_size,
            frame_count,
            released: 0,
            flushed: 0,
        },
    ))
}

/// Producer capability of a frame ring
pub struct FrameWriter {
    producer: Producer<u8>,
    frame_size: usize,
    frame_count: usize,
    written: u64,
}

impl FrameWriter {
    /// Whole frames that can be written without overwriting unread data
    #[inline]
    pub fn frames_available(&self) -> usize {
        self.producer.slots() / self.frame_size
    }

    /// Copy as many whole frames from `data` as fit; returns frames written
    pub fn write(&mut self, data: &[u8]) -> usize {
        let frames = (data.len() / self.frame_size).min(self.frames_available());
        if frames == 0 {
            return 0;
        }
        let bytes = frames * self.frame_size;
        match self.producer.write_chunk_uninit(bytes) {
            Ok(chunk) => {
                let n = chunk.fill_from_iter(data[..bytes].iter().copied());
                let done = n / self.frame_size;
                self.written += done as u64;
                done
            }
            Err(_) => 0,
        }
    }

    /// Borrow a contiguous writable run of up to `max_frames` frames
    pub fn obtain(&mut self, max_frames: usize) -> Option<WriteBuffer<'_>> {
        let frames = max_frames.min(self.frames_available());
        if frames == 0 {
            return None;
        }
        let Self {
            producer,
            frame_size,
            written,
            ..
        } = self;
        let mut chunk = producer.write_chunk(frames * *frame_size).ok()?;
        let contiguous = chunk.as_mut_slices().0.len() / *frame_size;
        if contiguous == 0 {
            return None;
        }
        Some(WriteBuffer {
            chunk,
            frames: contiguous,
            frame_size: *frame_size,
            written,
        })
    }

    /// Total frames committed since creation
    #[inline]
    pub fn frames_written(&self) -> u64 {
        self.written
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Whether the reader capability has been dropped
    #[inline]
    pub fn is_reader_gone(&self) -> bool {
        self.producer.is_abandoned()
    }
}

/// A contiguous writable run obtained from a [`FrameWriter`]
pub struct WriteBuffer<'a> {
    chunk: WriteChunk<'a, u8>,
    frames: usize,
    frame_size: usize,
    written: &'a mut u64,
}

impl WriteBuffer<'_> {
    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let len = self.frames * self.frame_size;
        &mut self.chunk.as_mut_slices().0[..len]
    }

    /// Publish the first `frames` frames to the reader; extra frames are ignored
    pub fn commit(self, frames: usize) -> usize {
        let n = frames.min(self.frames);
        self.chunk.commit(n * self.frame_size);
        *self.written += n as u64;
        n
    }
}

/// Consumer capability of a frame ring
pub struct FrameReader {
    consumer: Consumer<u8>,
    frame_size: usize,
    frame_count: usize,
    released: u64,
    flushed: u64,
}

impl FrameReader {
    /// Frames available to consume, without committing to anything
    #[inline]
    pub fn frames_ready(&self) -> usize {
        self.consumer.slots() / self.frame_size
    }

    /// Borrow a contiguous run of up to `max_frames` frames at the read cursor
    ///
    /// Returns `None` when the producer has not caught up; that is a normal
    /// "skip this track this cycle" signal, not an error.
    pub fn get_next_buffer(&mut self, max_frames: usize) -> Option<TrackBuffer<'_>> {
        let frames = max_frames.min(self.frames_ready());
        if frames == 0 {
            return None;
        }
        let Self {
            consumer,
            frame_size,
            released,
            ..
        } = self;
        let chunk = consumer.read_chunk(frames * *frame_size).ok()?;
        let contiguous = chunk.as_slices().0.len() / *frame_size;
        if contiguous == 0 {
            return None;
        }
        Some(TrackBuffer {
            chunk,
            frames: contiguous,
            frame_size: *frame_size,
            released,
        })
    }

    /// Copy up to `out.len()` bytes worth of whole frames; returns frames read
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let wanted = out.len() / self.frame_size;
        let mut done = 0;
        while done < wanted {
            let fs = self.frame_size;
            let Some(buffer) = self.get_next_buffer(wanted - done) else {
                break;
            };
            let n = buffer.frames();
            out[done * fs..(done + n) * fs].copy_from_slice(buffer.data());
            buffer.release(n);
            done += n;
        }
        done
    }

    /// Discard everything currently readable; returns frames discarded
    pub fn flush(&mut self) -> usize {
        self.discard(usize::MAX)
    }

    /// Discard readable frames up to the writer's `position`
    ///
    /// `position` is a [`FrameWriter::frames_written`] value sampled when the
    /// flush was requested; frames written after that survive.
    pub fn flush_to(&mut self, position: u64) -> usize {
        let consumed = self.released + self.flushed;
        let behind = position.saturating_sub(consumed);
        self.discard(usize::try_from(behind).unwrap_or(usize::MAX))
    }

    fn discard(&mut self, max_frames: usize) -> usize {
        let frames = (self.consumer.slots() / self.frame_size).min(max_frames);
        if frames == 0 {
            return 0;
        }
        if let Ok(chunk) = self.consumer.read_chunk(frames * self.frame_size) {
            chunk.commit_all();
            self.flushed += frames as u64;
            return frames;
        }
        0
    }

    /// Frames consumed through [`TrackBuffer::release`]
    #[inline]
    pub fn frames_released(&self) -> u64 {
        self.released
    }

    /// Frames discarded by [`FrameReader::flush`]
    #[inline]
    pub fn frames_flushed(&self) -> u64 {
        self.flushed
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Whether the writer capability has been dropped
    #[inline]
    pub fn is_writer_gone(&self) -> bool {
        self.consumer.is_abandoned()
    }
}

/// A contiguous readable run obtained from [`FrameReader::get_next_buffer`]
///
/// Dropping it without calling [`release`](TrackBuffer::release) releases nothing.
pub struct TrackBuffer<'a> {
    chunk: ReadChunk<'a, u8>,
    frames: usize,
    frame_size: usize,
    released: &'a mut u64,
}

impl TrackBuffer<'_> {
    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn data(&self) -> &[u8] {
        &self.chunk.as_slices().0[..self.frames * self.frame_size]
    }

    /// Advance the read cursor by `frames`, clamped to what this run holds
    pub fn release(self, frames: usize) -> usize {
        let n = frames.min(self.frames);
        self.chunk.commit(n * self.frame_size);
        *self.released += n as u64;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames_of(n: usize, frame_size: usize, start: u8) -> Vec<u8> {
        (0..n * frame_size).map(|i| start.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_zero_sized_ring_rejected() {
        assert!(matches!(frame_ring(0, 4), Err(FlingerError::BadValue(_))));
        assert!(matches!(frame_ring(16, 0), Err(FlingerError::BadValue(_))));
    }

    #[test]
    fn test_write_then_read_preserves_bytes() {
        let (mut w, mut r) = frame_ring(8, 4).unwrap();
        let data = frames_of(5, 4, 10);
        assert_eq!(w.write(&data), 5);
        assert_eq!(r.frames_ready(), 5);

        let mut out = vec![0u8; 20];
        assert_eq!(r.read(&mut out), 5);
        assert_eq!(out, data);
        assert_eq!(r.frames_ready(), 0);
    }

    #[test]
    fn test_write_stops_when_full() {
        let (mut w, r) = frame_ring(4, 2).unwrap();
        assert_eq!(w.write(&frames_of(10, 2, 0)), 4);
        assert_eq!(w.frames_available(), 0);
        assert_eq!(r.frames_ready(), 4);
    }

    #[test]
    fn test_partial_frames_are_not_written() {
        let (mut w, r) = frame_ring(4, 4).unwrap();
        assert_eq!(w.write(&[1, 2, 3]), 0);
        assert_eq!(w.write(&[1, 2, 3, 4, 5, 6]), 1);
        assert_eq!(r.frames_ready(), 1);
    }

    #[test]
    fn test_empty_ring_signals_no_data() {
        let (_w, mut r) = frame_ring(4, 4).unwrap();
        assert!(r.get_next_buffer(4).is_none());
    }

    #[test]
    fn test_next_buffer_is_contiguous_across_wrap() {
        let (mut w, mut r) = frame_ring(4, 2).unwrap();
        w.write(&frames_of(3, 2, 0));
        let b = r.get_next_buffer(3).unwrap();
        b.release(3);
        // Cursor now sits at frame 3: a 3-frame write wraps around.
        w.write(&frames_of(3, 2, 100));
        let b = r.get_next_buffer(3).unwrap();
        assert_eq!(b.frames(), 1);
        assert_eq!(b.data(), &[100, 101]);
        b.release(1);
        let b = r.get_next_buffer(3).unwrap();
        assert_eq!(b.frames(), 2);
        b.release(2);
        assert_eq!(r.frames_ready(), 0);
    }

    #[test]
    fn test_over_release_is_clamped() {
        let (mut w, mut r) = frame_ring(8, 4).unwrap();
        w.write(&frames_of(2, 4, 0));
        let b = r.get_next_buffer(8).unwrap();
        assert_eq!(b.release(100), 2);
        assert_eq!(r.frames_released(), 2);
    }

    #[test]
    fn test_dropped_buffer_releases_nothing() {
        let (mut w, mut r) = frame_ring(8, 4).unwrap();
        w.write(&frames_of(3, 4, 0));
        drop(r.get_next_buffer(3));
        assert_eq!(r.frames_ready(), 3);
        assert_eq!(r.frames_released(), 0);
    }

    #[test]
    fn test_release_never_exceeds_available() {
        // Deterministic pseudo-random interleaving of writes and releases.
        let (mut w, mut r) = frame_ring(32, 4).unwrap();
        let mut seed: u32 = 0x1234_5678;
        let mut next = || {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (seed >> 16) as usize
        };
        for _ in 0..2000 {
            let n = next() % 20;
            w.write(&frames_of(n, 4, 0));
            let want = next() % 24;
            if let Some(b) = r.get_next_buffer(want) {
                let give_back = next() % 30;
                b.release(give_back);
            }
            assert!(r.frames_released() <= w.frames_written());
            assert_eq!(
                r.frames_ready() as u64,
                w.frames_written() - r.frames_released()
            );
        }
    }

    #[test]
    fn test_flush_discards_readable_frames() {
        let (mut w, mut r) = frame_ring(8, 2).unwrap();
        w.write(&frames_of(6, 2, 0));
        assert_eq!(r.flush(), 6);
        assert_eq!(r.frames_ready(), 0);
        assert_eq!(r.frames_flushed(), 6);
        assert_eq!(w.frames_available(), 8);
    }

    #[test]
    fn test_flush_to_keeps_later_frames() {
        let (mut w, mut r) = frame_ring(8, 2).unwrap();
        w.write(&frames_of(3, 2, 0));
        let position = w.frames_written();
        w.write(&frames_of(2, 2, 50));
        assert_eq!(r.flush_to(position), 3);
        assert_eq!(r.frames_ready(), 2);
        assert_eq!(r.flush_to(position), 0);
        let mut out = [0u8; 4];
        r.read(&mut out);
        assert_eq!(out, [50, 51, 52, 53]);
    }

    #[test]
    fn test_obtain_and_commit() {
        let (mut w, mut r) = frame_ring(4, 2).unwrap();
        let mut buf = w.obtain(3).unwrap();
        assert_eq!(buf.frames(), 3);
        buf.data_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(buf.commit(2), 2);
        assert_eq!(w.frames_written(), 2);
        let mut out = [0u8; 4];
        assert_eq!(r.read(&mut out), 2);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_liveness_follows_capability_drop() {
        let (w, r) = frame_ring(4, 2).unwrap();
        assert!(!r.is_writer_gone());
        drop(w);
        assert!(r.is_writer_gone());
    }

    #[test]
    fn test_control_block_flags_and_volume() {
        let cblk = ControlBlock::new(48000);
        cblk.set_flags(CBLK_UNDERRUN | CBLK_DISABLED);
        assert!(cblk.has_flag(CBLK_DISABLED));
        cblk.clear_flags(CBLK_DISABLED);
        assert!(!cblk.has_flag(CBLK_DISABLED));
        assert!(cblk.has_flag(CBLK_UNDERRUN));

        cblk.set_volume(0.5, 2.0);
        assert_eq!(cblk.volume(), (0.5, 1.0));
    }
}
