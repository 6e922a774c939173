//! Scenario tests driving playback workers by hand against mock streams

use super::*;

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::devices::OutputDevices;
use crate::hal::mock::{fire, MockOutHandle, MockStreamOut};
use crate::hal::{DrainKind, StreamEvent};
use crate::thread::config_event::{AudioPatch, ConfigEventKind};

fn sink() -> StreamConfig {
    StreamConfig {
        sample_rate: 48000,
        format: AudioFormat::Pcm16,
        channel_mask: ChannelMask::OUT_STEREO,
        frame_count: 480,
    }
}

fn engine() -> EngineConfig {
    EngineConfig {
        standby_delay_ms: 0,
        ..Default::default()
    }
}

fn open_with(
    id: u32,
    config: EngineConfig,
    flags: OutputFlags,
) -> (Arc<PlaybackThread>, PlaybackWorker, MockOutHandle) {
    let (out, handle) = if flags.contains(OutputFlags::COMPRESS_OFFLOAD) {
        MockStreamOut::offload(sink())
    } else {
        MockStreamOut::new(sink())
    };
    let ctx = ThreadContext::new(config);
    let (thread, worker) = PlaybackWorker::open(IoHandle(id), ctx, Box::new(out), flags).unwrap();
    (thread, worker, handle)
}

fn open_mixer() -> (Arc<PlaybackThread>, PlaybackWorker, MockOutHandle) {
    open_with(1, engine(), OutputFlags::PRIMARY)
}

fn music() -> TrackParams {
    TrackParams::new(StreamType::Music, 48000, AudioFormat::Pcm16, ChannelMask::OUT_STEREO)
}

/// Stereo PCM16 frames with every sample set to `value`
fn frames(count: usize, value: i16) -> Vec<u8> {
    value.to_le_bytes().repeat(count * 2)
}

fn last_sample(written: &[u8]) -> i16 {
    let n = written.len();
    i16::from_le_bytes([written[n - 2], written[n - 1]])
}

fn drain_events(rx: &Receiver<TrackEvent>) -> Vec<TrackEvent> {
    rx.try_iter().collect()
}

// ─────────────────────────────────────────────────────────────
// Track creation
// ─────────────────────────────────────────────────────────────

#[test]
fn test_idle_without_tracks() {
    let (thread, mut worker, handle) = open_mixer();
    assert_eq!(worker.run_cycle(), Cycle::Idle);
    assert_eq!(thread.mixer_state(), MixerState::Idle);
    assert!(thread.standby());
    assert_eq!(handle.lock().unwrap().writes, 0);
}

#[test]
fn test_compressed_track_refused_on_mixer() {
    let (thread, _worker, _h) = open_mixer();
    let params = TrackParams::new(StreamType::Music, 48000, AudioFormat::Mp3, ChannelMask::OUT_STEREO);
    assert!(matches!(thread.create_track(params), Err(FlingerError::BadValue(_))));
    assert_eq!(thread.track_count(), 0);
}

#[test]
fn test_direct_track_must_match_sink() {
    let (thread, _worker, _h) = open_with(2, engine(), OutputFlags::DIRECT);
    let params = TrackParams::new(StreamType::Music, 44100, AudioFormat::Pcm16, ChannelMask::OUT_STEREO);
    assert!(thread.create_track(params).is_err());
    let (track, _w, _rx) = thread.create_track(music()).unwrap();
    assert!(track.is_direct());
}

#[test]
fn test_paused_direct_track_leaves_active_set() {
    let (thread, mut worker, _h) = open_with(2, engine(), OutputFlags::DIRECT);
    let (track, mut writer, _rx) = thread.create_track(music()).unwrap();
    writer.write(&frames(960, 100));
    thread.start_track(&track).unwrap();
    worker.run_cycle();
    assert_eq!(thread.active_track_count(), 1);

    thread.pause_track(&track);
    assert_eq!(track.state(), TrackState::Pausing);
    worker.run_cycle();
    assert_eq!(track.state(), TrackState::Paused);
    assert_eq!(thread.active_track_count(), 0);
}

#[test]
fn test_fast_slots_are_limited() {
    let config = EngineConfig {
        fast_track_slots: 2,
        ..engine()
    };
    let (thread, _worker, _h) = open_with(3, config, OutputFlags::PRIMARY);
    let (first, _w1, _r1) = thread.create_track(music().with_flags(OutputFlags::FAST)).unwrap();
    let (second, _w2, _r2) = thread.create_track(music().with_flags(OutputFlags::FAST)).unwrap();
    assert_eq!(first.fast_index(), Some(1));
    assert!(!second.is_fast());
    assert!(!second.flags().contains(OutputFlags::FAST));

    let (other, _worker2, _h2) = open_mixer();
    let resampled = TrackParams::new(StreamType::Music, 44100, AudioFormat::Pcm16, ChannelMask::OUT_STEREO);
    let (slow, _w3, _r3) = other.create_track(resampled.with_flags(OutputFlags::FAST)).unwrap();
    assert!(!slow.is_fast());
}

// ─────────────────────────────────────────────────────────────
// Mixing
// ─────────────────────────────────────────────────────────────

#[test]
fn test_started_track_is_mixed_and_written() {
    let (thread, mut worker, handle) = open_mixer();
    let (track, mut writer, _rx) = thread.create_track(music()).unwrap();
    assert_eq!(writer.write(&frames(480, 1000)), 480);
    thread.start_track(&track).unwrap();

    assert_eq!(worker.run_cycle(), Cycle::Continue(Duration::ZERO));
    assert_eq!(thread.mixer_state(), MixerState::TracksReady);
    assert!(!thread.standby());
    assert_eq!(thread.frames_written(), 480);
    assert_eq!(track.cblk().server_position(), 480);

    let written = handle.lock().unwrap().written.clone();
    assert_eq!(written.len(), 480 * 4);
    assert!((last_sample(&written) - 1000).abs() <= 2);
}

#[test]
fn test_stream_volume_scales_mix() {
    let (thread, mut worker, handle) = open_mixer();
    thread.set_stream_volume(StreamType::Music, 0.5);
    let (track, mut writer, _rx) = thread.create_track(music()).unwrap();
    writer.write(&frames(480, 1000));
    thread.start_track(&track).unwrap();
    worker.run_cycle();

    let written = handle.lock().unwrap().written.clone();
    assert!((last_sample(&written) - 500).abs() <= 2);
}

#[test]
fn test_starved_track_underruns_once_then_is_disabled() {
    let config = EngineConfig {
        max_track_startup_retries: 3,
        ..engine()
    };
    let (thread, mut worker, _h) = open_with(4, config, OutputFlags::PRIMARY);
    let (track, _writer, rx) = thread.create_track(music()).unwrap();
    thread.start_track(&track).unwrap();

    worker.run_cycle();
    assert_eq!(thread.mixer_state(), MixerState::TracksEnabled);
    worker.run_cycle();
    assert_eq!(drain_events(&rx), vec![TrackEvent::Underrun]);
    assert_eq!(thread.active_track_count(), 1);

    worker.run_cycle();
    assert_eq!(drain_events(&rx), vec![TrackEvent::Disabled]);
    assert_eq!(thread.active_track_count(), 0);
    assert!(track.cblk().underrun_frames() >= 3 * 480);
}

#[test]
fn test_stop_ends_stream_and_fires_sync_event() {
    let (thread, mut worker, handle) = open_mixer();
    let (track, mut writer, rx) = thread.create_track(music().with_session(SessionId(321))).unwrap();

    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let event = Arc::new(SyncEvent::new(
        SyncEventType::PresentationComplete,
        SessionId(321),
        SessionId(5),
        Box::new(move |_| flag.store(true, Ordering::Relaxed)),
    ));
    assert!(thread.set_sync_event(&event).unwrap());
    let elsewhere = Arc::new(SyncEvent::new(
        SyncEventType::PresentationComplete,
        SessionId(999),
        SessionId(5),
        Box::new(|_| {}),
    ));
    assert!(!thread.set_sync_event(&elsewhere).unwrap());

    writer.write(&frames(480, 100));
    thread.start_track(&track).unwrap();
    worker.run_cycle();
    assert!(!fired.load(Ordering::Relaxed));

    thread.stop_track(&track);
    assert_eq!(track.state(), TrackState::Stopped);
    worker.run_cycle();
    assert_eq!(drain_events(&rx), vec![TrackEvent::StreamEnd]);
    assert!(fired.load(Ordering::Relaxed));
    assert!(event.is_triggered());
    assert_eq!(thread.active_track_count(), 0);

    assert_eq!(worker.run_cycle(), Cycle::Idle);
    assert_eq!(handle.lock().unwrap().standby_count, 1);
}

#[test]
fn test_destroyed_track_leaves_after_cycle() {
    let (thread, mut worker, _h) = open_mixer();
    let (track, mut writer, _rx) = thread.create_track(music()).unwrap();
    writer.write(&frames(480, 100));
    thread.start_track(&track).unwrap();
    worker.run_cycle();

    thread.destroy_track(&track);
    assert_eq!(thread.track_count(), 1);
    worker.run_cycle();
    assert_eq!(thread.track_count(), 0);
    assert!(matches!(thread.start_track(&track), Err(FlingerError::BadValue(_))));
}

#[test]
fn test_suspended_output_discards_mix() {
    let (thread, mut worker, handle) = open_mixer();
    let (track, mut writer, _rx) = thread.create_track(music()).unwrap();
    writer.write(&frames(960, 100));
    thread.start_track(&track).unwrap();

    thread.suspend();
    worker.run_cycle();
    assert_eq!(handle.lock().unwrap().writes, 0);
    assert_eq!(thread.frames_written(), 480);

    thread.restore();
    assert!(!thread.is_suspended());
    worker.run_cycle();
    assert_eq!(handle.lock().unwrap().writes, 1);
    assert_eq!(thread.frames_written(), 960);
}

// ─────────────────────────────────────────────────────────────
// Config events
// ─────────────────────────────────────────────────────────────

#[test]
fn test_config_events_run_in_order() {
    let (thread, mut worker, handle) = open_mixer();
    {
        let mut st = thread.lock();
        thread.send_config_event_l(&mut st, ConfigEventKind::SetParameter("screen_state=on".into()));
        thread.send_config_event_l(&mut st, ConfigEventKind::SetParameter("bt_headset_name=car".into()));
    }
    worker.run_cycle();
    assert_eq!(
        handle.lock().unwrap().param_log,
        vec!["screen_state=on".to_string(), "bt_headset_name=car".to_string()]
    );
}

#[test]
fn test_refused_parameters_retried_after_standby() {
    let (thread, mut worker, handle) = open_mixer();
    let (track, mut writer, _rx) = thread.create_track(music()).unwrap();
    writer.write(&frames(480, 100));
    thread.start_track(&track).unwrap();
    worker.run_cycle();
    assert!(!thread.standby());

    handle.lock().unwrap().refuse_params = 1;
    {
        let mut st = thread.lock();
        thread.send_config_event_l(&mut st, ConfigEventKind::SetParameter("screen_state=off".into()));
    }
    worker.run_cycle();
    let h = handle.lock().unwrap();
    assert_eq!(h.param_log.len(), 2);
    assert_eq!(h.standby_count, 1);
    assert_eq!(h.params.get("screen_state"), Some("off"));
}

#[test]
fn test_patch_routes_and_releases() {
    let (thread, worker, handle) = open_mixer();
    let join = worker.spawn().unwrap();

    let patch = thread
        .create_audio_patch(AudioPatch::playback(thread.id(), OutputDevices::WIRED_HEADSET))
        .unwrap();
    assert_eq!(thread.out_device(), OutputDevices::WIRED_HEADSET);
    assert!(thread
        .create_audio_patch(AudioPatch::playback(IoHandle(77), OutputDevices::SPEAKER))
        .is_err());
    thread.release_audio_patch(patch).unwrap();
    assert!(thread.out_device().is_empty());
    assert!(thread.release_audio_patch(patch).is_err());

    thread.exit();
    join.join().unwrap();
    assert!(handle.lock().unwrap().param_log.iter().any(|kv| kv.starts_with("routing=")));
}

// ─────────────────────────────────────────────────────────────
// Offload
// ─────────────────────────────────────────────────────────────

fn open_offload() -> (Arc<PlaybackThread>, PlaybackWorker, MockOutHandle) {
    open_with(5, engine(), OutputFlags::COMPRESS_OFFLOAD | OutputFlags::NON_BLOCKING)
}

#[test]
fn test_partial_async_write_waits_for_callback() {
    let (thread, mut worker, handle) = open_offload();
    assert_eq!(thread.kind(), OutputKind::Offload);
    handle.lock().unwrap().accept_limit = Some(1000);
    let (track, mut writer, _rx) = thread.create_track(music()).unwrap();
    assert!(track.is_offloaded());
    writer.write(&frames(480, 100));
    thread.start_track(&track).unwrap();

    worker.run_cycle();
    assert_eq!(handle.lock().unwrap().written.len(), 1000);
    assert_eq!(handle.lock().unwrap().volume, Some((1.0, 1.0)));
    assert_eq!(worker.run_cycle(), Cycle::WaitAsync);
    assert!(!worker.poll_callbacks());

    fire(&handle, StreamEvent::WriteReady);
    assert!(worker.poll_callbacks());
    assert_ne!(worker.run_cycle(), Cycle::WaitAsync);
    assert_eq!(handle.lock().unwrap().written.len(), 1920);
}

#[test]
fn test_offload_stop_drains_before_stream_end() {
    let (thread, mut worker, handle) = open_offload();
    let (track, mut writer, rx) = thread.create_track(music()).unwrap();
    writer.write(&frames(480, 100));
    thread.start_track(&track).unwrap();
    worker.run_cycle();

    thread.stop_track(&track);
    assert_eq!(track.state(), TrackState::Stopping1);
    for _ in 0..10 {
        if !handle.lock().unwrap().drains.is_empty() {
            break;
        }
        worker.run_cycle();
    }
    assert_eq!(handle.lock().unwrap().drains, vec![DrainKind::EarlyNotify]);
    assert_eq!(track.state(), TrackState::Stopping2);
    assert_eq!(worker.run_cycle(), Cycle::WaitAsync);
    assert!(drain_events(&rx).is_empty());

    fire(&handle, StreamEvent::DrainReady);
    assert!(worker.poll_callbacks());
    worker.run_cycle();
    assert_eq!(drain_events(&rx), vec![TrackEvent::StreamEnd]);
    assert_eq!(track.state(), TrackState::Stopped);
    assert_eq!(thread.active_track_count(), 0);
}

#[test]
fn test_starved_offload_track_times_out() {
    let (thread, mut worker, _h) = open_offload();
    let retries = thread.engine_config().max_track_retries_offload;
    assert_eq!(retries, 20);
    let (track, _writer, rx) = thread.create_track(music()).unwrap();
    thread.start_track(&track).unwrap();

    for _ in 1..retries {
        worker.run_cycle();
        assert!(drain_events(&rx).is_empty());
    }
    assert_eq!(thread.mixer_state(), MixerState::TracksEnabled);
    assert_eq!(thread.active_track_count(), 1);
    worker.run_cycle();
    assert_eq!(drain_events(&rx), vec![TrackEvent::Disabled]);
    assert_eq!(thread.active_track_count(), 0);
}

#[test]
fn test_stream_error_invalidates_tracks() {
    let (thread, worker, handle) = open_offload();
    let (_track, _writer, rx) = thread.create_track(music()).unwrap();
    fire(&handle, StreamEvent::Error);
    assert!(worker.poll_callbacks());
    assert_eq!(drain_events(&rx), vec![TrackEvent::Invalidated]);
}

// ─────────────────────────────────────────────────────────────
// Duplication
// ─────────────────────────────────────────────────────────────

#[test]
fn test_duplicating_thread_feeds_downstream_outputs() {
    let (a, mut a_worker, a_handle) = open_with(10, engine(), OutputFlags::PRIMARY);
    let (b, _b_worker, _b_handle) = open_with(11, engine(), OutputFlags::PRIMARY);
    let (dup, mut dup_worker) = PlaybackWorker::open_duplicating(IoHandle(12), a.ctx().clone(), &a);
    assert!(a.add_output_track(&b).is_err());

    dup.add_output_track(&a).unwrap();
    dup.add_output_track(&b).unwrap();
    assert!(matches!(dup.add_output_track(&b), Err(FlingerError::AlreadyExists(_))));
    assert_eq!(dup.output_track_count(), 2);
    assert_eq!(dup.wait_time_ms(), 20);
    assert_eq!(a.track_count(), 1);
    assert_eq!(b.track_count(), 1);

    let (track, mut writer, _rx) = dup.create_track(music()).unwrap();
    writer.write(&frames(480, 100));
    dup.start_track(&track).unwrap();
    dup_worker.run_cycle();
    assert_eq!(dup.frames_written(), 480);

    a_worker.run_cycle();
    assert_eq!(a.active_track_count(), 1);
    assert_eq!(a_handle.lock().unwrap().written.len(), 480 * 4);

    assert!(dup.remove_output_track(b.id()));
    assert!(!dup.remove_output_track(b.id()));
    assert_eq!(dup.output_track_ios(), vec![a.id()]);
}
