//! Whole-session behavior of the recorder against mock encoders and writers

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crabreel::config::{EncoderSettings, RecorderSettings};
use crabreel::recording::{
    AudioSource, ContainerGate, EncoderAdapter, FrameSource, IngestMode, PollIngest, PushSource,
    Recorder, RecordingConfig, SessionState, TrackKind, VideoPipeline,
};
use crabreel::testing::{
    synthetic_audio_chunk, synthetic_i420_frame, MockBackend, MockCodec, MockWriter,
    RecordingStore, ScriptedSampler,
};

fn recorder_with(
    backend: &Arc<MockBackend>,
    store: &Arc<RecordingStore>,
    tune: impl FnOnce(&mut RecorderSettings),
) -> (Recorder, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = RecorderSettings::default();
    settings.storage.work_dir = dir.path().join("work");
    settings.encoder.input_timeout_ms = 2;
    settings.encoder.output_timeout_ms = 0;
    tune(&mut settings);
    let rec = Recorder::new(settings, backend.clone(), store.clone());
    rec.configure(RecordingConfig::new(64, 48, 25));
    (rec, dir)
}

fn recorder(backend: &Arc<MockBackend>, store: &Arc<RecordingStore>) -> (Recorder, TempDir) {
    recorder_with(backend, store, |_| {})
}

/// Offer a frame until the bounded queue admits it
fn push_frame(tx: &crabreel::FrameSender, n: u64) {
    push_sized_frame(tx, n, 64, 48);
}

fn push_sized_frame(tx: &crabreel::FrameSender, n: u64, width: u32, height: u32) {
    let frame = synthetic_i420_frame(n, width, height);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !tx.on_frame(frame.data.clone(), width, height, Some(n * 40_000)) {
        assert!(Instant::now() < deadline, "frame {} never admitted", n);
        thread::sleep(Duration::from_millis(1));
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn fifty_push_frames_record_on_the_frame_grid() {
    let backend = Arc::new(MockBackend::new());
    let store = Arc::new(RecordingStore::new());
    let (rec, _dir) = recorder(&backend, &store);
    rec.configure(RecordingConfig::new(256, 192, 25).with_bitrate_mbps(15));

    let (tx, push) = rec.push_channel();
    assert!(rec.start(FrameSource::Push(push)));
    assert_eq!(rec.ingest_mode(), Some(IngestMode::Push));
    for n in 0..50 {
        push_sized_frame(&tx, n, 256, 192);
        // Irregular delivery, 10 to 40 ms apart
        thread::sleep(Duration::from_millis(10 + (n * 7 % 4) * 10));
    }
    assert!(rec.stop());

    let log = backend.video_log().unwrap();
    let log = log.lock().unwrap();
    let expected: Vec<u64> = (0..50).map(|k| k * 40_000).collect();
    assert_eq!(log.queued_timestamps, expected);
    assert_eq!(log.end_of_stream_at, Some(2_000_000));
    assert!(log.stopped);

    let stats = rec.last_stats().unwrap();
    assert_eq!(stats.frames_submitted, 50);
    assert_eq!(stats.samples_written, 50);
    assert_eq!(stats.samples_discarded, 0);
    assert!(stats.end_of_stream_delivered);

    let calls = store.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.category, "Movies/ThermalCamera");
    assert!(calls[0].1.display_name.starts_with("MINI2-256_"));
    assert_eq!(stats.persisted_path.as_deref(), Some(calls[0].0.as_path()));
}

#[test]
fn stop_is_idempotent() {
    let backend = Arc::new(MockBackend::new());
    let store = Arc::new(RecordingStore::new());
    let (rec, _dir) = recorder(&backend, &store);

    let (tx, push) = rec.push_channel();
    assert!(rec.start(FrameSource::Push(push)));
    push_frame(&tx, 0);

    assert!(rec.stop());
    assert!(rec.stop());
    assert_eq!(rec.state(), SessionState::Idle);
    assert_eq!(store.calls().len(), 1);

    let writer = backend.writer_log().unwrap();
    let writer = writer.lock().unwrap();
    assert_eq!(writer.stops, 1);
    assert_eq!(writer.closes, 1);
}

#[test]
fn frames_after_stop_are_refused() {
    let backend = Arc::new(MockBackend::new());
    let store = Arc::new(RecordingStore::new());
    let (rec, _dir) = recorder(&backend, &store);

    let (tx, push) = rec.push_channel();
    assert!(rec.start(FrameSource::Push(push)));
    push_frame(&tx, 0);
    assert!(rec.stop());

    let frame = synthetic_i420_frame(1, 64, 48);
    assert!(!tx.on_frame(frame.data, 64, 48, None));
}

#[test]
fn busy_encoder_drops_without_timestamp_gaps() {
    let backend = Arc::new(MockBackend::new().failing_first_acquisitions(3));
    let store = Arc::new(RecordingStore::new());
    let (rec, _dir) = recorder_with(&backend, &store, |s| s.encoder.input_timeout_ms = 0);

    let (tx, push) = rec.push_channel();
    assert!(rec.start(FrameSource::Push(push)));
    for n in 0..5 {
        push_frame(&tx, n);
    }
    assert!(rec.stop());

    let stats = rec.last_stats().unwrap();
    assert_eq!(stats.frames_dropped, 3);
    assert_eq!(stats.frames_submitted, 2);

    let log = backend.video_log().unwrap();
    let log = log.lock().unwrap();
    assert_eq!(log.queued_timestamps, vec![0, 40_000]);
    assert_eq!(log.end_of_stream_at, Some(80_000));
}

#[test]
fn end_of_stream_retries_until_a_slot_frees() {
    let backend = Arc::new(MockBackend::new().failing_first_acquisitions(3));
    let store = Arc::new(RecordingStore::new());
    let (rec, _dir) = recorder_with(&backend, &store, |s| s.encoder.input_timeout_ms = 0);

    let (_tx, push) = rec.push_channel();
    assert!(rec.start(FrameSource::Push(push)));
    assert!(rec.stop());

    let log = backend.video_log().unwrap();
    let log = log.lock().unwrap();
    assert_eq!(log.failed_acquisitions, 3);
    assert_eq!(log.end_of_stream_at, Some(0));
    assert!(rec.last_stats().unwrap().end_of_stream_delivered);
}

#[test]
fn pause_blocks_frames_and_keeps_timestamps_contiguous() {
    let backend = Arc::new(MockBackend::new());
    let store = Arc::new(RecordingStore::new());
    let (rec, _dir) = recorder(&backend, &store);

    let (tx, push) = rec.push_channel();
    assert!(rec.start(FrameSource::Push(push)));
    push_frame(&tx, 0);
    push_frame(&tx, 1);

    let log = backend.video_log().unwrap();
    wait_until(|| log.lock().unwrap().queued_timestamps.len() == 2);

    assert!(rec.pause());
    let frame = synthetic_i420_frame(2, 64, 48);
    assert!(!tx.on_frame(frame.data, 64, 48, None));
    assert!(rec.resume());

    push_frame(&tx, 3);
    push_frame(&tx, 4);
    assert!(rec.stop());

    assert_eq!(
        log.lock().unwrap().queued_timestamps,
        vec![0, 40_000, 80_000, 120_000]
    );
}

#[test]
fn audio_track_holds_the_writer_until_both_tracks_exist() {
    let backend = Arc::new(MockBackend::new());
    let store = Arc::new(RecordingStore::new());
    let (rec, _dir) = recorder(&backend, &store);
    rec.configure(RecordingConfig::new(64, 48, 25).with_audio(true));

    let (audio_tx, audio_source) = AudioSource::channel(16);
    rec.attach_audio(audio_source);
    let (tx, push) = rec.push_channel();
    assert!(rec.start(FrameSource::Push(push)));

    for n in 0..3 {
        assert!(audio_tx.send(synthetic_audio_chunk(n, 960, 48_000, 1)));
    }
    let audio_log = backend.audio_log().unwrap();
    wait_until(|| audio_log.lock().unwrap().queued_timestamps.len() == 3);

    push_frame(&tx, 0);
    push_frame(&tx, 1);
    assert!(rec.stop());

    assert_eq!(
        audio_log.lock().unwrap().queued_timestamps,
        vec![0, 20_000, 40_000]
    );

    let writer = backend.writer_log().unwrap();
    let writer = writer.lock().unwrap();
    let kinds: Vec<TrackKind> = writer.tracks.iter().map(|t| t.kind).collect();
    assert_eq!(kinds.len(), 2);
    assert!(kinds.contains(&TrackKind::Video));
    assert!(kinds.contains(&TrackKind::Audio));
    assert_eq!(writer.starts, 1);
    assert!(writer.samples.iter().all(|(_, s)| s.size > 0));

    let stats = rec.last_stats().unwrap();
    assert_eq!(stats.audio_chunks_submitted, 3);
    assert_eq!(stats.frames_submitted, 2);
}

#[test]
fn start_failures_leave_the_recorder_idle() {
    let store = Arc::new(RecordingStore::new());

    let backend = Arc::new(MockBackend::new().failing_video_configure());
    let (rec, dir) = recorder(&backend, &store);
    let (_tx, push) = rec.push_channel();
    assert!(!rec.start(FrameSource::Push(push)));
    assert_eq!(rec.state(), SessionState::Idle);
    assert!(!dir.path().join("work").exists());

    let backend = Arc::new(MockBackend::new().failing_container());
    let (rec, _dir) = recorder(&backend, &store);
    let (_tx, push) = rec.push_channel();
    assert!(!rec.start(FrameSource::Push(push)));
    assert_eq!(rec.state(), SessionState::Idle);

    let backend = Arc::new(MockBackend::new());
    let (rec, _dir) = recorder(&backend, &store);
    rec.configure(RecordingConfig::new(63, 48, 25));
    let (_tx, push) = rec.push_channel();
    assert!(!rec.start(FrameSource::Push(push)));
    assert_eq!(backend.sessions(), 0);

    assert!(store.calls().is_empty());
}

#[test]
fn writer_start_failure_discards_the_recording() {
    let backend = Arc::new(MockBackend::new().failing_writer_start());
    let store = Arc::new(RecordingStore::new());
    let (rec, _dir) = recorder(&backend, &store);

    let (tx, push) = rec.push_channel();
    assert!(rec.start(FrameSource::Push(push)));
    let path = rec.output_path().unwrap();
    push_frame(&tx, 0);
    assert!(rec.stop());

    assert!(store.calls().is_empty());
    assert!(!path.exists());
    assert_eq!(rec.last_stats().unwrap().samples_written, 0);
}

#[test]
fn persistence_failure_still_stops_cleanly() {
    let backend = Arc::new(MockBackend::new());
    let store = Arc::new(RecordingStore::failing());
    let (rec, _dir) = recorder(&backend, &store);

    let (tx, push) = rec.push_channel();
    assert!(rec.start(FrameSource::Push(push)));
    push_frame(&tx, 0);
    assert!(rec.stop());

    assert_eq!(store.calls().len(), 1);
    assert_eq!(rec.state(), SessionState::Idle);
    assert!(rec.last_stats().unwrap().persisted_path.is_none());
}

#[test]
fn poll_session_stamps_every_tick() {
    let backend = Arc::new(MockBackend::new());
    let store = Arc::new(RecordingStore::new());
    let (rec, _dir) = recorder(&backend, &store);

    assert!(rec.start(FrameSource::Poll(Box::new(ScriptedSampler::always(64, 48)))));
    assert_eq!(rec.ingest_mode(), Some(IngestMode::Poll));

    let log = backend.video_log().unwrap();
    wait_until(|| log.lock().unwrap().queued_timestamps.len() >= 3);
    assert!(rec.stop());

    let log = log.lock().unwrap();
    let expected: Vec<u64> = (0..log.queued_timestamps.len() as u64)
        .map(|k| k * 40_000)
        .collect();
    assert_eq!(log.queued_timestamps, expected);
    assert_eq!(store.calls().len(), 1);
}

#[test]
fn push_or_poll_follows_the_producer() {
    let backend = Arc::new(MockBackend::new());
    let store = Arc::new(RecordingStore::new());
    let (rec, _dir) = recorder(&backend, &store);

    let (tx, push) = PushSource::channel(4);
    let source = FrameSource::PushOrPoll {
        push,
        fallback: Box::new(ScriptedSampler::always(64, 48)),
    };
    assert_eq!(source.mode(), IngestMode::Push);
    assert!(rec.start(source));
    assert_eq!(rec.ingest_mode(), Some(IngestMode::Push));
    assert!(rec.stop());
    drop(tx);

    let (tx, push) = PushSource::channel(4);
    drop(tx);
    let source = FrameSource::PushOrPoll {
        push,
        fallback: Box::new(ScriptedSampler::always(64, 48)),
    };
    assert!(rec.start(source));
    assert_eq!(rec.ingest_mode(), Some(IngestMode::Poll));
    assert!(rec.stop());
}

#[test]
fn poll_misses_reuse_the_last_frame() {
    let config = RecordingConfig::new(32, 32, 25);
    let settings = EncoderSettings {
        input_timeout_ms: 0,
        output_timeout_ms: 0,
        ..EncoderSettings::default()
    };
    let codec = MockCodec::video();
    let log = codec.log();
    let adapter = Arc::new(EncoderAdapter::new(Box::new(codec), &settings));
    adapter.configure(&config).unwrap();
    adapter.start().unwrap();
    let gate = Arc::new(Mutex::new(ContainerGate::new(Box::new(MockWriter::new()), false)));
    let video = VideoPipeline::new(adapter, gate, &config);

    let mut ingest = PollIngest::new(Box::new(ScriptedSampler::failing_on(32, 32, &[2, 5, 9])), 32, 32);
    for _ in 0..10 {
        if let Some(frame) = ingest.tick().frame() {
            video.submit_frame(frame).unwrap();
        }
    }
    assert_eq!(ingest.reused(), 3);
    assert_eq!(ingest.skipped(), 0);
    assert_eq!(video.frames_submitted(), 10);
    let expected: Vec<u64> = (0..10).map(|k| k * 40_000).collect();
    assert_eq!(log.lock().unwrap().queued_timestamps, expected);

    let mut ingest = PollIngest::new(Box::new(ScriptedSampler::failing_on(32, 32, &[1, 2, 5])), 32, 32);
    let fresh = (0..10).filter(|_| ingest.tick().frame().is_some()).count();
    assert_eq!(fresh, 8);
    assert_eq!(ingest.skipped(), 2);
    assert_eq!(ingest.reused(), 1);
}
