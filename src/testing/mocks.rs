//! Scriptable test doubles
//!
//! Each double records what was done to it in a shared log that stays
//! readable after the double itself has been moved into the recorder.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{EncoderSettings, StorageSettings};
use crate::errors::RecorderError;
use crate::recording::{
    Codec, CodecOutput, ContainerStats, ContainerWriter, EncodedSample, FrameSampler, InputSlot,
    MediaMetadata, MediaStore, RawFrame, RecorderBackend, RecordingConfig, SampleFlags,
    TrackDescriptor, TrackFormat, TrackKind,
};

use super::synthetic_data::synthetic_i420_frame;

/// Sampler that succeeds except on the listed 1-based ticks
pub struct ScriptedSampler {
    width: u32,
    height: u32,
    failing_ticks: HashSet<u64>,
    calls: Arc<Mutex<u64>>,
}

impl ScriptedSampler {
    pub fn always(width: u32, height: u32) -> Self {
        Self::failing_on(width, height, &[])
    }

    pub fn failing_on(width: u32, height: u32, ticks: &[u64]) -> Self {
        Self {
            width,
            height,
            failing_ticks: ticks.iter().copied().collect(),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Shared count of capture calls
    pub fn calls(&self) -> Arc<Mutex<u64>> {
        Arc::clone(&self.calls)
    }
}

impl FrameSampler for ScriptedSampler {
    fn capture_current_frame(&mut self, _target_width: u32, _target_height: u32) -> Option<RawFrame> {
        let mut calls = self.calls.lock().expect("lock poisoned");
        *calls += 1;
        if self.failing_ticks.contains(&*calls) {
            None
        } else {
            Some(synthetic_i420_frame(*calls, self.width, self.height))
        }
    }
}

/// Everything a [`MockCodec`] saw
#[derive(Debug, Default)]
pub struct MockCodecLog {
    /// Timestamps of non-end-of-stream inputs, in queue order
    pub queued_timestamps: Vec<u64>,
    pub payload_sizes: Vec<usize>,
    pub end_of_stream_at: Option<u64>,
    /// Output buffers handed back through `release_output`
    pub released: usize,
    /// Upcoming `dequeue_input` calls that report no free slot
    pub fail_next_acquisitions: usize,
    pub failed_acquisitions: usize,
    pub configured: bool,
    pub started: bool,
    pub stopped: bool,
}

pub type SharedCodecLog = Arc<Mutex<MockCodecLog>>;

/// In-memory codec with a bounded slot pool and scriptable misbehaviour
pub struct MockCodec {
    kind: TrackKind,
    capacity: usize,
    emit_config_sample: bool,
    announce_twice: bool,
    fail_configure: bool,
    config: Option<RecordingConfig>,
    reserved: usize,
    pending: VecDeque<(u64, bool)>,
    ready: VecDeque<CodecOutput>,
    announced: u32,
    produced: u64,
    started: bool,
    log: SharedCodecLog,
}

impl MockCodec {
    fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            capacity: 16,
            emit_config_sample: false,
            announce_twice: false,
            fail_configure: false,
            config: None,
            reserved: 0,
            pending: VecDeque::new(),
            ready: VecDeque::new(),
            announced: 0,
            produced: 0,
            started: false,
            log: Arc::new(Mutex::new(MockCodecLog::default())),
        }
    }

    /// Announces its format before the first payload
    pub fn video() -> Self {
        Self::new(TrackKind::Video)
    }

    /// Announces its format as soon as it is polled after start
    pub fn audio() -> Self {
        Self::new(TrackKind::Audio)
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn failing_acquisitions(self, count: usize) -> Self {
        self.log.lock().expect("lock poisoned").fail_next_acquisitions = count;
        self
    }

    /// Emit a codec-config buffer right after the format announcement
    pub fn with_codec_config_sample(mut self) -> Self {
        self.emit_config_sample = true;
        self
    }

    pub fn announcing_format_twice(mut self) -> Self {
        self.announce_twice = true;
        self
    }

    pub fn failing_configure(mut self) -> Self {
        self.fail_configure = true;
        self
    }

    pub fn log(&self) -> SharedCodecLog {
        Arc::clone(&self.log)
    }

    fn descriptor(&self) -> TrackDescriptor {
        let config = self.config.clone().unwrap_or_default();
        let format = match self.kind {
            TrackKind::Video => TrackFormat::H264 {
                width: config.width,
                height: config.height,
                fps: config.fps,
                bitrate: config.bitrate,
            },
            TrackKind::Audio => TrackFormat::Opus {
                sample_rate: config.audio.sample_rate,
                channels: config.audio.channels,
                bitrate: config.audio.bitrate,
            },
        };
        TrackDescriptor {
            kind: self.kind,
            format,
            codec_config: Vec::new(),
        }
    }

    fn payload_sample(&mut self, timestamp_us: u64) -> EncodedSample {
        self.produced += 1;
        EncodedSample::new(
            vec![0, 0, 0, 1, 0x65, (self.produced % 256) as u8],
            timestamp_us,
            SampleFlags {
                key_frame: self.produced == 1,
                ..SampleFlags::default()
            },
        )
    }
}

impl Codec for MockCodec {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn configure(&mut self, config: &RecordingConfig) -> Result<(), RecorderError> {
        if self.fail_configure {
            return Err(RecorderError::Configuration(
                "mock codec refuses the format".to_string(),
            ));
        }
        self.config = Some(config.clone());
        self.log.lock().expect("lock poisoned").configured = true;
        Ok(())
    }

    fn start(&mut self) -> Result<(), RecorderError> {
        self.started = true;
        self.log.lock().expect("lock poisoned").started = true;
        Ok(())
    }

    fn dequeue_input(&mut self) -> Option<InputSlot> {
        let mut log = self.log.lock().expect("lock poisoned");
        if log.fail_next_acquisitions > 0 {
            log.fail_next_acquisitions -= 1;
            log.failed_acquisitions += 1;
            return None;
        }
        if !self.started || self.reserved + self.pending.len() >= self.capacity {
            return None;
        }
        self.reserved += 1;
        Some(InputSlot(self.reserved + self.pending.len() - 1))
    }

    fn queue_input(
        &mut self,
        _slot: InputSlot,
        payload: &[u8],
        timestamp_us: u64,
        end_of_stream: bool,
    ) -> Result<(), RecorderError> {
        if self.reserved == 0 {
            return Err(RecorderError::InvalidState("no reserved slot".to_string()));
        }
        self.reserved -= 1;

        let mut log = self.log.lock().expect("lock poisoned");
        if end_of_stream {
            log.end_of_stream_at = Some(timestamp_us);
        } else if payload.is_empty() {
            return Ok(());
        } else {
            log.queued_timestamps.push(timestamp_us);
            log.payload_sizes.push(payload.len());
        }
        self.pending.push_back((timestamp_us, end_of_stream));
        Ok(())
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<CodecOutput, RecorderError> {
        if let Some(output) = self.ready.pop_front() {
            return Ok(output);
        }

        if self.kind == TrackKind::Audio && self.started && self.announced == 0 {
            self.announced = 1;
            return Ok(CodecOutput::FormatReady(self.descriptor()));
        }

        let (timestamp_us, end_of_stream) = match self.pending.pop_front() {
            Some(input) => input,
            None => return Ok(CodecOutput::TryAgainLater),
        };

        if end_of_stream {
            return Ok(CodecOutput::Sample(EncodedSample::end_of_stream(timestamp_us)));
        }

        let sample = self.payload_sample(timestamp_us);
        if self.announced == 0 {
            self.announced = 1;
            if self.emit_config_sample {
                self.ready.push_back(CodecOutput::Sample(EncodedSample::new(
                    vec![0, 0, 0, 1, 0x67, 0x42],
                    timestamp_us,
                    SampleFlags {
                        codec_config: true,
                        ..SampleFlags::default()
                    },
                )));
            }
            self.ready.push_back(CodecOutput::Sample(sample));
            if self.announce_twice {
                self.announced = 2;
                self.ready.push_back(CodecOutput::FormatReady(self.descriptor()));
            }
            return Ok(CodecOutput::FormatReady(self.descriptor()));
        }
        Ok(CodecOutput::Sample(sample))
    }

    fn release_output(&mut self, _sample: EncodedSample) {
        self.log.lock().expect("lock poisoned").released += 1;
    }

    fn pending_inputs(&self) -> usize {
        self.reserved + self.pending.len()
    }

    fn input_capacity(&self) -> usize {
        self.capacity
    }

    fn stop(&mut self) -> Result<(), RecorderError> {
        self.started = false;
        self.log.lock().expect("lock poisoned").stopped = true;
        Ok(())
    }
}

/// Calls seen by a [`MockWriter`]
#[derive(Debug, Default)]
pub struct WriterLog {
    pub tracks: Vec<TrackDescriptor>,
    pub starts: usize,
    pub samples: Vec<(usize, EncodedSample)>,
    pub stops: usize,
    pub closes: usize,
}

pub type SharedWriterLog = Arc<Mutex<WriterLog>>;

/// Container writer that only records calls
pub struct MockWriter {
    log: SharedWriterLog,
    fail_start: bool,
}

impl MockWriter {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(WriterLog::default())),
            fail_start: false,
        }
    }

    /// Create an empty placeholder file at `path`, like a real writer would
    pub fn at(path: &Path) -> Result<Self, RecorderError> {
        std::fs::write(path, b"")?;
        Ok(Self::new())
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn log(&self) -> SharedWriterLog {
        Arc::clone(&self.log)
    }
}

impl Default for MockWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerWriter for MockWriter {
    fn add_track(&mut self, descriptor: &TrackDescriptor) -> Result<usize, RecorderError> {
        let mut log = self.log.lock().expect("lock poisoned");
        log.tracks.push(descriptor.clone());
        Ok(log.tracks.len() - 1)
    }

    fn start(&mut self) -> Result<(), RecorderError> {
        if self.fail_start {
            return Err(RecorderError::Muxing("mock writer refuses to start".to_string()));
        }
        self.log.lock().expect("lock poisoned").starts += 1;
        Ok(())
    }

    fn write_sample(&mut self, track: usize, sample: &EncodedSample) -> Result<(), RecorderError> {
        self.log
            .lock()
            .expect("lock poisoned")
            .samples
            .push((track, sample.clone()));
        Ok(())
    }

    fn stop(&mut self) -> Result<ContainerStats, RecorderError> {
        let mut log = self.log.lock().expect("lock poisoned");
        log.stops += 1;

        let mut stats = ContainerStats::default();
        for (track, sample) in &log.samples {
            match log.tracks.get(*track).map(|t| t.kind) {
                Some(TrackKind::Video) => stats.video_samples += 1,
                Some(TrackKind::Audio) => stats.audio_samples += 1,
                None => {}
            }
            stats.bytes_written += sample.size as u64;
            stats.duration_secs = stats.duration_secs.max(sample.timestamp_us as f64 / 1e6);
        }
        Ok(stats)
    }

    fn close(&mut self) {
        self.log.lock().expect("lock poisoned").closes += 1;
    }
}

/// Media store that records every persist call
#[derive(Default)]
pub struct RecordingStore {
    calls: Mutex<Vec<(PathBuf, MediaMetadata)>>,
    fail: bool,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<(PathBuf, MediaMetadata)> {
        self.calls.lock().expect("lock poisoned").clone()
    }
}

impl MediaStore for RecordingStore {
    fn persist(&self, file: &Path, metadata: &MediaMetadata) -> Result<PathBuf, RecorderError> {
        self.calls
            .lock()
            .expect("lock poisoned")
            .push((file.to_path_buf(), metadata.clone()));
        if self.fail {
            return Err(RecorderError::Persistence("mock store is read-only".to_string()));
        }
        Ok(file.to_path_buf())
    }
}

/// Backend handing out mock codecs and writers, keeping their logs
#[derive(Default)]
pub struct MockBackend {
    initial_acquisition_failures: usize,
    fail_video_configure: bool,
    fail_writer_start: bool,
    fail_container: bool,
    video_logs: Mutex<Vec<SharedCodecLog>>,
    audio_logs: Mutex<Vec<SharedCodecLog>>,
    writer_logs: Mutex<Vec<SharedWriterLog>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Video codecs report no free slot for their first `count` acquisitions
    pub fn failing_first_acquisitions(mut self, count: usize) -> Self {
        self.initial_acquisition_failures = count;
        self
    }

    pub fn failing_video_configure(mut self) -> Self {
        self.fail_video_configure = true;
        self
    }

    pub fn failing_writer_start(mut self) -> Self {
        self.fail_writer_start = true;
        self
    }

    pub fn failing_container(mut self) -> Self {
        self.fail_container = true;
        self
    }

    pub fn video_log(&self) -> Option<SharedCodecLog> {
        self.video_logs.lock().expect("lock poisoned").last().cloned()
    }

    pub fn audio_log(&self) -> Option<SharedCodecLog> {
        self.audio_logs.lock().expect("lock poisoned").last().cloned()
    }

    pub fn writer_log(&self) -> Option<SharedWriterLog> {
        self.writer_logs.lock().expect("lock poisoned").last().cloned()
    }

    pub fn sessions(&self) -> usize {
        self.video_logs.lock().expect("lock poisoned").len()
    }
}

impl RecorderBackend for MockBackend {
    fn video_codec(
        &self,
        _config: &RecordingConfig,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn Codec>, RecorderError> {
        let mut codec = MockCodec::video()
            .with_capacity(settings.input_pool_capacity)
            .failing_acquisitions(self.initial_acquisition_failures);
        if self.fail_video_configure {
            codec = codec.failing_configure();
        }
        self.video_logs.lock().expect("lock poisoned").push(codec.log());
        Ok(Box::new(codec))
    }

    fn audio_codec(
        &self,
        _config: &RecordingConfig,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn Codec>, RecorderError> {
        let codec = MockCodec::audio().with_capacity(settings.input_pool_capacity);
        self.audio_logs.lock().expect("lock poisoned").push(codec.log());
        Ok(Box::new(codec))
    }

    fn container(
        &self,
        path: &Path,
        _storage: &StorageSettings,
    ) -> Result<Box<dyn ContainerWriter>, RecorderError> {
        if self.fail_container {
            return Err(RecorderError::Io(format!(
                "mock backend cannot create {}",
                path.display()
            )));
        }
        let mut writer = MockWriter::at(path)?;
        if self.fail_writer_start {
            writer = writer.failing_start();
        }
        self.writer_logs.lock().expect("lock poisoned").push(writer.log());
        Ok(Box::new(writer))
    }
}
