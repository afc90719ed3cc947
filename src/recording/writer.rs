//! Container writer and the gate that decides when it may start
//!
//! The writer is started exactly once, when the last required track has
//! announced its format. Samples that show up before that are discarded and
//! counted; nothing is buffered.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use muxide::api::{AudioCodec, Metadata, Muxer, MuxerBuilder, VideoCodec};
use serde::{Deserialize, Serialize};

use super::codec::{EncodedSample, TrackDescriptor, TrackFormat, TrackKind};
use crate::assert_invariant;
use crate::errors::RecorderError;

/// Totals reported by a container when it is finalized
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub video_samples: u64,
    pub audio_samples: u64,
    pub duration_secs: f64,
    pub bytes_written: u64,
}

/// A multiplexing sink for encoded samples
pub trait ContainerWriter: Send {
    /// Allocate a track and return its index
    fn add_track(&mut self, descriptor: &TrackDescriptor) -> Result<usize, RecorderError>;

    /// Begin accepting samples; no tracks may be added afterwards
    fn start(&mut self) -> Result<(), RecorderError>;

    fn write_sample(&mut self, track: usize, sample: &EncodedSample) -> Result<(), RecorderError>;

    /// Finalize the container
    fn stop(&mut self) -> Result<ContainerStats, RecorderError>;

    /// Release underlying resources; safe to call in any state
    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Waiting for required tracks to register
    Collecting,
    Started,
    Stopped,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Track registered; `started` is set when this registration started the writer
    Registered { index: usize, started: bool },
    /// The track was already registered, nothing changed
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Writer not started yet; the sample was dropped
    Discarded,
}

/// Owns the container writer and its start/stop lifecycle.
///
/// Shared between the video and audio drain paths behind a mutex. Callers
/// always take their encoder lock before this one.
pub struct ContainerGate {
    writer: Box<dyn ContainerWriter>,
    required: Vec<TrackKind>,
    tracks: HashMap<TrackKind, usize>,
    last_written_us: HashMap<TrackKind, u64>,
    state: GateState,
    written: u64,
    discarded: u64,
    stats: Option<ContainerStats>,
}

impl ContainerGate {
    /// Gate a writer on the given set of required tracks
    pub fn new(writer: Box<dyn ContainerWriter>, include_audio: bool) -> Self {
        let mut required = vec![TrackKind::Video];
        if include_audio {
            required.push(TrackKind::Audio);
        }
        Self {
            writer,
            required,
            tracks: HashMap::new(),
            last_written_us: HashMap::new(),
            state: GateState::Collecting,
            written: 0,
            discarded: 0,
            stats: None,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.state == GateState::Started
    }

    pub fn track_index(&self, kind: TrackKind) -> Option<usize> {
        self.tracks.get(&kind).copied()
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Stats from the finalized container, if `finish` succeeded
    pub fn stats(&self) -> Option<&ContainerStats> {
        self.stats.as_ref()
    }

    /// Register a track's format; starts the writer when the set is complete
    pub fn register_track(
        &mut self,
        descriptor: &TrackDescriptor,
    ) -> Result<Registration, RecorderError> {
        if self.tracks.contains_key(&descriptor.kind) {
            return Ok(Registration::Duplicate);
        }
        if self.state != GateState::Collecting {
            return Err(RecorderError::InvalidState(format!(
                "Cannot add {:?} track in state {:?}",
                descriptor.kind, self.state
            )));
        }
        if !self.required.contains(&descriptor.kind) {
            return Err(RecorderError::Muxing(format!(
                "{:?} track was not requested for this session",
                descriptor.kind
            )));
        }

        let index = self.writer.add_track(descriptor)?;
        self.tracks.insert(descriptor.kind, index);
        log::debug!("Registered {:?} track at index {}", descriptor.kind, index);

        let complete = self.required.iter().all(|k| self.tracks.contains_key(k));
        if complete {
            self.writer.start()?;
            self.state = GateState::Started;
            log::info!("Container writer started with {} track(s)", self.tracks.len());
        }

        Ok(Registration::Registered {
            index,
            started: complete,
        })
    }

    /// Write a sample for `kind`, or discard it if the writer has not started
    pub fn write(
        &mut self,
        kind: TrackKind,
        sample: &EncodedSample,
    ) -> Result<WriteOutcome, RecorderError> {
        match self.state {
            GateState::Collecting => {
                self.discarded += 1;
                return Ok(WriteOutcome::Discarded);
            }
            GateState::Stopped | GateState::Closed => {
                return Err(RecorderError::InvalidState(
                    "Container writer already stopped".to_string(),
                ));
            }
            GateState::Started => {}
        }

        let index = self.track_index(kind).ok_or_else(|| {
            RecorderError::Muxing(format!("No {:?} track registered", kind))
        })?;

        let previous = self.last_written_us.get(&kind).copied();
        assert_invariant!(
            previous.map_or(true, |last| sample.timestamp_us >= last),
            "Track timestamps never go backwards in the container",
            "ContainerGate::write"
        );
        self.writer.write_sample(index, sample)?;
        self.last_written_us.insert(kind, sample.timestamp_us);
        self.written += 1;
        Ok(WriteOutcome::Written)
    }

    /// Stop the writer if it started. Returns whether a container was finalized.
    pub fn finish(&mut self) -> Result<bool, RecorderError> {
        if self.state != GateState::Started {
            return Ok(false);
        }
        self.state = GateState::Stopped;
        let stats = self.writer.stop()?;
        log::info!(
            "Container finalized: {} video / {} audio samples, {:.2}s, {} bytes",
            stats.video_samples,
            stats.audio_samples,
            stats.duration_secs,
            stats.bytes_written
        );
        self.stats = Some(stats);
        Ok(true)
    }

    pub fn close(&mut self) {
        if self.state != GateState::Closed {
            self.writer.close();
            self.state = GateState::Closed;
        }
    }
}

/// MP4 writer backed by muxide
pub struct Mp4Writer {
    path: PathBuf,
    title: Option<String>,
    fast_start: bool,
    file: Option<BufWriter<File>>,
    descriptors: Vec<TrackDescriptor>,
    muxer: Option<Muxer<BufWriter<File>>>,
    video_samples: u64,
    audio_samples: u64,
    last_pts_secs: f64,
}

impl Mp4Writer {
    /// Create the output file. I/O failures surface here, before any encoder runs.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(&path).map_err(|e| {
            RecorderError::Io(format!("Failed to create {}: {}", path.display(), e))
        })?;

        Ok(Self {
            path,
            title: None,
            fast_start: true,
            file: Some(BufWriter::new(file)),
            descriptors: Vec::new(),
            muxer: None,
            video_samples: 0,
            audio_samples: 0,
            last_pts_secs: 0.0,
        })
    }

    /// Title stored in the container metadata
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_fast_start(mut self, fast_start: bool) -> Self {
        self.fast_start = fast_start;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn track_kind(&self, track: usize) -> Result<TrackKind, RecorderError> {
        self.descriptors
            .get(track)
            .map(|d| d.kind)
            .ok_or_else(|| RecorderError::Muxing(format!("Unknown track index {}", track)))
    }
}

impl ContainerWriter for Mp4Writer {
    fn add_track(&mut self, descriptor: &TrackDescriptor) -> Result<usize, RecorderError> {
        if self.muxer.is_some() {
            return Err(RecorderError::Muxing(
                "Tracks must be added before the muxer starts".to_string(),
            ));
        }
        self.descriptors.push(descriptor.clone());
        Ok(self.descriptors.len() - 1)
    }

    fn start(&mut self) -> Result<(), RecorderError> {
        let writer = self
            .file
            .take()
            .ok_or_else(|| RecorderError::InvalidState("MP4 writer already started".to_string()))?;

        let mut builder = MuxerBuilder::new(writer).with_fast_start(self.fast_start);
        for descriptor in &self.descriptors {
            builder = match descriptor.format {
                TrackFormat::H264 {
                    width, height, fps, ..
                } => builder.video(VideoCodec::H264, width, height, f64::from(fps)),
                TrackFormat::Opus {
                    sample_rate,
                    channels,
                    ..
                } => builder.audio(AudioCodec::Opus, sample_rate, channels),
            };
        }

        let metadata = match &self.title {
            Some(title) => Metadata::new().with_title(title).with_current_time(),
            None => Metadata::new().with_current_time(),
        };
        builder = builder.with_metadata(metadata);

        let muxer = builder
            .build()
            .map_err(|e| RecorderError::Muxing(format!("Failed to create muxer: {}", e)))?;
        self.muxer = Some(muxer);
        Ok(())
    }

    fn write_sample(&mut self, track: usize, sample: &EncodedSample) -> Result<(), RecorderError> {
        let kind = self.track_kind(track)?;
        let muxer = self
            .muxer
            .as_mut()
            .ok_or_else(|| RecorderError::InvalidState("MP4 writer not started".to_string()))?;

        let pts = sample.timestamp_us as f64 / 1_000_000.0;
        match kind {
            TrackKind::Video => {
                muxer
                    .write_video(pts, sample.payload(), sample.flags.key_frame)
                    .map_err(|e| RecorderError::Muxing(format!("Failed to write frame: {}", e)))?;
                self.video_samples += 1;
            }
            TrackKind::Audio => {
                muxer
                    .write_audio(pts, sample.payload())
                    .map_err(|e| {
                        RecorderError::Muxing(format!("Failed to write audio packet: {}", e))
                    })?;
                self.audio_samples += 1;
            }
        }
        self.last_pts_secs = self.last_pts_secs.max(pts);
        Ok(())
    }

    fn stop(&mut self) -> Result<ContainerStats, RecorderError> {
        let muxer = self
            .muxer
            .take()
            .ok_or_else(|| RecorderError::InvalidState("MP4 writer not started".to_string()))?;

        let stats = muxer
            .finish_with_stats()
            .map_err(|e| RecorderError::Muxing(format!("Failed to finalize recording: {}", e)))?;

        Ok(ContainerStats {
            video_samples: stats.video_frames,
            audio_samples: stats.audio_frames,
            duration_secs: if stats.duration_secs > 0.0 {
                stats.duration_secs
            } else {
                self.last_pts_secs
            },
            bytes_written: stats.bytes_written,
        })
    }

    fn close(&mut self) {
        // Dropping an unfinished muxer leaves a truncated file behind; the
        // controller deletes it when nothing was finalized.
        self.muxer = None;
        self.file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::codec::SampleFlags;
    use crate::testing::MockWriter;

    fn video_descriptor() -> TrackDescriptor {
        TrackDescriptor {
            kind: TrackKind::Video,
            format: TrackFormat::H264 {
                width: 256,
                height: 192,
                fps: 25,
                bitrate: 1_000_000,
            },
            codec_config: Vec::new(),
        }
    }

    fn audio_descriptor() -> TrackDescriptor {
        TrackDescriptor {
            kind: TrackKind::Audio,
            format: TrackFormat::Opus {
                sample_rate: 48_000,
                channels: 1,
                bitrate: 64_000,
            },
            codec_config: Vec::new(),
        }
    }

    fn sample(ts: u64) -> EncodedSample {
        EncodedSample::new(vec![0, 0, 0, 1, 0x65], ts, SampleFlags::default())
    }

    #[test]
    fn test_video_only_starts_on_video_format() {
        let writer = MockWriter::new();
        let log = writer.log();
        let mut gate = ContainerGate::new(Box::new(writer), false);

        assert_eq!(
            gate.register_track(&video_descriptor()).unwrap(),
            Registration::Registered {
                index: 0,
                started: true
            }
        );
        assert!(gate.is_started());
        assert_eq!(log.lock().unwrap().starts, 1);
    }

    #[test]
    fn test_waits_for_all_required_tracks() {
        let writer = MockWriter::new();
        let log = writer.log();
        let mut gate = ContainerGate::new(Box::new(writer), true);

        gate.register_track(&video_descriptor()).unwrap();
        assert!(!gate.is_started());
        assert_eq!(gate.write(TrackKind::Video, &sample(0)).unwrap(), WriteOutcome::Discarded);
        assert_eq!(gate.discarded(), 1);
        assert!(log.lock().unwrap().samples.is_empty());

        gate.register_track(&audio_descriptor()).unwrap();
        assert!(gate.is_started());
        assert_eq!(gate.write(TrackKind::Video, &sample(40_000)).unwrap(), WriteOutcome::Written);
        assert_eq!(log.lock().unwrap().samples.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_ignored() {
        let writer = MockWriter::new();
        let log = writer.log();
        let mut gate = ContainerGate::new(Box::new(writer), false);

        gate.register_track(&video_descriptor()).unwrap();
        assert_eq!(
            gate.register_track(&video_descriptor()).unwrap(),
            Registration::Duplicate
        );
        let log = log.lock().unwrap();
        assert_eq!(log.tracks.len(), 1);
        assert_eq!(log.starts, 1);
    }

    #[test]
    fn test_unrequested_track_rejected() {
        let mut gate = ContainerGate::new(Box::new(MockWriter::new()), false);
        assert!(gate.register_track(&audio_descriptor()).is_err());
        assert!(!gate.is_started());
    }

    #[test]
    fn test_finish_without_start() {
        let writer = MockWriter::new();
        let log = writer.log();
        let mut gate = ContainerGate::new(Box::new(writer), false);

        assert!(!gate.finish().unwrap());
        gate.close();
        let log = log.lock().unwrap();
        assert_eq!(log.stops, 0);
        assert_eq!(log.closes, 1);
    }

    #[test]
    fn test_write_after_stop_fails() {
        let mut gate = ContainerGate::new(Box::new(MockWriter::new()), false);
        gate.register_track(&video_descriptor()).unwrap();
        assert!(gate.finish().unwrap());
        assert!(gate.write(TrackKind::Video, &sample(0)).is_err());
        assert!(gate.stats().is_some());
    }

    #[test]
    fn contract_writer_gating() {
        crate::invariant_ppt::clear_invariant_log();
        let mut gate = ContainerGate::new(Box::new(MockWriter::new()), false);
        gate.register_track(&video_descriptor()).unwrap();
        gate.write(TrackKind::Video, &sample(0)).unwrap();
        gate.write(TrackKind::Video, &sample(40_000)).unwrap();
        crate::invariant_ppt::contract_test(
            "container gate",
            &["Track timestamps never go backwards in the container"],
        );
    }

    #[test]
    #[should_panic(expected = "Track timestamps never go backwards")]
    fn test_regressing_timestamp_is_caught_before_the_writer() {
        let mut gate = ContainerGate::new(Box::new(MockWriter::new()), false);
        gate.register_track(&video_descriptor()).unwrap();
        gate.write(TrackKind::Video, &sample(80_000)).unwrap();
        let _ = gate.write(TrackKind::Video, &sample(40_000));
    }

    #[test]
    fn test_mp4_writer_creates_file_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.mp4");
        let writer = Mp4Writer::create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(writer.path(), path.as_path());
    }
}
