//! Frame-to-MP4 recording pipeline
//!
//! Frames flow through these stages:
//! - `ingest`: push channel or poll sampler delivering `RawFrame`s
//! - `convert`: packed RGB variants to planar I420
//! - `pacer`: constant-rate presentation timestamps
//! - `adapter` + `codec`/`encoder`: bounded encoder session (openh264)
//! - `writer`: track-gated MP4 container (muxide)
//! - `recorder`: session lifecycle, workers, persistence via `store`
//!
//! # Example
//! ```rust,ignore
//! use crabreel::config::RecorderSettings;
//! use crabreel::recording::{FrameSource, PushSource, Recorder, RecordingConfig};
//!
//! let recorder = Recorder::with_settings(RecorderSettings::load_or_default());
//! recorder.configure(RecordingConfig::new(256, 192, 25));
//!
//! let (sender, source) = PushSource::channel(8);
//! recorder.start(FrameSource::Push(source));
//! // camera callback: sender.on_frame(i420_bytes, 256, 192, None);
//! recorder.stop();
//! ```

pub mod adapter;
pub mod backend;
pub mod codec;
pub mod config;
pub mod convert;
pub mod encoder;
pub mod ingest;
pub mod pacer;
pub mod pipeline;
pub mod recorder;
pub mod store;
pub mod writer;

pub use adapter::{
    DrainReport, EncoderAdapter, EncoderLoad, EncoderState, LoadLevel, SubmitOutcome,
};
pub use backend::{RecorderBackend, SoftwareBackend};
pub use codec::{
    Codec, CodecOutput, EncodedSample, InputSlot, SampleFlags, TrackDescriptor, TrackFormat,
    TrackKind,
};
pub use config::{AudioConfig, DevicePreset, RecordingConfig, RecordingStats};
pub use convert::{PixelFormat, ResizeFilter};
pub use encoder::H264Codec;
pub use ingest::{
    select_mode, AudioChunk, AudioSender, AudioSource, FrameLayout, FrameSampler, FrameSender,
    FrameSource, IngestMode, PollIngest, PushSource, RawFrame, SessionFlags, TickOutcome,
};
pub use pacer::{FramePacer, SamplePacer};
pub use pipeline::{AudioPipeline, VideoPipeline};
pub use recorder::{Recorder, SessionState};
pub use store::{LibraryStore, MediaMetadata, MediaStore};
pub use writer::{
    ContainerGate, ContainerStats, ContainerWriter, GateState, Mp4Writer, Registration,
    WriteOutcome,
};
