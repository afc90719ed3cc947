//! Testing utilities for crabreel
//!
//! Synthetic media plus scriptable stand-ins for every collaborator the
//! recorder talks to, so whole sessions can run without a camera, an
//! encoder library, or a filesystem library.

pub mod mocks;
pub mod synthetic_data;

pub use mocks::{
    MockBackend, MockCodec, MockCodecLog, MockWriter, RecordingStore, ScriptedSampler,
    SharedCodecLog, SharedWriterLog, WriterLog,
};
pub use synthetic_data::{synthetic_audio_chunk, synthetic_i420_frame, synthetic_rgba_frame};
