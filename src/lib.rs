//! crabreel: real-time frame-to-MP4 recording
//!
//! Frames from a camera callback (push) or a sampler polled at the frame
//! rate (poll) are converted to I420, given constant-rate timestamps,
//! encoded to H.264 and muxed into MP4. Finished files are handed to a
//! [`recording::MediaStore`] for long-term storage.
//!
//! # Features
//! - Push and poll ingestion with frame reuse on sampling misses
//! - Bounded encoder input pool with back-pressure reporting
//! - Track-gated container writer (no sample before every track is known)
//! - Pause/resume without timestamp gaps
//! - Optional Opus microphone track (`audio` feature)
//!
//! # Usage
//! ```toml
//! [dependencies]
//! crabreel = { version = "0.1", features = ["audio"] }
//! ```
//!
//! ```rust,ignore
//! use crabreel::recording::{FrameSource, Recorder, RecordingConfig};
//!
//! let recorder = Recorder::with_settings(crabreel::config::RecorderSettings::load_or_default());
//! recorder.configure(RecordingConfig::new(256, 192, 25));
//! let (sender, source) = recorder.push_channel();
//! recorder.start(FrameSource::Push(source));
//! ```
pub mod config;
pub mod errors;
pub mod invariant_ppt;
pub mod recording;
pub mod timing;

#[cfg(feature = "audio")]
pub mod audio;

// Mocks and synthetic media, public so integration tests and benches can use them
pub mod testing;

pub use config::RecorderSettings;
pub use errors::RecorderError;
pub use recording::{
    FrameSender, FrameSource, PushSource, RawFrame, Recorder, RecordingConfig, RecordingStats,
    SessionState,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize `env_logger`, defaulting to `crabreel=info` when `RUST_LOG`
/// is unset. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("crabreel=info"),
    )
    .try_init();
}
