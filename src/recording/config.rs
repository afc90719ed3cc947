//! Recording configuration types

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::RecorderError;

/// Known thermal camera models and the modes they stream in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum DevicePreset {
    /// 384x288 sensor, 30 or 60 fps
    Mini2_384,
    /// 256x192 sensor, 25 or 50 fps
    Mini2_256,
    /// 640x512 sensor, 30 fps
    Mini2_640,
}

impl DevicePreset {
    /// Native sensor resolution (width, height)
    pub fn resolution(&self) -> (u32, u32) {
        match self {
            DevicePreset::Mini2_384 => (384, 288),
            DevicePreset::Mini2_256 => (256, 192),
            DevicePreset::Mini2_640 => (640, 512),
        }
    }

    /// Frame rates the device can stream at
    pub fn fps_options(&self) -> &'static [u32] {
        match self {
            DevicePreset::Mini2_384 => &[30, 60],
            DevicePreset::Mini2_256 => &[25, 50],
            DevicePreset::Mini2_640 => &[30],
        }
    }

    /// Tag used in output file names
    pub fn tag(&self) -> &'static str {
        match self {
            DevicePreset::Mini2_384 => "384",
            DevicePreset::Mini2_256 => "256",
            DevicePreset::Mini2_640 => "640",
        }
    }
}

/// Audio track settings, only honoured when `include_audio` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Input device id, `None` for the system default microphone
    pub device_id: Option<String>,
    /// Sample rate in Hz (Opus requires 48000)
    pub sample_rate: u32,
    /// 1 for mono, 2 for stereo
    pub channels: u16,
    /// Target bitrate in bits per second
    pub bitrate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            sample_rate: 48_000,
            channels: 1,
            bitrate: 64_000,
        }
    }
}

/// Immutable snapshot of what a recording session should produce.
///
/// `Recorder::start` reads the latest snapshot; changing it mid-session has
/// no effect on the running session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Video width in pixels
    pub width: u32,
    /// Video height in pixels
    pub height: u32,
    /// Frames per second
    pub fps: u32,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Opaque device tag, only used for output naming
    pub device_tag: String,
    /// Mux an audio track alongside video
    pub include_audio: bool,
    /// Audio track settings
    pub audio: AudioConfig,
}

impl RecordingConfig {
    /// Create a new recording configuration with explicit dimensions
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            bitrate: 15_000_000,
            device_tag: "256".to_string(),
            include_audio: false,
            audio: AudioConfig::default(),
        }
    }

    /// Create configuration for a known device, checking the frame rate
    pub fn from_preset(preset: DevicePreset, fps: u32) -> Result<Self, RecorderError> {
        if !preset.fps_options().contains(&fps) {
            return Err(RecorderError::Configuration(format!(
                "{:?} does not stream at {} fps (supported: {:?})",
                preset,
                fps,
                preset.fps_options()
            )));
        }
        let (width, height) = preset.resolution();
        Ok(Self::new(width, height, fps).with_device_tag(preset.tag()))
    }

    /// Set custom bitrate in bits per second
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Set bitrate in megabits per second
    pub fn with_bitrate_mbps(mut self, mbps: u32) -> Self {
        self.bitrate = mbps.saturating_mul(1_000_000);
        self
    }

    /// Set the device tag used in output names
    pub fn with_device_tag(mut self, tag: impl Into<String>) -> Self {
        self.device_tag = tag.into();
        self
    }

    /// Enable or disable the audio track
    pub fn with_audio(mut self, include_audio: bool) -> Self {
        self.include_audio = include_audio;
        self
    }

    /// Enable the audio track with explicit settings
    pub fn with_audio_config(mut self, audio: AudioConfig) -> Self {
        self.include_audio = true;
        self.audio = audio;
        self
    }

    /// Fixed duration of one frame in microseconds
    pub fn frame_duration_us(&self) -> u64 {
        1_000_000 / u64::from(self.fps.max(1))
    }

    /// Poll-mode tick interval
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.fps.max(1)))
    }

    /// Size of one planar YUV 4:2:0 frame at the configured dimensions
    pub fn yuv_frame_size(&self) -> usize {
        let w = self.width as usize;
        let h = self.height as usize;
        w * h + 2 * (w.div_ceil(2) * h.div_ceil(2))
    }

    /// Check that the configuration can drive an encoder
    pub fn validate(&self) -> Result<(), RecorderError> {
        if self.width == 0 || self.height == 0 {
            return Err(RecorderError::Configuration(format!(
                "Invalid dimensions {}x{}",
                self.width, self.height
            )));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(RecorderError::Configuration(format!(
                "Dimensions must be even for 4:2:0 encoding, got {}x{}",
                self.width, self.height
            )));
        }
        if self.fps == 0 || self.fps > 240 {
            return Err(RecorderError::Configuration(format!(
                "Invalid frame rate {} (must be 1-240)",
                self.fps
            )));
        }
        if self.bitrate == 0 {
            return Err(RecorderError::Configuration(
                "Bitrate must be positive".to_string(),
            ));
        }
        if self.device_tag.is_empty() || self.device_tag.contains(['/', '\\']) {
            return Err(RecorderError::Configuration(format!(
                "Invalid device tag {:?}",
                self.device_tag
            )));
        }
        if self.include_audio {
            if self.audio.channels != 1 && self.audio.channels != 2 {
                return Err(RecorderError::Configuration(format!(
                    "Audio supports mono or stereo, got {} channels",
                    self.audio.channels
                )));
            }
            if self.audio.sample_rate == 0 || self.audio.bitrate == 0 {
                return Err(RecorderError::Configuration(
                    "Audio sample rate and bitrate must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self::new(256, 192, 25)
    }
}

/// Statistics collected over one recording session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordingStats {
    /// Session identifier used in logs
    pub session_id: Uuid,
    /// Temporary container path written during the session
    pub output_path: PathBuf,
    /// Where the persistence collaborator put the file, if it succeeded
    pub persisted_path: Option<PathBuf>,
    /// Video frames accepted by the encoder
    pub frames_submitted: u64,
    /// Frames dropped because no encoder input slot freed up in time
    pub frames_dropped: u64,
    /// Push frames rejected because the ingestion queue was full
    pub frames_rejected: u64,
    /// Poll ticks that re-submitted the last good frame
    pub frames_reused: u64,
    /// Poll ticks with neither a fresh nor a previous frame
    pub ticks_skipped: u64,
    /// Audio chunks accepted by the audio encoder
    pub audio_chunks_submitted: u64,
    /// Samples handed to the container writer
    pub samples_written: u64,
    /// Samples discarded before the writer started
    pub samples_discarded: u64,
    /// Whether every encoder reported end-of-stream before finalizing
    pub end_of_stream_delivered: bool,
    /// Wall-clock time spent recording, excluding pauses
    pub active_duration_ms: u64,
    /// Media duration as reported by the container
    pub media_duration_secs: f64,
    /// Container size on disk
    pub bytes_written: u64,
}

impl RecordingStats {
    /// Calculate the average bitrate achieved
    pub fn avg_bitrate(&self) -> f64 {
        if self.media_duration_secs > 0.0 {
            (self.bytes_written as f64 * 8.0) / self.media_duration_secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_mini2_256() {
        let config = RecordingConfig::default();
        assert_eq!((config.width, config.height, config.fps), (256, 192, 25));
        assert_eq!(config.bitrate, 15_000_000);
        assert!(!config.include_audio);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frame_timing() {
        let config = RecordingConfig::new(256, 192, 25);
        assert_eq!(config.frame_duration_us(), 40_000);
        assert_eq!(config.frame_interval(), Duration::from_millis(40));

        let config = RecordingConfig::new(384, 288, 60);
        assert_eq!(config.frame_duration_us(), 16_666);
    }

    #[test]
    fn test_yuv_frame_size() {
        let config = RecordingConfig::new(256, 192, 25);
        assert_eq!(config.yuv_frame_size(), 256 * 192 * 3 / 2);
    }

    #[test]
    fn test_from_preset() {
        let config = RecordingConfig::from_preset(DevicePreset::Mini2_384, 60).unwrap();
        assert_eq!((config.width, config.height), (384, 288));
        assert_eq!(config.device_tag, "384");

        assert!(RecordingConfig::from_preset(DevicePreset::Mini2_640, 60).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(RecordingConfig::new(0, 192, 25).validate().is_err());
        assert!(RecordingConfig::new(255, 192, 25).validate().is_err());
        assert!(RecordingConfig::new(256, 192, 0).validate().is_err());
        assert!(RecordingConfig::new(256, 192, 25).with_bitrate(0).validate().is_err());
        assert!(RecordingConfig::new(256, 192, 25)
            .with_device_tag("../x")
            .validate()
            .is_err());

        let mut audio = AudioConfig::default();
        audio.channels = 6;
        assert!(RecordingConfig::new(256, 192, 25)
            .with_audio_config(audio)
            .validate()
            .is_err());
    }

    #[test]
    fn test_bitrate_mbps() {
        let config = RecordingConfig::default().with_bitrate_mbps(8);
        assert_eq!(config.bitrate, 8_000_000);
    }
}
