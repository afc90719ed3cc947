//! Factories for the codecs and container a session runs on

use std::path::Path;

use super::codec::Codec;
use super::config::RecordingConfig;
use super::encoder::H264Codec;
use super::writer::{ContainerWriter, Mp4Writer};
use crate::config::{EncoderSettings, StorageSettings};
use crate::errors::RecorderError;

/// Builds the per-session encoder and writer instances
pub trait RecorderBackend: Send + Sync {
    fn video_codec(
        &self,
        config: &RecordingConfig,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn Codec>, RecorderError>;

    fn audio_codec(
        &self,
        config: &RecordingConfig,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn Codec>, RecorderError>;

    fn container(
        &self,
        path: &Path,
        storage: &StorageSettings,
    ) -> Result<Box<dyn ContainerWriter>, RecorderError>;
}

/// openh264 + libopus + muxide
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareBackend;

impl RecorderBackend for SoftwareBackend {
    fn video_codec(
        &self,
        _config: &RecordingConfig,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn Codec>, RecorderError> {
        Ok(Box::new(H264Codec::new(
            settings.input_pool_capacity,
            settings.keyframe_interval_secs,
        )))
    }

    #[cfg(feature = "audio")]
    fn audio_codec(
        &self,
        _config: &RecordingConfig,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn Codec>, RecorderError> {
        Ok(Box::new(crate::audio::OpusCodec::new(
            settings.input_pool_capacity,
        )))
    }

    #[cfg(not(feature = "audio"))]
    fn audio_codec(
        &self,
        _config: &RecordingConfig,
        _settings: &EncoderSettings,
    ) -> Result<Box<dyn Codec>, RecorderError> {
        Err(RecorderError::Configuration(
            "Audio requested but crabreel was built without the `audio` feature".to_string(),
        ))
    }

    fn container(
        &self,
        path: &Path,
        storage: &StorageSettings,
    ) -> Result<Box<dyn ContainerWriter>, RecorderError> {
        let writer = Mp4Writer::create(path)?.with_title(storage.title.clone());
        Ok(Box::new(writer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::codec::TrackKind;

    #[test]
    fn test_software_video_codec() {
        let codec = SoftwareBackend
            .video_codec(&RecordingConfig::default(), &EncoderSettings::default())
            .unwrap();
        assert_eq!(codec.kind(), TrackKind::Video);
        assert_eq!(codec.input_capacity(), 16);
    }

    #[cfg(not(feature = "audio"))]
    #[test]
    fn test_audio_requires_feature() {
        let result = SoftwareBackend
            .audio_codec(&RecordingConfig::default(), &EncoderSettings::default());
        assert!(matches!(result, Err(RecorderError::Configuration(_))));
    }
}
