//! Microphone capture feeding the audio track
//!
//! The cpal callback never blocks: chunks go through a bounded channel and
//! are dropped when the consumer falls behind.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use crossbeam_channel::Receiver;

use super::device::find_audio_device;
use crate::errors::RecorderError;
use crate::recording::ingest::SessionFlags;
use crate::recording::pipeline::{run_audio_loop, AudioPipeline};
use crate::recording::{AudioChunk, AudioConfig, AudioSender, AudioSource};

/// About five seconds of 20 ms callbacks
const MAX_BUFFER_CHUNKS: usize = 256;

/// Open input stream on one microphone
pub struct MicrophoneCapture {
    stream: Option<Stream>,
    is_running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    sample_rate: u32,
    channels: u16,
}

impl MicrophoneCapture {
    /// Open a device and route its PCM into `sink`.
    ///
    /// `device_id` of `None` or `"default"` picks the system default input.
    pub fn open(
        device_id: Option<&str>,
        sample_rate: u32,
        channels: u16,
        sink: AudioSender,
    ) -> Result<Self, RecorderError> {
        let requested = device_id.unwrap_or("default");
        let info = find_audio_device(requested)?;

        let host = cpal::default_host();
        let device = if requested.is_empty() || requested == "default" {
            host.default_input_device()
                .ok_or_else(|| RecorderError::Audio("No default audio device".to_string()))?
        } else {
            host.input_devices()
                .map_err(|e| RecorderError::Audio(format!("Failed to enumerate devices: {}", e)))?
                .find(|d| d.name().ok().as_deref() == Some(info.name.as_str()))
                .ok_or_else(|| RecorderError::Audio(format!("Device not found: {}", requested)))?
        };

        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let is_running = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));
        let running = Arc::clone(&is_running);
        let dropped_in_callback = Arc::clone(&dropped);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    let chunk = AudioChunk {
                        samples: data.to_vec(),
                        sample_rate,
                        channels,
                    };
                    if !sink.send(chunk) {
                        dropped_in_callback.fetch_add(1, Ordering::Relaxed);
                    }
                },
                move |err| {
                    log::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| RecorderError::Audio(format!("Failed to build stream: {}", e)))?;

        log::info!(
            "Opened microphone '{}' at {} Hz, {} channel(s)",
            info.name,
            sample_rate,
            channels
        );

        Ok(Self {
            stream: Some(stream),
            is_running,
            dropped,
            sample_rate,
            channels,
        })
    }

    /// Start capturing (idempotent)
    pub fn start(&mut self) -> Result<(), RecorderError> {
        if self.is_running.load(Ordering::Relaxed) {
            return Ok(());
        }
        if let Some(stream) = &self.stream {
            stream
                .play()
                .map_err(|e| RecorderError::Audio(format!("Failed to start stream: {}", e)))?;
            self.is_running.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Stop capturing (idempotent)
    pub fn stop(&mut self) -> Result<(), RecorderError> {
        if !self.is_running.load(Ordering::Relaxed) {
            return Ok(());
        }
        if let Some(stream) = &self.stream {
            stream
                .pause()
                .map_err(|e| RecorderError::Audio(format!("Failed to stop stream: {}", e)))?;
            self.is_running.store(false, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Callbacks lost because the consumer was behind
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        let _ = self.stop();
        self.stream = None;
    }
}

/// Worker body: own a microphone for the lifetime of a session.
///
/// cpal streams are not `Send` on every platform, so the stream is opened
/// on the worker thread and dropped there.
pub(crate) fn run_microphone(
    config: AudioConfig,
    audio: Arc<AudioPipeline>,
    flags: Arc<SessionFlags>,
    stop: Receiver<()>,
) {
    let (sender, source) = AudioSource::channel(MAX_BUFFER_CHUNKS);
    let mut capture = match MicrophoneCapture::open(
        config.device_id.as_deref(),
        config.sample_rate,
        config.channels,
        sender,
    ) {
        Ok(capture) => capture,
        Err(e) => {
            log::error!("Microphone unavailable, audio track stays empty: {}", e);
            return;
        }
    };

    if let Err(e) = capture.start() {
        log::error!("{}", e);
        return;
    }

    run_audio_loop(source, audio, flags, stop);

    if let Err(e) = capture.stop() {
        log::warn!("{}", e);
    }
    if capture.dropped_chunks() > 0 {
        log::warn!(
            "Dropped {} microphone chunks while the encoder was behind",
            capture.dropped_chunks()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_stop_idempotent() {
        // Only meaningful on machines with an input device
        let (sender, _source) = AudioSource::channel(4);
        if let Ok(mut capture) = MicrophoneCapture::open(None, 48_000, 1, sender) {
            assert!(capture.start().is_ok());
            assert!(capture.start().is_ok());
            assert!(capture.is_running());

            assert!(capture.stop().is_ok());
            assert!(capture.stop().is_ok());
            assert!(!capture.is_running());
        }
    }
}
