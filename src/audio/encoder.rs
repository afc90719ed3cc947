//! Opus codec session
//!
//! Input payloads are little-endian f32 PCM, interleaved. PCM is buffered
//! into 20 ms frames; a trailing partial frame is zero-padded when
//! end-of-stream arrives.

use std::collections::VecDeque;
use std::time::Duration;

use crate::errors::RecorderError;
use crate::recording::{
    Codec, CodecOutput, EncodedSample, InputSlot, RecordingConfig, SampleFlags, TrackDescriptor,
    TrackFormat, TrackKind,
};

/// 20 ms at 48 kHz, per channel
const OPUS_FRAME_SAMPLES: usize = 960;

/// OPUS_APPLICATION_AUDIO
const OPUS_APPLICATION_AUDIO: i32 = 2049;

/// Largest packet libopus will produce
const MAX_PACKET_BYTES: usize = 4000;

/// Owned libopus encoder state
struct RawEncoder(*mut libopus_sys::OpusEncoder);

// SAFETY: libopus encoders may be used from any thread as long as only one
// thread touches them at a time. `OpusCodec` is only reached through the
// adapter's mutex, and `RawEncoder` is neither `Clone` nor `Sync`.
unsafe impl Send for RawEncoder {}

impl RawEncoder {
    fn create(sample_rate: u32, channels: u16, bitrate: u32) -> Result<Self, RecorderError> {
        let mut error: i32 = 0;
        let encoder = unsafe {
            libopus_sys::opus_encoder_create(
                sample_rate as i32,
                i32::from(channels),
                OPUS_APPLICATION_AUDIO,
                &mut error,
            )
        };
        if encoder.is_null() || error != 0 {
            return Err(RecorderError::Configuration(format!(
                "Failed to create Opus encoder: error code {}",
                error
            )));
        }
        // Owned from here on so an early return frees it
        let raw = RawEncoder(encoder);

        let result = unsafe {
            libopus_sys::opus_encoder_ctl(
                raw.0,
                libopus_sys::OPUS_SET_BITRATE_REQUEST as i32,
                bitrate as i32,
            )
        };
        if result != 0 {
            return Err(RecorderError::Configuration(format!(
                "Failed to set Opus bitrate: error code {}",
                result
            )));
        }
        Ok(raw)
    }

    fn encode(&mut self, frame: &[f32]) -> Result<Vec<u8>, RecorderError> {
        let mut output = vec![0u8; MAX_PACKET_BYTES];
        let len = unsafe {
            libopus_sys::opus_encode_float(
                self.0,
                frame.as_ptr(),
                OPUS_FRAME_SAMPLES as i32,
                output.as_mut_ptr(),
                output.len() as i32,
            )
        };
        if len < 0 {
            return Err(RecorderError::Audio(format!(
                "Opus encoding failed: error code {}",
                len
            )));
        }
        output.truncate(len as usize);
        Ok(output)
    }
}

impl Drop for RawEncoder {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { libopus_sys::opus_encoder_destroy(self.0) };
        }
    }
}

struct PendingPcm {
    samples: Vec<f32>,
    timestamp_us: u64,
    end_of_stream: bool,
}

/// Opus encoder behind the codec seam
pub struct OpusCodec {
    encoder: Option<RawEncoder>,
    sample_rate: u32,
    channels: u16,
    bitrate: u32,
    capacity: usize,
    reserved: usize,
    pending: VecDeque<PendingPcm>,
    buffer: Vec<f32>,
    origin_us: Option<u64>,
    samples_encoded: u64,
    ready: VecDeque<CodecOutput>,
    started: bool,
    announced: bool,
}

impl OpusCodec {
    pub fn new(capacity: usize) -> Self {
        Self {
            encoder: None,
            sample_rate: 48_000,
            channels: 1,
            bitrate: 64_000,
            capacity: capacity.max(1),
            reserved: 0,
            pending: VecDeque::new(),
            buffer: Vec::new(),
            origin_us: None,
            samples_encoded: 0,
            ready: VecDeque::new(),
            started: false,
            announced: false,
        }
    }

    fn frame_len(&self) -> usize {
        OPUS_FRAME_SAMPLES * usize::from(self.channels)
    }

    fn next_packet_ts(&self) -> u64 {
        self.origin_us.unwrap_or(0) + self.samples_encoded * 1_000_000 / u64::from(self.sample_rate)
    }

    fn encode_buffered(&mut self, pad: bool) -> Result<(), RecorderError> {
        let frame_len = self.frame_len();
        if pad && self.buffer.len() % frame_len != 0 {
            let padding = frame_len - self.buffer.len() % frame_len;
            self.buffer.extend(std::iter::repeat(0.0f32).take(padding));
        }

        while self.buffer.len() >= frame_len {
            let frame: Vec<f32> = self.buffer.drain(..frame_len).collect();
            let timestamp_us = self.next_packet_ts();
            let encoder = self
                .encoder
                .as_mut()
                .ok_or_else(|| RecorderError::InvalidState("Opus encoder not configured".to_string()))?;
            let packet = encoder.encode(&frame)?;
            self.samples_encoded += OPUS_FRAME_SAMPLES as u64;
            self.ready.push_back(CodecOutput::Sample(EncodedSample::new(
                packet,
                timestamp_us,
                SampleFlags {
                    key_frame: true,
                    ..SampleFlags::default()
                },
            )));
        }
        Ok(())
    }

    fn descriptor(&self) -> TrackDescriptor {
        TrackDescriptor {
            kind: TrackKind::Audio,
            format: TrackFormat::Opus {
                sample_rate: self.sample_rate,
                channels: self.channels,
                bitrate: self.bitrate,
            },
            codec_config: Vec::new(),
        }
    }
}

impl Codec for OpusCodec {
    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn configure(&mut self, config: &RecordingConfig) -> Result<(), RecorderError> {
        if self.started {
            return Err(RecorderError::InvalidState(
                "Cannot reconfigure a running Opus encoder".to_string(),
            ));
        }
        let audio = &config.audio;
        if audio.sample_rate != 48_000 {
            return Err(RecorderError::Configuration(
                "Opus requires 48000 Hz sample rate".to_string(),
            ));
        }
        if audio.channels != 1 && audio.channels != 2 {
            return Err(RecorderError::Configuration(
                "Opus supports only mono (1) or stereo (2) channels".to_string(),
            ));
        }

        self.encoder = Some(RawEncoder::create(
            audio.sample_rate,
            audio.channels,
            audio.bitrate,
        )?);
        self.sample_rate = audio.sample_rate;
        self.channels = audio.channels;
        self.bitrate = audio.bitrate;
        self.buffer = Vec::with_capacity(self.frame_len() * 2);
        Ok(())
    }

    fn start(&mut self) -> Result<(), RecorderError> {
        if self.encoder.is_none() {
            return Err(RecorderError::InvalidState(
                "Opus encoder started before configure".to_string(),
            ));
        }
        self.started = true;
        Ok(())
    }

    fn dequeue_input(&mut self) -> Option<InputSlot> {
        if !self.started || self.pending_inputs() >= self.capacity {
            return None;
        }
        self.reserved += 1;
        Some(InputSlot(self.pending_inputs() - 1))
    }

    fn queue_input(
        &mut self,
        _slot: InputSlot,
        payload: &[u8],
        timestamp_us: u64,
        end_of_stream: bool,
    ) -> Result<(), RecorderError> {
        if self.reserved == 0 {
            return Err(RecorderError::InvalidState(
                "queue_input without a reserved slot".to_string(),
            ));
        }
        self.reserved -= 1;

        self.check_input(payload)?;
        if payload.is_empty() && !end_of_stream {
            return Ok(());
        }

        let samples = payload
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        self.pending.push_back(PendingPcm {
            samples,
            timestamp_us,
            end_of_stream,
        });
        Ok(())
    }

    fn check_input(&self, payload: &[u8]) -> Result<(), RecorderError> {
        if payload.len() % 4 != 0 {
            return Err(RecorderError::Audio(format!(
                "PCM payload of {} bytes is not whole f32 samples",
                payload.len()
            )));
        }
        Ok(())
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<CodecOutput, RecorderError> {
        if self.started && !self.announced {
            self.announced = true;
            return Ok(CodecOutput::FormatReady(self.descriptor()));
        }

        while self.ready.is_empty() {
            let input = match self.pending.pop_front() {
                Some(input) => input,
                None => break,
            };
            if self.origin_us.is_none() && !input.samples.is_empty() {
                self.origin_us = Some(input.timestamp_us);
            }
            self.buffer.extend_from_slice(&input.samples);
            self.encode_buffered(input.end_of_stream)?;
            if input.end_of_stream {
                let end = self.next_packet_ts().max(input.timestamp_us);
                self.ready
                    .push_back(CodecOutput::Sample(EncodedSample::end_of_stream(end)));
            }
        }

        Ok(self.ready.pop_front().unwrap_or(CodecOutput::TryAgainLater))
    }

    fn pending_inputs(&self) -> usize {
        self.reserved + self.pending.len()
    }

    fn input_capacity(&self) -> usize {
        self.capacity
    }

    fn stop(&mut self) -> Result<(), RecorderError> {
        self.started = false;
        self.pending.clear();
        self.ready.clear();
        self.buffer.clear();
        self.reserved = 0;
        self.encoder = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::AudioConfig;
    use crate::testing::synthetic_audio_chunk;

    fn started(channels: u16) -> OpusCodec {
        let config = RecordingConfig::default().with_audio_config(AudioConfig {
            channels,
            ..AudioConfig::default()
        });
        let mut codec = OpusCodec::new(8);
        codec.configure(&config).unwrap();
        codec.start().unwrap();
        codec
    }

    fn drain(codec: &mut OpusCodec) -> Vec<CodecOutput> {
        let mut out = Vec::new();
        loop {
            match codec.dequeue_output(Duration::ZERO).unwrap() {
                CodecOutput::TryAgainLater => return out,
                other => out.push(other),
            }
        }
    }

    #[test]
    fn test_rejects_wrong_sample_rate() {
        let config = RecordingConfig::default().with_audio_config(AudioConfig {
            sample_rate: 44_100,
            ..AudioConfig::default()
        });
        assert!(OpusCodec::new(8).configure(&config).is_err());
    }

    #[test]
    fn test_format_announced_without_input() {
        let mut codec = started(1);
        assert!(matches!(
            codec.dequeue_output(Duration::ZERO).unwrap(),
            CodecOutput::FormatReady(_)
        ));
        assert_eq!(
            codec.dequeue_output(Duration::ZERO).unwrap(),
            CodecOutput::TryAgainLater
        );
    }

    #[test]
    fn test_full_frame_yields_packet() {
        let mut codec = started(2);
        let chunk = synthetic_audio_chunk(0, OPUS_FRAME_SAMPLES, 48_000, 2);
        let slot = codec.dequeue_input().unwrap();
        codec.queue_input(slot, &chunk.to_le_bytes(), 0, false).unwrap();

        let outputs = drain(&mut codec);
        assert_eq!(outputs.len(), 2);
        match &outputs[1] {
            CodecOutput::Sample(s) => {
                assert!(!s.data.is_empty());
                assert_eq!(s.timestamp_us, 0);
            }
            other => panic!("expected packet, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_frame_flushed_on_end_of_stream() {
        let mut codec = started(1);
        drain(&mut codec);

        let chunk = synthetic_audio_chunk(0, 100, 48_000, 1);
        let slot = codec.dequeue_input().unwrap();
        codec.queue_input(slot, &chunk.to_le_bytes(), 0, false).unwrap();
        assert!(drain(&mut codec).is_empty());

        let slot = codec.dequeue_input().unwrap();
        codec.queue_input(slot, &[], 2_083, true).unwrap();
        let outputs = drain(&mut codec);
        assert_eq!(outputs.len(), 2);
        match &outputs[1] {
            CodecOutput::Sample(s) => {
                assert!(s.flags.end_of_stream);
                assert_eq!(s.timestamp_us, 20_000);
            }
            other => panic!("expected end-of-stream, got {:?}", other),
        }
    }
}
