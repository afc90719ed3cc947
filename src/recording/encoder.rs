//! H.264 codec session using openh264
//!
//! openh264 encodes synchronously, so queued inputs are held in a bounded
//! pool and encoded when the output queue is polled. That keeps the
//! submit/drain split of a hardware encoder: `queue_input` is cheap and the
//! drain does the work under the adapter's lock.

use std::collections::VecDeque;
use std::time::Duration;

use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate, FrameType, RateControlMode};
use openh264::formats::YUVBuffer;
use openh264::OpenH264API;

use super::codec::{
    Codec, CodecOutput, EncodedSample, InputSlot, SampleFlags, TrackDescriptor, TrackFormat,
    TrackKind,
};
use super::config::RecordingConfig;
use crate::errors::RecorderError;

struct PendingInput {
    data: Vec<u8>,
    timestamp_us: u64,
    end_of_stream: bool,
}

/// H.264 encoder session fed with I420 frames
pub struct H264Codec {
    encoder: Option<Encoder>,
    width: u32,
    height: u32,
    fps: u32,
    bitrate: u32,
    capacity: usize,
    reserved: usize,
    next_slot: usize,
    pending: VecDeque<PendingInput>,
    ready: VecDeque<CodecOutput>,
    started: bool,
    format_announced: bool,
    frames_encoded: u64,
    keyframe_interval_secs: u32,
    force_next_keyframe: bool,
}

impl H264Codec {
    /// Create an unconfigured codec with `capacity` input slots
    pub fn new(capacity: usize, keyframe_interval_secs: u32) -> Self {
        Self {
            encoder: None,
            width: 0,
            height: 0,
            fps: 0,
            bitrate: 0,
            capacity: capacity.max(1),
            reserved: 0,
            next_slot: 0,
            pending: VecDeque::with_capacity(capacity.max(1)),
            ready: VecDeque::new(),
            started: false,
            format_announced: false,
            frames_encoded: 0,
            keyframe_interval_secs,
            force_next_keyframe: false,
        }
    }

    /// Number of frames encoded so far
    pub fn frame_count(&self) -> u64 {
        self.frames_encoded
    }

    fn frame_size(&self) -> usize {
        let w = self.width as usize;
        let h = self.height as usize;
        w * h + 2 * (w.div_ceil(2) * h.div_ceil(2))
    }

    fn keyframe_due(&self) -> bool {
        let interval = u64::from(self.keyframe_interval_secs) * u64::from(self.fps);
        interval > 0 && self.frames_encoded > 0 && self.frames_encoded % interval == 0
    }

    fn descriptor(&self) -> TrackDescriptor {
        TrackDescriptor {
            kind: TrackKind::Video,
            format: TrackFormat::H264 {
                width: self.width,
                height: self.height,
                fps: self.fps,
                bitrate: self.bitrate,
            },
            // SPS/PPS travel in-band with every IDR
            codec_config: Vec::new(),
        }
    }

    fn encode(&mut self, input: PendingInput) -> Result<EncodedSample, RecorderError> {
        let force = self.force_next_keyframe || self.keyframe_due();
        let timestamp_us = input.timestamp_us;
        let yuv = YUVBuffer::from_vec(input.data, self.width as usize, self.height as usize);

        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| RecorderError::InvalidState("H.264 encoder not configured".to_string()))?;
        if force {
            encoder.force_intra_frame();
        }

        let bitstream = encoder
            .encode(&yuv)
            .map_err(|e| RecorderError::Encoding(format!("Encoding failed: {}", e)))?;
        let key_frame = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        let data = bitstream.to_vec();

        self.force_next_keyframe = false;
        self.frames_encoded += 1;

        Ok(EncodedSample::new(
            data,
            timestamp_us,
            SampleFlags {
                key_frame,
                ..SampleFlags::default()
            },
        ))
    }
}

impl Codec for H264Codec {
    fn kind(&self) -> TrackKind {
        TrackKind::Video
    }

    fn configure(&mut self, config: &RecordingConfig) -> Result<(), RecorderError> {
        if self.started {
            return Err(RecorderError::InvalidState(
                "Cannot reconfigure a running H.264 encoder".to_string(),
            ));
        }
        config.validate()?;

        // Dimensions are taken from the YUV source at encode time
        let encoder_config = EncoderConfig::new()
            .bitrate(BitRate::from_bps(config.bitrate))
            .max_frame_rate(FrameRate::from_hz(config.fps as f32))
            .rate_control_mode(RateControlMode::Bitrate)
            .skip_frames(false);
        let encoder = Encoder::with_api_config(OpenH264API::from_source(), encoder_config)
            .map_err(|e| {
                RecorderError::Configuration(format!("Failed to create encoder: {}", e))
            })?;
        log::debug!(
            "H.264 encoder configured: {}x{} @ {} fps, {} bps",
            config.width,
            config.height,
            config.fps,
            config.bitrate
        );

        self.encoder = Some(encoder);
        self.width = config.width;
        self.height = config.height;
        self.fps = config.fps;
        self.bitrate = config.bitrate;
        Ok(())
    }

    fn start(&mut self) -> Result<(), RecorderError> {
        if self.encoder.is_none() {
            return Err(RecorderError::InvalidState(
                "H.264 encoder started before configure".to_string(),
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
        let slot = InputSlot(self.next_slot % self.capacity);
        self.next_slot = self.next_slot.wrapping_add(1);
        Some(slot)
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

        if end_of_stream {
            self.pending.push_back(PendingInput {
                data: Vec::new(),
                timestamp_us,
                end_of_stream: true,
            });
            return Ok(());
        }
        if payload.is_empty() {
            return Ok(());
        }

        self.check_input(payload)?;

        self.pending.push_back(PendingInput {
            data: payload.to_vec(),
            timestamp_us,
            end_of_stream: false,
        });
        Ok(())
    }

    fn check_input(&self, payload: &[u8]) -> Result<(), RecorderError> {
        let expected = self.frame_size();
        if !payload.is_empty() && payload.len() != expected {
            return Err(RecorderError::Encoding(format!(
                "Invalid frame size: expected {} bytes, got {}",
                expected,
                payload.len()
            )));
        }
        Ok(())
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<CodecOutput, RecorderError> {
        if let Some(output) = self.ready.pop_front() {
            return Ok(output);
        }

        let input = match self.pending.pop_front() {
            Some(input) => input,
            None => return Ok(CodecOutput::TryAgainLater),
        };

        if input.end_of_stream {
            return Ok(CodecOutput::Sample(EncodedSample::end_of_stream(
                input.timestamp_us,
            )));
        }

        let sample = self.encode(input)?;
        if !self.format_announced {
            self.format_announced = true;
            self.ready.push_back(CodecOutput::Sample(sample));
            return Ok(CodecOutput::FormatReady(self.descriptor()));
        }
        Ok(CodecOutput::Sample(sample))
    }

    fn pending_inputs(&self) -> usize {
        self.reserved + self.pending.len()
    }

    fn input_capacity(&self) -> usize {
        self.capacity
    }

    fn request_keyframe(&mut self) {
        self.force_next_keyframe = true;
    }

    fn stop(&mut self) -> Result<(), RecorderError> {
        self.started = false;
        self.pending.clear();
        self.ready.clear();
        self.reserved = 0;
        self.encoder = None;
        Ok(())
    }
}
