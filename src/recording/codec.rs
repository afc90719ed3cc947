//! Codec session seam
//!
//! `Codec` models an encoder the way hardware encoders expose themselves: a
//! bounded pool of input slots, and an output queue that reports a format
//! announcement before the first payload. Concrete codecs (openh264, Opus,
//! test doubles) sit behind this trait; `EncoderAdapter` drives them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::RecordingConfig;
use crate::errors::RecorderError;

/// Logical track inside the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Video,
    Audio,
}

/// Stream format an encoder settled on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrackFormat {
    H264 {
        width: u32,
        height: u32,
        fps: u32,
        bitrate: u32,
    },
    Opus {
        sample_rate: u32,
        channels: u16,
        bitrate: u32,
    },
}

/// Everything the container needs to allocate a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub kind: TrackKind,
    pub format: TrackFormat,
    /// Out-of-band codec configuration, empty when carried in-band
    pub codec_config: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleFlags {
    pub key_frame: bool,
    /// Codec metadata rather than media; never written as a sample
    pub codec_config: bool,
    pub end_of_stream: bool,
}

/// One compressed unit produced by a codec
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedSample {
    pub data: Vec<u8>,
    /// Number of bytes of `data` that are media payload
    pub size: usize,
    pub flags: SampleFlags,
    /// Presentation timestamp assigned by the pacer
    pub timestamp_us: u64,
}

impl EncodedSample {
    pub fn new(data: Vec<u8>, timestamp_us: u64, flags: SampleFlags) -> Self {
        let size = data.len();
        Self {
            data,
            size,
            flags,
            timestamp_us,
        }
    }

    /// Empty sample carrying only the end-of-stream flag
    pub fn end_of_stream(timestamp_us: u64) -> Self {
        Self::new(
            Vec::new(),
            timestamp_us,
            SampleFlags {
                end_of_stream: true,
                ..SampleFlags::default()
            },
        )
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.size.min(self.data.len())]
    }
}

/// Handle to a reserved input slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSlot(pub usize);

/// Result of polling a codec's output queue
#[derive(Debug, Clone, PartialEq)]
pub enum CodecOutput {
    /// Nothing ready right now
    TryAgainLater,
    /// Output format is final; emitted once before the first payload
    FormatReady(TrackDescriptor),
    Sample(EncodedSample),
}

/// An encoder session with a bounded input pool
pub trait Codec: Send {
    fn kind(&self) -> TrackKind;

    /// Apply the recording configuration; only valid before `start`
    fn configure(&mut self, config: &RecordingConfig) -> Result<(), RecorderError>;

    fn start(&mut self) -> Result<(), RecorderError>;

    /// Reserve an input slot without blocking
    fn dequeue_input(&mut self) -> Option<InputSlot>;

    /// Fill a reserved slot. An empty non-end-of-stream payload returns the
    /// slot unused.
    fn queue_input(
        &mut self,
        slot: InputSlot,
        payload: &[u8],
        timestamp_us: u64,
        end_of_stream: bool,
    ) -> Result<(), RecorderError>;

    /// Reject a payload `queue_input` would refuse, before a slot or a
    /// timestamp is spent on it
    fn check_input(&self, _payload: &[u8]) -> Result<(), RecorderError> {
        Ok(())
    }

    /// Poll the output queue, waiting at most `timeout` for something ready
    fn dequeue_output(&mut self, timeout: Duration) -> Result<CodecOutput, RecorderError>;

    /// Hand an output buffer back once it was written or discarded
    fn release_output(&mut self, _sample: EncodedSample) {}

    /// Inputs queued or reserved but not yet turned into output
    fn pending_inputs(&self) -> usize;

    fn input_capacity(&self) -> usize;

    /// Ask for the next output to be independently decodable
    fn request_keyframe(&mut self) {}

    fn stop(&mut self) -> Result<(), RecorderError>;
}
