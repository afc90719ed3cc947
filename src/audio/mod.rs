//! Microphone track support
//!
//! - `device`: input enumeration (cpal)
//! - `capture`: microphone to `AudioChunk` stream
//! - `encoder`: Opus behind the `Codec` seam

mod capture;
mod device;
mod encoder;

pub(crate) use capture::run_microphone;
pub use capture::MicrophoneCapture;
pub use device::{find_audio_device, get_default_audio_device, list_audio_devices, AudioDevice};
pub use encoder::OpusCodec;
