//! Audio input enumeration

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

use crate::errors::RecorderError;

/// Audio input device information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDevice {
    /// Identifier accepted by `AudioConfig::device_id`
    pub id: String,
    pub name: String,
    /// Default sample rate in Hz
    pub sample_rate: u32,
    pub channels: u16,
    pub is_default: bool,
}

/// cpal has no portable device id, so derive one from position and name
fn synthetic_id(index: usize, name: &str) -> String {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    format!("audio_{}_{:08x}", index, hasher.finish() & 0xFFFF_FFFF)
}

/// List input devices, default first, then by name
pub fn list_audio_devices() -> Result<Vec<AudioDevice>, RecorderError> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let mut devices: Vec<AudioDevice> = host
        .input_devices()
        .map_err(|e| RecorderError::Audio(format!("Failed to enumerate audio devices: {}", e)))?
        .enumerate()
        .filter_map(|(index, device)| {
            let name = device.name().ok()?;
            let config = device.default_input_config().ok()?;
            Some(AudioDevice {
                id: synthetic_id(index, &name),
                is_default: default_name.as_deref() == Some(name.as_str()),
                sample_rate: config.sample_rate().0,
                channels: config.channels(),
                name,
            })
        })
        .collect();

    devices.sort_by(|a, b| b.is_default.cmp(&a.is_default).then_with(|| a.name.cmp(&b.name)));
    Ok(devices)
}

pub fn get_default_audio_device() -> Result<AudioDevice, RecorderError> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| RecorderError::Audio("No default audio input device".to_string()))?;
    let name = device
        .name()
        .map_err(|e| RecorderError::Audio(format!("Failed to get device name: {}", e)))?;
    let config = device
        .default_input_config()
        .map_err(|e| RecorderError::Audio(format!("Failed to get device config: {}", e)))?;

    Ok(AudioDevice {
        id: synthetic_id(0, &name),
        name,
        sample_rate: config.sample_rate().0,
        channels: config.channels(),
        is_default: true,
    })
}

/// Find a device by id or name; empty or `"default"` means the default input
pub fn find_audio_device(device_id: &str) -> Result<AudioDevice, RecorderError> {
    if device_id.is_empty() || device_id == "default" {
        return get_default_audio_device();
    }
    list_audio_devices()?
        .into_iter()
        .find(|d| d.id == device_id || d.name == device_id)
        .ok_or_else(|| RecorderError::Audio(format!("Audio device not found: {}", device_id)))
}
