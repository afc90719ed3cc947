//! Runtime settings for crabreel
//!
//! Tunables that are not part of a recording's identity: encoder timeouts and
//! pool sizes, ingestion queue depth, and where files are written and
//! persisted. Stored as TOML.

use crate::errors::RecorderError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root settings structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderSettings {
    pub encoder: EncoderSettings,
    pub ingest: IngestSettings,
    pub storage: StorageSettings,
}

/// Encoder flow-control settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// Input slots per encoder
    pub input_pool_capacity: usize,
    /// Bounded wait for a free input slot, in milliseconds
    pub input_timeout_ms: u64,
    /// Bounded wait on the output queue per drain poll, in milliseconds
    pub output_timeout_ms: u64,
    /// How long `stop` keeps trying to deliver end-of-stream
    pub end_of_stream_timeout_ms: u64,
    /// Forced keyframe cadence in seconds (0 disables)
    pub keyframe_interval_secs: u32,
    /// Periodic drain ticker interval (0 disables)
    pub drain_interval_ms: u64,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            input_pool_capacity: 16,
            input_timeout_ms: 10,
            output_timeout_ms: 10,
            end_of_stream_timeout_ms: 5000,
            keyframe_interval_secs: 2,
            drain_interval_ms: 0,
        }
    }
}

/// Frame ingestion settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// Depth of the push-mode frame queue
    pub push_queue_capacity: usize,
    /// How long `stop` waits for each worker thread
    pub worker_join_timeout_ms: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            push_queue_capacity: 8,
            worker_join_timeout_ms: 2000,
        }
    }
}

/// Output location and naming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Where containers are written while recording
    pub work_dir: PathBuf,
    /// Root of long-term storage
    pub library_dir: PathBuf,
    /// Category folder inside the library
    pub relative_path: String,
    /// File name prefix, followed by the device tag
    pub file_prefix: String,
    /// Title stored in container metadata
    pub title: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("crabreel"),
            library_dir: PathBuf::from("./recordings"),
            relative_path: "Movies/ThermalCamera".to_string(),
            file_prefix: "MINI2".to_string(),
            title: "MINI2 Thermal Recording".to_string(),
        }
    }
}

impl RecorderSettings {
    /// Load settings from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, RecorderError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Settings file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| {
            RecorderError::Configuration(format!("Failed to read settings file: {}", e))
        })?;

        let settings: RecorderSettings = toml::from_str(&contents).map_err(|e| {
            RecorderError::Configuration(format!("Failed to parse settings file: {}", e))
        })?;

        log::info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Save settings to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), RecorderError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    RecorderError::Configuration(format!(
                        "Failed to create settings directory: {}",
                        e
                    ))
                })?;
            }
        }

        let toml_string = toml::to_string_pretty(self).map_err(|e| {
            RecorderError::Configuration(format!("Failed to serialize settings: {}", e))
        })?;

        fs::write(path, toml_string).map_err(|e| {
            RecorderError::Configuration(format!("Failed to write settings file: {}", e))
        })?;

        log::info!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("crabreel.toml")
    }

    /// Load from the default location, falling back to defaults on error
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load settings, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate settings values
    pub fn validate(&self) -> Result<(), String> {
        if self.encoder.input_pool_capacity == 0 || self.encoder.input_pool_capacity > 256 {
            return Err("Input pool capacity must be between 1 and 256".to_string());
        }
        if self.encoder.end_of_stream_timeout_ms == 0 {
            return Err("End-of-stream timeout must be positive".to_string());
        }
        if self.ingest.push_queue_capacity == 0 {
            return Err("Push queue capacity must be positive".to_string());
        }
        if self.storage.file_prefix.is_empty() || self.storage.file_prefix.contains(['/', '\\']) {
            return Err("File prefix must be a non-empty name without separators".to_string());
        }
        if Path::new(&self.storage.relative_path).is_absolute() {
            return Err("Library relative path must not be absolute".to_string());
        }
        Ok(())
    }
}
