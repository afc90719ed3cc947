use thiserror::Error;

/// Errors produced by the recording pipeline.
///
/// Every variant carries a human-readable message; the controller turns
/// configuration-time errors into a `false` from `start` and logs the rest.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Encoding error: {0}")]
    Encoding(String),
    #[error("Muxing error: {0}")]
    Muxing(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Capture error: {0}")]
    Capture(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[cfg(feature = "audio")]
    #[error("Audio error: {0}")]
    Audio(String),
}

impl RecorderError {
    /// True for errors that must abort a `start` transition.
    pub fn is_configuration(&self) -> bool {
        matches!(self, RecorderError::Configuration(_))
    }
}

impl From<std::io::Error> for RecorderError {
    fn from(e: std::io::Error) -> Self {
        RecorderError::Io(e.to_string())
    }
}
