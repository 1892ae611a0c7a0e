//! Error types for voicepipe.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoicepipeError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // Audio capture errors
    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio format mismatch: expected {expected}, got {actual}")]
    AudioFormatMismatch { expected: String, actual: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    // Processing errors
    #[error("Resampler error: {message}")]
    Resampler { message: String },

    #[error("Preprocessor failed: {message}")]
    Preprocessor { message: String },

    #[error("Encoder failed: {message}")]
    Encoder { message: String },

    #[error("Subscriber '{name}' failed: {message}")]
    Subscriber { name: String, message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl VoicepipeError {
    /// Format mismatch between the configured and the supplied stream format.
    pub fn format_mismatch(
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        VoicepipeError::AudioFormatMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoicepipeError>;
