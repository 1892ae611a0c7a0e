use crate::defaults;
use crate::error::{Result, VoicepipeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: ProcessingConfig,
    pub preprocessor: PreprocessorSettings,
    pub skip_detector: SkipDetectorConfig,
    pub transmit: TransmitConfig,
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Input device name; `None` or empty selects the system default.
    pub device: Option<String>,
    pub startup_delay_ticks: u32,
}

/// Frame sizes and rates of the processing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessingConfig {
    pub intermediate_frame_size: usize,
    pub intermediate_sample_rate: u32,
    pub output_frame_size: usize,
    pub output_sample_rate: u32,
    /// Ring buffer capacity, in intermediate frames.
    pub buffer_frames: usize,
    pub wake_timeout_ms: u64,
}

/// Snapshot of the live-tunable preprocessor settings.
///
/// Passed to a preprocessor when it is created and again whenever the
/// settings change; nothing subscribes to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreprocessorSettings {
    pub noise_suppression: NoiseSuppressionLevel,
    pub vad_sensitivity: VadSensitivity,
    pub echo_cancellation: EchoCancellationLevel,
    pub background_removal: bool,
    /// Wet/dry mix of background removal, 0.0 to 1.0.
    pub background_removal_amount: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NoiseSuppressionLevel {
    Disabled,
    Low,
    Moderate,
    #[default]
    High,
    VeryHigh,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum VadSensitivity {
    Low,
    #[default]
    Medium,
    High,
    VeryHigh,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EchoCancellationLevel {
    #[default]
    Disabled,
    Low,
    Moderate,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SkipDetectorConfig {
    pub max_frame_time_ms: u64,
    pub min_breaker_ms: u64,
    pub max_breaker_ms: u64,
    pub breaker_reset_per_second_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransmitConfig {
    pub frame_size: usize,
    pub sample_rate: u32,
    pub packet_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Directory receiving a WAV recording of each pipeline's output.
    pub record_preprocessor_output: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            startup_delay_ticks: defaults::STARTUP_DELAY_TICKS,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            intermediate_frame_size: defaults::INTERMEDIATE_FRAME_SIZE,
            intermediate_sample_rate: defaults::INTERMEDIATE_SAMPLE_RATE,
            output_frame_size: defaults::OUTPUT_FRAME_SIZE,
            output_sample_rate: defaults::OUTPUT_SAMPLE_RATE,
            buffer_frames: defaults::RING_BUFFER_FRAMES,
            wake_timeout_ms: defaults::WORKER_WAKE_TIMEOUT_MS,
        }
    }
}

impl Default for PreprocessorSettings {
    fn default() -> Self {
        Self {
            noise_suppression: NoiseSuppressionLevel::default(),
            vad_sensitivity: VadSensitivity::default(),
            echo_cancellation: EchoCancellationLevel::default(),
            background_removal: false,
            background_removal_amount: 0.65,
        }
    }
}

impl Default for SkipDetectorConfig {
    fn default() -> Self {
        Self {
            max_frame_time_ms: defaults::MAX_FRAME_TIME_MS,
            min_breaker_ms: defaults::MIN_BREAKER_MS,
            max_breaker_ms: defaults::MAX_BREAKER_MS,
            breaker_reset_per_second_ms: defaults::BREAKER_RESET_PER_SECOND_MS,
        }
    }
}

impl Default for TransmitConfig {
    fn default() -> Self {
        Self {
            frame_size: defaults::CODEC_FRAME_SIZE,
            sample_rate: defaults::CODEC_SAMPLE_RATE,
            packet_queue: defaults::PACKET_QUEUE,
        }
    }
}

fn parse_kebab<T: for<'de> Deserialize<'de>>(key: &str, value: &str) -> Result<T> {
    T::deserialize(toml::Value::String(value.trim().to_ascii_lowercase())).map_err(|_| {
        VoicepipeError::ConfigInvalidValue {
            key: key.to_string(),
            message: format!("unknown value '{}'", value),
        }
    })
}

impl FromStr for NoiseSuppressionLevel {
    type Err = VoicepipeError;

    fn from_str(s: &str) -> Result<Self> {
        parse_kebab("preprocessor.noise_suppression", s)
    }
}

impl FromStr for VadSensitivity {
    type Err = VoicepipeError;

    fn from_str(s: &str) -> Result<Self> {
        parse_kebab("preprocessor.vad_sensitivity", s)
    }
}

impl fmt::Display for NoiseSuppressionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disabled => "disabled",
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::VeryHigh => "very-high",
        };
        f.write_str(name)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only a missing file falls back to defaults; invalid TOML is an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(VoicepipeError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOICEPIPE_DEVICE → capture.device
    /// - VOICEPIPE_NOISE_SUPPRESSION → preprocessor.noise_suppression
    /// - VOICEPIPE_VAD_SENSITIVITY → preprocessor.vad_sensitivity
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(device) = std::env::var("VOICEPIPE_DEVICE")
            && !device.is_empty()
        {
            self.capture.device = Some(device);
        }

        if let Ok(level) = std::env::var("VOICEPIPE_NOISE_SUPPRESSION")
            && !level.is_empty()
        {
            self.preprocessor.noise_suppression = level.parse()?;
        }

        if let Ok(sensitivity) = std::env::var("VOICEPIPE_VAD_SENSITIVITY")
            && !sensitivity.is_empty()
        {
            self.preprocessor.vad_sensitivity = sensitivity.parse()?;
        }

        Ok(self)
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        fn invalid(key: &str, message: &str) -> VoicepipeError {
            VoicepipeError::ConfigInvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            }
        }

        let p = &self.pipeline;
        if p.intermediate_frame_size == 0 {
            return Err(invalid("pipeline.intermediate_frame_size", "must be positive"));
        }
        if p.output_frame_size == 0 {
            return Err(invalid("pipeline.output_frame_size", "must be positive"));
        }
        if p.intermediate_sample_rate == 0 || p.output_sample_rate == 0 {
            return Err(invalid("pipeline.*_sample_rate", "must be positive"));
        }
        if p.buffer_frames < 2 {
            return Err(invalid("pipeline.buffer_frames", "must be at least 2"));
        }
        if p.wake_timeout_ms == 0 {
            return Err(invalid("pipeline.wake_timeout_ms", "must be positive"));
        }

        let amount = self.preprocessor.background_removal_amount;
        if !(0.0..=1.0).contains(&amount) {
            return Err(invalid(
                "preprocessor.background_removal_amount",
                "must be between 0.0 and 1.0",
            ));
        }

        let s = &self.skip_detector;
        if s.min_breaker_ms > s.max_breaker_ms {
            return Err(invalid(
                "skip_detector.min_breaker_ms",
                "must not exceed max_breaker_ms",
            ));
        }

        let t = &self.transmit;
        if t.frame_size == 0 || t.sample_rate == 0 {
            return Err(invalid("transmit", "frame_size and sample_rate must be positive"));
        }
        if t.packet_queue == 0 {
            return Err(invalid("transmit.packet_queue", "must be positive"));
        }

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voicepipe/config.toml on Linux
    #[cfg(feature = "cli")]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("voicepipe").join("config.toml"))
    }
}
