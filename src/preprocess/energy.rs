//! Reference preprocessors: an energy-based gate and a passthrough.

use super::Preprocessor;
use crate::audio::vad::{Vad, VadConfig};
use crate::config::{NoiseSuppressionLevel, PreprocessorSettings, VadSensitivity};
use crate::defaults;
use crate::error::Result;
use std::time::Duration;

/// RMS voice activity detection plus a noise gate.
///
/// Frames classified as non-speech are attenuated according to the noise
/// suppression level. With background removal on, the attenuated signal is
/// mixed with the dry signal by `background_removal_amount`.
pub struct EnergyPreprocessor {
    vad: Vad,
    sample_rate: u32,
    settings: PreprocessorSettings,
    /// Linear gain applied to non-speech frames.
    gate_gain: f32,
    output_muted: bool,
    stream_delay: Duration,
}

impl EnergyPreprocessor {
    pub fn new(settings: &PreprocessorSettings, sample_rate: u32) -> Self {
        let mut vad = Vad::new(VadConfig::default());
        vad.set_threshold(vad_threshold(settings.vad_sensitivity));
        Self {
            vad,
            sample_rate,
            gate_gain: gate_gain(settings.noise_suppression),
            settings: settings.clone(),
            output_muted: false,
            stream_delay: Duration::ZERO,
        }
    }

    pub fn settings(&self) -> &PreprocessorSettings {
        &self.settings
    }

    pub fn is_output_muted(&self) -> bool {
        self.output_muted
    }

    pub fn stream_delay(&self) -> Duration {
        self.stream_delay
    }
}

/// Gate attenuation per suppression level (0 dB, -6, -12, -18, -24).
fn gate_gain(level: NoiseSuppressionLevel) -> f32 {
    match level {
        NoiseSuppressionLevel::Disabled => 1.0,
        NoiseSuppressionLevel::Low => 0.5,
        NoiseSuppressionLevel::Moderate => 0.25,
        NoiseSuppressionLevel::High => 0.125,
        NoiseSuppressionLevel::VeryHigh => 0.063,
    }
}

/// Higher sensitivity means a lower RMS threshold.
fn vad_threshold(sensitivity: VadSensitivity) -> f32 {
    let base = defaults::VAD_THRESHOLD;
    match sensitivity {
        VadSensitivity::Low => base * 2.0,
        VadSensitivity::Medium => base,
        VadSensitivity::High => base * 0.5,
        VadSensitivity::VeryHigh => base * 0.25,
    }
}

impl Preprocessor for EnergyPreprocessor {
    fn process_frame(&mut self, frame: &mut [f32]) -> Result<()> {
        self.vad.process(frame, self.sample_rate);
        if self.vad.is_speaking() {
            return Ok(());
        }

        let mut gain = self.gate_gain;
        if self.settings.background_removal {
            let wet = self.settings.background_removal_amount.clamp(0.0, 1.0);
            gain = gain * wet + (1.0 - wet);
        }
        if gain < 1.0 {
            for sample in frame.iter_mut() {
                *sample *= gain;
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.vad.reset();
    }

    fn is_speech_detected(&self) -> bool {
        self.vad.is_speaking()
    }

    fn set_output_muted(&mut self, muted: bool) {
        self.output_muted = muted;
    }

    fn set_stream_delay(&mut self, delay: Duration) {
        self.stream_delay = delay;
    }

    fn apply_settings(&mut self, settings: &PreprocessorSettings) {
        if settings.vad_sensitivity != self.settings.vad_sensitivity {
            self.vad.set_threshold(vad_threshold(settings.vad_sensitivity));
        }
        self.gate_gain = gate_gain(settings.noise_suppression);
        self.settings = settings.clone();
        tracing::debug!(
            noise_suppression = %settings.noise_suppression,
            "Applied preprocessor settings"
        );
    }

    fn name(&self) -> &str {
        "energy"
    }
}

/// Leaves audio untouched and never reports speech.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughPreprocessor;

impl Preprocessor for PassthroughPreprocessor {
    fn process_frame(&mut self, _frame: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) {}

    fn is_speech_detected(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}
