//! Voice Activity Detection (VAD) module.
//!
//! Detects speech in a frame stream using RMS thresholding and a small state
//! machine with hangover. Timing is measured in audio samples, so detection
//! follows stream time rather than wall-clock time.

use crate::defaults;

/// Configuration for Voice Activity Detection.
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    /// RMS threshold for detecting speech (0.0 to 1.0).
    pub speech_threshold: f32,
    /// Silence needed before speech is considered ended (milliseconds).
    pub hangover_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speech_threshold: defaults::VAD_THRESHOLD,
            hangover_ms: defaults::VAD_HANGOVER_MS,
        }
    }
}

/// Current state of voice activity detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No speech detected.
    Idle,
    /// Speech is being detected.
    Speaking,
    /// Silence detected, waiting to confirm speech end.
    MaybeSilence,
}

/// Events emitted by the VAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart,
    Speech,
    Silence,
    SpeechEnd,
}

/// Voice Activity Detector state machine.
#[derive(Debug, Clone)]
pub struct Vad {
    config: VadConfig,
    state: VadState,
    /// Samples of silence seen since speech last stopped.
    silence_samples: u64,
}

impl Vad {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            state: VadState::Idle,
            silence_samples: 0,
        }
    }

    /// Classifies one frame and advances the state machine.
    pub fn process(&mut self, samples: &[f32], sample_rate: u32) -> VadEvent {
        let is_speech = calculate_rms(samples) > self.config.speech_threshold;

        match self.state {
            VadState::Idle => {
                if is_speech {
                    self.state = VadState::Speaking;
                    VadEvent::SpeechStart
                } else {
                    VadEvent::Silence
                }
            }
            VadState::Speaking | VadState::MaybeSilence if is_speech => {
                self.state = VadState::Speaking;
                self.silence_samples = 0;
                VadEvent::Speech
            }
            VadState::Speaking | VadState::MaybeSilence => {
                self.state = VadState::MaybeSilence;
                self.silence_samples += samples.len() as u64;
                let hangover =
                    u64::from(self.config.hangover_ms) * u64::from(sample_rate) / 1000;
                if self.silence_samples >= hangover {
                    self.state = VadState::Idle;
                    self.silence_samples = 0;
                    VadEvent::SpeechEnd
                } else {
                    VadEvent::Silence
                }
            }
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// True while speech is ongoing, including the hangover window.
    pub fn is_speaking(&self) -> bool {
        self.state != VadState::Idle
    }

    pub fn reset(&mut self) {
        self.state = VadState::Idle;
        self.silence_samples = 0;
    }

    /// Updates the speech threshold without resetting state.
    pub fn set_threshold(&mut self, threshold: f32) {
        self.config.speech_threshold = threshold;
    }

    pub fn threshold(&self) -> f32 {
        self.config.speech_threshold
    }
}

/// Root mean square of f32 samples in [-1.0, 1.0].
///
/// ~0.707 for a full-scale sine, 0.0 for silence or an empty slice.
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}
