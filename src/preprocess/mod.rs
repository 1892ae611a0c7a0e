//! Speech preprocessing capability.
//!
//! The pipeline treats the preprocessor as opaque: it hands over one
//! intermediate-rate frame at a time, in place, and reads back whether the
//! last frames contained speech.

pub mod energy;

pub use energy::{EnergyPreprocessor, PassthroughPreprocessor};

use crate::config::PreprocessorSettings;
use crate::error::Result;
use std::time::Duration;

/// In-place frame processor with voice activity detection.
///
/// Dropping the value releases whatever the implementation holds.
pub trait Preprocessor: Send {
    /// Processes one frame of intermediate-rate samples in place.
    fn process_frame(&mut self, frame: &mut [f32]) -> Result<()>;

    /// Forgets all stream history.
    fn reset(&mut self);

    fn is_speech_detected(&self) -> bool;

    /// Whether the pipeline's output is currently muted in the mix.
    fn set_output_muted(&mut self, _muted: bool) {}

    /// Estimated capture delay, used for echo alignment.
    fn set_stream_delay(&mut self, _delay: Duration) {}

    /// Applies a new settings snapshot without recreating the instance.
    fn apply_settings(&mut self, _settings: &PreprocessorSettings) {}

    fn name(&self) -> &str {
        "preprocessor"
    }
}

impl<P: Preprocessor + ?Sized> Preprocessor for Box<P> {
    fn process_frame(&mut self, frame: &mut [f32]) -> Result<()> {
        (**self).process_frame(frame)
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn is_speech_detected(&self) -> bool {
        (**self).is_speech_detected()
    }

    fn set_output_muted(&mut self, muted: bool) {
        (**self).set_output_muted(muted)
    }

    fn set_stream_delay(&mut self, delay: Duration) {
        (**self).set_stream_delay(delay)
    }

    fn apply_settings(&mut self, settings: &PreprocessorSettings) {
        (**self).apply_settings(settings)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
