//! Stream format descriptor shared by every stage of the pipeline.

use std::fmt;

/// Sample rate and channel count of an f32 sample stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaveFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl WaveFormat {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Single-channel format at the given rate.
    pub const fn mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1)
    }

    /// Number of interleaved samples covering `duration`.
    pub fn samples_for(&self, duration: std::time::Duration) -> usize {
        let frames = (duration.as_secs_f64() * self.sample_rate as f64).round() as usize;
        frames * self.channels as usize
    }
}

impl fmt::Display for WaveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz/{}ch", self.sample_rate, self.channels)
    }
}
