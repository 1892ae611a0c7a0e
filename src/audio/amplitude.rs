//! Running amplitude estimate for metering.

use crate::defaults;

/// Exponential moving average of the mean absolute sample value.
#[derive(Debug, Clone)]
pub struct AmplitudeMeter {
    smoothing: f32,
    value: f32,
}

impl Default for AmplitudeMeter {
    fn default() -> Self {
        Self::new(defaults::AMPLITUDE_SMOOTHING)
    }
}

impl AmplitudeMeter {
    /// `smoothing` is the weight of each new frame, in (0, 1].
    pub fn new(smoothing: f32) -> Self {
        Self {
            smoothing: smoothing.clamp(f32::EPSILON, 1.0),
            value: 0.0,
        }
    }

    pub fn update(&mut self, frame: &[f32]) {
        if frame.is_empty() {
            return;
        }
        let mean = frame.iter().map(|s| s.abs()).sum::<f32>() / frame.len() as f32;
        self.value += (mean - self.value) * self.smoothing;
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converges_to_constant_level() {
        let mut meter = AmplitudeMeter::new(0.5);
        for _ in 0..32 {
            meter.update(&[0.4, -0.4, 0.4, -0.4]);
        }
        assert!((meter.value() - 0.4).abs() < 1e-3);
    }

    #[test]
    fn test_smoothing_limits_single_frame_jump() {
        let mut meter = AmplitudeMeter::new(0.1);
        meter.update(&[1.0; 8]);
        assert!((meter.value() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_reset_and_empty_frame() {
        let mut meter = AmplitudeMeter::default();
        meter.update(&[0.5; 4]);
        meter.update(&[]);
        assert!(meter.value() > 0.0);
        meter.reset();
        assert_eq!(meter.value(), 0.0);
    }
}
