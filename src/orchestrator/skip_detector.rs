//! Scheduling-stall detection with a self-widening breaker.

use crate::config::SkipDetectorConfig;
use std::time::Duration;

/// Flags ticks long enough that buffered audio is out of step with the
/// wall clock.
///
/// After a trip the breaker stays open for its current duration, during
/// which further long ticks are ignored. Each trip doubles the breaker (up
/// to the maximum); quiet ticks shrink it back towards the minimum at the
/// reset rate.
#[derive(Debug, Clone)]
pub struct FrameSkipDetector {
    max_frame_time: Duration,
    min_breaker: Duration,
    max_breaker: Duration,
    /// Breaker shrinkage per second of elapsed ticks.
    reset_per_second: Duration,
    breaker: Duration,
    armed: bool,
    since_trip: Duration,
}

impl FrameSkipDetector {
    pub fn new(
        max_frame_time: Duration,
        min_breaker: Duration,
        max_breaker: Duration,
        reset_per_second: Duration,
    ) -> Self {
        let max_breaker = max_breaker.max(min_breaker);
        Self {
            max_frame_time,
            min_breaker,
            max_breaker,
            reset_per_second,
            breaker: min_breaker,
            armed: true,
            since_trip: Duration::ZERO,
        }
    }

    pub fn from_config(config: &SkipDetectorConfig) -> Self {
        Self::new(
            Duration::from_millis(config.max_frame_time_ms),
            Duration::from_millis(config.min_breaker_ms),
            Duration::from_millis(config.max_breaker_ms),
            Duration::from_millis(config.breaker_reset_per_second_ms),
        )
    }

    /// Feeds one tick's duration; true if this tick is a frame skip.
    pub fn is_frame_skip(&mut self, delta: Duration) -> bool {
        let decay = self.reset_per_second.mul_f64(delta.as_secs_f64());
        self.breaker = self.breaker.saturating_sub(decay).max(self.min_breaker);

        if !self.armed {
            self.since_trip += delta;
            if self.since_trip >= self.breaker {
                self.armed = true;
            }
            return false;
        }

        if delta <= self.max_frame_time {
            return false;
        }

        self.armed = false;
        self.since_trip = Duration::ZERO;
        self.breaker = (self.breaker * 2).min(self.max_breaker);
        true
    }

    /// Current breaker window.
    pub fn breaker(&self) -> Duration {
        self.breaker
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl Default for FrameSkipDetector {
    fn default() -> Self {
        Self::from_config(&SkipDetectorConfig::default())
    }
}
