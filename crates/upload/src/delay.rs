use std::time::Duration;

use mini_spool_storage::PerformancePreset;

/// Largest usable change rate. At 1.0 the delay would collapse to zero and
/// never grow again.
const MAX_CHANGE_RATE: f64 = 0.9;

/// Adaptive wait between upload cycles.
///
/// Healthy uploads shrink the delay towards `min`; a failure jumps back to
/// at least the default and keeps growing towards `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadDelay {
    current: Duration,
    default: Duration,
    min: Duration,
    max: Duration,
    decrease_factor: f64,
}

impl UploadDelay {
    /// `change_rate` is clamped into `[0, 0.9]`; a non-finite rate keeps the
    /// delay fixed.
    pub fn new(default: Duration, min: Duration, max: Duration, change_rate: f64) -> Self {
        let change_rate = if change_rate.is_finite() {
            change_rate.clamp(0.0, MAX_CHANGE_RATE)
        } else {
            0.0
        };
        Self {
            current: default,
            default,
            min,
            max,
            decrease_factor: 1.0 - change_rate,
        }
    }

    pub fn from_preset(preset: &PerformancePreset) -> Self {
        Self::new(
            preset.initial_upload_delay,
            preset.min_upload_delay,
            preset.max_upload_delay,
            preset.upload_delay_change_rate,
        )
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn decrease(&mut self) {
        self.current = self.current.mul_f64(self.decrease_factor).max(self.min);
    }

    pub fn increase(&mut self) {
        self.current = self
            .current
            .div_f64(self.decrease_factor)
            .max(self.default)
            .min(self.max);
    }
}
