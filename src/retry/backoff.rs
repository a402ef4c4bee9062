//! Exponential backoff schedule

use rand::Rng;
use std::time::Duration;

/// Delays between consecutive attempts of one execution.
///
/// The n-th delay (1-indexed) is `initial * multiplier^(n-1)`, capped at
/// `max`, with symmetric jitter applied. After jitter the delay is clamped so
/// the schedule never decreases and never exceeds `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    retry: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            retry: 0,
            last: Duration::ZERO,
        }
    }

    /// Delay before jitter for the given 1-indexed retry
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let ms = self.initial.as_millis() as f64 * self.multiplier.powi(exp);
        let max_ms = self.max.as_millis() as f64;
        Duration::from_millis(ms.min(max_ms) as u64)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.retry = self.retry.saturating_add(1);
        let base = self.base_delay(self.retry);

        let jittered = if self.jitter > 0.0 {
            let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            Duration::from_millis((base.as_millis() as f64 * factor).max(0.0) as u64)
        } else {
            base
        };

        let delay = jittered.min(self.max).max(self.last);
        self.last = delay;
        Some(delay)
    }
}
