use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// Exponential backoff: doubles from `initial` up to `max`, with optional
/// proportional jitter added on top of each base delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            current: initial,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.jitter,
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let delay = if self.jitter > 0.0 {
            let factor = 1.0 + rand::thread_rng().gen_range(0.0..=self.jitter);
            base.mul_f64(factor)
        } else {
            base
        };

        self.current = (self.current * 2).min(self.max);
        delay.min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
