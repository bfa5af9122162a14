//! Exponential backoff for reconnection

use std::time::Duration;

use xk_core::config::BackoffConfig;

/// Exponential backoff with optional jitter between connection attempts
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
    /// Jitter factor, clamped to 0.0..=1.0
    jitter: f64,
    attempts: u32,
}

impl ExponentialBackoff {
    /// Create a backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            current: initial.min(max),
            max,
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            attempts: 0,
        }
    }

    /// Delay before the next attempt; advances the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempts = self.attempts.saturating_add(1);

        let next = self.current.as_secs_f64() * self.multiplier;
        self.current = if next >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(next)
        };

        if self.jitter > 0.0 {
            let extra = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
            delay + Duration::from_secs_f64(extra)
        } else {
            delay
        }
    }

    /// Number of delays handed out since creation
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
