//! Reconnect Backoff
//!
//! Exponential delay between reconnect attempts with a small random spread so
//! that several bridges restarting together do not hammer the broker in step.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::ReconnectSettings;

/// Fraction of the delay used as random spread in either direction.
const SPREAD: f64 = 0.1;

/// Backoff state for one run of reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    max_attempts: u32,
    spread: f64,
    attempts: u32,
}

impl Backoff {
    /// Backoff following the configured reconnect settings.
    #[must_use]
    pub fn new(settings: &ReconnectSettings) -> Self {
        Self {
            initial: settings.initial_delay,
            max: settings.max_delay.max(settings.initial_delay),
            multiplier: settings.multiplier.max(1.0),
            max_attempts: settings.max_attempts,
            spread: SPREAD,
            attempts: 0,
        }
    }

    /// Same schedule without random spread.
    #[must_use]
    pub const fn exact(mut self) -> Self {
        self.spread = 0.0;
        self
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, or `None` once attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts > 0 && self.attempts >= self.max_attempts {
            return None;
        }

        let exponent = i32::try_from(self.attempts).unwrap_or(i32::MAX);
        self.attempts = self.attempts.saturating_add(1);

        let base = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if base.is_finite() {
            base.min(self.max.as_secs_f64())
        } else {
            self.max.as_secs_f64()
        };

        Some(Duration::from_secs_f64(self.spread(capped)))
    }

    /// Start over after a successful connection.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    fn spread(&self, secs: f64) -> f64 {
        if self.spread <= 0.0 || secs <= 0.0 {
            return secs;
        }
        let range = secs * self.spread;
        (secs + rand::rng().random_range(-range..=range)).max(0.001)
    }
}
