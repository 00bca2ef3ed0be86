//! Reconnect backoff policy.

use std::time::Duration;

/// Configuration for auto-reconnect behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt, and the value the backoff
    /// returns to after every successful connect.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Backoff multiplier (e.g., 2.0 for doubling).
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(15_000),
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Largest multiplier the configuration accepts.
    pub const MAX_MULTIPLIER: f64 = 10.0;

    /// Calculate the delay for a given consecutive failure number (1-based).
    ///
    /// The growth is computed in seconds and capped at `max_delay` before
    /// converting back, so any multiplier or attempt count yields the ceiling
    /// instead of overflowing.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let floor = self.initial_delay;
        let ceiling = self.max_delay.max(floor);
        // NaN and values below 1 degrade to a constant delay
        let multiplier = self.backoff_multiplier.max(1.0);
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;

        let secs = floor.as_secs_f64() * multiplier.powi(exponent);
        if secs.is_finite() && secs < ceiling.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            ceiling
        }
    }
}

/// Current reconnect interval.
///
/// Counts consecutive failures; non-decreasing between successful connects,
/// capped at the ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    failures: u32,
}

impl Backoff {
    /// Start at the configured floor.
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            config: config.clone(),
            failures: 0,
        }
    }

    /// Delay to wait now; advances the interval for the next failure.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.config.delay_for_attempt(self.failures)
    }

    /// Back to the floor. Called on every successful connect.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Delay the next failure would wait.
    #[must_use]
    pub fn current(&self) -> Duration {
        self.config
            .delay_for_attempt(self.failures.saturating_add(1))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(&ReconnectConfig::default())
    }
}
