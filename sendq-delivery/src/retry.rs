//! Retry policy with exponential backoff

use std::time::Duration;

use serde::Deserialize;

/// Decision for a message whose latest attempt failed transiently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Schedule another attempt after `delay`.
    Retry { delay: Duration },
    /// The attempt ceiling is reached; abandon the message permanently.
    GiveUp,
}

/// Exponential backoff policy for transiently failed deliveries
///
/// The delay after the `n`-th attempt is
/// `min(base * multiplier^(n - 1), max_delay)`, optionally widened by a
/// jitter factor. The jitter never pushes a delay past `max_delay` and
/// never changes the attempt ceiling.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry (in seconds)
    ///
    /// Default: 60 seconds (1 minute)
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,

    /// Growth factor between successive delays
    ///
    /// Default: 2
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,

    /// Ceiling on the delay between attempts (in seconds)
    ///
    /// Default: 3600 seconds (1 hour)
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Maximum number of delivery attempts before a message is abandoned
    ///
    /// Default: 10
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Jitter factor for retry delays (0.0 to 1.0)
    ///
    /// A factor of 0.2 widens each delay by ±20%. Zero keeps the schedule
    /// fully deterministic.
    ///
    /// Default: 0.0 (no jitter)
    #[serde(default)]
    pub jitter_factor: f64,
}

const fn default_base_delay() -> u64 {
    60
}

const fn default_multiplier() -> u32 {
    2
}

const fn default_max_delay() -> u64 {
    3600
}

const fn default_max_attempts() -> u32 {
    10
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay_secs: default_max_delay(),
            max_attempts: default_max_attempts(),
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// The delay to wait after the `attempt`-th failed attempt (1-indexed).
    ///
    /// Uses saturating arithmetic so that large attempt numbers or
    /// multipliers settle at `max_delay_secs` instead of overflowing.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exponent);
        let delay = self
            .base_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs);

        Duration::from_secs(self.apply_jitter(delay))
    }

    /// Whether to retry after `attempt_count` completed attempts, and how
    /// long to wait.
    #[must_use]
    pub fn decide(&self, attempt_count: u32) -> Decision {
        if attempt_count >= self.max_attempts {
            Decision::GiveUp
        } else {
            Decision::Retry {
                delay: self.backoff(attempt_count),
            }
        }
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn apply_jitter(&self, delay: u64) -> u64 {
        if self.jitter_factor <= 0.0 {
            return delay;
        }

        use rand::Rng;

        let jitter_range = (delay as f64) * self.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);

        (((delay as f64) + jitter).max(0.0) as u64).min(self.max_delay_secs)
    }
}
