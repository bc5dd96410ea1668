//! Retry backoff policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy applied between successive retry attempts of a queue item.
///
/// The per-item retry limit lives on the item itself (`max_retries`); this
/// policy only decides how long to wait before attempt `n` re-enters
/// processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied for each further attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Whether to add up to 25% jitter to delays.
    #[serde(default)]
    pub use_jitter: bool,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl RetryPolicy {
    /// Create a policy with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy with a custom base delay.
    pub fn with_base_delay_ms(base_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            ..Default::default()
        }
    }

    /// Calculate the delay before retry attempt `attempt` (1-indexed, i.e.
    /// the item's retry count after it has been incremented).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base = self.base_delay_ms as f64 * self.multiplier.powi(exponent as i32);
        let delay_ms = base.min(self.max_delay_ms as f64) as u64;

        if self.use_jitter {
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            Duration::from_millis(delay_ms + jitter)
        } else {
            Duration::from_millis(delay_ms)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            use_jitter: false,
        }
    }
}
