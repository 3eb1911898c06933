//! Retry strategies and backoff policies for kiln's network queues.
//!
//! Fetch, pull and push workers hit remote caches and execution services;
//! transient failures there are retried with a configurable backoff. The
//! strategy lives in this crate so that scheduler code and configuration
//! share one vocabulary.
//!
//! # Example
//!
//! ```
//! use kiln_retry::{BackoffConfig, calculate_delay};
//! use std::time::Duration;
//!
//! let config = BackoffConfig {
//!     jitter: 0.0,
//!     ..BackoffConfig::default()
//! };
//! assert_eq!(calculate_delay(&config, 1), Duration::from_secs(1));
//! assert_eq!(calculate_delay(&config, 2), Duration::from_secs(2));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy for spacing retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// No delay between retries.
    Immediate,
    /// Delay doubles each attempt (default).
    #[default]
    Exponential,
    /// Delay grows linearly with the attempt number.
    Linear,
    /// The same delay every attempt.
    Constant,
}

/// Configuration for a retry/backoff policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Strategy for calculating delay between retries.
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Maximum number of retries after the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for backoff calculations.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    /// Cap applied to the computed delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor (0.0 = none, 0.5 = delay * 0.5..1.5).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_jitter() -> f64 {
    0.3
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffConfig {
    /// Policy used by the network queues, honoring the user's
    /// `network-retries` count.
    pub fn network(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Whether another retry is allowed after `attempt` attempts have run.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

/// Calculate the delay before retry number `attempt` (1-indexed).
pub fn calculate_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        BackoffStrategy::Immediate => Duration::ZERO,
        BackoffStrategy::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        BackoffStrategy::Linear => config.base_delay.saturating_mul(attempt),
        BackoffStrategy::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Jitter factor of 0.5 means delay * (0.5 to 1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::RngExt;

    let jitter_range = 2.0 * jitter;
    let mut rng = rand::rng();
    let random_value: f64 = rng.random();
    let random_factor = 1.0 - jitter + (random_value * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}
