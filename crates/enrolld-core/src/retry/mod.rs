//! Submission retry policy.
//!
//! Defines the finalization retry budget and backoff between attempts. A
//! transient submission failure consumes one attempt; once the budget is
//! exhausted the request fails terminally with reason `submission failed`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::humantime_serde;

/// Backoff between finalization attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Fixed delay between attempts.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Exponential backoff.
    Exponential {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Multiplier for each retry (default: 2.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(15 * 60),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                #[allow(clippy::cast_possible_wrap)] // attempt count won't exceed i32
                let delay_secs =
                    initial_delay.as_secs_f64() * multiplier.powi(attempt.saturating_sub(1) as i32);
                let delay = Duration::from_secs_f64(delay_secs);
                delay.min(*max_delay)
            },
        }
    }
}

/// Retry budget plus backoff for finalization attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum finalization attempts per request (including the first).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff applied between attempts.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

const fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt remains after `attempts_used` failures.
    #[must_use]
    pub const fn attempts_remain(&self, attempts_used: u32) -> bool {
        attempts_used < self.max_attempts
    }

    /// Delay before the next attempt, given `attempts_used` failures so far.
    #[must_use]
    pub fn next_delay(&self, attempts_used: u32) -> Duration {
        self.backoff.delay_for_attempt(attempts_used)
    }
}
