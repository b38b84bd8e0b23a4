//! Retry policy for transient warehouse failures.
//!
//! A job that ends in a transient error is resubmitted after a backoff delay
//! until the retry budget is spent. Exhausting the budget turns the last
//! transient error into a permanent failure.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// How the delay between retries grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `initial * 2^(n-1)`
    #[default]
    Exponential,
    /// `initial * n`
    Linear,
    /// `initial` every time
    Fixed,
}

impl BackoffStrategy {
    /// Lowercase name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Fixed => "fixed",
        }
    }
}

impl FromStr for BackoffStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            "fixed" => Ok(Self::Fixed),
            _ => Err(ConfigError::Invalid {
                field: "retry.backoff".to_string(),
                reason: format!("'{s}' is not one of exponential, linear, fixed"),
            }),
        }
    }
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded retry with backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Resubmissions allowed after the first attempt
    pub max_retries: u32,
    /// Delay growth
    pub backoff: BackoffStrategy,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffStrategy::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Create a policy
    ///
    /// # Errors
    ///
    /// Returns error if `initial_delay` exceeds `max_delay`
    pub fn new(
        max_retries: u32,
        backoff: BackoffStrategy,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Result<Self, ConfigError> {
        let policy = Self {
            max_retries,
            backoff,
            initial_delay_ms: duration_ms(initial_delay),
            max_delay_ms: duration_ms(max_delay),
        };
        policy.validate()?;
        Ok(policy)
    }

    /// A policy that never retries
    #[must_use]
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set retry budget
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set backoff strategy
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set delay bounds
    #[must_use]
    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay_ms = duration_ms(initial);
        self.max_delay_ms = duration_ms(max);
        self
    }

    /// Check the delay bounds
    ///
    /// # Errors
    ///
    /// Returns error if the initial delay exceeds the max delay
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid {
                field: "retry.initial_delay_ms".to_string(),
                reason: format!(
                    "{} ms is greater than max_delay_ms ({} ms)",
                    self.initial_delay_ms, self.max_delay_ms
                ),
            });
        }
        Ok(())
    }

    /// Whether another retry is allowed after `retries` retries
    #[must_use]
    pub const fn allows_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Delay before retry `retry` (1-indexed)
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let initial = self.initial_delay_ms;
        let millis = match self.backoff {
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(retry - 1).unwrap_or(u64::MAX);
                initial.saturating_mul(factor)
            }
            BackoffStrategy::Linear => initial.saturating_mul(u64::from(retry)),
            BackoffStrategy::Fixed => initial,
        };
        Duration::from_millis(millis.min(self.max_delay_ms))
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
