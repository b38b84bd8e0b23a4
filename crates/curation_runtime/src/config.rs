//! Engine configuration.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Invalid or unreadable configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A field holds an unusable value
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted field path
        field: String,
        /// Why the value is rejected
        reason: String,
    },

    /// The file could not be read
    #[error("failed to read {path}: {message}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        message: String,
    },

    /// The file is not valid TOML for the expected shape
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// File path
        path: String,
        /// Underlying error
        message: String,
    },
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Rules that may execute at the same time
    pub max_parallel_rules: usize,
    /// Retry policy for transient job failures
    pub retry: RetryPolicy,
    /// Delay between polls of a pending job
    pub poll_interval_ms: u64,
    /// Deadline for the whole run
    pub run_timeout_ms: Option<u64>,
    /// Times query generation is attempted before the rule fails
    pub generation_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_rules: 4,
            retry: RetryPolicy::default(),
            poll_interval_ms: 500,
            run_timeout_ms: None,
            generation_attempts: 2,
        }
    }
}

impl EngineConfig {
    /// Create the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML text
    ///
    /// # Errors
    ///
    /// Returns error if the text does not parse or fails validation
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Self::parse_named(text, "<inline>")
    }

    /// Load from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed, or validated
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::parse_named(&text, &path.display().to_string())
    }

    fn parse_named(text: &str, name: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: name.to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Set the parallelism bound
    #[must_use]
    pub fn with_max_parallel_rules(mut self, n: usize) -> Self {
        self.max_parallel_rules = n;
        self
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set or clear the run deadline
    #[must_use]
    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout_ms = timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set the generation attempt count
    #[must_use]
    pub fn with_generation_attempts(mut self, attempts: u32) -> Self {
        self.generation_attempts = attempts;
        self
    }

    /// Poll interval as a duration
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Run deadline as a duration
    #[must_use]
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    /// Check every field
    ///
    /// # Errors
    ///
    /// Returns the first invalid field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_rules == 0 {
            return Err(invalid("max_parallel_rules", "must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", "must be greater than 0"));
        }
        if self.generation_attempts == 0 {
            return Err(invalid("generation_attempts", "must be at least 1"));
        }
        self.retry.validate()
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffStrategy;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_parallel_rules, 4);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert!(config.run_timeout().is_none());
    }

    #[test]
    fn test_validate_rejects_zeroes() {
        assert!(EngineConfig::new().with_max_parallel_rules(0).validate().is_err());
        assert!(EngineConfig::new()
            .with_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(EngineConfig::new()
            .with_generation_attempts(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_retry_delays() {
        let retry = RetryPolicy::default()
            .with_delays(Duration::from_secs(10), Duration::from_secs(1));
        let err = EngineConfig::new().with_retry(retry).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "retry.initial_delay_ms"));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = EngineConfig::from_toml_str(
            r#"
            max_parallel_rules = 2
            run_timeout_ms = 60000

            [retry]
            max_retries = 5
            backoff = "linear"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_parallel_rules, 2);
        assert_eq!(config.run_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff, BackoffStrategy::Linear);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
        assert_eq!(config.poll_interval_ms, 500);
    }

    #[test]
    fn test_from_toml_unknown_field() {
        let err = EngineConfig::from_toml_str("max_parallel = 2").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "poll_interval_ms = 50").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.poll_interval_ms, 50);

        let missing = EngineConfig::load("/nonexistent/engine.toml").unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
