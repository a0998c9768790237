use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Retry policy for transient remote failures (5xx responses, connection
/// resets). Backoff is exponential with a cap; 4xx responses are never
/// retried.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound on the delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    /// Default number of attempts before a transient error becomes fatal.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// Default initial backoff in milliseconds.
    pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;

    /// Default backoff multiplier.
    pub const DEFAULT_MULTIPLIER: f64 = 2.0;

    /// Default backoff cap in milliseconds.
    pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

    /// Validates retry configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "max_attempts".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.multiplier < 1.0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "multiplier".to_string(),
                constraint: "must be at least 1.0".to_string(),
            });
        }

        Ok(())
    }

    /// Returns the backoff delay in milliseconds for the given zero-based
    /// attempt number, capped at `max_backoff_ms`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self.initial_backoff_ms as f64 * self.multiplier.powi(attempt as i32);
        (delay as u64).min(self.max_backoff_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    RetryConfig::DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff_ms() -> u64 {
    RetryConfig::DEFAULT_INITIAL_BACKOFF_MS
}

fn default_multiplier() -> f64 {
    RetryConfig::DEFAULT_MULTIPLIER
}

fn default_max_backoff_ms() -> u64 {
    RetryConfig::DEFAULT_MAX_BACKOFF_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            multiplier: 10.0,
            max_backoff_ms: 5_000,
        };

        assert_eq!(config.backoff_ms(0), 100);
        assert_eq!(config.backoff_ms(1), 1_000);
        assert_eq!(config.backoff_ms(2), 5_000);
        assert_eq!(config.backoff_ms(3), 5_000);
    }

    #[test]
    fn test_multiplier_below_one_rejected() {
        let config = RetryConfig {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
