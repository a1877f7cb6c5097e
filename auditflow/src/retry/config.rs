//! Retry configuration.

use crate::settings::SettingsError;
use serde::{Deserialize, Serialize};

/// Backoff parameters.
///
/// The delay before attempt `n + 1` is
/// `min(base_delay * exponential_base^(n - 1), max_delay) + U(0, jitter)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total tries, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on the exponential part, in milliseconds.
    pub max_delay_ms: u64,
    /// Upper bound of the random addition, in milliseconds.
    pub jitter_ms: u64,
    /// Growth factor between retries.
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_ms: 1000,
            exponential_base: 2.0,
        }
    }
}

impl RetryConfig {
    /// Creates the default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A config that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Sets the total number of tries.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub const fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub const fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the jitter bound.
    #[must_use]
    pub const fn with_jitter_ms(mut self, jitter: u64) -> Self {
        self.jitter_ms = jitter;
        self
    }

    /// Sets the growth factor.
    #[must_use]
    pub const fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    /// Checks the bounds.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] if `max_attempts` is zero, the growth
    /// factor is not above 1, or the cap is below the base delay.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_attempts == 0 {
            return Err(SettingsError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if !(self.exponential_base.is_finite() && self.exponential_base > 1.0) {
            return Err(SettingsError::invalid(
                "retry.exponential_base",
                "must be a finite number above 1.0",
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(SettingsError::invalid(
                "retry.max_delay_ms",
                "must not be below base_delay_ms",
            ));
        }
        Ok(())
    }

    /// The backoff before retrying after `attempt` failed, without jitter.
    #[must_use]
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let raw = self.base_delay_ms as f64 * self.exponential_base.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let cap = self.max_delay_ms as f64;
        if raw.is_finite() && raw < cap {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let delay = raw as u64;
            delay
        } else {
            self.max_delay_ms
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.max_delay_ms, 60_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_grows_then_caps() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(1000)
            .with_exponential_base(3.0);
        assert_eq!(config.backoff_ms(1), 100);
        assert_eq!(config.backoff_ms(2), 300);
        assert_eq!(config.backoff_ms(3), 900);
        assert_eq!(config.backoff_ms(4), 1000);
        assert_eq!(config.backoff_ms(500), 1000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(RetryConfig::new().with_max_attempts(0).validate().is_err());
        assert!(RetryConfig::new().with_exponential_base(1.0).validate().is_err());
        assert!(RetryConfig::new()
            .with_base_delay_ms(10)
            .with_max_delay_ms(5)
            .validate()
            .is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: RetryConfig = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay_ms, 1000);
    }
}
