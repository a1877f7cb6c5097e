//! The retry loop.

use super::RetryConfig;
use rand::Rng;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Every attempt failed with a retryable error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("max retries exceeded after {attempts} attempts: {last_error}")]
pub struct MaxRetriesExceeded<E>
where
    E: Debug + Display,
{
    /// Attempts made.
    pub attempts: u32,
    /// Error from the final attempt.
    pub last_error: E,
}

/// How a retried operation ultimately failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError<E>
where
    E: Debug + Display,
{
    /// A non-retryable error, returned on the attempt that raised it.
    #[error("{0}")]
    Fatal(E),
    /// Retries ran out.
    #[error("{0}")]
    Exhausted(MaxRetriesExceeded<E>),
}

impl<E> RetryError<E>
where
    E: Debug + Display,
{
    /// The error from the last attempt.
    #[must_use]
    pub const fn last_error(&self) -> &E {
        match self {
            Self::Fatal(e) => e,
            Self::Exhausted(m) => &m.last_error,
        }
    }

    /// Consumes the error, returning the last attempt's error.
    pub fn into_last_error(self) -> E {
        match self {
            Self::Fatal(e) => e,
            Self::Exhausted(m) => m.last_error,
        }
    }

    /// Number of attempts made, when retries ran out.
    #[must_use]
    pub const fn attempts(&self) -> Option<u32> {
        match self {
            Self::Fatal(_) => None,
            Self::Exhausted(m) => Some(m.attempts),
        }
    }
}

/// Runs operations under a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    /// Creates a manager.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retrying after `attempt` failed, jitter included.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = if self.config.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.config.jitter_ms)
        };
        Duration::from_millis(self.config.backoff_ms(attempt).saturating_add(jitter))
    }

    /// Runs `operation` until it succeeds, fails fatally, or attempts run
    /// out.
    ///
    /// `operation` receives the 1-based attempt number. `on_retry` is
    /// called with the attempt number and error for each failure that will
    /// be retried, before the backoff sleep. Only the calling task sleeps.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Fatal`] immediately when `is_retryable` is
    /// false, and [`RetryError::Exhausted`] after the last attempt.
    pub async fn execute<T, E, F, Fut, P, R>(
        &self,
        mut operation: F,
        is_retryable: P,
        mut on_retry: R,
    ) -> Result<T, RetryError<E>>
    where
        E: Debug + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        R: FnMut(u32, &E),
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if !is_retryable(&error) {
                debug!(attempt, error = %error, "non-retryable error");
                return Err(RetryError::Fatal(error));
            }
            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %error, "retries exhausted");
                return Err(RetryError::Exhausted(MaxRetriesExceeded {
                    attempts: attempt,
                    last_error: error,
                }));
            }

            on_retry(attempt, &error);
            let delay = self.delay_for(attempt);
            debug!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "retrying after error"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryManager {
        RetryManager::new(
            RetryConfig::new()
                .with_max_attempts(max_attempts)
                .with_base_delay_ms(0)
                .with_max_delay_ms(0)
                .with_jitter_ms(0),
        )
    }

    #[tokio::test]
    async fn test_succeeds_after_two_failures() {
        let calls = AtomicU32::new(0);
        let mut retried = Vec::new();

        let result: Result<&str, RetryError<String>> = fast(3)
            .execute(
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err(format!("fail {attempt}"))
                        } else {
                            Ok("done")
                        }
                    }
                },
                |_| true,
                |attempt, err: &String| retried.push((attempt, err.clone())),
            )
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            retried,
            vec![(1, "fail 1".to_string()), (2, "fail 2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_exhaustion_carries_attempts_and_last_error() {
        let mut hook_calls = 0;
        let result: Result<(), RetryError<String>> = fast(3)
            .execute(
                |attempt| async move { Err(format!("fail {attempt}")) },
                |_| true,
                |_, _| hook_calls += 1,
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(err.last_error(), "fail 3");
        assert_eq!(hook_calls, 2);
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let calls = AtomicU32::new(0);
        let mut hook_calls = 0;
        let result: Result<(), RetryError<String>> = fast(5)
            .execute(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("fatal".to_string()) }
                },
                |_| false,
                |_, _| hook_calls += 1,
            )
            .await;

        assert_eq!(result, Err(RetryError::Fatal("fatal".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hook_calls, 0);
    }

    #[test]
    fn test_delay_includes_bounded_jitter() {
        let manager = RetryManager::new(
            RetryConfig::new()
                .with_base_delay_ms(100)
                .with_max_delay_ms(1000)
                .with_jitter_ms(50),
        );
        for _ in 0..20 {
            let delay = manager.delay_for(2).as_millis();
            assert!((200..=250).contains(&delay), "delay {delay}");
        }
    }
}
