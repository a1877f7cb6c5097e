//! Bounded retries with jittered exponential backoff.
//!
//! [`RetryManager::execute`] runs an operation up to `max_attempts`
//! times. Whether an error is worth retrying is decided by a
//! caller-supplied predicate, and every attempt that is about to be
//! retried is reported to an `on_retry` hook so the caller can audit it.
//! The final failure is never reported to the hook; it surfaces as
//! [`MaxRetriesExceeded`].

mod config;
mod manager;

pub use config::RetryConfig;
pub use manager::{MaxRetriesExceeded, RetryError, RetryManager};
