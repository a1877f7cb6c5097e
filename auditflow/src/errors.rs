//! Error taxonomy.
//!
//! Errors follow the three-tier trust model:
//!
//! - **Tier 1**, audit data: [`LandscapeError::Integrity`]. The ledger's
//!   own records are inconsistent. Always fatal.
//! - **Tier 2**, pipeline data: [`ContractViolation`]. A row broke its
//!   contract after the source boundary; an upstream plugin is wrong.
//!   Always fatal.
//! - **Tier 3**, external data: never an error. Invalid source input is
//!   quarantined and recorded as a validation error.
//!
//! [`AuditflowError`] collects the domain errors for callers that drive a
//! whole run.

use crate::canonical::CanonicalError;
use crate::checkpoint::RecoveryError;
use crate::contracts::ContractViolation;
use crate::engine::RunCounters;
use crate::guards::GuardError;
use crate::landscape::{ExplainError, LandscapeError};
use crate::retry::MaxRetriesExceeded;
use crate::settings::SettingsError;
use thiserror::Error;

/// Stable type marker for an error, written into FAILED node states.
pub trait ErrorKind {
    /// Short type name, e.g. `PluginError`.
    fn kind_name(&self) -> &'static str;
}

/// The main error type for auditflow operations.
#[derive(Debug, Error)]
pub enum AuditflowError {
    /// Ledger failure. [`LandscapeError::Integrity`] is Tier-1 corruption.
    #[error(transparent)]
    Landscape(#[from] LandscapeError),

    /// Tier-2 contract violation.
    #[error(transparent)]
    Contract(#[from] ContractViolation),

    /// Value could not be canonically encoded.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// A run could not be resumed.
    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    /// A lineage query failed.
    #[error(transparent)]
    Explain(#[from] ExplainError),

    /// A plugin call failed.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// A retryable plugin call kept failing.
    #[error(transparent)]
    RetriesExhausted(#[from] MaxRetriesExceeded<PluginError>),

    /// The run was interrupted by a shutdown signal.
    #[error(transparent)]
    Shutdown(#[from] GracefulShutdownError),

    /// A state guard or operation tracker detected misuse.
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// Invalid engine settings.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// The pipeline definition is unusable (unknown sink, empty branches).
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// A bounded wait expired.
    #[error("timed out waiting for {what} after {after_ms}ms")]
    Timeout {
        /// What was being waited for.
        what: String,
        /// The deadline.
        after_ms: u64,
    },
}

impl AuditflowError {
    /// Creates a pipeline definition error.
    #[must_use]
    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::Pipeline(message.into())
    }

    /// Returns true for Tier-1 ledger corruption.
    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(self, Self::Landscape(LandscapeError::Integrity(_)))
    }
}

impl ErrorKind for AuditflowError {
    fn kind_name(&self) -> &'static str {
        match self {
            Self::Landscape(LandscapeError::Integrity(_)) => "IntegrityError",
            Self::Landscape(_) => "LandscapeError",
            Self::Contract(_) => "ContractViolation",
            Self::Canonical(_) => "CanonicalError",
            Self::Recovery(_) => "RecoveryError",
            Self::Explain(_) => "ExplainError",
            Self::Plugin(_) => "PluginError",
            Self::RetriesExhausted(_) => "MaxRetriesExceeded",
            Self::Shutdown(_) => "GracefulShutdownError",
            Self::Guard(_) => "GuardError",
            Self::Settings(_) => "SettingsError",
            Self::Pipeline(_) => "PipelineError",
            Self::Timeout { .. } => "TimeoutError",
        }
    }
}

/// A plugin reported a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("plugin '{plugin}' failed: {message}")]
pub struct PluginError {
    /// Plugin name.
    pub plugin: String,
    /// Failure description.
    pub message: String,
    /// Whether trying again might succeed.
    pub retryable: bool,
    /// Structured failure detail reported by the plugin.
    pub detail: Option<serde_json::Value>,
}

impl PluginError {
    /// A non-retryable failure.
    #[must_use]
    pub fn new(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            message: message.into(),
            retryable: false,
            detail: None,
        }
    }

    /// A transient failure worth retrying.
    #[must_use]
    pub fn transient(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(plugin, message)
        }
    }
}

impl PluginError {
    /// Attaches structured detail.
    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl ErrorKind for PluginError {
    fn kind_name(&self) -> &'static str {
        "PluginError"
    }
}

/// A run stopped on a shutdown signal. Carries the counters accumulated
/// before the stop so the summary reflects real work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("run '{run_id}' interrupted after {} rows", counters.rows_processed)]
pub struct GracefulShutdownError {
    /// Interrupted run.
    pub run_id: String,
    /// Work done before the interruption.
    pub counters: RunCounters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        let integrity = AuditflowError::from(LandscapeError::Integrity("x".into()));
        assert_eq!(integrity.kind_name(), "IntegrityError");
        assert!(integrity.is_integrity());

        let plugin = AuditflowError::from(PluginError::new("csv", "bad"));
        assert_eq!(plugin.kind_name(), "PluginError");
        assert!(!plugin.is_integrity());
    }

    #[test]
    fn test_plugin_error_display() {
        let err = PluginError::transient("http", "503");
        assert!(err.retryable);
        assert_eq!(err.to_string(), "plugin 'http' failed: 503");
    }

    #[test]
    fn test_shutdown_error_carries_counters() {
        let counters = RunCounters {
            rows_processed: 3,
            rows_succeeded: 2,
            ..RunCounters::default()
        };
        let err = GracefulShutdownError {
            run_id: "r1".into(),
            counters,
        };
        assert!(err.to_string().contains("after 3 rows"));
        assert_eq!(err.counters.rows_succeeded, 2);
    }
}
