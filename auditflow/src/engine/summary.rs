//! Run counters and the user-visible summary.

use crate::landscape::{ReproducibilityGrade, RunStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// What happened to one leaf token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenDisposition {
    /// Written to the default sink.
    Completed {
        /// Sink name.
        sink: String,
    },
    /// Sent to a sink by a gate route.
    Routed {
        /// Sink name.
        sink: String,
    },
    /// Sent to an error destination.
    Quarantined {
        /// Sink name or `discard`.
        destination: String,
    },
    /// Failed with no error destination.
    Failed,
    /// Submitted work that must be polled later.
    Pending,
    /// Dropped by a transform that produced no rows.
    Filtered,
}

/// Work accumulated over a run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCounters {
    /// Source rows handled, including ones quarantined at the source.
    pub rows_processed: u64,
    /// Tokens written to the default sink.
    pub rows_succeeded: u64,
    /// Tokens that failed.
    pub rows_failed: u64,
    /// Rows and tokens sent to an error destination.
    pub rows_quarantined: u64,
    /// Tokens routed by a gate.
    pub rows_routed: u64,
    /// Tokens waiting on asynchronous work.
    pub rows_pending: u64,
    /// Tokens a transform expanded into nothing.
    #[serde(default)]
    pub rows_filtered: u64,
    /// Routed tokens per sink.
    pub routed_destinations: BTreeMap<String, u64>,
}

impl RunCounters {
    /// Counts one leaf disposition.
    pub fn record(&mut self, disposition: &TokenDisposition) {
        match disposition {
            TokenDisposition::Completed { .. } => self.rows_succeeded += 1,
            TokenDisposition::Routed { sink } => {
                self.rows_routed += 1;
                *self.routed_destinations.entry(sink.clone()).or_default() += 1;
            }
            TokenDisposition::Quarantined { .. } => self.rows_quarantined += 1,
            TokenDisposition::Failed => self.rows_failed += 1,
            TokenDisposition::Pending => self.rows_pending += 1,
            TokenDisposition::Filtered => self.rows_filtered += 1,
        }
    }

    /// Whether anything left the happy path.
    #[must_use]
    pub const fn is_partial(&self) -> bool {
        self.rows_failed > 0 || self.rows_quarantined > 0 || self.rows_routed > 0
    }
}

/// Final status of a run as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResultStatus {
    /// Every token reached the default sink.
    Completed,
    /// The run finished but some tokens failed, were quarantined or
    /// were routed.
    Partial,
    /// A fatal error stopped the run.
    Failed,
    /// A shutdown signal stopped the run.
    Interrupted,
}

impl RunResultStatus {
    /// Status for a run that reached the end of its source.
    #[must_use]
    pub const fn from_counters(counters: &RunCounters) -> Self {
        if counters.is_partial() {
            Self::Partial
        } else {
            Self::Completed
        }
    }

    /// The ledger status this maps to. Partial runs are completed runs.
    #[must_use]
    pub const fn ledger_status(self) -> RunStatus {
        match self {
            Self::Completed | Self::Partial => RunStatus::Completed,
            Self::Failed => RunStatus::Failed,
            Self::Interrupted => RunStatus::Interrupted,
        }
    }
}

impl fmt::Display for RunResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Counters and status of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run identifier.
    pub run_id: String,
    /// Final status.
    pub status: RunResultStatus,
    /// Accumulated counters.
    #[serde(flatten)]
    pub counters: RunCounters,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

/// What [`super::Orchestrator::run`] returns for a run that finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    /// Summary.
    pub summary: RunSummary,
    /// Reproducibility grade stored at finalization.
    pub grade: ReproducibilityGrade,
}

impl RunResult {
    /// Run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.summary.run_id
    }

    /// Final status.
    #[must_use]
    pub const fn status(&self) -> RunResultStatus {
        self.summary.status
    }

    /// Counters.
    #[must_use]
    pub const fn counters(&self) -> &RunCounters {
        &self.summary.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_routed_destinations_breakdown() {
        let mut counters = RunCounters::default();
        counters.record(&TokenDisposition::Completed { sink: "out".into() });
        counters.record(&TokenDisposition::Routed { sink: "review".into() });
        counters.record(&TokenDisposition::Routed { sink: "review".into() });
        counters.record(&TokenDisposition::Pending);

        assert_eq!(counters.rows_succeeded, 1);
        assert_eq!(counters.rows_routed, 2);
        assert_eq!(counters.routed_destinations.get("review"), Some(&2));
        assert_eq!(counters.rows_pending, 1);
        assert_eq!(RunResultStatus::from_counters(&counters), RunResultStatus::Partial);
    }

    #[test]
    fn test_pending_alone_is_not_partial() {
        let mut counters = RunCounters::default();
        counters.record(&TokenDisposition::Pending);
        counters.record(&TokenDisposition::Filtered);
        assert_eq!(counters.rows_filtered, 1);
        assert_eq!(RunResultStatus::from_counters(&counters), RunResultStatus::Completed);
        assert_eq!(RunResultStatus::Partial.ledger_status(), RunStatus::Completed);
    }

    #[test]
    fn test_summary_serializes_flat() {
        let summary = RunSummary {
            run_id: "r1".into(),
            status: RunResultStatus::Interrupted,
            counters: RunCounters {
                rows_processed: 4,
                ..RunCounters::default()
            },
            duration_ms: 12,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["status"], "interrupted");
        assert_eq!(json["rows_processed"], 4);
    }
}
