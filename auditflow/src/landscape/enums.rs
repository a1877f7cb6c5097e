//! Closed vocabularies stored in the ledger.
//!
//! Each enum round-trips through a fixed lowercase text form. Reading an
//! unknown value back is Tier-1 corruption and surfaces as
//! [`LandscapeError::Integrity`](super::LandscapeError::Integrity).

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A stored enum value this build does not recognise.
#[derive(Debug, Error)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

macro_rules! ledger_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            /// Stored text form.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $text ),+
                }
            }

            /// Parses the stored text form.
            #[must_use]
            pub fn parse(text: &str) -> Option<Self> {
                match text {
                    $( $text => Some(Self::$variant), )+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                Self::parse(text).ok_or_else(|| {
                    FromSqlError::Other(Box::new(UnknownVariant {
                        kind: stringify!($name),
                        value: text.to_string(),
                    }))
                })
            }
        }
    };
}

ledger_enum! {
    /// Lifecycle of a run.
    RunStatus {
        /// In progress.
        Running => "running",
        /// Finished normally.
        Completed => "completed",
        /// Stopped by a fatal error.
        Failed => "failed",
        /// Stopped by a shutdown signal.
        Interrupted => "interrupted",
    }
}

impl RunStatus {
    /// Whether a run in this status may be resumed.
    #[must_use]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, Self::Failed | Self::Interrupted)
    }
}

ledger_enum! {
    /// Role of a node within the pipeline.
    NodeType {
        /// Produces rows.
        Source => "source",
        /// Row-level transform.
        Transform => "transform",
        /// Routing decision.
        Gate => "gate",
        /// Batch transform fed by a trigger.
        Aggregation => "aggregation",
        /// Joins fork branches.
        Coalesce => "coalesce",
        /// Consumes rows.
        Sink => "sink",
    }
}

ledger_enum! {
    /// How reproducible a plugin's output is.
    Determinism {
        /// Same input, same output.
        Deterministic => "deterministic",
        /// Deterministic given a recorded seed.
        Seeded => "seeded",
        /// Reads state outside the pipeline.
        IoRead => "io_read",
        /// Writes state outside the pipeline.
        IoWrite => "io_write",
        /// Calls an external service.
        ExternalCall => "external_call",
        /// No reproducibility guarantee at all.
        NonDeterministic => "non_deterministic",
    }
}

impl Determinism {
    /// Whether rerunning reproduces the output without the ledger.
    #[must_use]
    pub const fn is_reproducible(&self) -> bool {
        matches!(self, Self::Deterministic | Self::Seeded)
    }
}

ledger_enum! {
    /// Status of one token's attempt at one node.
    NodeStateStatus {
        /// Processing has begun.
        Open => "open",
        /// Finished successfully.
        Completed => "completed",
        /// Finished with an error.
        Failed => "failed",
        /// Submitted asynchronously; result outstanding.
        Pending => "pending",
    }
}

impl NodeStateStatus {
    /// Whether this status ends the state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Open)
    }
}

ledger_enum! {
    /// Kind of source or sink boundary operation.
    OperationType {
        /// A source load.
        SourceLoad => "source_load",
        /// A sink write.
        SinkWrite => "sink_write",
    }
}

ledger_enum! {
    /// Status of a boundary operation.
    OperationStatus {
        /// In progress.
        Open => "open",
        /// Finished successfully.
        Completed => "completed",
        /// Finished with an error.
        Failed => "failed",
        /// Asynchronous work outstanding. Not a failure.
        Pending => "pending",
    }
}

impl OperationStatus {
    /// Whether this status ends the operation.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Open)
    }
}

ledger_enum! {
    /// Classification of what happened to a token.
    RowOutcome {
        /// Reached its sink.
        Completed => "completed",
        /// Sent to an alternate sink by a gate or error policy.
        Routed => "routed",
        /// Split into sibling tokens.
        Forked => "forked",
        /// Failed with no error destination.
        Failed => "failed",
        /// Invalid or discarded; kept for audit only.
        Quarantined => "quarantined",
        /// Absorbed into an aggregation batch.
        ConsumedInBatch => "consumed_in_batch",
        /// Merged into a coalesced token.
        Coalesced => "coalesced",
        /// Replaced by expanded children.
        Expanded => "expanded",
        /// Waiting for an aggregation trigger.
        Buffered => "buffered",
    }
}

impl RowOutcome {
    /// Every outcome except `Buffered` is final.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Buffered)
    }

    /// Outcomes that end a lineage chain rather than hand off to
    /// descendant tokens.
    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Routed | Self::Failed | Self::Quarantined
        )
    }
}

ledger_enum! {
    /// How far a run's output can be reproduced.
    ReproducibilityGrade {
        /// Rerunning the pipeline yields the same output.
        FullReproducible => "full_reproducible",
        /// Reproducible only by replaying recorded inputs and outputs.
        ReplayReproducible => "replay_reproducible",
        /// Payloads are gone; only attribution remains.
        AttributableOnly => "attributable_only",
    }
}

ledger_enum! {
    /// Kind of external call.
    CallType {
        /// Language-model request.
        Llm => "llm",
        /// HTTP request.
        Http => "http",
        /// Database query.
        Sql => "sql",
        /// File-system access.
        Filesystem => "filesystem",
    }
}

ledger_enum! {
    /// Result of an external call.
    CallStatus {
        /// Call succeeded.
        Success => "success",
        /// Call failed.
        Error => "error",
    }
}

ledger_enum! {
    /// Whether a routed token leaves its path or is copied.
    RoutingMode {
        /// The token leaves its current path.
        Move => "move",
        /// A copy continues on each route.
        Copy => "copy",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_text_round_trip() {
        assert_eq!(RowOutcome::parse("consumed_in_batch"), Some(RowOutcome::ConsumedInBatch));
        assert_eq!(RowOutcome::ConsumedInBatch.to_string(), "consumed_in_batch");
        assert_eq!(Determinism::parse("nope"), None);
    }

    #[test]
    fn test_serde_uses_text_form() {
        let json = serde_json::to_string(&ReproducibilityGrade::ReplayReproducible).unwrap();
        assert_eq!(json, "\"replay_reproducible\"");
    }

    #[test]
    fn test_terminal_classification() {
        assert!(!RowOutcome::Buffered.is_terminal());
        assert!(RowOutcome::Expanded.is_terminal());
        assert!(!RowOutcome::Expanded.is_leaf());
        assert!(!NodeStateStatus::Open.is_terminal());
        assert!(OperationStatus::Pending.is_terminal());
        assert!(RunStatus::Interrupted.is_resumable());
        assert!(!RunStatus::Completed.is_resumable());
    }
}
