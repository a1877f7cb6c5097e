//! Lineage queries.

use super::{
    Call, CallParent, Landscape, LandscapeError, NodeState, RoutingEvent, Row, Token,
    TokenOutcome, TransformErrorRecord, ValidationErrorRecord,
};
use serde::Serialize;
use thiserror::Error;

/// Errors raised by [`Landscape::explain`].
#[derive(Debug, Error)]
pub enum ExplainError {
    /// Neither a token id nor a row id was given.
    #[error("explain needs a token id or a row id")]
    NoIdentifier,

    /// The row produced several terminal tokens and no sink was named.
    #[error("row '{row_id}' has {count} terminal tokens; name a sink to choose one")]
    AmbiguousRow {
        /// Row queried.
        row_id: String,
        /// Number of terminal tokens.
        count: usize,
    },

    /// No terminal token of the row went to the named sink.
    #[error("row '{row_id}' has no terminal token at sink '{sink}'")]
    SinkNotFound {
        /// Row queried.
        row_id: String,
        /// Sink named.
        sink: String,
    },

    /// Several terminal tokens of the row went to the named sink.
    #[error("row '{row_id}' has {count} terminal tokens at sink '{sink}'")]
    SinkAmbiguous {
        /// Row queried.
        row_id: String,
        /// Sink named.
        sink: String,
        /// Number of matching tokens.
        count: usize,
    },

    /// The token or row does not exist, or the row has no terminal token.
    #[error("nothing to explain: {0}")]
    NotFound(String),

    /// Ledger failure, including Tier-1 corruption.
    #[error(transparent)]
    Landscape(#[from] LandscapeError),
}

/// What to explain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineageQuery {
    /// Token to explain.
    pub token_id: Option<String>,
    /// Row whose terminal token should be explained.
    pub row_id: Option<String>,
    /// Destination used to pick among a row's terminal tokens.
    pub sink: Option<String>,
}

impl LineageQuery {
    /// Explain one token.
    #[must_use]
    pub fn token(token_id: impl Into<String>) -> Self {
        Self {
            token_id: Some(token_id.into()),
            ..Self::default()
        }
    }

    /// Explain a row's terminal token.
    #[must_use]
    pub fn row(row_id: impl Into<String>) -> Self {
        Self {
            row_id: Some(row_id.into()),
            ..Self::default()
        }
    }

    /// Disambiguates a row query by destination.
    #[must_use]
    pub fn at_sink(mut self, sink: impl Into<String>) -> Self {
        self.sink = Some(sink.into());
        self
    }
}

/// Complete lineage of one token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineageResult {
    /// The token.
    pub token: Token,
    /// Its source row.
    pub source_row: Row,
    /// Every node state, by step then attempt.
    pub node_states: Vec<NodeState>,
    /// Routing events of those states.
    pub routing_events: Vec<RoutingEvent>,
    /// External calls made during those states.
    pub calls: Vec<Call>,
    /// Direct parents, by ordinal.
    pub parent_tokens: Vec<Token>,
    /// Validation errors for the source row's content.
    pub validation_errors: Vec<ValidationErrorRecord>,
    /// Transform errors for the token.
    pub transform_errors: Vec<TransformErrorRecord>,
    /// Current outcome.
    pub outcome: Option<TokenOutcome>,
}

impl Landscape {
    /// Composes the lineage of a token, or of a row's terminal token.
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError`] when the query is empty or ambiguous, when
    /// nothing matches, or when the ledger is inconsistent.
    pub fn explain(&self, run_id: &str, query: &LineageQuery) -> Result<LineageResult, ExplainError> {
        let token_id = match (&query.token_id, &query.row_id) {
            (Some(token_id), _) => token_id.clone(),
            (None, Some(row_id)) => self.resolve_row_token(row_id, query.sink.as_deref())?,
            (None, None) => return Err(ExplainError::NoIdentifier),
        };

        let token = match self.get_token(&token_id) {
            Ok(token) => token,
            Err(LandscapeError::NotFound { .. }) => {
                return Err(ExplainError::NotFound(format!("token '{token_id}'")))
            }
            Err(e) => return Err(e.into()),
        };
        let source_row = self.get_row(&token.row_id).map_err(|e| match e {
            LandscapeError::NotFound { .. } => LandscapeError::integrity(format!(
                "token {} references missing row {}",
                token.token_id, token.row_id
            )),
            other => other,
        })?;

        let node_states = self.get_node_states_for_token(&token.token_id)?;
        let mut routing_events = Vec::new();
        let mut calls = Vec::new();
        for state in &node_states {
            routing_events.extend(self.get_routing_events(&state.state_id)?);
            calls.extend(self.get_calls(&CallParent::State(state.state_id.clone()))?);
        }

        Ok(LineageResult {
            parent_tokens: self.get_token_parents(&token.token_id)?,
            validation_errors: self.get_validation_errors_for_row(run_id, &source_row.source_data_hash)?,
            transform_errors: self.get_transform_errors_for_token(&token.token_id)?,
            outcome: self.get_token_outcome(&token.token_id)?,
            token,
            source_row,
            node_states,
            routing_events,
            calls,
        })
    }

    fn resolve_row_token(&self, row_id: &str, sink: Option<&str>) -> Result<String, ExplainError> {
        match self.get_row(row_id) {
            Ok(_) => {}
            Err(LandscapeError::NotFound { .. }) => {
                return Err(ExplainError::NotFound(format!("row '{row_id}'")))
            }
            Err(e) => return Err(e.into()),
        }
        let leaves: Vec<TokenOutcome> = self
            .get_token_outcomes_for_row(row_id)?
            .into_iter()
            .filter(|o| o.outcome.is_leaf())
            .collect();

        let candidates: Vec<&TokenOutcome> = match sink {
            Some(sink) => {
                let matching: Vec<&TokenOutcome> = leaves
                    .iter()
                    .filter(|o| o.sink_name.as_deref() == Some(sink))
                    .collect();
                match matching.len() {
                    0 => {
                        return Err(ExplainError::SinkNotFound {
                            row_id: row_id.to_string(),
                            sink: sink.to_string(),
                        })
                    }
                    1 => matching,
                    count => {
                        return Err(ExplainError::SinkAmbiguous {
                            row_id: row_id.to_string(),
                            sink: sink.to_string(),
                            count,
                        })
                    }
                }
            }
            None => match leaves.len() {
                0 => {
                    return Err(ExplainError::NotFound(format!(
                        "row '{row_id}' has no terminal token"
                    )))
                }
                1 => leaves.iter().collect(),
                count => {
                    return Err(ExplainError::AmbiguousRow {
                        row_id: row_id.to_string(),
                        count,
                    })
                }
            },
        };
        candidates
            .first()
            .map(|o| o.token_id.clone())
            .ok_or_else(|| ExplainError::NotFound(format!("row '{row_id}'")))
    }
}
