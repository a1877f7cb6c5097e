//! Tokens, parent edges and outcomes.

use super::{
    Landscape, LandscapeError, OutcomeDetails, Result, RowOutcome, Token, TokenOutcome,
    TokenParent,
};
use crate::utils::{generate_id, now_utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

#[derive(Default)]
struct NewToken<'a> {
    fork_group_id: Option<&'a str>,
    join_group_id: Option<&'a str>,
    expand_group_id: Option<&'a str>,
    branch_name: Option<&'a str>,
    step: Option<i64>,
}

fn insert_token(conn: &Connection, row_id: &str, new: &NewToken<'_>) -> Result<Token> {
    let token = Token {
        token_id: generate_id(),
        row_id: row_id.to_string(),
        fork_group_id: new.fork_group_id.map(str::to_string),
        join_group_id: new.join_group_id.map(str::to_string),
        expand_group_id: new.expand_group_id.map(str::to_string),
        branch_name: new.branch_name.map(str::to_string),
        step_in_pipeline: new.step,
        created_at: now_utc(),
    };
    conn.execute(
        "INSERT INTO tokens (token_id, row_id, fork_group_id, join_group_id, expand_group_id, \
         branch_name, step_in_pipeline, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            token.token_id,
            token.row_id,
            token.fork_group_id,
            token.join_group_id,
            token.expand_group_id,
            token.branch_name,
            token.step_in_pipeline,
            token.created_at,
        ],
    )?;
    Ok(token)
}

fn insert_parent(conn: &Connection, token_id: &str, parent_id: &str, ordinal: usize) -> Result<()> {
    let ordinal = i64::try_from(ordinal)
        .map_err(|_| LandscapeError::integrity("parent ordinal overflow"))?;
    conn.execute(
        "INSERT INTO token_parents (token_id, parent_token_id, ordinal) VALUES (?1, ?2, ?3)",
        params![token_id, parent_id, ordinal],
    )?;
    Ok(())
}

pub(super) fn load_token(conn: &Connection, token_id: &str) -> Result<Option<Token>> {
    let token = conn
        .query_row(
            &format!("SELECT {} FROM tokens WHERE token_id = ?1", Token::COLUMNS),
            [token_id],
            Token::from_row,
        )
        .optional()?;
    Ok(token)
}

/// Appends an outcome, enforcing one terminal outcome per token.
pub(super) fn insert_outcome(
    conn: &Connection,
    run_id: &str,
    token_id: &str,
    outcome: RowOutcome,
    details: &OutcomeDetails,
) -> Result<TokenOutcome> {
    let existing: Option<RowOutcome> = conn
        .query_row(
            "SELECT outcome FROM token_outcomes WHERE token_id = ?1 AND is_terminal = 1",
            [token_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(existing) = existing {
        return Err(LandscapeError::integrity(format!(
            "token {token_id} already has terminal outcome {existing}; refusing {outcome}"
        )));
    }

    let record = TokenOutcome {
        outcome_id: generate_id(),
        run_id: run_id.to_string(),
        token_id: token_id.to_string(),
        outcome,
        is_terminal: outcome.is_terminal(),
        sink_name: details.sink_name.clone(),
        batch_id: details.batch_id.clone(),
        fork_group_id: details.fork_group_id.clone(),
        join_group_id: details.join_group_id.clone(),
        expand_group_id: details.expand_group_id.clone(),
        error_hash: details.error_hash.clone(),
        context: details.context.clone(),
        recorded_at: now_utc(),
    };
    conn.execute(
        "INSERT INTO token_outcomes (outcome_id, run_id, token_id, outcome, is_terminal, \
         sink_name, batch_id, fork_group_id, join_group_id, expand_group_id, error_hash, \
         context_json, recorded_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            record.outcome_id,
            record.run_id,
            record.token_id,
            record.outcome,
            record.is_terminal,
            record.sink_name,
            record.batch_id,
            record.fork_group_id,
            record.join_group_id,
            record.expand_group_id,
            record.error_hash,
            record.context,
            record.recorded_at,
        ],
    )?;
    Ok(record)
}

impl Landscape {
    /// Creates the initial token for a source row.
    ///
    /// # Errors
    ///
    /// Returns an error if the row does not exist.
    pub fn create_token(&self, row_id: &str) -> Result<Token> {
        insert_token(&self.lock(), row_id, &NewToken::default())
    }

    /// Creates a token whose parents are `parent_ids`, in order. Used for
    /// aggregation outputs, whose parents are every consumed token.
    ///
    /// # Errors
    ///
    /// Returns an error if any parent does not exist.
    pub fn create_child_token(&self, parent_ids: &[String], row_id: &str, step: i64) -> Result<Token> {
        self.transaction(|tx| {
            let token = insert_token(
                tx,
                row_id,
                &NewToken {
                    step: Some(step),
                    ..NewToken::default()
                },
            )?;
            for (ordinal, parent) in parent_ids.iter().enumerate() {
                insert_parent(tx, &token.token_id, parent, ordinal)?;
            }
            Ok(token)
        })
    }

    /// Forks a token into one child per branch. The parent is recorded as
    /// FORKED in the same transaction.
    ///
    /// Returns the children (in branch order) and the fork group id.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Integrity`] if the parent already has a
    /// terminal outcome.
    pub fn fork_token(
        &self,
        run_id: &str,
        parent_token_id: &str,
        row_id: &str,
        branches: &[String],
        step: i64,
    ) -> Result<(Vec<Token>, String)> {
        let fork_group_id = generate_id();
        let children = self.transaction(|tx| {
            let mut children = Vec::with_capacity(branches.len());
            for branch in branches {
                let child = insert_token(
                    tx,
                    row_id,
                    &NewToken {
                        fork_group_id: Some(fork_group_id.as_str()),
                        branch_name: Some(branch.as_str()),
                        step: Some(step),
                        ..NewToken::default()
                    },
                )?;
                insert_parent(tx, &child.token_id, parent_token_id, 0)?;
                children.push(child);
            }
            insert_outcome(
                tx,
                run_id,
                parent_token_id,
                RowOutcome::Forked,
                &OutcomeDetails {
                    fork_group_id: Some(fork_group_id.clone()),
                    ..OutcomeDetails::default()
                },
            )?;
            Ok(children)
        })?;
        debug!(token_id = parent_token_id, branches = branches.len(), "token forked");
        Ok((children, fork_group_id))
    }

    /// Merges tokens into one. Each parent gets an ordinal edge and a
    /// COALESCED outcome in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Integrity`] if any parent already has a
    /// terminal outcome.
    pub fn coalesce_tokens(
        &self,
        run_id: &str,
        parent_ids: &[String],
        row_id: &str,
        step: i64,
    ) -> Result<Token> {
        let join_group_id = generate_id();
        self.transaction(|tx| {
            let token = insert_token(
                tx,
                row_id,
                &NewToken {
                    join_group_id: Some(join_group_id.as_str()),
                    step: Some(step),
                    ..NewToken::default()
                },
            )?;
            for (ordinal, parent) in parent_ids.iter().enumerate() {
                insert_parent(tx, &token.token_id, parent, ordinal)?;
                insert_outcome(
                    tx,
                    run_id,
                    parent,
                    RowOutcome::Coalesced,
                    &OutcomeDetails {
                        join_group_id: Some(join_group_id.clone()),
                        ..OutcomeDetails::default()
                    },
                )?;
            }
            Ok(token)
        })
    }

    /// Expands a token into `count` children. The parent is recorded as
    /// EXPANDED in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Integrity`] if the parent already has a
    /// terminal outcome.
    pub fn expand_token(
        &self,
        run_id: &str,
        parent_token_id: &str,
        row_id: &str,
        count: usize,
        step: i64,
    ) -> Result<(Vec<Token>, String)> {
        let expand_group_id = generate_id();
        let children = self.transaction(|tx| {
            let mut children = Vec::with_capacity(count);
            for _ in 0..count {
                let child = insert_token(
                    tx,
                    row_id,
                    &NewToken {
                        expand_group_id: Some(expand_group_id.as_str()),
                        step: Some(step),
                        ..NewToken::default()
                    },
                )?;
                insert_parent(tx, &child.token_id, parent_token_id, 0)?;
                children.push(child);
            }
            insert_outcome(
                tx,
                run_id,
                parent_token_id,
                RowOutcome::Expanded,
                &OutcomeDetails {
                    expand_group_id: Some(expand_group_id.clone()),
                    ..OutcomeDetails::default()
                },
            )?;
            Ok(children)
        })?;
        Ok((children, expand_group_id))
    }

    /// Loads a token.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::NotFound`] if absent.
    pub fn get_token(&self, token_id: &str) -> Result<Token> {
        load_token(&self.lock(), token_id)?.ok_or_else(|| LandscapeError::not_found("token", token_id))
    }

    /// All tokens carrying a row.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_tokens_for_row(&self, row_id: &str) -> Result<Vec<Token>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tokens WHERE row_id = ?1 ORDER BY created_at, token_id",
            Token::COLUMNS
        ))?;
        let tokens = stmt
            .query_map([row_id], Token::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tokens)
    }

    /// Raw parent edges of a token, by ordinal.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_token_parent_edges(&self, token_id: &str) -> Result<Vec<TokenParent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT token_id, parent_token_id, ordinal FROM token_parents \
             WHERE token_id = ?1 ORDER BY ordinal",
        )?;
        let edges = stmt
            .query_map([token_id], |row| {
                Ok(TokenParent {
                    token_id: row.get(0)?,
                    parent_token_id: row.get(1)?,
                    ordinal: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    /// Parent tokens of a token, by ordinal.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Integrity`] if an edge points at a token
    /// that does not exist.
    pub fn get_token_parents(&self, token_id: &str) -> Result<Vec<Token>> {
        let edges = self.get_token_parent_edges(token_id)?;
        let conn = self.lock();
        edges
            .iter()
            .map(|edge| {
                load_token(&conn, &edge.parent_token_id)?.ok_or_else(|| {
                    LandscapeError::integrity(format!(
                        "token {} has parent edge to missing token {}",
                        edge.token_id, edge.parent_token_id
                    ))
                })
            })
            .collect()
    }

    /// Records a token's outcome.
    ///
    /// A token has exactly one terminal outcome. BUFFERED is not terminal
    /// and may be followed by a terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Integrity`] on a second terminal outcome.
    pub fn record_token_outcome(
        &self,
        run_id: &str,
        token_id: &str,
        outcome: RowOutcome,
        details: &OutcomeDetails,
    ) -> Result<TokenOutcome> {
        let record = self.transaction(|tx| insert_outcome(tx, run_id, token_id, outcome, details))?;
        debug!(run_id, token_id, outcome = %outcome, "token outcome recorded");
        Ok(record)
    }

    /// The token's current outcome: its terminal one if recorded,
    /// otherwise its latest non-terminal one.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_token_outcome(&self, token_id: &str) -> Result<Option<TokenOutcome>> {
        let outcome = self
            .lock()
            .query_row(
                &format!(
                    "SELECT {} FROM token_outcomes WHERE token_id = ?1 \
                     ORDER BY is_terminal DESC, recorded_at DESC LIMIT 1",
                    TokenOutcome::COLUMNS
                ),
                [token_id],
                TokenOutcome::from_row,
            )
            .optional()?;
        Ok(outcome)
    }

    /// Terminal outcomes of every token carrying a row.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_token_outcomes_for_row(&self, row_id: &str) -> Result<Vec<TokenOutcome>> {
        let conn = self.lock();
        let columns = TokenOutcome::COLUMNS
            .split(", ")
            .map(|c| format!("o.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {columns} FROM token_outcomes o JOIN tokens t ON t.token_id = o.token_id \
             WHERE t.row_id = ?1 AND o.is_terminal = 1 ORDER BY o.recorded_at, o.outcome_id"
        ))?;
        let outcomes = stmt
            .query_map([row_id], TokenOutcome::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(outcomes)
    }

    /// Every outcome recorded in a run, terminal or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_token_outcomes_for_run(&self, run_id: &str) -> Result<Vec<TokenOutcome>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM token_outcomes WHERE run_id = ?1 ORDER BY recorded_at, outcome_id",
            TokenOutcome::COLUMNS
        ))?;
        let outcomes = stmt
            .query_map([run_id], TokenOutcome::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landscape::test_support::{row_and_token, seeded};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fork_records_siblings_and_parent_outcome() {
        let (landscape, run) = seeded();
        let (row, token) = row_and_token(&landscape, &run, 0);
        let branches = vec!["left".to_string(), "right".to_string()];

        let (children, group) = landscape
            .fork_token(&run.run_id, &token.token_id, &row.row_id, &branches, 1)
            .unwrap();

        assert_eq!(children.len(), 2);
        assert_eq!(children[0].branch_name.as_deref(), Some("left"));
        assert!(children.iter().all(|c| c.fork_group_id.as_deref() == Some(group.as_str())));
        let parents = landscape.get_token_parents(&children[1].token_id).unwrap();
        assert_eq!(parents[0].token_id, token.token_id);

        let outcome = landscape.get_token_outcome(&token.token_id).unwrap().unwrap();
        assert_eq!(outcome.outcome, RowOutcome::Forked);
        assert_eq!(outcome.fork_group_id, Some(group));
    }

    #[test]
    fn test_coalesce_records_ordinal_parents() {
        let (landscape, run) = seeded();
        let (row, token) = row_and_token(&landscape, &run, 0);
        let branches = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let (children, _) = landscape
            .fork_token(&run.run_id, &token.token_id, &row.row_id, &branches, 1)
            .unwrap();
        let ids: Vec<String> = children.iter().map(|c| c.token_id.clone()).collect();

        let merged = landscape.coalesce_tokens(&run.run_id, &ids, &row.row_id, 2).unwrap();

        let edges = landscape.get_token_parent_edges(&merged.token_id).unwrap();
        let ordinals: Vec<i64> = edges.iter().map(|e| e.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
        let parents: Vec<String> = landscape
            .get_token_parents(&merged.token_id)
            .unwrap()
            .into_iter()
            .map(|t| t.token_id)
            .collect();
        assert_eq!(parents, ids);
        for id in &ids {
            let outcome = landscape.get_token_outcome(id).unwrap().unwrap();
            assert_eq!(outcome.outcome, RowOutcome::Coalesced);
        }
    }

    #[test]
    fn test_expand_marks_parent_expanded() {
        let (landscape, run) = seeded();
        let (row, token) = row_and_token(&landscape, &run, 0);
        let (children, group) = landscape
            .expand_token(&run.run_id, &token.token_id, &row.row_id, 3, 1)
            .unwrap();
        assert_eq!(children.len(), 3);
        assert!(children.iter().all(|c| c.expand_group_id.as_deref() == Some(group.as_str())));
        let outcome = landscape.get_token_outcome(&token.token_id).unwrap().unwrap();
        assert_eq!(outcome.outcome, RowOutcome::Expanded);
    }

    #[test]
    fn test_second_terminal_outcome_is_integrity() {
        let (landscape, run) = seeded();
        let (_, token) = row_and_token(&landscape, &run, 0);
        landscape
            .record_token_outcome(&run.run_id, &token.token_id, RowOutcome::Completed, &OutcomeDetails::sink("out"))
            .unwrap();
        let err = landscape
            .record_token_outcome(&run.run_id, &token.token_id, RowOutcome::Failed, &OutcomeDetails::default())
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_buffered_then_consumed() {
        let (landscape, run) = seeded();
        let (row, token) = row_and_token(&landscape, &run, 0);
        landscape
            .record_token_outcome(&run.run_id, &token.token_id, RowOutcome::Buffered, &OutcomeDetails::batch("b1"))
            .unwrap();
        landscape
            .record_token_outcome(
                &run.run_id,
                &token.token_id,
                RowOutcome::ConsumedInBatch,
                &OutcomeDetails::batch("b1"),
            )
            .unwrap();

        let current = landscape.get_token_outcome(&token.token_id).unwrap().unwrap();
        assert_eq!(current.outcome, RowOutcome::ConsumedInBatch);
        let terminal = landscape.get_token_outcomes_for_row(&row.row_id).unwrap();
        assert_eq!(terminal.len(), 1);
        assert_eq!(landscape.get_token_outcomes_for_run(&run.run_id).unwrap().len(), 2);
    }

    #[test]
    fn test_child_token_parents() {
        let (landscape, run) = seeded();
        let (row, first) = row_and_token(&landscape, &run, 0);
        let (_, second) = row_and_token(&landscape, &run, 1);
        let parents = vec![first.token_id.clone(), second.token_id.clone()];
        let child = landscape.create_child_token(&parents, &row.row_id, 2).unwrap();
        let loaded: Vec<String> = landscape
            .get_token_parents(&child.token_id)
            .unwrap()
            .into_iter()
            .map(|t| t.token_id)
            .collect();
        assert_eq!(loaded, parents);
    }

    #[test]
    fn test_dangling_parent_edge_is_integrity() {
        let (landscape, run) = seeded();
        let (_, token) = row_and_token(&landscape, &run, 0);
        landscape
            .execute_raw(&format!(
                "PRAGMA foreign_keys = OFF; \
                 INSERT INTO token_parents (token_id, parent_token_id, ordinal) \
                 VALUES ('{}', 'ghost', 0); \
                 PRAGMA foreign_keys = ON;",
                token.token_id
            ))
            .unwrap();
        let err = landscape.get_token_parents(&token.token_id).unwrap_err();
        assert!(err.is_integrity());
    }
}
