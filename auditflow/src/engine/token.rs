//! In-flight token state.

use crate::contracts::SchemaContract;
use crate::values::RowData;

/// A token as the processor carries it between steps.
///
/// Mirrors the ledger's token record plus the row data and contract it
/// currently holds. Discarded once the token reaches an outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenInfo {
    /// Token identifier.
    pub token_id: String,
    /// Row the token carries.
    pub row_id: String,
    /// Source position of the row.
    pub row_index: i64,
    /// Current data.
    pub data: RowData,
    /// Contract describing `data`.
    pub contract: SchemaContract,
    /// Fork branch, if forked.
    pub branch: Option<String>,
    /// Fork group, if forked.
    pub fork_group_id: Option<String>,
}

impl TokenInfo {
    /// A token fresh from the source.
    #[must_use]
    pub fn new(
        token_id: impl Into<String>,
        row_id: impl Into<String>,
        row_index: i64,
        data: RowData,
        contract: SchemaContract,
    ) -> Self {
        Self {
            token_id: token_id.into(),
            row_id: row_id.into(),
            row_index,
            data,
            contract,
            branch: None,
            fork_group_id: None,
        }
    }

    /// The same token holding a transform's output. The contract is
    /// narrowed to the output's shape.
    #[must_use]
    pub fn with_data(self, data: RowData) -> Self {
        let contract = self.contract.narrow(&data);
        Self {
            data,
            contract,
            ..self
        }
    }

    /// A child token carrying `data` on the same row, keeping branch and
    /// fork group.
    #[must_use]
    pub fn child(&self, token_id: impl Into<String>, data: RowData) -> Self {
        Self {
            token_id: token_id.into(),
            row_id: self.row_id.clone(),
            row_index: self.row_index,
            contract: self.contract.narrow(&data),
            data,
            branch: self.branch.clone(),
            fork_group_id: self.fork_group_id.clone(),
        }
    }

    /// A fork child on `branch`, carrying this token's data unchanged.
    #[must_use]
    pub fn forked(&self, token_id: impl Into<String>, branch: &str, group: &str) -> Self {
        Self {
            token_id: token_id.into(),
            branch: Some(branch.to_string()),
            fork_group_id: Some(group.to_string()),
            ..self.clone()
        }
    }

    /// Whether this token should be handled by a step limited to
    /// `branch`. Steps without a branch handle every token.
    #[must_use]
    pub fn is_on(&self, branch: Option<&str>) -> bool {
        branch.map_or(true, |b| self.branch.as_deref() == Some(b))
    }
}
