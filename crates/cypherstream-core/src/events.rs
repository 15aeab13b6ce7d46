//! Events flowing out of the engine.
//!
//! [`ResponseEvent`]s are decoded from a single response body.
//! [`TransactionEvent`]s are what callers observe: one ordered channel per
//! output sequence with exactly one terminal message.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EngineError;

// ── Transaction lifecycle ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    #[default]
    Unopened,
    Open,
    Committing,
    RollingBack,
    Committed,
    RolledBack,
    Expired,
}

impl TransactionState {
    /// Committed and RolledBack end the transaction.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    /// States in which new writes are refused.
    pub fn rejects_writes(self) -> bool {
        matches!(
            self,
            Self::Committing | Self::RollingBack | Self::Committed | Self::RolledBack
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unopened => "unopened",
            Self::Open => "open",
            Self::Committing => "committing",
            Self::RollingBack => "rolling back",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
            Self::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// Snapshot of a transaction, published after every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionStatus {
    pub state: TransactionState,
    pub id: Option<String>,
    pub expires: Option<DateTime<Utc>>,
}

// ── Records ───────────────────────────────────────────────────────

/// One output row: column name to value, tagged with the ordinal of the
/// statement that produced it (0-based, counted across the transaction).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    #[serde(skip)]
    statement: usize,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Record {
    pub fn new(statement: usize, fields: Map<String, Value>) -> Self {
        Self { statement, fields }
    }

    pub fn statement(&self) -> usize {
        self.statement
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// ── Response decoding ─────────────────────────────────────────────

/// Structural events decoded from one response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    TransactionLocation(String),
    ExpiryNotice(DateTime<Utc>),
    /// Result `n` (0-based, one per submitted statement) begins.
    ResultBoundary(usize),
    ColumnList(Vec<String>),
    RowData { result: usize, values: Vec<Value> },
    StatementError { code: String, message: String },
    Done,
}

// ── Caller-facing events ──────────────────────────────────────────

/// How a sequence finished successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Committed,
    RolledBack,
    /// A per-statement sub-stream reached the end of its result.
    StatementComplete,
}

#[derive(Debug, Clone)]
pub enum TransactionEvent {
    /// The server assigned the transaction id.
    TransactionId(String),
    /// The server reported a (new) expiry deadline.
    Expires(DateTime<Utc>),
    /// The most recent expiry deadline passed. Advisory only.
    Expired,
    Row(Record),
    /// Terminal: the sequence failed.
    Failed(EngineError),
    /// Terminal: the sequence finished.
    Finished(Completion),
}

impl TransactionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Finished(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_states() {
        assert!(TransactionState::Committed.is_terminal());
        assert!(TransactionState::RolledBack.is_terminal());
        assert!(!TransactionState::Expired.is_terminal());
        assert!(!TransactionState::Open.is_terminal());
    }

    #[test]
    fn test_writes_rejected_once_closing() {
        assert!(!TransactionState::Unopened.rejects_writes());
        assert!(!TransactionState::Open.rejects_writes());
        assert!(!TransactionState::Expired.rejects_writes());
        assert!(TransactionState::Committing.rejects_writes());
        assert!(TransactionState::RollingBack.rejects_writes());
        assert!(TransactionState::Committed.rejects_writes());
        assert!(TransactionState::RolledBack.rejects_writes());
    }

    #[test]
    fn test_record_serializes_as_plain_mapping() {
        let mut fields = Map::new();
        fields.insert("n".into(), json!({"test": true}));
        fields.insert("count".into(), json!(3));
        let record = Record::new(4, fields);

        assert_eq!(record.statement(), 4);
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"n": {"test": true}, "count": 3})
        );
    }
}
