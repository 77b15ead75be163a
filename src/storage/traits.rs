use async_trait::async_trait;
use crate::flatten::FlatRow;
use crate::registry::PrimaryKeyStrategy;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Row {row} has no value for key column '{column}'")]
    MissingKey { row: usize, column: String },
    #[error("Column '{0}' is reserved")]
    ReservedColumn(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Worth another attempt: I/O, pool exhaustion or SQLite lock contention.
    /// Schema and constraint errors repeat identically and are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) => true,
            Self::Sql(sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut) => true,
            // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
            Self::Sql(sqlx::Error::Database(e)) => {
                matches!(e.code().as_deref(), Some("5" | "6" | "261" | "262" | "517"))
            }
            _ => false,
        }
    }
}

/// Result of persisting one batch to one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchWriteResult {
    /// Rows written (appended, inserted or replaced)
    pub written: usize,
    /// Rows that replaced an existing keyed row (always 0 for the CSV log)
    pub replaced: usize,
    /// Columns this batch added to the backend's shape for the operation
    pub columns_added: Vec<String>,
}

impl BatchWriteResult {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            written: 0,
            replaced: 0,
            columns_added: Vec::new(),
        }
    }
}

/// A stored row of the keyed backend.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedRow {
    /// Internal identifier, present for surrogate-keyed operations only
    pub surrogate_id: Option<i64>,
    pub values: FlatRow,
}

/// One of the two output backends.
///
/// A single `write_batch` call is all-or-nothing with respect to this backend.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Backend name used in logs, metrics and [`PersistenceError`](crate::PersistenceError).
    fn name(&self) -> &'static str;

    async fn write_batch(
        &self,
        operation: &str,
        strategy: &PrimaryKeyStrategy,
        rows: &[FlatRow],
    ) -> Result<BatchWriteResult, StorageError>;
}

/// Read side of a keyed backend (replace-on-conflict table per operation).
#[async_trait]
pub trait KeyedStore: BatchSink {
    /// All rows of `operation` in insertion order. Empty if never written.
    async fn rows(&self, operation: &str) -> Result<Vec<KeyedRow>, StorageError>;

    /// Data columns of `operation` (the surrogate column excluded), in table order.
    async fn columns(&self, operation: &str) -> Result<Vec<String>, StorageError>;
}

/// Reject rows whose natural/composite key is incomplete and rows that carry
/// the reserved surrogate column.
pub(crate) fn check_rows(strategy: &PrimaryKeyStrategy, rows: &[FlatRow]) -> Result<(), StorageError> {
    use crate::registry::SURROGATE_COLUMN;

    for (i, row) in rows.iter().enumerate() {
        if row.contains(SURROGATE_COLUMN) {
            return Err(StorageError::ReservedColumn(SURROGATE_COLUMN.to_string()));
        }
        if !strategy.is_surrogate() {
            if let Some(column) = strategy.key_fields().iter().find(|f| row.value(f).is_null()) {
                return Err(StorageError::MissingKey { row: i, column: column.clone() });
            }
        }
    }
    Ok(())
}

/// Union of columns over `rows`, sorted.
pub(crate) fn batch_columns(rows: &[FlatRow]) -> Vec<String> {
    let set: std::collections::BTreeSet<&str> = rows.iter().flat_map(FlatRow::columns).collect();
    set.into_iter().map(String::from).collect()
}
