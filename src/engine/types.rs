//! Public types for the ingest engine.

use crate::error::{FetchError, PersistenceError};
use std::collections::BTreeMap;
use std::time::Duration;

/// One operation to sync, with the caller's query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    pub operation: String,
    pub params: BTreeMap<String, String>,
}

impl SyncJob {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a query parameter (site id, time range, filter).
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// What happened while syncing one operation.
///
/// Pages written before a fetch error or cancellation stay written; the
/// counters say how far the sync got.
#[derive(Debug)]
pub struct SyncReport {
    pub operation: String,
    /// Pages fetched and handed to the writer
    pub pages: usize,
    pub rows_fetched: usize,
    pub rows_written_file: usize,
    pub rows_written_keyed: usize,
    /// Backend failures, one per failed (batch, backend) pair
    pub write_failures: Vec<PersistenceError>,
    /// Terminal fetch error, if the sequence did not reach its last page
    pub error: Option<FetchError>,
    /// Stopped between pages by the cancel signal
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl SyncReport {
    pub(super) fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            pages: 0,
            rows_fetched: 0,
            rows_written_file: 0,
            rows_written_keyed: 0,
            write_failures: Vec::new(),
            error: None,
            cancelled: false,
            elapsed: Duration::ZERO,
        }
    }

    /// Every page fetched and written to both backends.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.write_failures.is_empty() && !self.cancelled
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn status(&self) -> &'static str {
        if self.cancelled {
            "cancelled"
        } else if self.error.is_some() {
            "fetch_failed"
        } else if !self.write_failures.is_empty() {
            "write_failed"
        } else {
            "ok"
        }
    }
}

impl std::fmt::Display for SyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} ({} pages, {} rows, file={}, keyed={}, {:?})",
            self.operation,
            self.status(),
            self.pages,
            self.rows_fetched,
            self.rows_written_file,
            self.rows_written_keyed,
            self.elapsed
        )
    }
}
