// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dual-backend batch persistence.
//!
//! Every batch goes to both the append-only log and the keyed store. The two
//! writes run concurrently and independently: each is all-or-nothing for its
//! own backend, and a failure in one never stops the other. There is no
//! transaction spanning both, so the caller sees one result per backend in
//! the [`WriteReport`] and decides whether to resubmit. Resubmitting is safe:
//! the keyed store converges to the same state, the log gains duplicate lines
//! that share key columns.

use crate::dispatch::Batch;
use crate::error::{ConfigError, PersistenceError};
use crate::flatten::FlatRow;
use crate::metrics::{self, LatencyTimer};
use crate::registry::StrategyRegistry;
use crate::storage::traits::{BatchSink, BatchWriteResult, KeyedStore, StorageError};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Outcome of one [`UpsertWriter::write`], per backend.
#[derive(Debug)]
pub struct WriteReport {
    pub operation: String,
    /// Correlates the two backend writes in logs
    pub batch_id: String,
    pub rows: usize,
    pub file: Result<BatchWriteResult, PersistenceError>,
    pub keyed: Result<BatchWriteResult, PersistenceError>,
}

impl WriteReport {
    /// Both backends persisted the batch.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.file.is_ok() && self.keyed.is_ok()
    }

    /// Backend failures, file first.
    pub fn failures(&self) -> impl Iterator<Item = &PersistenceError> {
        self.file.as_ref().err().into_iter().chain(self.keyed.as_ref().err())
    }
}

/// Resolves an operation's strategy and persists batches to both backends.
#[derive(Clone)]
pub struct UpsertWriter {
    registry: Arc<StrategyRegistry>,
    file: Arc<dyn BatchSink>,
    keyed: Arc<dyn KeyedStore>,
}

impl UpsertWriter {
    pub fn new(registry: Arc<StrategyRegistry>, file: Arc<dyn BatchSink>, keyed: Arc<dyn KeyedStore>) -> Self {
        Self { registry, file, keyed }
    }

    #[must_use]
    pub fn keyed(&self) -> &Arc<dyn KeyedStore> {
        &self.keyed
    }

    #[must_use]
    pub fn file(&self) -> &Arc<dyn BatchSink> {
        &self.file
    }

    /// Persist `rows` of `operation` to both backends.
    ///
    /// Only an unregistered operation is an `Err`; backend failures are
    /// reported inside the [`WriteReport`].
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn write(&self, operation: &str, rows: &[FlatRow]) -> Result<WriteReport, ConfigError> {
        let strategy = self.registry.strategy_for(operation)?;
        let batch_id = Uuid::new_v4().to_string();

        let (file, keyed) = tokio::join!(
            persist(self.file.name(), operation, rows.len(), self.file.write_batch(operation, strategy, rows)),
            persist(self.keyed.name(), operation, rows.len(), self.keyed.write_batch(operation, strategy, rows)),
        );

        debug!(
            batch_id = %batch_id,
            file_ok = file.is_ok(),
            keyed_ok = keyed.is_ok(),
            "Batch persisted"
        );

        Ok(WriteReport {
            operation: operation.to_string(),
            batch_id,
            rows: rows.len(),
            file,
            keyed,
        })
    }

    /// [`write`](Self::write) for a fetched page.
    pub async fn write_batch(&self, batch: &Batch) -> Result<WriteReport, ConfigError> {
        self.write(&batch.operation, &batch.rows).await
    }
}

async fn persist<F>(
    backend: &'static str,
    operation: &str,
    batch_size: usize,
    write: F,
) -> Result<BatchWriteResult, PersistenceError>
where
    F: Future<Output = Result<BatchWriteResult, StorageError>>,
{
    let _timer = LatencyTimer::new(backend, operation);
    match write.await {
        Ok(result) => {
            metrics::record_rows_written(backend, operation, result.written);
            if !result.columns_added.is_empty() {
                metrics::record_columns_added(backend, result.columns_added.len());
            }
            Ok(result)
        }
        Err(source) => {
            metrics::record_persistence_error(backend, operation);
            warn!(backend, operation = %operation, batch_size, error = %source, "Backend write failed");
            Err(PersistenceError {
                backend,
                operation: operation.to_string(),
                batch_size,
                source,
            })
        }
    }
}
