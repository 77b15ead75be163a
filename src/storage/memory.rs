//! In-process keyed store with the same replace-on-conflict rules as the SQL
//! store. Used when no database is wanted and as a test double.

use super::traits::{batch_columns, check_rows, BatchSink, BatchWriteResult, KeyedRow, KeyedStore, StorageError};
use crate::flatten::FlatRow;
use crate::registry::PrimaryKeyStrategy;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
struct MemTable {
    columns: Vec<String>,
    rows: Vec<KeyedRow>,
    /// Serialized key tuple → position in `rows`
    index: HashMap<String, usize>,
    next_id: i64,
}

impl MemTable {
    fn new(strategy: &PrimaryKeyStrategy) -> Self {
        Self {
            columns: strategy.key_fields().to_vec(),
            next_id: 1,
            ..Self::default()
        }
    }

    /// Apply one row; returns whether it replaced an existing one.
    fn upsert(&mut self, strategy: &PrimaryKeyStrategy, row: &FlatRow) -> Result<bool, StorageError> {
        let key = serde_json::to_string(&strategy.key_of(row))?;
        let values: FlatRow = self
            .columns
            .iter()
            .map(|c| (c.as_str(), row.value(c).clone()))
            .collect();

        match self.index.get(&key) {
            Some(&pos) => {
                self.rows[pos].values = values;
                Ok(true)
            }
            None => {
                let surrogate_id = if strategy.is_surrogate() {
                    let id = self.next_id;
                    self.next_id += 1;
                    Some(id)
                } else {
                    None
                };
                self.index.insert(key, self.rows.len());
                self.rows.push(KeyedRow { surrogate_id, values });
                Ok(false)
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: DashMap<String, Arc<Mutex<MemTable>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations with a table
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Drop every table
    pub fn clear(&self) {
        self.tables.clear();
    }
}

#[async_trait]
impl BatchSink for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write_batch(
        &self,
        operation: &str,
        strategy: &PrimaryKeyStrategy,
        rows: &[FlatRow],
    ) -> Result<BatchWriteResult, StorageError> {
        check_rows(strategy, rows)?;
        if rows.is_empty() {
            return Ok(BatchWriteResult::empty());
        }

        let table = self
            .tables
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(MemTable::new(strategy))))
            .value()
            .clone();
        let mut table = table.lock();

        // Work on a copy so a failure part-way leaves the table untouched
        let mut next = table.clone();
        let mut added = Vec::new();
        for column in batch_columns(rows) {
            if !next.columns.contains(&column) {
                next.columns.push(column.clone());
                added.push(column);
            }
        }
        if !added.is_empty() {
            for existing in &mut next.rows {
                for column in &added {
                    existing.values.insert(column.clone(), crate::flatten::Scalar::Null);
                }
            }
        }

        let mut replaced = 0;
        for row in rows {
            if next.upsert(strategy, row)? {
                replaced += 1;
            }
        }

        *table = next;
        Ok(BatchWriteResult {
            written: rows.len(),
            replaced,
            columns_added: added,
        })
    }
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn rows(&self, operation: &str) -> Result<Vec<KeyedRow>, StorageError> {
        Ok(self
            .tables
            .get(operation)
            .map(|t| t.value().lock().rows.clone())
            .unwrap_or_default())
    }

    async fn columns(&self, operation: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .tables
            .get(operation)
            .map(|t| t.value().lock().columns.clone())
            .unwrap_or_default())
    }
}
