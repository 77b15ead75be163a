// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Append-only CSV log: one `<operation>.csv` per operation.
//!
//! The first record is the header and fixes column order. Key columns come
//! first, then the rest sorted. A batch that brings new columns appends them
//! to the end of the header; rows already in the file keep their shorter
//! record and read back with the new columns null. Nothing is ever reflowed.
//!
//! The log is a replayable record of what was fetched, not a deduplicated
//! table: writing a batch twice writes its rows twice. Consumers dedupe on
//! the key columns.
//!
//! A batch is all-or-nothing per file:
//! - plain append: `write_all` + `sync_data`, truncated back on failure
//! - header change or new file: full rewrite to `<operation>.csv.tmp`, then rename

use super::traits::{batch_columns, BatchSink, BatchWriteResult, StorageError};
use crate::flatten::{FlatRow, Scalar};
use crate::registry::PrimaryKeyStrategy;
use async_trait::async_trait;
use dashmap::DashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Default)]
struct LogState {
    /// Header as on disk; `None` until the file has been looked at
    header: Option<Vec<String>>,
}

pub struct CsvLog {
    dir: PathBuf,
    files: DashMap<String, Arc<Mutex<LogState>>>,
}

impl CsvLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: DashMap::new(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file for `operation`.
    #[must_use]
    pub fn path_for(&self, operation: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", operation))
    }

    fn file_lock(&self, operation: &str) -> Arc<Mutex<LogState>> {
        self.files
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LogState::default())))
            .value()
            .clone()
    }

    /// Header of `operation`'s log; empty if nothing was logged yet.
    pub async fn header(&self, operation: &str) -> Result<Vec<String>, StorageError> {
        let lock = self.file_lock(operation);
        let _guard = lock.lock().await;
        let path = self.path_for(operation);
        let header = tokio::task::spawn_blocking(move || read_header(&path))
            .await
            .map_err(|e| StorageError::Backend(format!("csv reader task failed: {}", e)))??;
        Ok(header.map(|(header, _)| header).unwrap_or_default())
    }

    /// Every logged row of `operation`, oldest first. Fields missing from the
    /// end of a record (rows written before a column existed) read as null.
    ///
    /// The log stores text only, so values come back through
    /// [`Scalar::parse_field`] and types are not always recovered: `Text("")`
    /// reads as `Null`, `Text("12")` as `Int(12)`, `Text("true")` as
    /// `Bool(true)` and `Float(1.0)` as `Int(1)`. The keyed store keeps types.
    pub async fn read_rows(&self, operation: &str) -> Result<Vec<FlatRow>, StorageError> {
        let lock = self.file_lock(operation);
        let _guard = lock.lock().await;
        let path = self.path_for(operation);
        tokio::task::spawn_blocking(move || read_all(&path))
            .await
            .map_err(|e| StorageError::Backend(format!("csv reader task failed: {}", e)))?
    }
}

#[async_trait]
impl BatchSink for CsvLog {
    fn name(&self) -> &'static str {
        "csv"
    }

    async fn write_batch(
        &self,
        operation: &str,
        strategy: &PrimaryKeyStrategy,
        rows: &[FlatRow],
    ) -> Result<BatchWriteResult, StorageError> {
        if rows.is_empty() {
            return Ok(BatchWriteResult::empty());
        }

        let lock = self.file_lock(operation);
        let mut state = lock.lock().await;

        let job = AppendJob {
            dir: self.dir.clone(),
            path: self.path_for(operation),
            known: state.header.clone(),
            keys: strategy.key_fields().to_vec(),
            rows: rows.to_vec(),
        };
        let (result, header) = tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| StorageError::Backend(format!("csv writer task failed: {}", e)))??;

        debug!(
            operation = %operation,
            rows = result.written,
            columns_added = result.columns_added.len(),
            "Batch appended to log"
        );
        state.header = Some(header);
        Ok(result)
    }
}

/// Everything the blocking writer needs, owned.
struct AppendJob {
    dir: PathBuf,
    path: PathBuf,
    known: Option<Vec<String>>,
    keys: Vec<String>,
    rows: Vec<FlatRow>,
}

impl AppendJob {
    fn run(self) -> Result<(BatchWriteResult, Vec<String>), StorageError> {
        std::fs::create_dir_all(&self.dir)?;

        let existing = match self.known.clone() {
            Some(header) => Some((header, None)),
            None => read_header(&self.path)?.map(|(header, offset)| (header, Some(offset))),
        };
        let columns = batch_columns(&self.rows);

        match existing {
            None => {
                let mut header: Vec<String> = self.keys.clone();
                header.extend(columns.into_iter().filter(|c| !self.keys.contains(c)));
                self.rewrite(&header, &[])?;
                let result = BatchWriteResult {
                    written: self.rows.len(),
                    replaced: 0,
                    columns_added: header.clone(),
                };
                Ok((result, header))
            }
            Some((mut header, offset)) => {
                let added: Vec<String> = columns.into_iter().filter(|c| !header.contains(c)).collect();
                if added.is_empty() {
                    self.append(&header)?;
                } else {
                    header.extend(added.iter().cloned());
                    let offset = match offset {
                        Some(offset) => offset,
                        None => read_header(&self.path)?.map(|(_, offset)| offset).unwrap_or(0),
                    };
                    let previous = std::fs::read(&self.path)?;
                    let body = previous.get(offset as usize..).unwrap_or_default();
                    self.rewrite(&header, body)?;
                }
                let result = BatchWriteResult {
                    written: self.rows.len(),
                    replaced: 0,
                    columns_added: added,
                };
                Ok((result, header))
            }
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Write `header`, the previous records verbatim, then this batch; swap in by rename.
    fn rewrite(&self, header: &[String], previous_records: &[u8]) -> Result<(), StorageError> {
        let tmp = self.temp_path();
        let outcome = (|| -> Result<(), StorageError> {
            let mut file = File::create(&tmp)?;
            file.write_all(&encode_records(std::iter::once(header.to_vec()))?)?;
            file.write_all(previous_records)?;
            file.write_all(&encode_rows(header, &self.rows)?)?;
            file.sync_data()?;
            Ok(())
        })();

        match outcome {
            Ok(()) => {
                std::fs::rename(&tmp, &self.path)?;
                Ok(())
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    /// Append this batch under an unchanged header.
    fn append(&self, header: &[String]) -> Result<(), StorageError> {
        let bytes = encode_rows(header, &self.rows)?;
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let before = file.metadata()?.len();

        let written = file.write_all(&bytes).and_then(|_| file.sync_data());
        if let Err(e) = written {
            warn!(path = %self.path.display(), error = %e, "Append failed, truncating partial batch");
            file.set_len(before)?;
            return Err(e.into());
        }
        Ok(())
    }
}

fn encode_records<I>(records: I) -> Result<Vec<u8>, StorageError>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_writer(Vec::new());
    for record in records {
        writer.write_record(&record)?;
    }
    writer.into_inner().map_err(|e| StorageError::Io(e.into_error()))
}

fn encode_rows(header: &[String], rows: &[FlatRow]) -> Result<Vec<u8>, StorageError> {
    encode_records(
        rows.iter()
            .map(|row| header.iter().map(|c| row.value(c).to_string()).collect::<Vec<_>>()),
    )
}

/// Header record and the byte offset where data records start, or `None`
/// for a missing or empty file.
fn read_header(path: &Path) -> Result<Option<(Vec<String>, u64)>, StorageError> {
    let mut reader = match csv::ReaderBuilder::new().has_headers(false).flexible(true).from_path(path) {
        Ok(reader) => reader,
        Err(e) => match e.kind() {
            csv::ErrorKind::Io(io) if io.kind() == ErrorKind::NotFound => return Ok(None),
            _ => return Err(e.into()),
        },
    };
    let mut record = csv::StringRecord::new();
    if !reader.read_record(&mut record)? {
        return Ok(None);
    }
    let header = record.iter().map(String::from).collect();
    Ok(Some((header, reader.position().byte())))
}

fn read_all(path: &Path) -> Result<Vec<FlatRow>, StorageError> {
    let mut reader = match csv::ReaderBuilder::new().has_headers(false).flexible(true).from_path(path) {
        Ok(reader) => reader,
        Err(e) => match e.kind() {
            csv::ErrorKind::Io(io) if io.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            _ => return Err(e.into()),
        },
    };

    let mut records = reader.records();
    let header: Vec<String> = match records.next() {
        Some(record) => record?.iter().map(String::from).collect(),
        None => return Ok(Vec::new()),
    };

    let mut rows = Vec::new();
    for record in records {
        let record = record?;
        let row: FlatRow = header
            .iter()
            .enumerate()
            .map(|(i, column)| (column.as_str(), record.get(i).map_or(Scalar::Null, Scalar::parse_field)))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}
