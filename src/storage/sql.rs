// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite keyed store: one table per operation, replace-on-conflict.
//!
//! Table layout for an operation `listOrgSites` with `Natural[id]`:
//!
//! ```sql
//! CREATE TABLE "op_listOrgSites" (
//!   "id",                -- key columns first, untyped (SQLite keeps each value's own type)
//!   UNIQUE("id")
//! );
//! -- later batches: ALTER TABLE "op_listOrgSites" ADD COLUMN "name"; ...
//! ```
//!
//! Surrogate-keyed operations carry an extra
//! `"_row_id" INTEGER PRIMARY KEY AUTOINCREMENT` (monotonic, never reused) and
//! the `UNIQUE` constraint covers the unique fields.
//!
//! ## Write path
//!
//! Each batch runs in one transaction while holding the operation's table
//! lock, so a batch is all-or-nothing and two writers never interleave on
//! the same table:
//!
//! - **Natural / Composite**: `INSERT ... ON CONFLICT(keys) DO UPDATE SET` every
//!   non-key column, binding NULL for columns the row lacks (full replace,
//!   last write wins).
//! - **Surrogate**: look up `_row_id` with `IS` comparison on the unique fields
//!   (so NULLs match NULLs), then `UPDATE ... WHERE _row_id = ?` or `INSERT`.
//!
//! Booleans are stored as INTEGER 0/1 and read back as integers.
//!
//! ## Column names
//!
//! SQLite identifiers ignore ASCII case, flattened column names do not. A
//! column whose name is already taken under case folding (`name` after
//! `Name`, or anything spelled like `_row_id`) is stored as `name__2`,
//! `name__3`, ... and the rename is recorded in `_column_names`, so rows read
//! back under their original names after a restart.

use super::traits::{batch_columns, check_rows, BatchSink, BatchWriteResult, KeyedRow, KeyedStore, StorageError};
use crate::flatten::{FlatRow, Scalar};
use crate::registry::{PrimaryKeyStrategy, SURROGATE_COLUMN};
use crate::resilience::retry::{retry, retry_if, RetryConfig};
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

const COLUMN_NAMES_TABLE: &str = "_column_names";

/// A data column: its row name and the identifier it has in SQLite.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ColumnSlot {
    name: String,
    sql: String,
}

/// Cached shape of one operation's table.
#[derive(Default)]
struct TableState {
    /// Data columns in table order (surrogate column excluded). `None` until
    /// first read from the database.
    columns: Option<Vec<ColumnSlot>>,
}

pub struct SqlStore {
    pool: SqlitePool,
    tables: DashMap<String, Arc<Mutex<TableState>>>,
}

impl SqlStore {
    /// Open (creating if missing) the database at `url`, with startup-mode
    /// retry so a bad path fails fast.
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        let pool_options = if in_memory {
            // Every connection to ":memory:" is its own database: keep exactly one alive
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            if let Some(parent) = options.get_filename().parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
            SqlitePoolOptions::new()
                .max_connections(max_connections.max(1))
                .idle_timeout(Duration::from_secs(300))
        };
        let pool_options = pool_options.acquire_timeout(Duration::from_secs(10));

        let pool = retry("sql_connect", &RetryConfig::startup(), || {
            pool_options.clone().connect_with(options.clone())
        })
        .await?;

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (tbl TEXT NOT NULL, sql_name TEXT NOT NULL, name TEXT NOT NULL, PRIMARY KEY (tbl, sql_name))",
            quote_ident(COLUMN_NAMES_TABLE)
        );
        sqlx::query(&sql).execute(&pool).await?;

        info!(url = %url, in_memory, "Keyed store opened");
        Ok(Self {
            pool,
            tables: DashMap::new(),
        })
    }

    /// Private in-memory database; nothing survives the store.
    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::new("sqlite::memory:", 1).await
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    fn table_lock(&self, operation: &str) -> Arc<Mutex<TableState>> {
        self.tables
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TableState::default())))
            .value()
            .clone()
    }

    #[instrument(skip(self, strategy, rows, known), fields(rows = rows.len(), strategy = strategy.kind()))]
    async fn write_tx(
        &self,
        operation: &str,
        strategy: &PrimaryKeyStrategy,
        rows: &[FlatRow],
        known: Option<&[ColumnSlot]>,
    ) -> Result<(BatchWriteResult, Vec<ColumnSlot>), StorageError> {
        let table = table_name(operation);
        let mut tx = self.pool.begin().await?;

        let mut columns = match known {
            Some(columns) => columns.to_vec(),
            None => {
                let existing = table_columns(&mut tx, &table).await?;
                match existing {
                    Some(columns) => columns,
                    None => create_table(&mut tx, &table, strategy).await?,
                }
            }
        };

        let mut added = Vec::new();
        for column in batch_columns(rows) {
            if !columns.iter().any(|c| c.name == column) {
                let slot = allocate_slot(&mut tx, &table, &column, &columns).await?;
                let sql = format!("ALTER TABLE {} ADD COLUMN {}", quote_ident(&table), quote_ident(&slot.sql));
                sqlx::query(&sql).execute(&mut *tx).await?;
                columns.push(slot);
                added.push(column);
            }
        }
        if !added.is_empty() {
            debug!(table = %table, added = ?added, "Columns added");
        }

        let replaced = match strategy {
            PrimaryKeyStrategy::Natural { fields } | PrimaryKeyStrategy::Composite { fields } => {
                upsert_by_key(&mut tx, &table, fields, &columns, rows).await?
            }
            PrimaryKeyStrategy::Surrogate { unique_fields } => {
                upsert_by_surrogate(&mut tx, &table, unique_fields, &columns, rows).await?
            }
        };

        tx.commit().await?;

        Ok((
            BatchWriteResult {
                written: rows.len(),
                replaced,
                columns_added: added,
            },
            columns,
        ))
    }
}

#[async_trait]
impl BatchSink for SqlStore {
    fn name(&self) -> &'static str {
        "sql"
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

        let lock = self.table_lock(operation);
        let mut state = lock.lock().await;
        let known = state.columns.clone();

        let (result, columns) = retry_if(
            "sql_write_batch",
            &RetryConfig::query(),
            || self.write_tx(operation, strategy, rows, known.as_deref()),
            StorageError::is_transient,
        )
        .await?;

        // Only a committed schema is cached
        state.columns = Some(columns);
        Ok(result)
    }
}

#[async_trait]
impl KeyedStore for SqlStore {
    async fn rows(&self, operation: &str) -> Result<Vec<KeyedRow>, StorageError> {
        let table = table_name(operation);
        let mut conn = self.pool.acquire().await?;
        let Some(columns) = table_columns(&mut conn, &table).await? else {
            return Ok(Vec::new());
        };
        let names: HashMap<String, String> = columns.into_iter().map(|c| (c.sql, c.name)).collect();

        let sql = format!("SELECT * FROM {} ORDER BY rowid", quote_ident(&table));
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        rows.iter().map(|row| decode_row(row, &names)).collect()
    }

    async fn columns(&self, operation: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let columns = table_columns(&mut conn, &table_name(operation)).await?.unwrap_or_default();
        Ok(columns.into_iter().map(|c| c.name).collect())
    }
}

fn table_name(operation: &str) -> String {
    format!("op_{}", operation)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quoted_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names.into_iter().map(quote_ident).collect::<Vec<_>>().join(", ")
}

fn slot<'a>(columns: &'a [ColumnSlot], table: &str, name: &str) -> Result<&'a ColumnSlot, StorageError> {
    columns
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| StorageError::Backend(format!("table {} has no key column '{}'", table, name)))
}

/// Slot for a new column `name`, renamed (and the rename recorded) when its
/// identifier is already taken under ASCII case folding.
async fn allocate_slot(
    conn: &mut SqliteConnection,
    table: &str,
    name: &str,
    columns: &[ColumnSlot],
) -> Result<ColumnSlot, StorageError> {
    let taken = |candidate: &str| {
        candidate.eq_ignore_ascii_case(SURROGATE_COLUMN) || columns.iter().any(|c| c.sql.eq_ignore_ascii_case(candidate))
    };
    if !taken(name) {
        return Ok(ColumnSlot { name: name.to_string(), sql: name.to_string() });
    }

    let mut n = 2;
    let sql = loop {
        let candidate = format!("{}__{}", name, n);
        if !taken(&candidate) {
            break candidate;
        }
        n += 1;
    };
    let record = format!(
        "INSERT OR REPLACE INTO {} (tbl, sql_name, name) VALUES (?, ?, ?)",
        quote_ident(COLUMN_NAMES_TABLE)
    );
    sqlx::query(&record).bind(table).bind(&sql).bind(name).execute(&mut *conn).await?;
    debug!(table = %table, column = %name, sql_name = %sql, "Column renamed to avoid a case-insensitive clash");
    Ok(ColumnSlot { name: name.to_string(), sql })
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_scalar<'q>(query: SqliteQuery<'q>, value: &'q Scalar) -> SqliteQuery<'q> {
    match value {
        Scalar::Null => query.bind(None::<String>),
        Scalar::Bool(b) => query.bind(i64::from(*b)),
        Scalar::Int(i) => query.bind(*i),
        Scalar::Float(f) => query.bind(*f),
        Scalar::Text(s) => query.bind(s.as_str()),
    }
}

/// Data columns of `table` in table order, or `None` if it does not exist.
async fn table_columns(conn: &mut SqliteConnection, table: &str) -> Result<Option<Vec<ColumnSlot>>, StorageError> {
    let sql = format!("PRAGMA table_info({})", quote_ident(table));
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    if rows.is_empty() {
        return Ok(None);
    }

    let renames_sql = format!("SELECT sql_name, name FROM {} WHERE tbl = ?", quote_ident(COLUMN_NAMES_TABLE));
    let mut renames = HashMap::new();
    for row in sqlx::query(&renames_sql).bind(table).fetch_all(&mut *conn).await? {
        renames.insert(row.try_get::<String, _>("sql_name")?, row.try_get::<String, _>("name")?);
    }

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let sql: String = row.try_get("name")?;
        if sql != SURROGATE_COLUMN {
            let name = renames.remove(&sql).unwrap_or_else(|| sql.clone());
            columns.push(ColumnSlot { name, sql });
        }
    }
    Ok(Some(columns))
}

/// Create the table with only its key columns; returns them as the initial shape.
async fn create_table(
    conn: &mut SqliteConnection,
    table: &str,
    strategy: &PrimaryKeyStrategy,
) -> Result<Vec<ColumnSlot>, StorageError> {
    // Renames left behind by a dropped table of the same name
    let stale = format!("DELETE FROM {} WHERE tbl = ?", quote_ident(COLUMN_NAMES_TABLE));
    sqlx::query(&stale).bind(table).execute(&mut *conn).await?;

    let mut keys: Vec<ColumnSlot> = Vec::new();
    for field in strategy.key_fields() {
        let slot = allocate_slot(conn, table, field, &keys).await?;
        keys.push(slot);
    }
    let key_list = quoted_list(keys.iter().map(|k| k.sql.as_str()));

    let sql = if strategy.is_surrogate() {
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({} INTEGER PRIMARY KEY AUTOINCREMENT, {}, UNIQUE({}))",
            quote_ident(table),
            quote_ident(SURROGATE_COLUMN),
            key_list,
            key_list
        )
    } else {
        format!("CREATE TABLE IF NOT EXISTS {} ({}, UNIQUE({}))", quote_ident(table), key_list, key_list)
    };
    sqlx::query(&sql).execute(&mut *conn).await?;
    info!(table = %table, strategy = strategy.kind(), keys = ?strategy.key_fields(), "Created keyed table");
    Ok(keys)
}

/// Natural / composite upsert. Returns how many rows replaced an existing key.
async fn upsert_by_key(
    conn: &mut SqliteConnection,
    table: &str,
    keys: &[String],
    columns: &[ColumnSlot],
    rows: &[FlatRow],
) -> Result<usize, StorageError> {
    let key_slots = keys.iter().map(|k| slot(columns, table, k)).collect::<Result<Vec<_>, _>>()?;
    let key_match = key_slots
        .iter()
        .map(|k| format!("{} = ?", quote_ident(&k.sql)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let exists_sql = format!("SELECT 1 FROM {} WHERE {} LIMIT 1", quote_ident(table), key_match);

    let placeholders = vec!["?"; columns.len()].join(", ");
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !keys.contains(&c.name))
        .map(|c| format!("{0} = excluded.{0}", quote_ident(&c.sql)))
        .collect();
    let on_conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    let upsert_sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
        quote_ident(table),
        quoted_list(columns.iter().map(|c| c.sql.as_str())),
        placeholders,
        quoted_list(key_slots.iter().map(|k| k.sql.as_str())),
        on_conflict
    );

    let mut replaced = 0;
    for row in rows {
        let mut exists = sqlx::query(&exists_sql);
        for key in keys {
            exists = bind_scalar(exists, row.value(key));
        }
        if exists.fetch_optional(&mut *conn).await?.is_some() {
            replaced += 1;
        }

        let mut upsert = sqlx::query(&upsert_sql);
        for column in columns {
            upsert = bind_scalar(upsert, row.value(&column.name));
        }
        upsert.execute(&mut *conn).await?;
    }
    Ok(replaced)
}

/// Surrogate upsert: replace the row matching `unique_fields`, else insert.
async fn upsert_by_surrogate(
    conn: &mut SqliteConnection,
    table: &str,
    unique_fields: &[String],
    columns: &[ColumnSlot],
    rows: &[FlatRow],
) -> Result<usize, StorageError> {
    let key_match = unique_fields
        .iter()
        .map(|k| slot(columns, table, k).map(|c| format!("{} IS ?", quote_ident(&c.sql))))
        .collect::<Result<Vec<_>, _>>()?
        .join(" AND ");
    let find_sql = format!(
        "SELECT {} FROM {} WHERE {} LIMIT 1",
        quote_ident(SURROGATE_COLUMN),
        quote_ident(table),
        key_match
    );
    let assignments = columns
        .iter()
        .map(|c| format!("{} = ?", quote_ident(&c.sql)))
        .collect::<Vec<_>>()
        .join(", ");
    let update_sql = format!(
        "UPDATE {} SET {} WHERE {} = ?",
        quote_ident(table),
        assignments,
        quote_ident(SURROGATE_COLUMN)
    );
    let insert_sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        quoted_list(columns.iter().map(|c| c.sql.as_str())),
        vec!["?"; columns.len()].join(", ")
    );

    let mut replaced = 0;
    for row in rows {
        let mut find = sqlx::query(&find_sql);
        for field in unique_fields {
            find = bind_scalar(find, row.value(field));
        }
        let existing: Option<i64> = match find.fetch_optional(&mut *conn).await? {
            Some(found) => Some(found.try_get(0)?),
            None => None,
        };

        match existing {
            Some(row_id) => {
                let mut update = sqlx::query(&update_sql);
                for column in columns {
                    update = bind_scalar(update, row.value(&column.name));
                }
                update.bind(row_id).execute(&mut *conn).await?;
                replaced += 1;
            }
            None => {
                let mut insert = sqlx::query(&insert_sql);
                for column in columns {
                    insert = bind_scalar(insert, row.value(&column.name));
                }
                insert.execute(&mut *conn).await?;
            }
        }
    }
    Ok(replaced)
}

/// Decode one table row; `names` maps renamed SQLite identifiers back to row names.
fn decode_row(row: &SqliteRow, names: &HashMap<String, String>) -> Result<KeyedRow, StorageError> {
    let mut values = FlatRow::new();
    let mut surrogate_id = None;

    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Scalar::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => Scalar::Int(row.try_get::<i64, _>(i)?),
                "REAL" => Scalar::Float(row.try_get::<f64, _>(i)?),
                "BLOB" => Scalar::Text(String::from_utf8_lossy(&row.try_get::<Vec<u8>, _>(i)?).into_owned()),
                _ => Scalar::Text(row.try_get::<String, _>(i)?),
            }
        };

        if column.name() == SURROGATE_COLUMN {
            if let Scalar::Int(id) = value {
                surrogate_id = Some(id);
            }
        } else {
            let name = names.get(column.name()).map_or(column.name(), String::as_str);
            values.insert(name, value);
        }
    }

    Ok(KeyedRow { surrogate_id, values })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(pairs: &[(&str, Scalar)]) -> FlatRow {
        pairs.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    #[tokio::test]
    async fn test_composite_key_replaces_row() {
        let store = SqlStore::in_memory().await.unwrap();
        let strategy = PrimaryKeyStrategy::composite(["id", "ts"]);

        let first = store
            .write_batch("O", &strategy, &[row(&[("id", "a".into()), ("ts", 100i64.into()), ("val", 1i64.into())])])
            .await
            .unwrap();
        assert_eq!(first.replaced, 0);
        let second = store
            .write_batch("O", &strategy, &[row(&[("id", "a".into()), ("ts", 100i64.into()), ("val", 2i64.into())])])
            .await
            .unwrap();
        assert_eq!(second.replaced, 1);

        let rows = store.rows("O").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].surrogate_id, None);
        assert_eq!(rows[0].values.get("val"), Some(&Scalar::Int(2)));
    }

    #[tokio::test]
    async fn test_surrogate_replay_keeps_identifier() {
        let store = SqlStore::in_memory().await.unwrap();
        let strategy = PrimaryKeyStrategy::surrogate(["name"]);

        store
            .write_batch("S", &strategy, &[row(&[("name", "x".into()), ("count", 1i64.into())])])
            .await
            .unwrap();
        let id = store.rows("S").await.unwrap()[0].surrogate_id;
        assert!(id.is_some());

        store
            .write_batch("S", &strategy, &[row(&[("name", "x".into()), ("count", 2i64.into())])])
            .await
            .unwrap();
        let rows = store.rows("S").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].surrogate_id, id);
        assert_eq!(rows[0].values.get("count"), Some(&Scalar::Int(2)));
    }

    #[tokio::test]
    async fn test_surrogate_matches_null_unique_fields() {
        let store = SqlStore::in_memory().await.unwrap();
        let strategy = PrimaryKeyStrategy::surrogate(["site_id", "name"]);
        let batch = [row(&[("site_id", Scalar::Null), ("name", "app".into()), ("n", 1i64.into())])];

        store.write_batch("S", &strategy, &batch).await.unwrap();
        store.write_batch("S", &strategy, &batch).await.unwrap();
        assert_eq!(store.rows("S").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_surrogate_ids_are_monotonic() {
        let store = SqlStore::in_memory().await.unwrap();
        let strategy = PrimaryKeyStrategy::surrogate(["name"]);
        let batch: Vec<FlatRow> = ["a", "b", "c"].iter().map(|n| row(&[("name", (*n).into())])).collect();
        store.write_batch("S", &strategy, &batch).await.unwrap();

        let ids: Vec<i64> = store.rows("S").await.unwrap().iter().filter_map(|r| r.surrogate_id).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_new_columns_are_null_for_earlier_rows() {
        let store = SqlStore::in_memory().await.unwrap();
        let strategy = PrimaryKeyStrategy::natural(["x"]);

        store
            .write_batch("G", &strategy, &[row(&[("x", 1i64.into()), ("y", "a".into())])])
            .await
            .unwrap();
        let result = store
            .write_batch("G", &strategy, &[row(&[("x", 2i64.into()), ("y", "b".into()), ("z", 3.5f64.into())])])
            .await
            .unwrap();
        assert_eq!(result.columns_added, vec!["z".to_string()]);

        assert_eq!(store.columns("G").await.unwrap(), vec!["x", "y", "z"]);
        let rows = store.rows("G").await.unwrap();
        assert_eq!(rows[0].values.get("z"), Some(&Scalar::Null));
        assert_eq!(rows[1].values.get("z"), Some(&Scalar::Float(3.5)));
    }

    #[tokio::test]
    async fn test_replace_clears_columns_missing_from_new_row() {
        let store = SqlStore::in_memory().await.unwrap();
        let strategy = PrimaryKeyStrategy::natural(["id"]);
        store
            .write_batch("R", &strategy, &[row(&[("id", "a".into()), ("note", "old".into())])])
            .await
            .unwrap();
        store.write_batch("R", &strategy, &[row(&[("id", "a".into())])]).await.unwrap();

        let rows = store.rows("R").await.unwrap();
        assert_eq!(rows[0].values.get("note"), Some(&Scalar::Null));
    }

    #[tokio::test]
    async fn test_missing_key_rejects_whole_batch() {
        let store = SqlStore::in_memory().await.unwrap();
        let strategy = PrimaryKeyStrategy::natural(["id"]);
        let batch = [row(&[("id", "a".into())]), row(&[("other", 1i64.into())])];

        let err = store.write_batch("M", &strategy, &batch).await.unwrap_err();
        assert!(matches!(err, StorageError::MissingKey { row: 1, ref column } if column == "id"));
        assert!(store.rows("M").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bool_reads_back_as_integer() {
        let store = SqlStore::in_memory().await.unwrap();
        let strategy = PrimaryKeyStrategy::natural(["id"]);
        store
            .write_batch("B", &strategy, &[row(&[("id", "a".into()), ("up", true.into())])])
            .await
            .unwrap();
        assert_eq!(store.rows("B").await.unwrap()[0].values.get("up"), Some(&Scalar::Int(1)));
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("nested/ingest.db").display());
        let strategy = PrimaryKeyStrategy::natural(["id"]);

        {
            let store = SqlStore::new(&url, 2).await.unwrap();
            store
                .write_batch("P", &strategy, &[row(&[("id", "a".into()), ("v", 1i64.into())])])
                .await
                .unwrap();
            store.pool().close().await;
        }

        let store = SqlStore::new(&url, 2).await.unwrap();
        // Fresh store: column cache cold, schema read back from the file
        let result = store
            .write_batch("P", &strategy, &[row(&[("id", "a".into()), ("v", 2i64.into())])])
            .await
            .unwrap();
        assert_eq!(result.replaced, 1);
        assert!(result.columns_added.is_empty());
        assert_eq!(store.rows("P").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_operation_reads_empty() {
        let store = SqlStore::in_memory().await.unwrap();
        assert!(store.rows("never").await.unwrap().is_empty());
        assert!(store.columns("never").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_case_variant_columns_are_kept_apart() {
        let store = SqlStore::in_memory().await.unwrap();
        let strategy = PrimaryKeyStrategy::natural(["id"]);
        let batch = [row(&[("id", 1i64.into()), ("Name", "upper".into()), ("name", "lower".into())])];

        let first = store.write_batch("C", &strategy, &batch).await.unwrap();
        assert_eq!(first.columns_added, vec!["Name".to_string(), "name".to_string()]);
        let second = store.write_batch("C", &strategy, &batch).await.unwrap();
        assert_eq!(second.replaced, 1);
        assert!(second.columns_added.is_empty());

        assert_eq!(store.columns("C").await.unwrap(), vec!["id", "Name", "name"]);
        let rows = store.rows("C").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values, batch[0]);
    }

    #[tokio::test]
    async fn test_case_variant_columns_survive_reopen() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("ingest.db").display());
        let strategy = PrimaryKeyStrategy::surrogate(["key"]);

        {
            let store = SqlStore::new(&url, 2).await.unwrap();
            store
                .write_batch("C", &strategy, &[row(&[("key", "a".into()), ("Name", "A".into()), ("name", "a".into())])])
                .await
                .unwrap();
            store.pool().close().await;
        }

        let store = SqlStore::new(&url, 2).await.unwrap();
        let result = store
            .write_batch("C", &strategy, &[row(&[("key", "a".into()), ("name", "b".into())])])
            .await
            .unwrap();
        assert_eq!(result.replaced, 1);
        assert!(result.columns_added.is_empty());

        let rows = store.rows("C").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values.get("name"), Some(&Scalar::Text("b".into())));
        assert_eq!(rows[0].values.get("Name"), Some(&Scalar::Null));
    }

    #[tokio::test]
    async fn test_column_spelled_like_surrogate_column() {
        let store = SqlStore::in_memory().await.unwrap();
        let strategy = PrimaryKeyStrategy::surrogate(["name"]);
        store
            .write_batch("S", &strategy, &[row(&[("name", "x".into()), ("_ROW_ID", 7i64.into())])])
            .await
            .unwrap();

        let rows = store.rows("S").await.unwrap();
        assert_eq!(rows[0].surrogate_id, Some(1));
        assert_eq!(rows[0].values.get("_ROW_ID"), Some(&Scalar::Int(7)));
    }

    #[tokio::test]
    async fn test_only_contention_is_transient() {
        let store = SqlStore::in_memory().await.unwrap();
        let err: StorageError = sqlx::query("SELECT * FROM no_such_table")
            .execute(&store.pool())
            .await
            .unwrap_err()
            .into();
        assert!(!err.is_transient());
        assert!(!StorageError::MissingKey { row: 0, column: "id".into() }.is_transient());
        assert!(StorageError::Sql(sqlx::Error::PoolTimedOut).is_transient());
    }
}
