// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Nested API record → flat rows.
//!
//! Object paths are joined with a separator (`.` by default) into column
//! names. Arrays of scalars become one delimited string. Arrays containing
//! objects are either summarized into a JSON text column or expanded into one
//! row per element, per field path, as configured in [`FlattenConfig`].
//!
//! The transformation is total: every JSON value produces at least one row.
//! Absent fields are represented by [`Scalar::Null`], and
//! [`Flattener::flatten_page`] pads every row of a page to the same column set.
//!
//! # Example
//!
//! ```
//! use ingest_engine::flatten::{Flattener, FlattenConfig, Scalar};
//! use serde_json::json;
//!
//! let flattener = Flattener::new(FlattenConfig::default());
//! let rows = flattener.flatten_record(&json!({
//!     "id": "ap-1",
//!     "port_stat": {"eth0": {"speed": 1000}},
//!     "tags": ["lobby", "floor1"],
//! }));
//!
//! assert_eq!(rows.len(), 1);
//! assert_eq!(rows[0].get("port_stat.eth0.speed"), Some(&Scalar::Int(1000)));
//! assert_eq!(rows[0].get("tags"), Some(&Scalar::Text("lobby;floor1".into())));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A single flat cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Convert a JSON scalar. Returns `None` for objects and arrays.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Null),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => Some(if let Some(i) = n.as_i64() {
                Self::Int(i)
            } else if n.is_u64() {
                // Beyond i64: keep the exact digits
                Self::Text(n.to_string())
            } else {
                n.as_f64().map_or(Self::Null, Self::Float)
            }),
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Parse a field read back from the CSV log. Empty means null; anything
    /// that parses as an integer, a finite float or a boolean becomes one,
    /// whatever type was written.
    #[must_use]
    pub fn parse_field(field: &str) -> Self {
        if field.is_empty() {
            return Self::Null;
        }
        if let Ok(i) = field.parse::<i64>() {
            return Self::Int(i);
        }
        if let Ok(f) = field.parse::<f64>() {
            if f.is_finite() {
                return Self::Float(f);
            }
        }
        match field {
            "true" => Self::Bool(true),
            "false" => Self::Bool(false),
            _ => Self::Text(field.to_string()),
        }
    }
}

impl fmt::Display for Scalar {
    /// CSV rendering; null renders as the empty string.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Scalar {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Column name → scalar. Columns iterate in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlatRow(BTreeMap<String, Scalar>);

impl FlatRow {
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Scalar>) {
        self.0.insert(column.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Scalar> {
        self.0.get(column)
    }

    /// Value for `column`, with absent columns read as null.
    #[must_use]
    pub fn value(&self, column: &str) -> &Scalar {
        const NULL: &Scalar = &Scalar::Null;
        self.0.get(column).unwrap_or(NULL)
    }

    #[must_use]
    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Scalar)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Scalar>> FromIterator<(K, V)> for FlatRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// How an array containing objects is turned into columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayPolicy {
    /// Compact JSON text in a single column
    #[default]
    Summarize,
    /// One row per element; parent columns are carried into every row and
    /// the element position lands in `<path><sep>index`
    Expand,
}

/// Field-level flattening rules for one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlattenConfig {
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_list_separator")]
    pub list_separator: String,
    /// Policy per flattened field path; unlisted paths use [`ArrayPolicy::Summarize`]
    #[serde(default)]
    pub arrays: BTreeMap<String, ArrayPolicy>,
}

fn default_separator() -> String { ".".into() }
fn default_list_separator() -> String { ";".into() }

impl Default for FlattenConfig {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            list_separator: default_list_separator(),
            arrays: BTreeMap::new(),
        }
    }
}

impl FlattenConfig {
    /// Expand the array of objects at `path` into one row per element.
    #[must_use]
    pub fn expand(mut self, path: impl Into<String>) -> Self {
        self.arrays.insert(path.into(), ArrayPolicy::Expand);
        self
    }
}

/// Column used for a record that is not an object (or an unnamed top-level array).
pub const VALUE_COLUMN: &str = "value";

/// Deterministic JSON → [`FlatRow`] transformation.
#[derive(Debug, Clone, Default)]
pub struct Flattener {
    config: FlattenConfig,
}

impl Flattener {
    #[must_use]
    pub fn new(config: FlattenConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &FlattenConfig {
        &self.config
    }

    /// Flatten one record into one or more rows (more than one only when an
    /// expanded array is present).
    #[must_use]
    pub fn flatten_record(&self, record: &Value) -> Vec<FlatRow> {
        self.walk("", record, vec![FlatRow::new()])
    }

    /// Flatten every record of a page and pad all rows to the union of their columns.
    #[must_use]
    pub fn flatten_page(&self, records: &[Value]) -> Vec<FlatRow> {
        let mut rows: Vec<FlatRow> = records.iter().flat_map(|r| self.flatten_record(r)).collect();
        normalize_columns(&mut rows);
        rows
    }

    fn join(&self, prefix: &str, key: &str) -> String {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}{}", prefix, self.config.separator, key)
        }
    }

    fn walk(&self, path: &str, value: &Value, mut rows: Vec<FlatRow>) -> Vec<FlatRow> {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    rows = self.walk(&self.join(path, key), child, rows);
                }
                rows
            }
            Value::Array(items) => self.walk_array(path, value, items, rows),
            scalar => {
                let column = column_name(path);
                let cell = Scalar::from_json(scalar).unwrap_or(Scalar::Null);
                for row in &mut rows {
                    row.insert(column.clone(), cell.clone());
                }
                rows
            }
        }
    }

    fn walk_array(&self, path: &str, whole: &Value, items: &[Value], mut rows: Vec<FlatRow>) -> Vec<FlatRow> {
        let column = column_name(path);
        let all_scalar = items.iter().all(|v| !v.is_object() && !v.is_array());

        if all_scalar {
            let cell = if items.is_empty() {
                Scalar::Null
            } else {
                let joined: Vec<String> = items
                    .iter()
                    .map(|v| Scalar::from_json(v).unwrap_or(Scalar::Null).to_string())
                    .collect();
                Scalar::Text(joined.join(&self.config.list_separator))
            };
            for row in &mut rows {
                row.insert(column.clone(), cell.clone());
            }
            return rows;
        }

        match self.config.arrays.get(path).copied().unwrap_or_default() {
            ArrayPolicy::Summarize => {
                let cell = Scalar::Text(whole.to_string());
                for row in &mut rows {
                    row.insert(column.clone(), cell.clone());
                }
                rows
            }
            ArrayPolicy::Expand => {
                let index_column = self.join(path, "index");
                let mut expanded = Vec::with_capacity(rows.len() * items.len());
                for row in rows {
                    for (i, item) in items.iter().enumerate() {
                        let mut seed = row.clone();
                        seed.insert(index_column.clone(), Scalar::Int(i as i64));
                        expanded.extend(self.walk(path, item, vec![seed]));
                    }
                }
                expanded
            }
        }
    }
}

fn column_name(path: &str) -> String {
    if path.is_empty() {
        VALUE_COLUMN.to_string()
    } else {
        path.to_string()
    }
}

/// Pad every row with nulls so all rows share the same column set.
pub fn normalize_columns(rows: &mut [FlatRow]) {
    let all: BTreeSet<String> = rows.iter().flat_map(|r| r.columns().map(String::from)).collect();
    for row in rows.iter_mut() {
        for column in &all {
            if !row.contains(column) {
                row.insert(column.clone(), Scalar::Null);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_objects_join_with_separator() {
        let flattener = Flattener::default();
        let rows = flattener.flatten_record(&json!({
            "id": "d1",
            "clients_stats": {"total": {"num_wifi_clients": 7, "num_aps": [1, 2]}},
        }));
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.get("id"), Some(&Scalar::Text("d1".into())));
        assert_eq!(row.get("clients_stats.total.num_wifi_clients"), Some(&Scalar::Int(7)));
        assert_eq!(row.get("clients_stats.total.num_aps"), Some(&Scalar::Text("1;2".into())));
    }

    #[test]
    fn test_custom_separators() {
        let flattener = Flattener::new(FlattenConfig {
            separator: "__".into(),
            list_separator: "|".into(),
            ..FlattenConfig::default()
        });
        let rows = flattener.flatten_record(&json!({"a": {"b": ["x", "y"]}}));
        assert_eq!(rows[0].get("a__b"), Some(&Scalar::Text("x|y".into())));
    }

    #[test]
    fn test_scalar_types_preserved() {
        let rows = Flattener::default().flatten_record(&json!({
            "on": true, "n": -3, "ratio": 0.5, "missing": null, "big": u64::MAX
        }));
        let row = &rows[0];
        assert_eq!(row.get("on"), Some(&Scalar::Bool(true)));
        assert_eq!(row.get("n"), Some(&Scalar::Int(-3)));
        assert_eq!(row.get("ratio"), Some(&Scalar::Float(0.5)));
        assert_eq!(row.get("missing"), Some(&Scalar::Null));
        assert_eq!(row.get("big"), Some(&Scalar::Text(u64::MAX.to_string())));
    }

    #[test]
    fn test_empty_scalar_array_is_null() {
        let rows = Flattener::default().flatten_record(&json!({"tags": []}));
        assert_eq!(rows[0].get("tags"), Some(&Scalar::Null));
    }

    #[test]
    fn test_object_array_summarized_by_default() {
        let rows = Flattener::default().flatten_record(&json!({
            "id": "s1",
            "samples": [{"t": 1, "v": 0.9}, {"t": 2, "v": 0.8}],
        }));
        assert_eq!(rows.len(), 1);
        match rows[0].get("samples") {
            Some(Scalar::Text(json)) => {
                let back: Value = serde_json::from_str(json).unwrap();
                assert_eq!(back.as_array().unwrap().len(), 2);
            }
            other => panic!("expected JSON text, got {:?}", other),
        }
    }

    #[test]
    fn test_object_array_expanded_carries_parent_columns() {
        let flattener = Flattener::new(FlattenConfig::default().expand("samples"));
        let rows = flattener.flatten_record(&json!({
            "site_id": "s1",
            "metric": "coverage",
            "samples": [{"t": 1, "v": 0.9}, {"t": 2, "v": 0.8}, {"t": 3}],
            "zzz": "after",
        }));
        assert_eq!(rows.len(), 3);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.get("site_id"), Some(&Scalar::Text("s1".into())));
            assert_eq!(row.get("metric"), Some(&Scalar::Text("coverage".into())));
            assert_eq!(row.get("zzz"), Some(&Scalar::Text("after".into())));
            assert_eq!(row.get("samples.index"), Some(&Scalar::Int(i as i64)));
            assert_eq!(row.get("samples.t"), Some(&Scalar::Int(i as i64 + 1)));
        }
        assert!(rows[2].get("samples.v").is_none());
    }

    #[test]
    fn test_expand_policy_with_empty_array_keeps_parent_row() {
        let flattener = Flattener::new(FlattenConfig::default().expand("samples"));
        let rows = flattener.flatten_record(&json!({"id": 1, "samples": [{"a": 1}], "other": []}));
        assert_eq!(rows.len(), 1);
        let rows = flattener.flatten_record(&json!({"id": 1, "samples": []}));
        // All-scalar (empty) array: stays a single row with a null column
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("samples"), Some(&Scalar::Null));
    }

    #[test]
    fn test_non_object_records_are_total() {
        let flattener = Flattener::default();
        assert_eq!(flattener.flatten_record(&json!(42))[0].get(VALUE_COLUMN), Some(&Scalar::Int(42)));
        assert_eq!(flattener.flatten_record(&Value::Null)[0].get(VALUE_COLUMN), Some(&Scalar::Null));
        assert_eq!(
            flattener.flatten_record(&json!(["a", "b"]))[0].get(VALUE_COLUMN),
            Some(&Scalar::Text("a;b".into()))
        );
        assert_eq!(flattener.flatten_record(&json!({})).len(), 1);
    }

    #[test]
    fn test_page_rows_share_column_set() {
        let rows = Flattener::default().flatten_page(&[
            json!({"id": "a", "x": 1}),
            json!({"id": "b", "y": {"z": 2}}),
        ]);
        assert_eq!(rows.len(), 2);
        let cols: Vec<Vec<&str>> = rows.iter().map(|r| r.columns().collect()).collect();
        assert_eq!(cols[0], vec!["id", "x", "y.z"]);
        assert_eq!(cols[0], cols[1]);
        assert_eq!(rows[0].get("y.z"), Some(&Scalar::Null));
        assert_eq!(rows[1].get("x"), Some(&Scalar::Null));
    }

    #[test]
    fn test_flatten_is_deterministic() {
        let flattener = Flattener::default();
        let record = json!({"b": 1, "a": {"d": [1, {"x": 2}], "c": "s"}});
        assert_eq!(flattener.flatten_record(&record), flattener.flatten_record(&record));
    }

    #[test]
    fn test_parse_field_round_trip_of_rendering() {
        assert_eq!(Scalar::parse_field(""), Scalar::Null);
        assert_eq!(Scalar::parse_field("12"), Scalar::Int(12));
        assert_eq!(Scalar::parse_field("1.5"), Scalar::Float(1.5));
        assert_eq!(Scalar::parse_field("true"), Scalar::Bool(true));
        assert_eq!(Scalar::parse_field("ap-1"), Scalar::Text("ap-1".into()));
        assert_eq!(Scalar::Null.to_string(), "");
    }
}
