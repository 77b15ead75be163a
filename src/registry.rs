// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operation name → primary-key strategy.
//!
//! The registry is built once at startup and then shared read-only. Asking
//! for an operation that was never registered is a [`ConfigError`]; there is
//! no fallback strategy.
//!
//! # Example
//!
//! ```
//! use ingest_engine::registry::{StrategyRegistry, OperationDescriptor, PrimaryKeyStrategy};
//!
//! let mut registry = StrategyRegistry::new();
//! registry.register(OperationDescriptor::new(
//!     "listOrgSites",
//!     PrimaryKeyStrategy::natural(["id"]),
//! )).unwrap();
//!
//! assert!(registry.validate(["listOrgSites"]).is_ok());
//! assert!(registry.validate(["listOrgSites", "unknownOp"]).is_err());
//! ```

use crate::error::ConfigError;
use crate::flatten::{FlatRow, FlattenConfig, Scalar};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Internal identifier column of surrogate-keyed tables.
pub const SURROGATE_COLUMN: &str = "_row_id";

/// How rows of one operation are identified in the keyed store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrimaryKeyStrategy {
    /// Upstream guarantees these fields are a stable unique identifier
    Natural { fields: Vec<String> },
    /// Unique only as a tuple (time series, events)
    Composite { fields: Vec<String> },
    /// No natural identifier: the store assigns `_row_id`, and `unique_fields`
    /// decide whether a row is new or a replay
    Surrogate { unique_fields: Vec<String> },
}

impl PrimaryKeyStrategy {
    pub fn natural<I: IntoIterator<Item = S>, S: Into<String>>(fields: I) -> Self {
        Self::Natural { fields: fields.into_iter().map(Into::into).collect() }
    }

    pub fn composite<I: IntoIterator<Item = S>, S: Into<String>>(fields: I) -> Self {
        Self::Composite { fields: fields.into_iter().map(Into::into).collect() }
    }

    pub fn surrogate<I: IntoIterator<Item = S>, S: Into<String>>(unique_fields: I) -> Self {
        Self::Surrogate { unique_fields: unique_fields.into_iter().map(Into::into).collect() }
    }

    /// Columns that identify a logical row.
    #[must_use]
    pub fn key_fields(&self) -> &[String] {
        match self {
            Self::Natural { fields } | Self::Composite { fields } => fields,
            Self::Surrogate { unique_fields } => unique_fields,
        }
    }

    #[must_use]
    pub fn is_surrogate(&self) -> bool {
        matches!(self, Self::Surrogate { .. })
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Natural { .. } => "natural",
            Self::Composite { .. } => "composite",
            Self::Surrogate { .. } => "surrogate",
        }
    }

    /// Key tuple of `row`, absent columns read as null.
    #[must_use]
    pub fn key_of<'r>(&self, row: &'r FlatRow) -> Vec<&'r Scalar> {
        self.key_fields().iter().map(|f| row.value(f)).collect()
    }

    fn validate(&self, operation: &str) -> Result<(), ConfigError> {
        let fields = self.key_fields();
        if fields.is_empty() || fields.iter().any(|f| f.is_empty()) {
            return Err(ConfigError::EmptyKey { operation: operation.to_string() });
        }
        // Stored as SQLite columns, whose names ignore ASCII case
        let distinct: BTreeSet<String> = fields.iter().map(|f| f.to_ascii_lowercase()).collect();
        if distinct.len() != fields.len() {
            return Err(ConfigError::InvalidOperation {
                operation: operation.to_string(),
                reason: "key fields repeat".into(),
            });
        }
        if fields.iter().any(|f| f.eq_ignore_ascii_case(SURROGATE_COLUMN)) {
            return Err(ConfigError::InvalidOperation {
                operation: operation.to_string(),
                reason: format!("'{}' is reserved", SURROGATE_COLUMN),
            });
        }
        Ok(())
    }
}

/// An upstream call and everything needed to persist its rows.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDescriptor {
    pub name: String,
    pub strategy: PrimaryKeyStrategy,
    pub flatten: FlattenConfig,
}

impl OperationDescriptor {
    pub fn new(name: impl Into<String>, strategy: PrimaryKeyStrategy) -> Self {
        Self {
            name: name.into(),
            strategy,
            flatten: FlattenConfig::default(),
        }
    }

    #[must_use]
    pub fn with_flatten(mut self, flatten: FlattenConfig) -> Self {
        self.flatten = flatten;
        self
    }
}

/// Static lookup table, validated as it is built.
#[derive(Debug, Clone, Default)]
pub struct StrategyRegistry {
    operations: HashMap<String, Arc<OperationDescriptor>>,
}

impl StrategyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation. Names are limited to `[A-Za-z0-9_-]` and must differ
    /// from every registered name by more than ASCII case, because they
    /// become file and table names.
    pub fn register(&mut self, descriptor: OperationDescriptor) -> Result<(), ConfigError> {
        validate_name(&descriptor.name)?;
        descriptor.strategy.validate(&descriptor.name)?;
        if self.operations.contains_key(&descriptor.name) {
            return Err(ConfigError::DuplicateOperation { operation: descriptor.name });
        }
        if let Some(existing) = self.operations.keys().find(|k| k.eq_ignore_ascii_case(&descriptor.name)) {
            return Err(ConfigError::OperationNameClash {
                operation: descriptor.name,
                existing: existing.clone(),
            });
        }
        self.operations.insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, descriptor: OperationDescriptor) -> Result<Self, ConfigError> {
        self.register(descriptor)?;
        Ok(self)
    }

    pub fn get(&self, operation: &str) -> Result<Arc<OperationDescriptor>, ConfigError> {
        self.operations
            .get(operation)
            .cloned()
            .ok_or_else(|| ConfigError::MissingStrategy { operation: operation.to_string() })
    }

    pub fn strategy_for(&self, operation: &str) -> Result<&PrimaryKeyStrategy, ConfigError> {
        self.operations
            .get(operation)
            .map(|d| &d.strategy)
            .ok_or_else(|| ConfigError::MissingStrategy { operation: operation.to_string() })
    }

    /// Fail fast on the first operation without a registered strategy.
    pub fn validate<'a, I>(&self, operations: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for op in operations {
            self.strategy_for(op)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, operation: &str) -> bool {
        self.operations.contains_key(operation)
    }

    /// Registered operation names, sorted.
    #[must_use]
    pub fn operations(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Catalogue of the network-management API's list/search calls.
    pub fn network_defaults() -> Result<Self, ConfigError> {
        use PrimaryKeyStrategy as K;

        Self::new()
            .with(OperationDescriptor::new("listOrgSites", K::natural(["id"])))?
            .with(OperationDescriptor::new("listSiteDevicesStats", K::natural(["id"])))?
            .with(OperationDescriptor::new("searchSiteWiredClients", K::composite(["mac", "site_id"])))?
            .with(OperationDescriptor::new("searchSiteWirelessClients", K::composite(["mac", "site_id"])))?
            .with(OperationDescriptor::new(
                "searchSiteWirelessClientSessions",
                K::composite(["mac", "connect"]),
            ))?
            .with(OperationDescriptor::new("listSiteWirelessClientsStats", K::composite(["mac", "site_id"])))?
            .with(OperationDescriptor::new(
                "searchOrgPeerPathStats",
                K::composite(["mac", "port_id", "peer_mac"]),
            ))?
            .with(OperationDescriptor::new("searchOrgBgpStats", K::composite(["mac", "neighbor"])))?
            .with(
                OperationDescriptor::new(
                    "getSiteSleSummaryTrend",
                    K::composite(["site_id", "metric", "samples.index"]),
                )
                .with_flatten(FlattenConfig::default().expand("samples")),
            )?
            .with(OperationDescriptor::new(
                "listSiteSleImpactedApplications",
                K::surrogate(["site_id", "metric", "name"]),
            ))?
            .with(OperationDescriptor::new(
                "listSiteSleImpactedWiredClients",
                K::surrogate(["site_id", "metric", "mac"]),
            ))
    }
}

fn validate_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::InvalidOperation {
            operation: name.to_string(),
            reason: "empty name".into(),
        });
    }
    if let Some(c) = name.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-')) {
        return Err(ConfigError::InvalidOperation {
            operation: name.to_string(),
            reason: format!("character '{}' not allowed", c),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_registered_strategy() {
        let registry = StrategyRegistry::new()
            .with(OperationDescriptor::new("O", PrimaryKeyStrategy::composite(["id", "ts"])))
            .unwrap();
        let strategy = registry.strategy_for("O").unwrap();
        assert_eq!(strategy.kind(), "composite");
        assert_eq!(strategy.key_fields(), ["id".to_string(), "ts".to_string()]);
    }

    #[test]
    fn test_missing_operation_names_it() {
        let registry = StrategyRegistry::new();
        let err = registry.strategy_for("listOrgSites").unwrap_err();
        assert_eq!(err, ConfigError::MissingStrategy { operation: "listOrgSites".into() });
        assert!(err.to_string().contains("listOrgSites"));
    }

    #[test]
    fn test_validate_reports_first_missing() {
        let registry = StrategyRegistry::new()
            .with(OperationDescriptor::new("a", PrimaryKeyStrategy::natural(["id"])))
            .unwrap();
        let err = registry.validate(["a", "b", "c"]).unwrap_err();
        assert_eq!(err, ConfigError::MissingStrategy { operation: "b".into() });
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = StrategyRegistry::new();
        registry.register(OperationDescriptor::new("a", PrimaryKeyStrategy::natural(["id"]))).unwrap();
        let err = registry
            .register(OperationDescriptor::new("a", PrimaryKeyStrategy::surrogate(["name"])))
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateOperation { operation: "a".into() });
        // First registration wins and is unchanged
        assert_eq!(registry.strategy_for("a").unwrap().kind(), "natural");
    }

    #[test]
    fn test_names_differing_only_by_case_rejected() {
        let mut registry = StrategyRegistry::new();
        registry
            .register(OperationDescriptor::new("listOrgSites", PrimaryKeyStrategy::natural(["id"])))
            .unwrap();
        let err = registry
            .register(OperationDescriptor::new("listorgsites", PrimaryKeyStrategy::natural(["id"])))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::OperationNameClash {
                operation: "listorgsites".into(),
                existing: "listOrgSites".into(),
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_key_fields_compared_without_case() {
        let mut registry = StrategyRegistry::new();
        assert!(registry
            .register(OperationDescriptor::new("a", PrimaryKeyStrategy::composite(["Name", "name"])))
            .is_err());
        assert!(registry
            .register(OperationDescriptor::new("b", PrimaryKeyStrategy::surrogate(["_ROW_ID"])))
            .is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let mut registry = StrategyRegistry::new();
        let empty: [&str; 0] = [];
        assert!(matches!(
            registry.register(OperationDescriptor::new("a", PrimaryKeyStrategy::natural(empty))),
            Err(ConfigError::EmptyKey { .. })
        ));
        assert!(matches!(
            registry.register(OperationDescriptor::new("b", PrimaryKeyStrategy::composite(["x", "x"]))),
            Err(ConfigError::InvalidOperation { .. })
        ));
        assert!(matches!(
            registry.register(OperationDescriptor::new("c", PrimaryKeyStrategy::surrogate([SURROGATE_COLUMN]))),
            Err(ConfigError::InvalidOperation { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_operation_names_restricted() {
        let mut registry = StrategyRegistry::new();
        for bad in ["", "../etc", "a b", "op\"x"] {
            assert!(
                registry.register(OperationDescriptor::new(bad, PrimaryKeyStrategy::natural(["id"]))).is_err(),
                "{bad:?} should be rejected"
            );
        }
        assert!(registry
            .register(OperationDescriptor::new("list-Org_Sites2", PrimaryKeyStrategy::natural(["id"])))
            .is_ok());
    }

    #[test]
    fn test_key_of_reads_absent_as_null() {
        let strategy = PrimaryKeyStrategy::composite(["id", "ts"]);
        let row: FlatRow = [("id", Scalar::from("a"))].into_iter().collect();
        assert_eq!(strategy.key_of(&row), vec![&Scalar::Text("a".into()), &Scalar::Null]);
    }

    #[test]
    fn test_network_defaults_catalogue() {
        let registry = StrategyRegistry::network_defaults().unwrap();
        assert!(registry.len() >= 10);
        assert_eq!(registry.strategy_for("listOrgSites").unwrap().kind(), "natural");
        assert!(registry.strategy_for("listSiteSleImpactedApplications").unwrap().is_surrogate());
        let trend = registry.get("getSiteSleSummaryTrend").unwrap();
        assert_eq!(
            trend.flatten.arrays.get("samples"),
            Some(&crate::flatten::ArrayPolicy::Expand)
        );
    }

    #[test]
    fn test_strategy_serde_shape() {
        let json = serde_json::to_value(PrimaryKeyStrategy::surrogate(["name"])).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "surrogate", "unique_fields": ["name"]}));
    }
}
