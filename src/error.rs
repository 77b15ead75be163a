// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the ingest engine.
//!
//! | Error | Recoverable | Surfaced |
//! |-------|-------------|----------|
//! | [`ConfigError`] | no | before any I/O |
//! | [`ApiError::RateLimited`] | yes | only as the cause of [`FetchError::FetchFailed`] once retries run out |
//! | [`ApiError::Transient`] / [`ApiError::Timeout`] | yes | same |
//! | [`ApiError::Permanent`] / [`ApiError::Malformed`] | no | immediately, as [`FetchError::FetchFailed`] |
//! | [`PersistenceError`] | caller decides | per backend, per batch |

use crate::dispatch::PageParams;
use crate::storage::traits::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Registry / configuration problems. Always fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no primary-key strategy registered for operation '{operation}'")]
    MissingStrategy { operation: String },
    #[error("operation '{operation}' registered twice")]
    DuplicateOperation { operation: String },
    #[error("operation '{operation}' differs from registered '{existing}' only by case")]
    OperationNameClash { operation: String, existing: String },
    #[error("operation '{operation}' has an empty key field list")]
    EmptyKey { operation: String },
    #[error("invalid operation name '{operation}': {reason}")]
    InvalidOperation { operation: String, reason: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Classification of a failed upstream call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient upstream error: {0}")]
    Transient(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("permanent upstream error (status {status:?}): {message}")]
    Permanent { status: Option<u16>, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ApiError {
    /// Map an HTTP status to an error class: 429 → rate limited,
    /// 408 and 5xx → transient, any other 4xx → permanent.
    #[must_use]
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        match status {
            429 => Self::RateLimited { retry_after: None },
            408 | 500..=599 => Self::Transient(format!("HTTP {}: {}", status, body.into())),
            _ => Self::Permanent {
                status: Some(status),
                message: body.into(),
            },
        }
    }

    /// Whether the dispatcher should retry the same page.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_) | Self::Timeout(_))
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Transient(_) => "transient",
            Self::Timeout(_) => "timeout",
            Self::Permanent { .. } => "permanent",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// Terminal failure of a `fetch_all` sequence.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error("fetch of '{operation}' failed at {page} after {attempts} attempt(s): {cause}")]
    FetchFailed {
        operation: String,
        page: PageParams,
        attempts: usize,
        cause: ApiError,
    },
}

impl FetchError {
    /// Parameters of the page that failed, when the failure is page-specific.
    #[must_use]
    pub fn page(&self) -> Option<&PageParams> {
        match self {
            Self::FetchFailed { page, .. } => Some(page),
            Self::Configuration(_) => None,
        }
    }

    #[must_use]
    pub fn cause(&self) -> Option<&ApiError> {
        match self {
            Self::FetchFailed { cause, .. } => Some(cause),
            Self::Configuration(_) => None,
        }
    }
}

/// A batch that one backend failed to persist.
#[derive(Error, Debug)]
#[error("{backend} backend failed to persist {batch_size} row(s) for '{operation}': {source}")]
pub struct PersistenceError {
    pub backend: &'static str,
    pub operation: String,
    pub batch_size: usize,
    #[source]
    pub source: StorageError,
}

/// Failures while assembling an engine from configuration.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ApiError::from_status(429, ""), ApiError::RateLimited { retry_after: None });
        assert!(matches!(ApiError::from_status(503, "busy"), ApiError::Transient(_)));
        assert!(matches!(ApiError::from_status(408, ""), ApiError::Transient(_)));
        assert_eq!(
            ApiError::from_status(404, "no such site"),
            ApiError::Permanent { status: Some(404), message: "no such site".into() }
        );
    }

    #[test]
    fn test_retryable() {
        assert!(ApiError::RateLimited { retry_after: None }.is_retryable());
        assert!(ApiError::Transient("reset".into()).is_retryable());
        assert!(ApiError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ApiError::Malformed("not json".into()).is_retryable());
        assert!(!ApiError::from_status(403, "forbidden").is_retryable());
    }

    #[test]
    fn test_fetch_failed_names_page() {
        let page = PageParams::first(Default::default(), 100).advance("c2".into());
        let err = FetchError::FetchFailed {
            operation: "listOrgSites".into(),
            page: page.clone(),
            attempts: 1,
            cause: ApiError::from_status(400, "bad"),
        };
        assert_eq!(err.page(), Some(&page));
        let msg = err.to_string();
        assert!(msg.contains("listOrgSites"));
        assert!(msg.contains("page=2"));
    }
}
