// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The upstream collaborator: an authenticated API handle the dispatcher
//! calls once per page.

use crate::error::ApiError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Parameters of one page request.
///
/// `query` holds the caller's own parameters (site id, time range, filters)
/// and is repeated unchanged on every page. `page` is 1-based. `cursor` is
/// the opaque token the previous response handed back, `None` on page 1.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PageParams {
    pub query: BTreeMap<String, String>,
    pub limit: usize,
    pub page: u32,
    pub cursor: Option<String>,
}

impl PageParams {
    #[must_use]
    pub fn first(query: BTreeMap<String, String>, limit: usize) -> Self {
        Self {
            query,
            limit,
            page: 1,
            cursor: None,
        }
    }

    /// Parameters of the page after this one.
    #[must_use]
    pub fn advance(&self, cursor: String) -> Self {
        Self {
            query: self.query.clone(),
            limit: self.limit,
            page: self.page.saturating_add(1),
            cursor: Some(cursor),
        }
    }
}

impl fmt::Display for PageParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page={} limit={}", self.page, self.limit)?;
        if let Some(cursor) = &self.cursor {
            write!(f, " cursor={}", cursor)?;
        }
        for (key, value) in &self.query {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// One successful page: raw records plus the cursor of the next page.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApiPage {
    pub records: Vec<Value>,
    /// `None` on the last page
    pub next_cursor: Option<String>,
}

impl ApiPage {
    pub fn new(records: Vec<Value>, next_cursor: Option<String>) -> Self {
        Self { records, next_cursor }
    }

    /// Final page of a result set.
    pub fn last(records: Vec<Value>) -> Self {
        Self { records, next_cursor: None }
    }
}

/// Opaque upstream API. Authentication and connection setup are the
/// implementor's business; the dispatcher only sees pages and error classes.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn call(&self, operation: &str, params: &PageParams) -> Result<ApiPage, ApiError>;
}
