// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process [`ApiClient`] serving fixed datasets.
//!
//! Pages are cut from each operation's dataset using `limit`; the cursor is
//! the offset of the next page. An optional minimum call spacing makes the
//! simulated API throttle callers that go too fast, which is what the pacing
//! loop is meant to learn.

use super::client::{ApiClient, ApiPage, PageParams};
use crate::error::ApiError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
pub struct SimulatedApi {
    datasets: HashMap<String, Vec<Value>>,
    min_spacing: HashMap<String, Duration>,
    last_call: Mutex<HashMap<String, Instant>>,
    calls: AtomicUsize,
    log: Mutex<Vec<(String, PageParams)>>,
}

impl SimulatedApi {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `records` for `operation`.
    #[must_use]
    pub fn with_dataset(mut self, operation: impl Into<String>, records: Vec<Value>) -> Self {
        self.datasets.insert(operation.into(), records);
        self
    }

    /// Answer `RateLimited` whenever two calls to `operation` are closer than `spacing`.
    #[must_use]
    pub fn with_min_spacing(mut self, operation: impl Into<String>, spacing: Duration) -> Self {
        self.min_spacing.insert(operation.into(), spacing);
        self
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Every call received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, PageParams)> {
        self.log.lock().clone()
    }

    fn throttled(&self, operation: &str) -> bool {
        let now = Instant::now();
        let mut last = self.last_call.lock();
        let previous = last.insert(operation.to_string(), now);
        match (self.min_spacing.get(operation), previous) {
            (Some(spacing), Some(previous)) => now.duration_since(previous) < *spacing,
            _ => false,
        }
    }
}

#[async_trait]
impl ApiClient for SimulatedApi {
    async fn call(&self, operation: &str, params: &PageParams) -> Result<ApiPage, ApiError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.log.lock().push((operation.to_string(), params.clone()));

        let records = self.datasets.get(operation).ok_or_else(|| ApiError::Permanent {
            status: Some(404),
            message: format!("unknown operation {}", operation),
        })?;

        if self.throttled(operation) {
            return Err(ApiError::RateLimited { retry_after: None });
        }

        let offset = match params.cursor.as_deref() {
            None => 0,
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| ApiError::Permanent { status: Some(400), message: format!("bad cursor {}", cursor) })?,
        };
        let limit = params.limit.max(1);
        let end = offset.saturating_add(limit).min(records.len());
        let page = records.get(offset..end).map(<[Value]>::to_vec).unwrap_or_default();
        let next_cursor = (end < records.len()).then(|| end.to_string());

        Ok(ApiPage::new(page, next_cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn records(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({"id": i})).collect()
    }

    #[tokio::test]
    async fn test_pages_by_offset_cursor() {
        let api = SimulatedApi::new().with_dataset("op", records(5));
        let first = PageParams::first(BTreeMap::new(), 2);

        let page = api.call("op", &first).await.unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("2"));

        let last = first.advance("4".into());
        let page = api.call("op", &last).await.unwrap();
        assert_eq!(page.records, vec![json!({"id": 4})]);
        assert_eq!(page.next_cursor, None);
    }

    #[tokio::test]
    async fn test_unknown_operation_is_permanent() {
        let api = SimulatedApi::new();
        let err = api.call("nope", &PageParams::first(BTreeMap::new(), 10)).await.unwrap_err();
        assert!(matches!(err, ApiError::Permanent { status: Some(404), .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttles_calls_closer_than_spacing() {
        let api = SimulatedApi::new()
            .with_dataset("op", records(1))
            .with_min_spacing("op", Duration::from_millis(100));
        let params = PageParams::first(BTreeMap::new(), 10);

        assert!(api.call("op", &params).await.is_ok());
        assert!(matches!(api.call("op", &params).await, Err(ApiError::RateLimited { .. })));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(api.call("op", &params).await.is_ok());
    }
}
