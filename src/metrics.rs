// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the ingest engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `ingest_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms and delay gauges
//!
//! # Labels
//! - `operation`: upstream API operation name (e.g. listOrgSites)
//! - `outcome`: success, rate_limited, transient, timeout, permanent, malformed
//! - `backend`: csv, sql, memory

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// UPSTREAM REQUESTS
// ═══════════════════════════════════════════════════════════════════════════

/// Record one upstream call and how it ended
pub fn record_request(operation: &str, outcome: &str) {
    counter!(
        "ingest_requests_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record upstream call latency
pub fn record_request_latency(operation: &str, duration: Duration) {
    histogram!(
        "ingest_request_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a retried page (kind: rate_limited, transient, timeout)
pub fn record_retry(operation: &str, kind: &str) {
    counter!(
        "ingest_retries_total",
        "operation" => operation.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a page handed to the caller
pub fn record_page(operation: &str, rows: usize) {
    counter!(
        "ingest_pages_total",
        "operation" => operation.to_string()
    )
    .increment(1);
    histogram!(
        "ingest_page_rows",
        "operation" => operation.to_string()
    )
    .record(rows as f64);
}

/// Record a fetch that was abandoned
pub fn record_fetch_failed(operation: &str, cause: &str) {
    counter!(
        "ingest_fetch_failures_total",
        "operation" => operation.to_string(),
        "cause" => cause.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// PACING
// ═══════════════════════════════════════════════════════════════════════════

/// Set the current pacing delay of an operation
pub fn set_rate_delay(operation: &str, delay_secs: f64) {
    gauge!(
        "ingest_rate_delay_seconds",
        "operation" => operation.to_string()
    )
    .set(delay_secs);
}

// ═══════════════════════════════════════════════════════════════════════════
// PERSISTENCE
// ═══════════════════════════════════════════════════════════════════════════

/// Record rows persisted to a backend
pub fn record_rows_written(backend: &str, operation: &str, count: usize) {
    counter!(
        "ingest_rows_written_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .increment(count as u64);
}

/// Record a batch a backend failed to persist
pub fn record_persistence_error(backend: &str, operation: &str) {
    counter!(
        "ingest_persistence_errors_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record columns added to an operation's stored shape
pub fn record_columns_added(backend: &str, count: usize) {
    counter!(
        "ingest_schema_columns_added_total",
        "backend" => backend.to_string()
    )
    .increment(count as u64);
}

/// Record batch write latency per backend
pub fn record_write_latency(backend: &str, operation: &str, duration: Duration) {
    histogram!(
        "ingest_write_seconds",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// ENGINE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a finished per-operation sync
pub fn record_sync(operation: &str, status: &str, duration: Duration) {
    counter!(
        "ingest_syncs_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "ingest_sync_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set number of operations currently being synced
pub fn set_active_syncs(count: usize) {
    gauge!("ingest_active_syncs").set(count as f64);
}

/// A timing guard that records backend write latency on drop
pub struct LatencyTimer {
    backend: &'static str,
    operation: String,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(backend: &'static str, operation: impl Into<String>) -> Self {
        Self {
            backend,
            operation: operation.into(),
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_write_latency(self.backend, &self.operation, self.start.elapsed());
    }
}
