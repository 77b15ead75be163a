// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the ingest engine.
//!
//! # Example
//!
//! ```
//! use ingest_engine::{IngestConfig, DispatchMode};
//!
//! // Minimal config (uses defaults)
//! let config = IngestConfig::default();
//! assert_eq!(config.rate.initial_delay_ms, 1000);
//! assert_eq!(config.dispatch.concurrency(), 4);
//!
//! // Fast mode raises the worker bound and shortens retries
//! let mut config = IngestConfig::default();
//! config.dispatch.mode = DispatchMode::Fast;
//! assert_eq!(config.dispatch.concurrency(), 16);
//! assert_eq!(config.dispatch.max_retries(), 2);
//! ```

use crate::resilience::retry::RetryConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration, deserializable from any serde source.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Tuning for the adaptive pacing controller.
#[derive(Debug, Clone, Deserialize)]
pub struct RateConfig {
    /// Delay used for an operation with no learned state (conservative)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied on a rate-limited outcome (must be > 1)
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Fraction of the gap to the learned floor removed per qualifying success
    #[serde(default = "default_decrease_fraction")]
    pub decrease_fraction: f64,
    /// Margin kept above the learned rate-limited delay
    #[serde(default = "default_baseline_headroom")]
    pub baseline_headroom: f64,
    /// Successes slower than this hold the delay instead of shrinking it
    #[serde(default = "default_target_latency_ms")]
    pub target_latency_ms: u64,
    /// Consecutive fast successes required before the delay shrinks
    #[serde(default = "default_success_streak")]
    pub success_streak: u32,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    /// Fast successes in a row, after which the learned baseline is lowered
    /// once to test whether the limit has loosened (0 = never)
    #[serde(default = "default_baseline_relax_after")]
    pub baseline_relax_after: u32,
    /// Fraction of the learned baseline given up on each relaxation
    #[serde(default = "default_baseline_relax_fraction")]
    pub baseline_relax_fraction: f64,
    /// 0 = flush after every update
    #[serde(default)]
    pub flush_interval_ms: u64,
}

fn default_initial_delay_ms() -> u64 { 1000 }
fn default_min_delay_ms() -> u64 { 50 }
fn default_max_delay_ms() -> u64 { 60_000 }
fn default_backoff_factor() -> f64 { 2.0 }
fn default_decrease_fraction() -> f64 { 0.1 }
fn default_baseline_headroom() -> f64 { 0.05 }
fn default_target_latency_ms() -> u64 { 2000 }
fn default_success_streak() -> u32 { 3 }
fn default_history_len() -> usize { 20 }
fn default_baseline_relax_after() -> u32 { 50 }
fn default_baseline_relax_fraction() -> f64 { 0.05 }

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            decrease_fraction: default_decrease_fraction(),
            baseline_headroom: default_baseline_headroom(),
            target_latency_ms: default_target_latency_ms(),
            success_streak: default_success_streak(),
            history_len: default_history_len(),
            baseline_relax_after: default_baseline_relax_after(),
            baseline_relax_fraction: default_baseline_relax_fraction(),
            flush_interval_ms: 0,
        }
    }
}

impl RateConfig {
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    #[must_use]
    pub fn min_delay_secs(&self) -> f64 {
        self.min_delay_ms as f64 / 1000.0
    }

    #[must_use]
    pub fn max_delay_secs(&self) -> f64 {
        self.max_delay_ms as f64 / 1000.0
    }

    #[must_use]
    pub fn target_latency(&self) -> Duration {
        Duration::from_millis(self.target_latency_ms)
    }

    #[must_use]
    pub fn flush_interval(&self) -> Option<Duration> {
        (self.flush_interval_ms > 0).then(|| Duration::from_millis(self.flush_interval_ms))
    }

    /// Check the feedback-loop parameters before any controller is built.
    pub fn validate(&self) -> Result<(), String> {
        if self.backoff_factor <= 1.0 || !self.backoff_factor.is_finite() {
            return Err(format!("rate.backoff_factor must be > 1 (got {})", self.backoff_factor));
        }
        if !(self.decrease_fraction > 0.0 && self.decrease_fraction < 1.0) {
            return Err(format!(
                "rate.decrease_fraction must be in (0, 1) (got {})",
                self.decrease_fraction
            ));
        }
        if self.baseline_headroom < 0.0 || !self.baseline_headroom.is_finite() {
            return Err("rate.baseline_headroom must be >= 0".into());
        }
        if !(self.baseline_relax_fraction >= 0.0 && self.baseline_relax_fraction < 1.0) {
            return Err(format!(
                "rate.baseline_relax_fraction must be in [0, 1) (got {})",
                self.baseline_relax_fraction
            ));
        }
        if self.min_delay_ms == 0 || self.min_delay_ms > self.max_delay_ms {
            return Err(format!(
                "rate delay bounds invalid: min {}ms, max {}ms",
                self.min_delay_ms, self.max_delay_ms
            ));
        }
        Ok(())
    }

    /// Near-zero delays for tests
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            initial_delay_ms: 1,
            min_delay_ms: 1,
            max_delay_ms: 50,
            success_streak: 1,
            ..Self::default()
        }
    }
}

/// Worker-pool sizing and retry behavior selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    Normal,
    Fast,
}

/// Request dispatch settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub mode: DispatchMode,
    #[serde(default = "default_normal_concurrency")]
    pub normal_concurrency: usize,
    #[serde(default = "default_fast_concurrency")]
    pub fast_concurrency: usize,
    #[serde(default = "default_normal_max_retries")]
    pub normal_max_retries: usize,
    #[serde(default = "default_fast_max_retries")]
    pub fast_max_retries: usize,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub retry_factor: f64,
    /// Extra wait after a rate-limited response, on top of the pacing delay
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,
    #[serde(default = "default_rate_limit_max_ms")]
    pub rate_limit_max_ms: u64,
    #[serde(default = "default_normal_max_rate_limit_retries")]
    pub normal_max_rate_limit_retries: usize,
    #[serde(default = "default_fast_max_rate_limit_retries")]
    pub fast_max_rate_limit_retries: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Items per page requested from the upstream API (1000 is the upstream maximum)
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
}

fn default_normal_concurrency() -> usize { 4 }
fn default_fast_concurrency() -> usize { 16 }
fn default_normal_max_retries() -> usize { 5 }
fn default_fast_max_retries() -> usize { 2 }
fn default_retry_initial_ms() -> u64 { 500 }
fn default_retry_max_ms() -> u64 { 30_000 }
fn default_retry_factor() -> f64 { 2.0 }
fn default_rate_limit_backoff_ms() -> u64 { 5000 }
fn default_rate_limit_max_ms() -> u64 { 120_000 }
fn default_normal_max_rate_limit_retries() -> usize { 10 }
fn default_fast_max_rate_limit_retries() -> usize { 3 }
fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_page_limit() -> usize { 1000 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Normal,
            normal_concurrency: default_normal_concurrency(),
            fast_concurrency: default_fast_concurrency(),
            normal_max_retries: default_normal_max_retries(),
            fast_max_retries: default_fast_max_retries(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_factor: default_retry_factor(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
            rate_limit_max_ms: default_rate_limit_max_ms(),
            normal_max_rate_limit_retries: default_normal_max_rate_limit_retries(),
            fast_max_rate_limit_retries: default_fast_max_rate_limit_retries(),
            request_timeout_ms: default_request_timeout_ms(),
            page_limit: default_page_limit(),
        }
    }
}

impl DispatchConfig {
    /// Max operations fetched concurrently in the current mode.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        let bound = match self.mode {
            DispatchMode::Normal => self.normal_concurrency,
            DispatchMode::Fast => self.fast_concurrency,
        };
        bound.max(1)
    }

    /// Transient-error retry ceiling in the current mode.
    #[must_use]
    pub fn max_retries(&self) -> usize {
        match self.mode {
            DispatchMode::Normal => self.normal_max_retries,
            DispatchMode::Fast => self.fast_max_retries,
        }
    }

    /// Rate-limited retry ceiling per page in the current mode.
    #[must_use]
    pub fn max_rate_limit_retries(&self) -> usize {
        match self.mode {
            DispatchMode::Normal => self.normal_max_rate_limit_retries,
            DispatchMode::Fast => self.fast_max_rate_limit_retries,
        }
    }

    /// Backoff policy for transient errors.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry_initial_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
            factor: self.retry_factor,
            max_retries: Some(self.max_retries()),
        }
    }

    /// Backoff policy for rate-limited responses.
    #[must_use]
    pub fn rate_limit_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.rate_limit_backoff_ms),
            max_delay: Duration::from_millis(self.rate_limit_max_ms),
            factor: self.retry_factor,
            max_retries: Some(self.max_rate_limit_retries()),
        }
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Reject settings the dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if !self.retry_factor.is_finite() || self.retry_factor < 1.0 || self.retry_factor > 1000.0 {
            return Err(format!("dispatch.retry_factor must be in [1, 1000] (got {})", self.retry_factor));
        }
        if self.retry_initial_ms > self.retry_max_ms {
            return Err(format!(
                "dispatch.retry_initial_ms ({}) exceeds retry_max_ms ({})",
                self.retry_initial_ms, self.retry_max_ms
            ));
        }
        if self.rate_limit_backoff_ms > self.rate_limit_max_ms {
            return Err(format!(
                "dispatch.rate_limit_backoff_ms ({}) exceeds rate_limit_max_ms ({})",
                self.rate_limit_backoff_ms, self.rate_limit_max_ms
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err("dispatch.request_timeout_ms must be > 0".into());
        }
        if self.page_limit == 0 {
            return Err("dispatch.page_limit must be > 0".into());
        }
        Ok(())
    }

    /// Millisecond-scale waits for tests
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            retry_initial_ms: 1,
            retry_max_ms: 5,
            rate_limit_backoff_ms: 2,
            rate_limit_max_ms: 10,
            request_timeout_ms: 1000,
            normal_max_retries: 3,
            ..Self::default()
        }
    }
}

/// Where the two output backends and the rate state live.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Directory holding one append-only CSV log per operation
    #[serde(default = "default_csv_dir")]
    pub csv_dir: PathBuf,
    /// SQLite connection string for the keyed store (e.g. "sqlite:output/ingest.db")
    #[serde(default = "default_sql_url")]
    pub sql_url: String,
    #[serde(default = "default_sql_max_connections")]
    pub sql_max_connections: u32,
    /// JSON-lines file with per-operation pacing state (None = not persisted)
    #[serde(default = "default_rate_state_path")]
    pub rate_state_path: Option<PathBuf>,
}

fn default_csv_dir() -> PathBuf { PathBuf::from("output/csv") }
fn default_sql_url() -> String { "sqlite:output/ingest.db".into() }
fn default_sql_max_connections() -> u32 { 4 }
fn default_rate_state_path() -> Option<PathBuf> { Some(PathBuf::from("output/rate_state.jsonl")) }

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            csv_dir: default_csv_dir(),
            sql_url: default_sql_url(),
            sql_max_connections: default_sql_max_connections(),
            rate_state_path: default_rate_state_path(),
        }
    }
}
