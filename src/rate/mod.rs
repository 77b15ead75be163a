// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Adaptive per-operation request pacing.
//!
//! Each operation owns a [`RateState`]: the delay to wait before its next
//! call, the highest delay known to be rate limited (`learned_baseline`),
//! and a short outcome history. Outcomes feed a proportional loop:
//!
//! - **RateLimited**: baseline rises to the current delay, delay is multiplied
//!   by `backoff_factor` (clamped to `max_delay`).
//! - **Success** within `target_latency`, after `success_streak` in a row:
//!   delay moves `decrease_fraction` of the way down to
//!   `baseline * (1 + baseline_headroom)` (clamped to `min_delay`).
//! - **TransientError**: delay untouched; the dispatcher's own backoff handles it.
//!
//! Every rate-limited outcome raises the floor by at least the headroom
//! factor, so the delay settles just above the remote limit after a bounded
//! number of throttled calls. Operations never share state.
//!
//! Remote limits move. After `baseline_relax_after` fast successes with the
//! delay resting on its floor, the baseline is lowered by
//! `baseline_relax_fraction` and the previous value is kept in
//! `relaxed_from`. If the lower floor holds, the next relaxation follows; if
//! it is throttled, the delay returns to the last floor that held instead of
//! backing off multiplicatively.
//!
//! # Example
//!
//! ```
//! use ingest_engine::rate::{RateController, Outcome};
//! use ingest_engine::rate::store::MemoryStateStore;
//! use ingest_engine::RateConfig;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let controller = RateController::new(RateConfig::default(), Arc::new(MemoryStateStore::new())).await;
//! assert_eq!(controller.delay_for("listOrgSites"), Duration::from_secs(1));
//!
//! controller.record_outcome("listOrgSites", Duration::from_millis(80), Outcome::RateLimited).await;
//! assert_eq!(controller.delay_for("listOrgSites"), Duration::from_secs(2));
//! # }
//! ```

pub mod store;

use crate::config::RateConfig;
use crate::metrics;
use crate::storage::traits::StorageError;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::RateStateStore;
use tracing::{debug, info, warn};

/// Result class of one upstream call, as seen by the pacing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    RateLimited,
    TransientError,
}

impl Outcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RateLimited => "rate_limited",
            Self::TransientError => "transient_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub latency_ms: u64,
    pub outcome: Outcome,
}

/// Pacing state of one operation. Delays are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateState {
    pub operation: String,
    pub current_delay: f64,
    #[serde(default)]
    pub learned_baseline: f64,
    #[serde(default)]
    pub recent_outcome_history: VecDeque<OutcomeRecord>,
    #[serde(default)]
    pub consecutive_successes: u32,
    /// Baseline before the latest relaxation, until that relaxation is confirmed or refuted
    #[serde(default)]
    pub relaxed_from: Option<f64>,
}

impl RateState {
    pub fn new(operation: impl Into<String>, current_delay: f64) -> Self {
        Self {
            operation: operation.into(),
            current_delay,
            learned_baseline: 0.0,
            recent_outcome_history: VecDeque::new(),
            consecutive_successes: 0,
            relaxed_from: None,
        }
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.current_delay.max(0.0))
    }

    /// Repair a state read from disk, or reject it if the delay is unusable.
    fn sanitized(mut self, config: &RateConfig) -> Option<Self> {
        if !self.current_delay.is_finite() || self.current_delay <= 0.0 || self.operation.is_empty() {
            return None;
        }
        self.current_delay = self.current_delay.clamp(config.min_delay_secs(), config.max_delay_secs());
        if !self.learned_baseline.is_finite() || self.learned_baseline < 0.0 {
            self.learned_baseline = 0.0;
        }
        self.relaxed_from = self.relaxed_from.filter(|b| b.is_finite() && *b >= 0.0);
        while self.recent_outcome_history.len() > config.history_len {
            self.recent_outcome_history.pop_front();
        }
        Some(self)
    }

    /// Apply one outcome under `config`'s feedback rule.
    pub fn apply(&mut self, config: &RateConfig, latency: Duration, outcome: Outcome) {
        self.recent_outcome_history.push_back(OutcomeRecord {
            latency_ms: latency.as_millis().min(u128::from(u64::MAX)) as u64,
            outcome,
        });
        while self.recent_outcome_history.len() > config.history_len {
            self.recent_outcome_history.pop_front();
        }

        let min = config.min_delay_secs();
        let max = config.max_delay_secs();
        let headroom = 1.0 + config.baseline_headroom;

        match outcome {
            Outcome::RateLimited => {
                self.consecutive_successes = 0;
                match self.relaxed_from.take() {
                    // The lowered floor was too low: go back to the one that held
                    Some(previous) => {
                        self.learned_baseline = previous.max(self.current_delay);
                        self.current_delay = (self.learned_baseline * headroom).clamp(min, max);
                    }
                    None => {
                        self.learned_baseline = self.learned_baseline.max(self.current_delay);
                        self.current_delay = (self.current_delay * config.backoff_factor).clamp(min, max);
                    }
                }
            }
            Outcome::Success if latency <= config.target_latency() => {
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                let floor = (self.learned_baseline * headroom).clamp(min, max);
                if self.consecutive_successes >= config.success_streak && self.current_delay > floor {
                    let step = config.decrease_fraction * (self.current_delay - floor);
                    self.current_delay = (self.current_delay - step).max(floor);
                }
                if self.relax_due(config, floor) {
                    self.relaxed_from = Some(self.learned_baseline);
                    self.learned_baseline *= 1.0 - config.baseline_relax_fraction;
                    self.consecutive_successes = 0;
                }
            }
            // Slow success: hold the delay and restart the streak
            Outcome::Success => self.consecutive_successes = 0,
            Outcome::TransientError => {}
        }
    }

    /// Long enough on a floor that still sits above `min_delay`.
    fn relax_due(&self, config: &RateConfig, floor: f64) -> bool {
        config.baseline_relax_after > 0
            && config.baseline_relax_fraction > 0.0
            && self.consecutive_successes >= config.baseline_relax_after
            && self.learned_baseline * (1.0 + config.baseline_headroom) > config.min_delay_secs()
            && self.current_delay <= floor * 1.01
    }
}

/// Shared, per-operation pacing controller.
pub struct RateController {
    config: RateConfig,
    states: DashMap<String, Arc<Mutex<RateState>>>,
    store: Arc<dyn RateStateStore>,
    /// Serializes flushes so snapshots land in order
    flush_lock: tokio::sync::Mutex<()>,
    last_flush: Mutex<Instant>,
    dirty: AtomicBool,
}

impl RateController {
    /// Build a controller and load persisted state. Never fails: an
    /// unreadable store means every operation starts from the default delay.
    pub async fn new(config: RateConfig, store: Arc<dyn RateStateStore>) -> Self {
        let states = DashMap::new();

        match store.load().await {
            Ok(loaded) => {
                let total = loaded.len();
                for state in loaded {
                    let operation = state.operation.clone();
                    match state.sanitized(&config) {
                        Some(state) => {
                            metrics::set_rate_delay(&operation, state.current_delay);
                            states.insert(operation, Arc::new(Mutex::new(state)));
                        }
                        None => warn!(operation = %operation, "Discarding invalid persisted rate state"),
                    }
                }
                info!(loaded = states.len(), total, "Rate state loaded");
            }
            Err(e) => {
                warn!(error = %e, "Rate state unreadable, starting from default delays");
            }
        }

        Self {
            config,
            states,
            store,
            flush_lock: tokio::sync::Mutex::new(()),
            last_flush: Mutex::new(Instant::now()),
            dirty: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RateConfig {
        &self.config
    }

    /// Current delay before the next call to `operation`. Pure read.
    #[must_use]
    pub fn delay_for(&self, operation: &str) -> Duration {
        match self.states.get(operation) {
            Some(entry) => entry.value().lock().delay(),
            None => self.config.initial_delay(),
        }
    }

    /// Copy of the state of `operation`, if it has been used or loaded.
    #[must_use]
    pub fn snapshot(&self, operation: &str) -> Option<RateState> {
        self.states.get(operation).map(|entry| entry.value().lock().clone())
    }

    fn state_handle(&self, operation: &str) -> Arc<Mutex<RateState>> {
        if let Some(entry) = self.states.get(operation) {
            return entry.value().clone();
        }
        let initial = self.config.initial_delay().as_secs_f64();
        self.states
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RateState::new(operation, initial))))
            .value()
            .clone()
    }

    /// Feed one call's outcome into the loop and return the new delay.
    pub async fn record_outcome(&self, operation: &str, latency: Duration, outcome: Outcome) -> Duration {
        let handle = self.state_handle(operation);
        let (before, after) = {
            let mut state = handle.lock();
            let before = state.current_delay;
            state.apply(&self.config, latency, outcome);
            (before, state.current_delay)
        };

        if (after - before).abs() > f64::EPSILON {
            debug!(
                operation = %operation,
                outcome = outcome.as_str(),
                from_ms = (before * 1000.0) as u64,
                to_ms = (after * 1000.0) as u64,
                "Pacing delay adjusted"
            );
            metrics::set_rate_delay(operation, after);
        }
        self.dirty.store(true, Ordering::Release);

        if self.flush_due() {
            if let Err(e) = self.flush().await {
                warn!(operation = %operation, error = %e, "Rate state flush failed, will retry on next update");
            }
        }

        Duration::from_secs_f64(after)
    }

    fn flush_due(&self) -> bool {
        match self.config.flush_interval() {
            None => true,
            Some(interval) => self.last_flush.lock().elapsed() >= interval,
        }
    }

    /// Write every operation's state to the store if anything changed.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let _guard = self.flush_lock.lock().await;
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let mut snapshot: Vec<RateState> = self
            .states
            .iter()
            .map(|entry| entry.value().lock().clone())
            .collect();
        snapshot.sort_by(|a, b| a.operation.cmp(&b.operation));

        if let Err(e) = self.store.save(&snapshot).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        *self.last_flush.lock() = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::store::MemoryStateStore;
    use super::*;

    fn fast() -> Duration {
        Duration::from_millis(10)
    }

    async fn controller(config: RateConfig) -> (RateController, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        (RateController::new(config, store.clone()).await, store)
    }

    #[tokio::test]
    async fn test_unknown_operation_uses_initial_delay_without_side_effect() {
        let (controller, _) = controller(RateConfig::default()).await;
        assert_eq!(controller.delay_for("x"), Duration::from_millis(1000));
        assert!(controller.snapshot("x").is_none());
    }

    #[tokio::test]
    async fn test_rate_limited_multiplies_and_clamps() {
        let config = RateConfig { max_delay_ms: 3000, ..RateConfig::default() };
        let (controller, _) = controller(config).await;

        assert_eq!(controller.record_outcome("op", fast(), Outcome::RateLimited).await, Duration::from_secs(2));
        assert_eq!(controller.record_outcome("op", fast(), Outcome::RateLimited).await, Duration::from_secs(3));
        assert_eq!(controller.snapshot("op").unwrap().learned_baseline, 2.0);
    }

    #[tokio::test]
    async fn test_success_streak_required_before_decrease() {
        let (controller, _) = controller(RateConfig::default()).await;

        controller.record_outcome("op", fast(), Outcome::Success).await;
        controller.record_outcome("op", fast(), Outcome::Success).await;
        assert_eq!(controller.delay_for("op"), Duration::from_secs(1));

        let after = controller.record_outcome("op", fast(), Outcome::Success).await;
        assert!(after < Duration::from_secs(1));
        // Gap to the 50ms floor shrinks by 10%
        let expected = 1.0 - 0.1 * (1.0 - 0.05);
        assert!((after.as_secs_f64() - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_slow_success_holds_delay() {
        let config = RateConfig { success_streak: 1, ..RateConfig::default() };
        let (controller, _) = controller(config).await;
        controller.record_outcome("op", Duration::from_secs(5), Outcome::Success).await;
        assert_eq!(controller.delay_for("op"), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_transient_error_leaves_delay_unchanged() {
        let (controller, _) = controller(RateConfig::default()).await;
        controller.record_outcome("op", fast(), Outcome::RateLimited).await;
        let before = controller.delay_for("op");
        controller.record_outcome("op", fast(), Outcome::TransientError).await;
        assert_eq!(controller.delay_for("op"), before);
    }

    #[tokio::test]
    async fn test_decrease_never_crosses_learned_floor() {
        let config = RateConfig {
            success_streak: 1,
            decrease_fraction: 0.5,
            baseline_relax_after: 0,
            ..RateConfig::default()
        };
        let (controller, _) = controller(config).await;
        controller.record_outcome("op", fast(), Outcome::RateLimited).await; // baseline 1.0, delay 2.0
        for _ in 0..200 {
            controller.record_outcome("op", fast(), Outcome::Success).await;
        }
        let delay = controller.delay_for("op").as_secs_f64();
        assert!(delay >= 1.05 - 1e-9, "delay {delay} fell below floor");
        assert!(delay < 1.06);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let config = RateConfig { history_len: 4, ..RateConfig::default() };
        let (controller, _) = controller(config).await;
        for _ in 0..10 {
            controller.record_outcome("op", fast(), Outcome::TransientError).await;
        }
        assert_eq!(controller.snapshot("op").unwrap().recent_outcome_history.len(), 4);
    }

    #[tokio::test]
    async fn test_operations_are_independent() {
        let (controller, _) = controller(RateConfig::default()).await;
        controller.record_outcome("a", fast(), Outcome::RateLimited).await;
        assert_eq!(controller.delay_for("a"), Duration::from_secs(2));
        assert_eq!(controller.delay_for("b"), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_every_update_flushes_by_default() {
        let (controller, store) = controller(RateConfig::default()).await;
        controller.record_outcome("a", fast(), Outcome::RateLimited).await;
        controller.record_outcome("b", fast(), Outcome::Success).await;
        assert_eq!(store.save_count(), 2);
        let saved = store.saved();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].operation, "a");
        assert_eq!(saved[0].current_delay, 2.0);
    }

    #[tokio::test]
    async fn test_interval_flush_batches_updates() {
        let config = RateConfig { flush_interval_ms: 60_000, ..RateConfig::default() };
        let (controller, store) = controller(config).await;
        for _ in 0..5 {
            controller.record_outcome("a", fast(), Outcome::Success).await;
        }
        assert_eq!(store.save_count(), 0);
        controller.flush().await.unwrap();
        assert_eq!(store.save_count(), 1);
        // Nothing changed since: no second write
        controller.flush().await.unwrap();
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_resumes_from_persisted_state() {
        let mut persisted = RateState::new("listOrgSites", 0.3);
        persisted.learned_baseline = 0.25;
        let store = Arc::new(MemoryStateStore::with_states(vec![
            persisted,
            RateState::new("broken", f64::NAN),
            RateState::new("too_slow", 1e9),
        ]));
        let controller = RateController::new(RateConfig::default(), store).await;

        assert_eq!(controller.delay_for("listOrgSites"), Duration::from_millis(300));
        assert_eq!(controller.snapshot("listOrgSites").unwrap().learned_baseline, 0.25);
        assert_eq!(controller.delay_for("broken"), Duration::from_secs(1));
        assert_eq!(controller.delay_for("too_slow"), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_converges_to_simulated_threshold() {
        let config = RateConfig {
            min_delay_ms: 10,
            max_delay_ms: 10_000,
            decrease_fraction: 0.2,
            success_streak: 1,
            baseline_relax_after: 0,
            ..RateConfig::default()
        };
        let (controller, _) = controller(config).await;
        let threshold = 0.5;

        for _ in 0..1000 {
            let delay = controller.delay_for("op").as_secs_f64();
            let outcome = if delay < threshold { Outcome::RateLimited } else { Outcome::Success };
            controller.record_outcome("op", fast(), outcome).await;
        }

        let delay = controller.delay_for("op").as_secs_f64();
        assert!(delay >= threshold, "settled below threshold: {delay}");
        assert!(delay <= threshold * 1.1, "settled too far above threshold: {delay}");
    }

    fn loosening_config() -> RateConfig {
        RateConfig {
            min_delay_ms: 10,
            max_delay_ms: 10_000,
            decrease_fraction: 0.2,
            success_streak: 1,
            ..RateConfig::default()
        }
    }

    /// Calls with a delay under `threshold` are throttled. Returns the number throttled.
    async fn drive(controller: &RateController, threshold: f64, calls: usize) -> usize {
        let mut throttled = 0;
        for _ in 0..calls {
            let outcome = if controller.delay_for("op").as_secs_f64() < threshold {
                throttled += 1;
                Outcome::RateLimited
            } else {
                Outcome::Success
            };
            controller.record_outcome("op", fast(), outcome).await;
        }
        throttled
    }

    #[tokio::test]
    async fn test_baseline_relaxes_when_limit_loosens() {
        let (controller, _) = controller(loosening_config()).await;

        drive(&controller, 2.0, 500).await;
        let delay = controller.delay_for("op").as_secs_f64();
        assert!((delay - 2.0).abs() <= 0.2, "did not settle near 2s: {delay}");

        drive(&controller, 0.1, 5000).await;
        let delay = controller.delay_for("op").as_secs_f64();
        assert!((delay - 0.1).abs() <= 0.01, "stuck at {delay} after the limit dropped to 100ms");
        assert!(controller.snapshot("op").unwrap().learned_baseline < 0.11);
    }

    #[tokio::test]
    async fn test_refuted_relaxation_returns_to_last_good_floor() {
        let config = loosening_config();
        let relax_after = config.baseline_relax_after as usize;
        let (controller, _) = controller(config).await;
        let threshold = 0.5;
        drive(&controller, threshold, 500).await;

        let mut throttled = 0;
        for _ in 0..3000 {
            throttled += drive(&controller, threshold, 1).await;
            let delay = controller.delay_for("op").as_secs_f64();
            assert!((delay - threshold).abs() <= threshold * 0.1, "left the band: {delay}");
        }
        // At most one throttled call per relaxation
        assert!(throttled <= 3000 / relax_after + 1, "throttled {throttled} times");
    }

    #[tokio::test]
    async fn test_relaxation_waits_for_the_floor() {
        let config = RateConfig {
            success_streak: 1,
            decrease_fraction: 0.5,
            baseline_relax_after: 5,
            ..RateConfig::default()
        };
        let (controller, _) = controller(config).await;
        controller.record_outcome("op", fast(), Outcome::RateLimited).await; // baseline 1.0, delay 2.0

        for _ in 0..4 {
            controller.record_outcome("op", fast(), Outcome::Success).await;
        }
        let state = controller.snapshot("op").unwrap();
        assert_eq!(state.learned_baseline, 1.0);
        assert!(state.relaxed_from.is_none());

        // 2.0 -> 1.525 -> 1.2875 -> 1.169 -> 1.109 -> 1.080 -> 1.065 -> 1.057: within 1% of the 1.05s floor
        for _ in 0..3 {
            controller.record_outcome("op", fast(), Outcome::Success).await;
        }
        let state = controller.snapshot("op").unwrap();
        assert_eq!(state.relaxed_from, Some(1.0));
        assert!((state.learned_baseline - 0.95).abs() < 1e-9);
        assert_eq!(state.consecutive_successes, 0);

        controller.record_outcome("op", fast(), Outcome::Success).await;
        controller.record_outcome("op", fast(), Outcome::Success).await;
        let throttled_at = controller.delay_for("op").as_secs_f64();
        assert!(throttled_at < 1.05);

        // Throttled under the old floor: back to it, no multiplicative jump
        controller.record_outcome("op", fast(), Outcome::RateLimited).await;
        let state = controller.snapshot("op").unwrap();
        assert!(state.relaxed_from.is_none());
        assert!((state.learned_baseline - throttled_at.max(1.0)).abs() < 1e-6);
        assert!((state.current_delay - state.learned_baseline * 1.05).abs() < 1e-6);
        assert!(state.current_delay < throttled_at * 1.1);
    }
}
