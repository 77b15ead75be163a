// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Paginated, paced, retrying fetches.
//!
//! [`Dispatcher::fetch_all`] returns a [`PageStream`]: a lazy sequence of
//! [`Batch`]es, one per page, in cursor order. Page N+1 is only requested
//! after page N has been handed out, since its cursor comes from page N's
//! response. The stream ends after the last page or after the first error and
//! cannot be restarted.
//!
//! Per page request:
//!
//! ```text
//! wait delay_for(op) ─► acquire slot ─► call (with timeout)
//!        ▲                                   │
//!        │     RateLimited: record, wait backoff / Retry-After, same page
//!        ├──── Transient / Timeout: record, exponential backoff, same page
//!        │                                   │
//!        │     Permanent / Malformed ──────► FetchFailed (no retry)
//!        │                                   │
//!        └──────────── Success: record, flatten, yield Batch, advance cursor
//! ```

pub mod client;
pub mod simulated;

pub use client::{ApiClient, ApiPage, PageParams};

use crate::config::DispatchConfig;
use crate::error::{ApiError, FetchError};
use crate::flatten::{FlatRow, Flattener};
use crate::metrics;
use crate::rate::{Outcome, RateController};
use crate::registry::{OperationDescriptor, StrategyRegistry};
use crate::resilience::retry::Backoff;
use futures::Stream;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, instrument, warn};

/// One page of one operation, flattened. The unit of write atomicity.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub operation: String,
    /// Request parameters that produced this page
    pub page: PageParams,
    pub rows: Vec<FlatRow>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Issues page requests for registered operations.
///
/// Cheap to clone; clones share the client, pacing state and the in-flight bound.
#[derive(Clone)]
pub struct Dispatcher {
    client: Arc<dyn ApiClient>,
    registry: Arc<StrategyRegistry>,
    controller: Arc<RateController>,
    config: DispatchConfig,
    in_flight: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn ApiClient>,
        registry: Arc<StrategyRegistry>,
        controller: Arc<RateController>,
        config: DispatchConfig,
    ) -> Self {
        let in_flight = Arc::new(Semaphore::new(config.concurrency()));
        Self {
            client,
            registry,
            controller,
            config,
            in_flight,
        }
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<RateController> {
        &self.controller
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.registry
    }

    /// Start fetching every page of `operation`.
    ///
    /// Fails before any request if `operation` has no registered strategy.
    pub fn fetch_all(&self, operation: &str, query: BTreeMap<String, String>) -> Result<PageStream, FetchError> {
        let descriptor = self.registry.get(operation)?;
        let flattener = Flattener::new(descriptor.flatten.clone());
        let first = PageParams::first(query, self.config.page_limit);
        debug!(operation = %operation, limit = first.limit, "Starting paginated fetch");

        Ok(PageStream {
            dispatcher: self.clone(),
            descriptor,
            flattener,
            next: Some(first),
            pages: 0,
        })
    }

    /// Request one page, retrying in place until it succeeds or the error is final.
    #[instrument(skip(self, descriptor), fields(operation = %descriptor.name, page = params.page))]
    async fn fetch_page(&self, descriptor: &OperationDescriptor, params: &PageParams) -> Result<ApiPage, FetchError> {
        let operation = descriptor.name.as_str();
        let request_timeout = self.config.request_timeout();
        let max_retries = self.config.max_retries();
        let max_rate_limit_retries = self.config.max_rate_limit_retries();
        let mut backoff = Backoff::new(&self.config.retry_config());
        let mut rate_limit_backoff = Backoff::new(&self.config.rate_limit_config());

        let mut attempts = 0usize;
        let mut failures = 0usize;
        let mut rate_limits = 0usize;

        loop {
            let delay = self.controller.delay_for(operation);
            if !delay.is_zero() {
                sleep(delay).await;
            }

            let result = {
                let _slot = self
                    .in_flight
                    .acquire()
                    .await
                    .map_err(|_| self.failed(descriptor, params, attempts, ApiError::Transient("dispatcher closed".into())))?;
                attempts += 1;
                let started = Instant::now();
                let result = match timeout(request_timeout, self.client.call(operation, params)).await {
                    Ok(result) => result,
                    Err(_) => Err(ApiError::Timeout(request_timeout)),
                };
                let latency = started.elapsed();
                metrics::record_request_latency(operation, latency);
                (result, latency)
            };

            match result {
                (Ok(page), latency) => {
                    metrics::record_request(operation, "success");
                    self.controller.record_outcome(operation, latency, Outcome::Success).await;
                    debug!(records = page.records.len(), latency_ms = latency.as_millis() as u64, "Page received");
                    return Ok(page);
                }
                (Err(cause), latency) => {
                    metrics::record_request(operation, cause.kind());
                    match &cause {
                        ApiError::RateLimited { retry_after } => {
                            let next_delay = self.controller.record_outcome(operation, latency, Outcome::RateLimited).await;
                            rate_limits += 1;
                            if rate_limits > max_rate_limit_retries {
                                return Err(self.failed(descriptor, params, attempts, cause));
                            }
                            let wait = rate_limit_backoff
                                .next_delay()
                                .max(retry_after.unwrap_or_default())
                                .max(next_delay);
                            metrics::record_retry(operation, cause.kind());
                            warn!(
                                attempt = rate_limits,
                                wait_ms = wait.as_millis() as u64,
                                pacing_ms = next_delay.as_millis() as u64,
                                "Rate limited, retrying same page"
                            );
                            sleep(wait).await;
                        }
                        ApiError::Transient(_) | ApiError::Timeout(_) => {
                            self.controller.record_outcome(operation, latency, Outcome::TransientError).await;
                            failures += 1;
                            if failures > max_retries {
                                return Err(self.failed(descriptor, params, attempts, cause));
                            }
                            let wait = backoff.next_delay();
                            metrics::record_retry(operation, cause.kind());
                            warn!(
                                attempt = failures,
                                max_retries,
                                wait_ms = wait.as_millis() as u64,
                                error = %cause,
                                "Transient upstream error, retrying same page"
                            );
                            sleep(wait).await;
                        }
                        ApiError::Permanent { .. } | ApiError::Malformed(_) => {
                            return Err(self.failed(descriptor, params, attempts, cause));
                        }
                    }
                }
            }
        }
    }

    fn failed(&self, descriptor: &OperationDescriptor, params: &PageParams, attempts: usize, cause: ApiError) -> FetchError {
        metrics::record_fetch_failed(&descriptor.name, cause.kind());
        error!(
            operation = %descriptor.name,
            page = %params,
            attempts,
            error = %cause,
            "Fetch abandoned"
        );
        FetchError::FetchFailed {
            operation: descriptor.name.clone(),
            page: params.clone(),
            attempts,
            cause,
        }
    }
}

/// Lazy, finite, non-restartable sequence of pages for one operation.
pub struct PageStream {
    dispatcher: Dispatcher,
    descriptor: Arc<OperationDescriptor>,
    flattener: Flattener,
    next: Option<PageParams>,
    pages: usize,
}

impl PageStream {
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.descriptor.name
    }

    #[must_use]
    pub fn descriptor(&self) -> &Arc<OperationDescriptor> {
        &self.descriptor
    }

    /// Pages yielded so far.
    #[must_use]
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Whether the stream has ended (last page reached or an error was returned).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.next.is_none()
    }

    /// Fetch the next page. `None` once the stream has ended.
    pub async fn next_batch(&mut self) -> Option<Result<Batch, FetchError>> {
        let params = self.next.take()?;
        let page = match self.dispatcher.fetch_page(&self.descriptor, &params).await {
            Ok(page) => page,
            Err(e) => return Some(Err(e)),
        };

        if let Some(cursor) = page.next_cursor.as_ref() {
            if params.cursor.as_ref() == Some(cursor) {
                let cause = ApiError::Malformed(format!("cursor '{}' did not advance", cursor));
                return Some(Err(self.dispatcher.failed(&self.descriptor, &params, 1, cause)));
            }
        }

        let rows = self.flattener.flatten_page(&page.records);
        self.pages += 1;
        metrics::record_page(&self.descriptor.name, rows.len());
        self.next = page.next_cursor.map(|cursor| params.advance(cursor));

        Some(Ok(Batch {
            operation: self.descriptor.name.clone(),
            page: params,
            rows,
        }))
    }

    /// Adapt into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<Batch, FetchError>> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next_batch().await.map(|item| (item, stream))
        })
    }
}
