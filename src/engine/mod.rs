// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ingest engine coordinator.
//!
//! The [`IngestEngine`] ties the components together:
//! - [`StrategyRegistry`]: validated before any request goes out
//! - [`RateController`]: shared pacing state, persisted
//! - [`Dispatcher`]: paginated fetch per operation
//! - [`UpsertWriter`]: every page to the CSV log and the keyed store
//!
//! # Flow
//!
//! ```text
//! sync_all(jobs) ─► validate all ─► bounded pool ─► sync_operation(job) per worker
//!                                                      │
//!                     ┌────────────────────────────────┘
//!                     ▼
//!        fetch_all ─► next_batch ─► write_batch ─► (cancelled?) ─► next_batch ...
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use ingest_engine::{IngestEngine, IngestConfig, StrategyRegistry, SyncJob};
//! use ingest_engine::dispatch::simulated::SimulatedApi;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let client = Arc::new(SimulatedApi::new());
//! let registry = StrategyRegistry::network_defaults().expect("catalogue is valid");
//! let engine = IngestEngine::open(IngestConfig::default(), registry, client).await.expect("open failed");
//!
//! let reports = engine
//!     .sync_all(vec![SyncJob::new("listOrgSites")], None)
//!     .await
//!     .expect("unknown operation");
//! for report in &reports {
//!     println!("{}", report);
//! }
//! engine.shutdown().await.expect("rate state flush failed");
//! # }
//! ```

mod types;

pub use types::{SyncJob, SyncReport};

use crate::config::{DispatchConfig, IngestConfig};
use crate::dispatch::{ApiClient, Dispatcher};
use crate::error::{ConfigError, EngineError, FetchError};
use crate::metrics;
use crate::rate::store::{JsonLinesStateStore, MemoryStateStore, RateStateStore};
use crate::rate::RateController;
use crate::registry::StrategyRegistry;
use crate::storage::csv_log::CsvLog;
use crate::storage::sql::SqlStore;
use crate::storage::traits::{BatchSink, KeyedStore, StorageError};
use crate::writer::{UpsertWriter, WriteReport};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Main ingest coordinator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct IngestEngine {
    registry: Arc<StrategyRegistry>,
    controller: Arc<RateController>,
    dispatcher: Dispatcher,
    writer: UpsertWriter,
    active: Arc<AtomicUsize>,
}

impl IngestEngine {
    /// Build the engine from configuration: load rate state, open the CSV
    /// directory and the SQLite keyed store.
    ///
    /// Fails on invalid tuning or an unopenable keyed store. A missing or
    /// corrupt rate-state file is not an error.
    pub async fn open(
        config: IngestConfig,
        registry: StrategyRegistry,
        client: Arc<dyn ApiClient>,
    ) -> Result<Self, EngineError> {
        let started = Instant::now();
        config.rate.validate().map_err(ConfigError::InvalidConfig)?;
        config.dispatch.validate().map_err(ConfigError::InvalidConfig)?;

        let state_store: Arc<dyn RateStateStore> = match &config.output.rate_state_path {
            Some(path) => Arc::new(JsonLinesStateStore::new(path.clone())),
            None => Arc::new(MemoryStateStore::new()),
        };
        let controller = Arc::new(RateController::new(config.rate.clone(), state_store).await);
        let file = Arc::new(CsvLog::new(config.output.csv_dir.clone()));
        let keyed = Arc::new(SqlStore::new(&config.output.sql_url, config.output.sql_max_connections).await?);

        info!(
            operations = registry.len(),
            mode = ?config.dispatch.mode,
            concurrency = config.dispatch.concurrency(),
            csv_dir = %config.output.csv_dir.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Ingest engine ready"
        );

        Ok(Self::from_parts(
            Arc::new(registry),
            controller,
            client,
            config.dispatch,
            file,
            keyed,
        ))
    }

    /// Assemble from already-built parts (custom backends, shared controller).
    pub fn from_parts(
        registry: Arc<StrategyRegistry>,
        controller: Arc<RateController>,
        client: Arc<dyn ApiClient>,
        dispatch: DispatchConfig,
        file: Arc<dyn BatchSink>,
        keyed: Arc<dyn KeyedStore>,
    ) -> Self {
        let dispatcher = Dispatcher::new(client, registry.clone(), controller.clone(), dispatch);
        let writer = UpsertWriter::new(registry.clone(), file, keyed);
        Self {
            registry,
            controller,
            dispatcher,
            writer,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<RateController> {
        &self.controller
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn writer(&self) -> &UpsertWriter {
        &self.writer
    }

    /// Operations currently being synced.
    #[must_use]
    pub fn active_syncs(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Fail fast if any of `operations` has no registered strategy.
    pub fn validate<'a, I>(&self, operations: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.registry.validate(operations)
    }

    /// Fetch every page of one operation and write each page as it arrives.
    ///
    /// `cancel` is checked between pages only; a request in flight always
    /// completes and its page is written.
    #[instrument(skip(self, job, cancel), fields(operation = %job.operation))]
    pub async fn sync_operation(&self, job: &SyncJob, cancel: Option<&watch::Receiver<bool>>) -> SyncReport {
        let started = Instant::now();
        let mut report = SyncReport::new(&job.operation);
        metrics::set_active_syncs(self.active.fetch_add(1, Ordering::Relaxed) + 1);

        match self.dispatcher.fetch_all(&job.operation, job.params.clone()) {
            Ok(mut stream) => loop {
                if cancel.map_or(false, |rx| *rx.borrow()) {
                    info!(pages = report.pages, "Sync cancelled between pages");
                    report.cancelled = true;
                    break;
                }

                let batch = match stream.next_batch().await {
                    None => break,
                    Some(Err(e)) => {
                        report.error = Some(e);
                        break;
                    }
                    Some(Ok(batch)) => batch,
                };
                report.pages += 1;
                report.rows_fetched += batch.len();

                match self.writer.write_batch(&batch).await {
                    Ok(written) => self.tally(&mut report, written),
                    Err(e) => {
                        report.error = Some(FetchError::Configuration(e));
                        break;
                    }
                }
            },
            Err(e) => report.error = Some(e),
        }

        report.elapsed = started.elapsed();
        metrics::set_active_syncs(self.active.fetch_sub(1, Ordering::Relaxed).saturating_sub(1));
        metrics::record_sync(&job.operation, report.status(), report.elapsed);

        match (&report.error, report.write_failures.is_empty()) {
            (Some(e), _) => warn!(pages = report.pages, error = %e, "Sync ended early"),
            (None, false) => warn!(failures = report.write_failures.len(), "Sync finished with write failures"),
            (None, true) => info!(pages = report.pages, rows = report.rows_fetched, "Sync finished"),
        }
        report
    }

    fn tally(&self, report: &mut SyncReport, written: WriteReport) {
        debug!(batch_id = %written.batch_id, rows = written.rows, "Page written");
        match written.file {
            Ok(result) => report.rows_written_file += result.written,
            Err(e) => report.write_failures.push(e),
        }
        match written.keyed {
            Ok(result) => report.rows_written_keyed += result.written,
            Err(e) => report.write_failures.push(e),
        }
    }

    /// Sync many operations on a bounded pool (the dispatch mode's concurrency).
    ///
    /// Every job is validated before the first request. Reports come back in
    /// job order.
    pub async fn sync_all(
        &self,
        jobs: Vec<SyncJob>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<Vec<SyncReport>, ConfigError> {
        self.validate(jobs.iter().map(|j| j.operation.as_str()))?;

        let total = jobs.len();
        let workers = Arc::new(Semaphore::new(self.dispatcher.config().concurrency()));
        let mut set = JoinSet::new();

        info!(jobs = total, workers = self.dispatcher.config().concurrency(), "Sync run starting");

        for (i, job) in jobs.into_iter().enumerate() {
            let engine = self.clone();
            let workers = workers.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let _slot = workers.acquire_owned().await.ok();
                (i, engine.sync_operation(&job, cancel.as_ref()).await)
            });
        }

        let mut slots: Vec<Option<SyncReport>> = (0..total).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, report)) => slots[i] = Some(report),
                Err(e) => error!(error = %e, "Sync worker died"),
            }
        }

        let reports: Vec<SyncReport> = slots.into_iter().flatten().collect();
        info!(
            jobs = total,
            succeeded = reports.iter().filter(|r| r.is_success()).count(),
            "Sync run finished"
        );
        Ok(reports)
    }

    /// Final flush of the pacing state.
    pub async fn shutdown(&self) -> Result<(), StorageError> {
        info!("Shutting down ingest engine");
        self.controller.flush().await
    }
}
