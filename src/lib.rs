//! # Ingest Engine
//!
//! Rate-adaptive, paginated ingestion of list/search API operations into two
//! idempotent outputs: an append-only CSV log and a keyed SQLite store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      IngestEngine                           │
//! │  • Validates every job against the strategy registry       │
//! │  • Runs operations on a bounded worker pool                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Dispatcher                            │
//! │  • Cursor pagination, one Batch per page                   │
//! │  • Pacing from the RateController before each request      │
//! │  • Retries rate limits and transient errors                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                     (Flattener: JSON → FlatRow)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      UpsertWriter                           │
//! │  • CSV log: one file per operation, grows its header       │
//! │  • SQLite: one table per operation, upsert by strategy     │
//! │  • Backends fail independently                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ingest_engine::{IngestEngine, IngestConfig, StrategyRegistry, SyncJob};
//! use ingest_engine::dispatch::simulated::SimulatedApi;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let api = SimulatedApi::new()
//!         .with_dataset("listOrgSites", vec![json!({"id": "s-1", "name": "HQ"})]);
//!     let registry = StrategyRegistry::network_defaults().expect("catalogue");
//!
//!     let engine = IngestEngine::open(IngestConfig::default(), registry, Arc::new(api))
//!         .await
//!         .expect("Failed to open");
//!
//!     let reports = engine
//!         .sync_all(vec![SyncJob::new("listOrgSites")], None)
//!         .await
//!         .expect("unregistered operation");
//!     assert!(reports[0].is_success());
//!
//!     engine.shutdown().await.expect("Failed to flush rate state");
//! }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: The [`IngestEngine`] orchestrating all components
//! - [`dispatch`]: Paginated fetches and the [`ApiClient`] seam
//! - [`rate`]: Per-operation adaptive pacing with persisted state
//! - [`registry`]: Primary-key strategy per operation
//! - [`flatten`]: Nested JSON records to flat rows
//! - [`writer`]: Dual-backend batch persistence
//! - [`storage`]: CSV log, SQLite and in-memory backends
//! - [`resilience`]: Retry and backoff

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod flatten;
pub mod metrics;
pub mod rate;
pub mod registry;
pub mod resilience;
pub mod storage;
pub mod writer;

pub use config::{DispatchConfig, DispatchMode, IngestConfig, OutputConfig, RateConfig};
pub use dispatch::{ApiClient, ApiPage, Batch, Dispatcher, PageParams, PageStream};
pub use engine::{IngestEngine, SyncJob, SyncReport};
pub use error::{ApiError, ConfigError, EngineError, FetchError, PersistenceError};
pub use flatten::{ArrayPolicy, FlatRow, FlattenConfig, Flattener, Scalar};
pub use metrics::LatencyTimer;
pub use rate::{Outcome, RateController, RateState};
pub use registry::{OperationDescriptor, PrimaryKeyStrategy, StrategyRegistry};
pub use resilience::retry::RetryConfig;
pub use storage::{BatchSink, BatchWriteResult, CsvLog, KeyedRow, KeyedStore, MemoryStore, SqlStore, StorageError};
pub use writer::{UpsertWriter, WriteReport};
