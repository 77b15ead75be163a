//! Output backends: the append-only CSV log and the keyed stores.

pub mod csv_log;
pub mod memory;
pub mod sql;
pub mod traits;

pub use csv_log::CsvLog;
pub use memory::MemoryStore;
pub use sql::SqlStore;
pub use traits::{BatchSink, BatchWriteResult, KeyedRow, KeyedStore, StorageError};
