// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable home of the per-operation pacing state.
//!
//! The file format is JSON lines, one [`RateState`] per line:
//!
//! ```text
//! {"operation":"listOrgSites","current_delay":0.42,"learned_baseline":0.4,"recent_outcome_history":[...]}
//! ```
//!
//! Unknown fields are ignored. A line that fails to parse (truncated write,
//! manual edit) only costs that operation its learned state; the others load.

use super::RateState;
use crate::storage::traits::StorageError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Injectable persistence for [`RateController`](super::RateController).
#[async_trait]
pub trait RateStateStore: Send + Sync {
    /// Load every readable entry. Unreadable entries are skipped, not fatal.
    async fn load(&self) -> Result<Vec<RateState>, StorageError>;

    /// Replace the stored set with `states`.
    async fn save(&self, states: &[RateState]) -> Result<(), StorageError>;
}

/// JSON-lines file, rewritten atomically (temp file + rename) on every save.
pub struct JsonLinesStateStore {
    path: PathBuf,
}

impl JsonLinesStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Parse JSON lines, skipping (and logging) lines that do not decode.
pub fn parse_lines(text: &str) -> Vec<RateState> {
    let mut states = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RateState>(line) {
            Ok(state) => states.push(state),
            Err(e) => warn!(line = i + 1, error = %e, "Skipping unreadable rate-state entry"),
        }
    }
    states
}

#[async_trait]
impl RateStateStore for JsonLinesStateStore {
    async fn load(&self) -> Result<Vec<RateState>, StorageError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No rate-state file yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        // Lossy so a single mangled byte does not discard every entry
        let text = String::from_utf8_lossy(&bytes);
        Ok(parse_lines(&text))
    }

    async fn save(&self, states: &[RateState]) -> Result<(), StorageError> {
        let mut body = String::new();
        for state in states {
            body.push_str(&serde_json::to_string(state)?);
            body.push('\n');
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.temp_path();
        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            tokio::io::AsyncWriteExt::write_all(&mut file, body.as_bytes()).await?;
            file.sync_data().await?;
        }
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), entries = states.len(), "Rate state flushed");
        Ok(())
    }
}

/// Process-local store; nothing survives the process. Also the test double.
#[derive(Default)]
pub struct MemoryStateStore {
    states: Mutex<Vec<RateState>>,
    saves: AtomicU64,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeded store, as if a previous process had saved `states`.
    #[must_use]
    pub fn with_states(states: Vec<RateState>) -> Self {
        Self {
            states: Mutex::new(states),
            saves: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn saved(&self) -> Vec<RateState> {
        self.states.lock().clone()
    }

    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RateStateStore for MemoryStateStore {
    async fn load(&self) -> Result<Vec<RateState>, StorageError> {
        Ok(self.states.lock().clone())
    }

    async fn save(&self, states: &[RateState]) -> Result<(), StorageError> {
        *self.states.lock() = states.to_vec();
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn state(op: &str, delay: f64) -> RateState {
        RateState::new(op, delay)
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = JsonLinesStateStore::new(dir.path().join("absent.jsonl"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = JsonLinesStateStore::new(dir.path().join("nested/rate.jsonl"));
        store.save(&[state("a", 0.5), state("b", 2.0)]).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].operation, "a");
        assert_eq!(loaded[1].current_delay, 2.0);
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_corrupt_line_only_drops_that_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rate.jsonl");
        let good = serde_json::to_string(&state("good", 0.3)).unwrap();
        let text = format!("{}\n{{\"operation\":\"bad\",\"current_de\n", good);
        std::fs::write(&path, text).unwrap();

        let loaded = JsonLinesStateStore::new(&path).load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].operation, "good");
    }

    #[tokio::test]
    async fn test_unknown_fields_ignored() {
        let text = r#"{"operation":"x","current_delay":1.5,"future_field":{"a":1}}"#;
        let loaded = parse_lines(text);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].current_delay, 1.5);
        assert_eq!(loaded[0].learned_baseline, 0.0);
        assert!(loaded[0].recent_outcome_history.is_empty());
    }

    #[tokio::test]
    async fn test_binary_garbage_is_tolerated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rate.jsonl");
        let good = serde_json::to_string(&state("ok", 0.7)).unwrap();
        let mut bytes = vec![0xff, 0xfe, 0x00, b'\n'];
        bytes.extend_from_slice(good.as_bytes());
        std::fs::write(&path, bytes).unwrap();

        let loaded = JsonLinesStateStore::new(&path).load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].operation, "ok");
    }

    #[tokio::test]
    async fn test_memory_store_counts_saves() {
        let store = MemoryStateStore::new();
        store.save(&[state("a", 1.0)]).await.unwrap();
        store.save(&[state("a", 2.0)]).await.unwrap();
        assert_eq!(store.save_count(), 2);
        assert_eq!(store.load().await.unwrap()[0].current_delay, 2.0);
    }
}
