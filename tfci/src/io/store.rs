//! Durable run history under the state directory.
//!
//! Layout:
//!
//! ```text
//! <state>/
//! ├── config.toml     provisioner settings (optional, see `io::config`)
//! ├── runs.json       index of every RunRecord plus the next id
//! └── logs/
//!     └── <id>.log    combined stdout/stderr of one run
//! ```
//!
//! The index is rewritten whole on every change (temp file + rename). The
//! in-memory copy is swapped only after the rename lands, under a single
//! `RwLock`, so concurrent readers never observe a half-applied change.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{RunId, RunRecord, RunStatus};

/// Errors returned by [`RunStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {0} not found")]
    NotFound(RunId),
    #[error("run {0} already exists")]
    Duplicate(RunId),
    #[error("update of run {id} must not change its id (got {new_id})")]
    IdChanged { id: RunId, new_id: RunId },
    /// The state directory could not be read or written.
    #[error("persistence error: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

/// Canonical paths within a state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub index_path: PathBuf,
    pub logs_dir: PathBuf,
    pub config_path: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            index_path: root.join("runs.json"),
            logs_dir: root.join("logs"),
            config_path: root.join("config.toml"),
        }
    }

    /// Log file for a run: `<state>/logs/<id>.log`.
    pub fn log_path(&self, id: RunId) -> PathBuf {
        self.logs_dir.join(format!("{id}.log"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunIndex {
    next_id: RunId,
    runs: Vec<RunRecord>,
}

impl Default for RunIndex {
    fn default() -> Self {
        Self {
            next_id: 1,
            runs: Vec::new(),
        }
    }
}

/// File-backed run history.
#[derive(Debug)]
pub struct RunStore {
    paths: StatePaths,
    index: RwLock<RunIndex>,
    last_error: Mutex<Option<String>>,
}

impl RunStore {
    /// Open (creating if needed) the store rooted at `state_dir`.
    #[instrument(skip_all, fields(state_dir = %state_dir.as_ref().display()))]
    pub fn open(state_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let paths = StatePaths::new(state_dir.as_ref());
        fs::create_dir_all(&paths.logs_dir)
            .with_context(|| format!("create logs directory {}", paths.logs_dir.display()))?;
        let index = load_index(&paths.index_path)?;
        info!(
            runs = index.runs.len(),
            next_id = index.next_id,
            "run store opened"
        );
        Ok(Self {
            paths,
            index: RwLock::new(index),
            last_error: Mutex::new(None),
        })
    }

    pub fn log_path(&self, id: RunId) -> PathBuf {
        self.paths.log_path(id)
    }

    /// The id the next appended run should carry.
    pub fn next_id(&self) -> RunId {
        self.read_index().next_id
    }

    /// Persist a new record. Its id must not be in use yet.
    pub fn append(&self, record: RunRecord) -> Result<(), StoreError> {
        let id = record.id;
        self.write_with(|index| {
            if index.runs.iter().any(|r| r.id == id) {
                return Err(StoreError::Duplicate(id));
            }
            index.next_id = index.next_id.max(id + 1);
            index.runs.push(record);
            Ok(())
        })?;
        debug!(run_id = id, "run appended");
        Ok(())
    }

    /// Apply `mutation` to run `id` and persist the result.
    pub fn update<F>(&self, id: RunId, mutation: F) -> Result<RunRecord, StoreError>
    where
        F: FnOnce(&mut RunRecord),
    {
        let updated = self.write_with(|index| {
            let record = index
                .runs
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(StoreError::NotFound(id))?;
            mutation(record);
            if record.id != id {
                return Err(StoreError::IdChanged {
                    id,
                    new_id: record.id,
                });
            }
            Ok(record.clone())
        })?;
        debug!(run_id = id, status = %updated.status, "run updated");
        Ok(updated)
    }

    pub fn get(&self, id: RunId) -> Option<RunRecord> {
        self.read_index().runs.iter().find(|r| r.id == id).cloned()
    }

    /// Newest-first page of history.
    pub fn list(&self, limit: usize, offset: usize) -> Vec<RunRecord> {
        self.read_index()
            .runs
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Records currently in `status`, oldest first.
    pub fn list_by_status(&self, status: RunStatus) -> Vec<RunRecord> {
        self.read_index()
            .runs
            .iter()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    pub fn latest(&self) -> Option<RunRecord> {
        self.read_index().runs.last().cloned()
    }

    pub fn len(&self) -> usize {
        self.read_index().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record and run log. Other files in the logs directory stay.
    #[instrument(skip_all)]
    pub fn clear_all(&self) -> Result<(), StoreError> {
        self.write_with(|index| {
            *index = RunIndex::default();
            Ok(())
        })?;
        let removed = remove_run_logs(&self.paths.logs_dir).map_err(|e| self.record_failure(e))?;
        info!(removed_logs = removed, "run history cleared");
        Ok(())
    }

    /// Captured output of a run. Empty if the run never produced any.
    pub fn read_log(&self, id: RunId) -> Result<String, StoreError> {
        let record = self.get(id).ok_or(StoreError::NotFound(id))?;
        if !record.log_path.exists() {
            return Ok(String::new());
        }
        let bytes = fs::read(&record.log_path)
            .with_context(|| format!("read run log {}", record.log_path.display()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Message of the most recent failed write, cleared by the next successful one.
    pub fn degraded(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, RunIndex> {
        self.index
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mutate a copy of the index, persist it, then publish it.
    fn write_with<T, F>(&self, change: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut RunIndex) -> Result<T, StoreError>,
    {
        let mut guard = self
            .index
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = guard.clone();
        let out = change(&mut next)?;
        persist_index(&self.paths.index_path, &next).map_err(|e| self.record_failure(e))?;
        *guard = next;
        self.clear_failure();
        Ok(out)
    }

    fn record_failure(&self, err: anyhow::Error) -> StoreError {
        warn!(err = format!("{err:#}"), "state directory write failed");
        *self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(format!("{err:#}"));
        StoreError::Persistence(err)
    }

    fn clear_failure(&self) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

fn load_index(path: &Path) -> Result<RunIndex, StoreError> {
    if !path.exists() {
        debug!(path = %path.display(), "no run index yet");
        return Ok(RunIndex::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run index {}", path.display()))?;
    let index: RunIndex = serde_json::from_str(&contents)
        .with_context(|| format!("parse run index {}", path.display()))?;
    Ok(index)
}

fn persist_index(path: &Path, index: &RunIndex) -> anyhow::Result<()> {
    let mut buf = serde_json::to_string_pretty(index).context("serialize run index")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

fn remove_run_logs(logs_dir: &Path) -> anyhow::Result<usize> {
    if !logs_dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    let entries = fs::read_dir(logs_dir)
        .with_context(|| format!("read logs directory {}", logs_dir.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() && is_run_log(&path) {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn is_run_log(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    match name.strip_suffix(".log") {
        Some(stem) => !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}
