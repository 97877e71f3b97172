//! Durable dispatch progress.
//!
//! A [`ProgressSnapshot`] is everything needed to resume a run in a fresh
//! process: the job ids in dispatch order, the index of the next job to send,
//! the latest attempt per job, and the run state. [`FileProgressStore`] writes
//! it to a temp file, syncs, and renames over the previous snapshot, so a
//! reader only ever sees a complete snapshot.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dispatch::{DispatchAttempt, RunState};
use crate::error::GroupMailError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_ids: Vec<String>,
    pub next_index: usize,
    /// Latest attempt per job id.
    pub attempts: BTreeMap<String, DispatchAttempt>,
    pub state: RunState,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn new(job_ids: Vec<String>) -> Self {
        Self {
            job_ids,
            next_index: 0,
            attempts: BTreeMap::new(),
            state: RunState::Idle,
            updated_at: Utc::now(),
        }
    }

    /// Whether this snapshot was taken over exactly `job_ids`, in order.
    pub fn matches(&self, job_ids: &[String]) -> bool {
        self.job_ids == job_ids
    }

    pub fn latest_attempt(&self, job_id: &str) -> Option<&DispatchAttempt> {
        self.attempts.get(job_id)
    }

    pub fn succeeded(&self) -> usize {
        self.attempts
            .values()
            .filter(|a| a.outcome.is_success())
            .count()
    }

    pub fn remaining(&self) -> usize {
        self.job_ids.len().saturating_sub(self.next_index)
    }
}

/// Persistence for the scheduler's snapshot.
pub trait ProgressStore: Send + Sync {
    /// Replace the stored snapshot. Idempotent.
    fn save(&self, snapshot: &ProgressSnapshot) -> Result<(), GroupMailError>;

    /// Last successfully saved snapshot, if any.
    fn load(&self) -> Result<Option<ProgressSnapshot>, GroupMailError>;

    fn clear(&self) -> Result<(), GroupMailError>;
}

/// Snapshot kept as pretty JSON on disk.
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    path: PathBuf,
    temp_path: PathBuf,
}

impl FileProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".tmp");
        let temp_path = path.with_file_name(temp_name);
        Self { path, temp_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProgressStore for FileProgressStore {
    fn save(&self, snapshot: &ProgressSnapshot) -> Result<(), GroupMailError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(parent)?;
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let mut file = fs::File::create(&self.temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&self.temp_path, &self.path)?;
        // The rename is only durable once the directory entry is flushed.
        #[cfg(unix)]
        fs::File::open(parent)?.sync_all()?;
        debug!(path = %self.path.display(), next_index = snapshot.next_index, "Progress saved");
        Ok(())
    }

    fn load(&self) -> Result<Option<ProgressSnapshot>, GroupMailError> {
        // A leftover temp file means a save died before the rename; the
        // previous snapshot at `path` is still the valid one.
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)?;
        let snapshot = serde_json::from_slice(&bytes)?;
        Ok(Some(snapshot))
    }

    fn clear(&self) -> Result<(), GroupMailError> {
        for path in [&self.path, &self.temp_path] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

/// In-process store, serialized the same way as the file store.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    saved: Mutex<Option<String>>,
    saves: Mutex<usize>,
}

#[cfg(test)]
impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
impl ProgressStore for MemoryProgressStore {
    fn save(&self, snapshot: &ProgressSnapshot) -> Result<(), GroupMailError> {
        let json = serde_json::to_string(snapshot)?;
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(json);
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }

    fn load(&self) -> Result<Option<ProgressSnapshot>, GroupMailError> {
        let saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);
        match saved.as_deref() {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    fn clear(&self) -> Result<(), GroupMailError> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

#[cfg(test)]
impl<S: ProgressStore + ?Sized> ProgressStore for std::sync::Arc<S> {
    fn save(&self, snapshot: &ProgressSnapshot) -> Result<(), GroupMailError> {
        (**self).save(snapshot)
    }

    fn load(&self) -> Result<Option<ProgressSnapshot>, GroupMailError> {
        (**self).load()
    }

    fn clear(&self) -> Result<(), GroupMailError> {
        (**self).clear()
    }
}
