//! Run checkpoints and split-retry planning
//!
//! A checkpoint is written only when a run is aborted (quota exhaustion or
//! operator interrupt). It holds the batches that were not finished so a
//! later, explicit `resume` can pick them up without re-deriving work from
//! the store. Checkpoint files are never overwritten.

use crate::artifacts::{unique_path, FILE_STAMP};
use crate::model::Batch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("checkpoint not found: {0}")]
    NotFound(PathBuf),
}

/// Why a run stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    QuotaExhausted,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    /// The batch being processed when the run stopped, then every batch not yet attempted
    pub remaining_batches: Vec<Batch>,
    pub completed_count: usize,
    pub failed_count: usize,
    pub total_batches: usize,
    pub stopped_at_index: usize,
    pub status: CheckpointStatus,
    /// Error or signal that stopped the run
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl RunCheckpoint {
    /// Batches to re-enter the loop with.
    pub fn resume(&self) -> Vec<Batch> {
        self.remaining_batches.clone()
    }

    pub fn remaining_units(&self) -> usize {
        self.remaining_batches.iter().map(|b| b.total_pending).sum()
    }
}

pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a checkpoint as `checkpoint_<timestamp>.json`.
    pub fn save(&self, checkpoint: &RunCheckpoint) -> Result<PathBuf, CheckpointError> {
        std::fs::create_dir_all(&self.dir)?;
        let stem = format!("checkpoint_{}", checkpoint.timestamp.format(FILE_STAMP));
        let path = unique_path(&self.dir, &stem, "json");

        let json = serde_json::to_string_pretty(checkpoint)?;
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        Ok(path)
    }

    /// Load a named checkpoint file.
    pub fn load(path: impl AsRef<Path>) -> Result<RunCheckpoint, CheckpointError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CheckpointError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Checkpoint files in the directory, oldest first.
    pub fn list(&self) -> Result<Vec<PathBuf>, CheckpointError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension().is_some_and(|ext| ext == "json")
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("checkpoint_"))
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

/// Split policy for batches that exhausted every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Batches with at most this many items are not split
    pub split_floor: usize,
    pub sub_batch_size: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            split_floor: 3,
            sub_batch_size: 5,
        }
    }
}

/// Sub-batches to retry once, or `None` when the batch must not be split.
///
/// Retry batches are never split again.
pub fn split_for_retry(
    batch: &Batch,
    retry: &RetryConfig,
    large_threshold: usize,
    pack_threshold: usize,
) -> Option<Vec<Batch>> {
    if batch.is_retry || batch.len() <= retry.split_floor || retry.sub_batch_size == 0 {
        return None;
    }
    Some(
        batch
            .items
            .chunks(retry.sub_batch_size)
            .map(|chunk| Batch::new(chunk.to_vec(), large_threshold, pack_threshold).as_retry())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkItem;

    fn batch_of(n: usize) -> Batch {
        Batch::new(
            (0..n).map(|i| WorkItem::new(format!("c{i}"), 4, 2)).collect(),
            50,
            150,
        )
    }

    fn checkpoint() -> RunCheckpoint {
        RunCheckpoint {
            remaining_batches: vec![batch_of(2), batch_of(1).as_retry()],
            completed_count: 3,
            failed_count: 1,
            total_batches: 6,
            stopped_at_index: 4,
            status: CheckpointStatus::QuotaExhausted,
            reason: "quota exceeded".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("checkpoints"));
        let saved = checkpoint();

        let path = manager.save(&saved).unwrap();
        let loaded = CheckpointManager::load(&path).unwrap();

        assert_eq!(loaded, saved);
        assert_eq!(loaded.resume(), saved.remaining_batches);
        assert_eq!(loaded.remaining_units(), 6);
        assert!(loaded.remaining_batches[1].is_retry);
    }

    #[test]
    fn checkpoints_are_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let cp = checkpoint();

        let first = manager.save(&cp).unwrap();
        let second = manager.save(&cp).unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.list().unwrap(), vec![first, second]);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&checkpoint()).unwrap();
        assert!(json.contains("\"status\":\"quota_exhausted\""));
    }

    #[test]
    fn missing_checkpoint_is_not_found() {
        let err = CheckpointManager::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound(_)));
    }

    #[test]
    fn twelve_items_split_into_fives() {
        let subs = split_for_retry(&batch_of(12), &RetryConfig::default(), 50, 150).unwrap();
        let sizes: Vec<usize> = subs.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![5, 5, 2]);
        assert!(subs.iter().all(|b| b.is_retry));
        assert_eq!(subs.iter().map(|b| b.total_pending).sum::<usize>(), 24);
    }

    #[test]
    fn small_or_retry_batches_are_not_split() {
        let retry = RetryConfig::default();
        assert!(split_for_retry(&batch_of(3), &retry, 50, 150).is_none());
        assert!(split_for_retry(&batch_of(4), &retry, 50, 150).is_some());
        let sub = &split_for_retry(&batch_of(12), &retry, 50, 150).unwrap()[0];
        assert!(split_for_retry(sub, &retry, 50, 150).is_none());
    }
}
