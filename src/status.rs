//! Batch status persistence.
//!
//! The orchestrator records batch lifecycle transitions and run summaries
//! through the backend-agnostic [`StatusProvider`] trait. A filesystem
//! implementation is provided; deployments with a shared store supply
//! their own.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::utils::write_json_file_atomic;

/// Lifecycle states a batch moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Waiting,
    Running,
    Done,
    Deleted,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Waiting => "waiting",
            BatchStatus::Running => "running",
            BatchStatus::Done => "done",
            BatchStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum StatusError {
    /// The batch has no persisted record; usually a concurrent deletion.
    #[error("Batch {0} not found")]
    BatchNotFound(i64),
    #[error("Status store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Status serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// External persistence of per-batch status and summary artifacts.
///
/// Status transitions must be performed while holding [`status_lock`];
/// the lock is exposed so outside observers (batch submitters, deleters)
/// can serialize their own transitions against the orchestrator's. The
/// orchestrator never acquires it while holding its internal accounting
/// lock.
///
/// [`status_lock`]: StatusProvider::status_lock
#[async_trait]
pub trait StatusProvider: Send + Sync {
    fn status_lock(&self) -> &Mutex<()>;

    /// Whether the batch has been deleted (or never existed).
    async fn is_deleted(&self, batch_id: i64) -> bool;

    /// Remove the batch record and any persisted artifacts.
    async fn delete_batch(&self, batch_id: i64) -> Result<(), StatusError>;

    async fn change_status(&self, batch_id: i64, status: BatchStatus) -> Result<(), StatusError>;

    /// Persist the current run summary for the batch.
    async fn set_run_summary(
        &self,
        batch_id: i64,
        summary: &serde_json::Value,
    ) -> Result<(), StatusError>;

    /// Directory where the batch's work items and result artifacts live.
    fn batch_base_path(&self, batch_id: i64) -> PathBuf;
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusRecord {
    status: BatchStatus,
    updated_at: chrono::DateTime<chrono::Utc>,
}

/// Filesystem-backed status provider: one directory per batch under a
/// root, holding a `status.json` marker and a `run_summary.json` artifact.
pub struct FsStatusProvider {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FsStatusProvider {
    const STATUS_FILE: &'static str = "status.json";
    const SUMMARY_FILE: &'static str = "run_summary.json";

    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn batch_dir(&self, batch_id: i64) -> PathBuf {
        self.root.join(format!("batch_{batch_id}"))
    }

    /// Register a new batch in `waiting` state and return its base path.
    pub async fn create_batch(&self, batch_id: i64) -> Result<PathBuf, StatusError> {
        let dir = self.batch_dir(batch_id);
        tokio::fs::create_dir_all(&dir).await?;
        self.write_status(batch_id, BatchStatus::Waiting).await?;
        Ok(dir)
    }

    /// Read the persisted status, if the batch still exists.
    pub async fn read_status(&self, batch_id: i64) -> Option<BatchStatus> {
        let path = self.batch_dir(batch_id).join(Self::STATUS_FILE);
        let bytes = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice::<StatusRecord>(&bytes)
            .ok()
            .map(|r| r.status)
    }

    /// Read the persisted run summary, if any.
    pub async fn read_run_summary(&self, batch_id: i64) -> Option<serde_json::Value> {
        let path = self.batch_dir(batch_id).join(Self::SUMMARY_FILE);
        let bytes = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn write_status(&self, batch_id: i64, status: BatchStatus) -> Result<(), StatusError> {
        let record = StatusRecord {
            status,
            updated_at: chrono::Utc::now(),
        };
        let path = self.batch_dir(batch_id).join(Self::STATUS_FILE);
        write_json_file_atomic(&serde_json::to_value(&record)?, &path, 3).await?;
        Ok(())
    }
}

#[async_trait]
impl StatusProvider for FsStatusProvider {
    fn status_lock(&self) -> &Mutex<()> {
        &self.lock
    }

    fn batch_base_path(&self, batch_id: i64) -> PathBuf {
        self.batch_dir(batch_id)
    }

    async fn is_deleted(&self, batch_id: i64) -> bool {
        if !self.batch_dir(batch_id).exists() {
            return true;
        }
        matches!(self.read_status(batch_id).await, Some(BatchStatus::Deleted))
    }

    async fn delete_batch(&self, batch_id: i64) -> Result<(), StatusError> {
        let dir = self.batch_dir(batch_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn change_status(&self, batch_id: i64, status: BatchStatus) -> Result<(), StatusError> {
        if !self.batch_dir(batch_id).exists() {
            return Err(StatusError::BatchNotFound(batch_id));
        }
        self.write_status(batch_id, status).await
    }

    async fn set_run_summary(
        &self,
        batch_id: i64,
        summary: &serde_json::Value,
    ) -> Result<(), StatusError> {
        let dir = self.batch_dir(batch_id);
        if !dir.exists() {
            return Err(StatusError::BatchNotFound(batch_id));
        }
        write_json_file_atomic(summary, &dir.join(Self::SUMMARY_FILE), 3).await?;
        Ok(())
    }
}

/// List the batch ids present under a provider root, oldest first.
pub fn list_batches(root: &Path) -> std::io::Result<Vec<i64>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(id) = name
            .to_str()
            .and_then(|n| n.strip_prefix("batch_"))
            .and_then(|n| n.parse::<i64>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}
