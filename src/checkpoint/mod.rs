//! Durable run state for batch execution
//!
//! A [`RunRecord`] is the persisted state of one run. Every mutation after
//! creation goes through [`CheckpointStore::commit_progress`], which applies a
//! [`CommitRequest`] atomically and rejects it with
//! [`CheckpointError::StaleCheckpoint`] when the stored cursor is not the one
//! the caller expected to supersede.

mod memory;
pub mod postgres;
mod rows;
pub mod sqlite;

pub use memory::MemoryCheckpointStore;
pub use postgres::{PostgresCheckpointStore, PostgresConfig};
pub use sqlite::{SqliteCheckpointStore, SqliteConfig};

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors related to checkpoint storage
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// No run with this id exists
    #[error("Run not found: {0}")]
    NotFound(String),

    /// A run with this id already exists
    #[error("Run already exists: {0}")]
    DuplicateRun(String),

    /// The stored cursor moved past the one the caller expected
    #[error("Stale checkpoint for run {run_id}: expected cursor {expected:?}, found {actual:?}")]
    StaleCheckpoint {
        /// Run being committed
        run_id: String,
        /// Cursor the caller believed was current
        expected: Option<String>,
        /// Cursor actually stored
        actual: Option<String>,
    },

    /// Status change not allowed by the run lifecycle
    #[error("Invalid status transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        /// Run being committed
        run_id: String,
        /// Stored status
        from: RunStatus,
        /// Requested status
        to: RunStatus,
    },

    /// Commit would push processed_count past total_items
    #[error("Run {run_id} would account {processed} items but only {total} exist")]
    CountExceeded {
        /// Run being committed
        run_id: String,
        /// Resulting processed count
        processed: u64,
        /// Known total
        total: u64,
    },

    /// Infrastructure failure reading or writing the store
    #[error("Checkpoint storage failure: {0}")]
    Storage(String),

    /// Stored data could not be decoded
    #[error("Invalid checkpoint data: {0}")]
    InvalidData(String),
}

impl CheckpointError {
    /// Whether this is an infrastructure failure (safe to retry on resume)
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, CheckpointError::Storage(_))
    }
}

impl From<sqlx::Error> for CheckpointError {
    fn from(err: sqlx::Error) -> Self {
        CheckpointError::Storage(err.to_string())
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Created, no batch started yet
    Pending,
    /// Actively processing (or died without a clean exit)
    Running,
    /// Work source exhausted without a fatal error
    Completed,
    /// Stopped permanently
    Failed,
    /// Stopped early; resumable
    Interrupted,
}

impl RunStatus {
    /// Stable lowercase name used in storage
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
        }
    }

    /// Completed and failed runs never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Runs a processor may pick up again
    pub fn is_resumable(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether a commit may move a run from `self` to `next`
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        !self.is_terminal() && next != RunStatus::Pending
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "interrupted" => Ok(RunStatus::Interrupted),
            other => Err(CheckpointError::InvalidData(format!("unknown run status '{}'", other))),
        }
    }
}

/// An item that failed with a retryable error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    /// Key of the failed item
    pub item_key: String,
    /// Last error message reported for it
    pub error_message: String,
    /// How many times it has failed within this run
    pub attempt_count: u32,
}

/// A failure reported by one commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFailure {
    /// Key of the failed item
    pub item_key: String,
    /// Error message
    pub error_message: String,
}

impl NewFailure {
    /// Create a failure entry
    pub fn new(item_key: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            item_key: item_key.into(),
            error_message: error_message.into(),
        }
    }
}

/// Atomic progress update for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    /// Cursor the caller believes is currently stored
    pub expected_cursor: Option<String>,
    /// Cursor after this commit
    pub new_cursor: Option<String>,
    /// Successes accounted by this commit
    pub processed_delta: u64,
    /// Retryable failures accounted by this commit
    pub newly_failed: Vec<NewFailure>,
    /// Status after this commit
    pub new_status: RunStatus,
}

impl CommitRequest {
    /// A commit that only changes status, leaving the cursor where it is
    pub fn status_only(cursor: Option<String>, new_status: RunStatus) -> Self {
        Self {
            expected_cursor: cursor.clone(),
            new_cursor: cursor,
            processed_delta: 0,
            newly_failed: Vec::new(),
            new_status,
        }
    }

    /// Whether this commit accounts for at least one item
    pub fn accounts_items(&self) -> bool {
        self.processed_delta > 0 || !self.newly_failed.is_empty()
    }
}

/// Persisted state of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique, immutable run id
    pub run_id: String,
    /// Logical source the run iterates
    pub source_id: String,
    /// Lifecycle status
    pub status: RunStatus,
    /// Total items, when the source knows it
    pub total_items: Option<u64>,
    /// Items processed successfully
    pub processed_count: u64,
    /// Key of the last committed item
    pub cursor: Option<String>,
    /// Retryable failures in the order they were committed
    pub failed_items: Vec<FailedItem>,
    /// Items per batch
    pub batch_size: u32,
    /// Number of commits that accounted at least one item
    pub batches_committed: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time of the last commit
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// A fresh pending record
    pub fn new(
        run_id: impl Into<String>,
        source_id: impl Into<String>,
        batch_size: u32,
        total_items: Option<u64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            source_id: source_id.into(),
            status: RunStatus::Pending,
            total_items,
            processed_count: 0,
            cursor: None,
            failed_items: Vec::new(),
            batch_size,
            batches_committed: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Items accounted for so far, successes and failures
    pub fn accounted(&self) -> u64 {
        self.processed_count + self.failed_items.len() as u64
    }

    /// Validate a commit against this record without applying it
    pub fn check_commit(&self, request: &CommitRequest) -> Result<(), CheckpointError> {
        if !self.status.can_transition_to(request.new_status) {
            return Err(CheckpointError::InvalidTransition {
                run_id: self.run_id.clone(),
                from: self.status,
                to: request.new_status,
            });
        }

        if self.cursor != request.expected_cursor {
            return Err(CheckpointError::StaleCheckpoint {
                run_id: self.run_id.clone(),
                expected: request.expected_cursor.clone(),
                actual: self.cursor.clone(),
            });
        }

        let processed = self.processed_count + request.processed_delta;
        if let Some(total) = self.total_items {
            if processed > total {
                return Err(CheckpointError::CountExceeded {
                    run_id: self.run_id.clone(),
                    processed,
                    total,
                });
            }
        }

        Ok(())
    }

    /// Validate and apply a commit in place
    pub fn apply_commit(
        &mut self,
        request: CommitRequest,
        now: DateTime<Utc>,
    ) -> Result<(), CheckpointError> {
        self.check_commit(&request)?;

        if request.accounts_items() {
            self.batches_committed += 1;
        }
        self.processed_count += request.processed_delta;
        self.cursor = request.new_cursor;
        self.status = request.new_status;
        self.updated_at = now;

        for failure in request.newly_failed {
            match self
                .failed_items
                .iter_mut()
                .find(|existing| existing.item_key == failure.item_key)
            {
                Some(existing) => {
                    existing.attempt_count += 1;
                    existing.error_message = failure.error_message;
                }
                None => self.failed_items.push(FailedItem {
                    item_key: failure.item_key,
                    error_message: failure.error_message,
                    attempt_count: 1,
                }),
            }
        }

        Ok(())
    }
}

/// Generate a run id of the form `<source>_<timestamp>_<suffix>`
pub fn new_run_id(source_id: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        source_id,
        Utc::now().format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    )
}

/// Durable, keyed storage of run state
///
/// Implementations must serialize commits per `run_id` and must not block
/// commits of unrelated runs on each other beyond what the backend itself
/// imposes.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Create a pending run; fails with `DuplicateRun` if the id exists
    async fn create_run(
        &self,
        run_id: &str,
        source_id: &str,
        batch_size: u32,
        total_items: Option<u64>,
    ) -> Result<RunRecord, CheckpointError>;

    /// Load a run by id
    async fn load_run(&self, run_id: &str) -> Result<RunRecord, CheckpointError>;

    /// Apply a commit atomically, returning the updated record
    async fn commit_progress(
        &self,
        run_id: &str,
        request: CommitRequest,
    ) -> Result<RunRecord, CheckpointError>;

    /// Runs in `running` or `interrupted` state, oldest first
    async fn list_incomplete_runs(
        &self,
        source_id: Option<&str>,
    ) -> Result<Vec<RunRecord>, CheckpointError>;

    /// All runs, newest first
    async fn list_runs(
        &self,
        source_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<RunRecord>, CheckpointError>;

    /// Most recently created run of a source
    async fn latest_run(&self, source_id: &str) -> Result<Option<RunRecord>, CheckpointError> {
        Ok(self.list_runs(Some(source_id), Some(1)).await?.into_iter().next())
    }

    /// Delete completed runs beyond the `keep_recent` newest per source
    ///
    /// Returns the number of runs deleted.
    async fn archive_runs(
        &self,
        source_id: Option<&str>,
        keep_recent: usize,
    ) -> Result<u64, CheckpointError>;
}

/// Pick the completed runs `archive_runs` should delete
///
/// `runs` must be sorted newest first.
pub(crate) fn runs_to_archive(runs: &[RunRecord], keep_recent: usize) -> Vec<String> {
    let mut kept: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    runs.iter()
        .filter(|run| run.status == RunStatus::Completed)
        .filter(|run| {
            let seen = kept.entry(run.source_id.as_str()).or_insert(0);
            *seen += 1;
            *seen > keep_recent
        })
        .map(|run| run.run_id.clone())
        .collect()
}
