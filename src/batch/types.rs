use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checkpoint::{RunRecord, RunStatus};
use crate::telemetry::progress::ProgressSnapshot;

/// A single unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Stable key, unique within a run
    pub key: String,
    /// Arbitrary payload handed to the processor
    pub payload: Value,
}

impl Item {
    /// Item with a payload
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }

    /// Item carrying only its key
    pub fn keyed(key: impl Into<String>) -> Self {
        Self::new(key, Value::Null)
    }
}

/// Result of processing one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Item processed
    Success,
    /// Item failed; recorded and the run continues
    Retryable(String),
    /// The run must stop now
    Fatal(String),
}

impl Outcome {
    /// Retryable failure
    pub fn retryable(reason: impl Into<String>) -> Self {
        Outcome::Retryable(reason.into())
    }

    /// Fatal failure
    pub fn fatal(reason: impl Into<String>) -> Self {
        Outcome::Fatal(reason.into())
    }

    /// Label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Retryable(_) => "retryable",
            Outcome::Fatal(_) => "fatal",
        }
    }
}

/// How an item timeout is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// Record the item as failed and keep going
    #[default]
    Retryable,
    /// Stop the run
    Fatal,
}

/// Why a run stopped before completing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunFailure {
    /// An item reported a fatal error
    Fatal {
        /// Item that failed
        item_key: String,
        /// Reason it gave
        reason: String,
    },
    /// Writing a checkpoint failed; the last batch will be redone on resume
    CheckpointWrite {
        /// Storage error message
        message: String,
    },
    /// The work source could not produce items
    Source {
        /// Source error message
        message: String,
        /// Whether the run can be resumed
        transient: bool,
    },
    /// Cancelled by the caller
    Cancelled,
}

/// Terminal result of `BatchProcessor::run`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Run identifier
    pub run_id: String,
    /// Final status
    pub status: RunStatus,
    /// Items processed successfully (committed)
    pub processed: u64,
    /// Items recorded as failed (committed)
    pub failed: u64,
    /// Last committed cursor
    pub cursor: Option<String>,
    /// Why the run stopped early, if it did
    pub failure: Option<RunFailure>,
}

impl RunResult {
    /// Build a result from committed state
    pub fn from_record(record: &RunRecord, failure: Option<RunFailure>) -> Self {
        Self {
            run_id: record.run_id.clone(),
            status: record.status,
            processed: record.processed_count,
            failed: record.failed_items.len() as u64,
            cursor: record.cursor.clone(),
            failure,
        }
    }

    /// Whether the run completed
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Process exit code: 0 only for completed runs
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Completed => 0,
            RunStatus::Failed => 2,
            _ => 1,
        }
    }
}

/// Batch execution configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Items per batch for new runs
    pub batch_size: u32,
    /// Reopen an existing run instead of failing with DuplicateRun
    pub resume: bool,
    /// Items of one batch processed at the same time
    pub concurrency: usize,
    /// Per-item timeout
    pub item_timeout: Option<Duration>,
    /// Classification of timed-out items
    pub timeout_policy: TimeoutPolicy,
    /// Extra fields attached to the run's correlation context
    pub correlation_fields: BTreeMap<String, String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            resume: true,
            concurrency: 1,
            item_timeout: None,
            timeout_policy: TimeoutPolicy::Retryable,
            correlation_fields: BTreeMap::new(),
        }
    }
}

/// Progress reported after each committed batch
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Run identifier
    pub run_id: String,
    /// Sequence number of the committed batch
    pub batch_seq: u64,
    /// Committed successes
    pub processed: u64,
    /// Committed failures
    pub failed: u64,
    /// Committed cursor
    pub cursor: Option<String>,
    /// Status after the commit
    pub status: RunStatus,
    /// Rate and ETA view
    pub snapshot: ProgressSnapshot,
}

/// Callback for progress updates
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;
