//! Row types shared by the SQL-backed stores

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::checkpoint::{CheckpointError, FailedItem, RunRecord, RunStatus};

/// Columns selected from `run_state`
pub(crate) const RUN_COLUMNS: &str = "run_id, source_id, status, total_items, processed_count, \
     cursor, batch_size, batches_committed, created_at, updated_at";

#[derive(Debug, FromRow)]
pub(crate) struct RunRow {
    pub run_id: String,
    pub source_id: String,
    pub status: String,
    pub total_items: Option<i64>,
    pub processed_count: i64,
    pub cursor: Option<String>,
    pub batch_size: i32,
    pub batches_committed: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
pub(crate) struct FailedRow {
    pub item_key: String,
    pub error_message: String,
    pub attempt_count: i32,
}

impl RunRow {
    pub fn into_record(self, failed: Vec<FailedRow>) -> Result<RunRecord, CheckpointError> {
        let status: RunStatus = self.status.parse()?;
        Ok(RunRecord {
            run_id: self.run_id,
            source_id: self.source_id,
            status,
            total_items: self.total_items.map(|total| total.max(0) as u64),
            processed_count: self.processed_count.max(0) as u64,
            cursor: self.cursor,
            failed_items: failed
                .into_iter()
                .map(|row| FailedItem {
                    item_key: row.item_key,
                    error_message: row.error_message,
                    attempt_count: row.attempt_count.max(0) as u32,
                })
                .collect(),
            batch_size: self.batch_size.max(0) as u32,
            batches_committed: self.batches_committed.max(0) as u64,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Explain why a guarded UPDATE touched no row
///
/// Re-validates against the current record; if that passes, another writer
/// committed between our guard and the re-read.
pub(crate) fn classify_rejected_commit(
    current: &RunRecord,
    request: &crate::checkpoint::CommitRequest,
) -> CheckpointError {
    match current.check_commit(request) {
        Err(err) => err,
        Ok(()) => CheckpointError::StaleCheckpoint {
            run_id: current.run_id.clone(),
            expected: request.expected_cursor.clone(),
            actual: current.cursor.clone(),
        },
    }
}
