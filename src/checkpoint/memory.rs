use crate::checkpoint::{
    runs_to_archive, CheckpointError, CheckpointStore, CommitRequest, RunRecord, RunStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// In-memory checkpoint storage
///
/// Each run sits behind its own mutex, so commits to one run never wait on
/// another. State is lost with the process; use it for tests and for
/// workloads that do not need crash recovery.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    runs: Arc<DashMap<String, Arc<Mutex<RunRecord>>>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs currently held
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Whether the store holds no runs
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    fn slot(&self, run_id: &str) -> Result<Arc<Mutex<RunRecord>>, CheckpointError> {
        self.runs
            .get(run_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CheckpointError::NotFound(run_id.to_string()))
    }

    fn snapshot(&self) -> Vec<RunRecord> {
        self.runs
            .iter()
            .map(|entry| entry.value().lock().clone())
            .collect()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn create_run(
        &self,
        run_id: &str,
        source_id: &str,
        batch_size: u32,
        total_items: Option<u64>,
    ) -> Result<RunRecord, CheckpointError> {
        match self.runs.entry(run_id.to_string()) {
            Entry::Occupied(_) => Err(CheckpointError::DuplicateRun(run_id.to_string())),
            Entry::Vacant(slot) => {
                let record = RunRecord::new(run_id, source_id, batch_size, total_items);
                slot.insert(Arc::new(Mutex::new(record.clone())));
                debug!(run_id, source_id, "Created run");
                Ok(record)
            }
        }
    }

    async fn load_run(&self, run_id: &str) -> Result<RunRecord, CheckpointError> {
        Ok(self.slot(run_id)?.lock().clone())
    }

    async fn commit_progress(
        &self,
        run_id: &str,
        request: CommitRequest,
    ) -> Result<RunRecord, CheckpointError> {
        // Clone the slot out so the map shard is not held during the commit
        let slot = self.slot(run_id)?;
        let mut record = slot.lock();
        record.apply_commit(request, Utc::now())?;
        Ok(record.clone())
    }

    async fn list_incomplete_runs(
        &self,
        source_id: Option<&str>,
    ) -> Result<Vec<RunRecord>, CheckpointError> {
        let mut runs: Vec<RunRecord> = self
            .snapshot()
            .into_iter()
            .filter(|run| matches!(run.status, RunStatus::Running | RunStatus::Interrupted))
            .filter(|run| source_id.map_or(true, |source| run.source_id == source))
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn list_runs(
        &self,
        source_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<RunRecord>, CheckpointError> {
        let mut runs: Vec<RunRecord> = self
            .snapshot()
            .into_iter()
            .filter(|run| source_id.map_or(true, |source| run.source_id == source))
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit.unwrap_or(usize::MAX));
        Ok(runs)
    }

    async fn archive_runs(
        &self,
        source_id: Option<&str>,
        keep_recent: usize,
    ) -> Result<u64, CheckpointError> {
        let runs = self.list_runs(source_id, None).await?;
        let doomed = runs_to_archive(&runs, keep_recent);
        for run_id in &doomed {
            self.runs.remove(run_id);
        }
        Ok(doomed.len() as u64)
    }
}
