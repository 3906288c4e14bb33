//! Checkpointed batch execution
//!
//! [`BatchProcessor::run`] drives a work source to completion in fixed-size
//! batches. Items of a batch may be processed concurrently but are accounted
//! in source order, and a checkpoint is committed after every batch. The
//! processor is never invoked again for an item at or before a committed
//! cursor.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::batch::processor::ItemProcessor;
use crate::batch::source::{ItemStream, WorkSource, WorkSourceError};
use crate::batch::types::{
    BatchConfig, Item, Outcome, ProgressCallback, ProgressUpdate, RunFailure, RunResult,
    TimeoutPolicy,
};
use crate::checkpoint::{
    CheckpointError, CheckpointStore, CommitRequest, NewFailure, RunRecord, RunStatus,
};
use crate::telemetry::correlation::CorrelationContext;
use crate::telemetry::metrics::{RunMetrics, Timer};
use crate::telemetry::progress::ProgressTracker;
use crate::{BatchRunError, Result};

/// What startup decided to do with a run id
enum Startup {
    /// Run is terminal; hand back its stored result
    Finished(RunResult),
    /// Run is marked running and ready for batches
    Ready(RunRecord),
}

/// Items pulled for one batch
struct Pulled {
    items: Vec<Item>,
    exhausted: bool,
}

/// Accounting of one processed batch, in source order
#[derive(Default)]
struct BatchTally {
    succeeded: u64,
    failures: Vec<NewFailure>,
    last_key: Option<String>,
    fatal: Option<(String, String)>,
}

/// Orchestrates checkpointed runs over a work source
#[derive(Clone)]
pub struct BatchProcessor {
    config: BatchConfig,
    cancellation: CancellationToken,
    progress_callback: Option<ProgressCallback>,
}

impl Default for BatchProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchProcessor {
    /// Processor with default settings
    pub fn new() -> Self {
        Self::with_config(BatchConfig::default())
    }

    /// Processor with the given settings
    pub fn with_config(config: BatchConfig) -> Self {
        Self {
            config,
            cancellation: CancellationToken::new(),
            progress_callback: None,
        }
    }

    /// Items per batch for newly created runs
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.config.batch_size = batch_size.max(1);
        self
    }

    /// Whether an existing run id is resumed or rejected
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.config.resume = resume;
        self
    }

    /// Items of one batch processed at the same time
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency.max(1);
        self
    }

    /// Per-item timeout and how timed-out items are classified
    pub fn with_item_timeout(mut self, timeout: Duration, policy: TimeoutPolicy) -> Self {
        self.config.item_timeout = Some(timeout);
        self.config.timeout_policy = policy;
        self
    }

    /// Token checked before every batch
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Callback invoked after every committed batch
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    /// Extra field attached to the run's correlation context
    pub fn with_correlation_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.correlation_fields.insert(key.into(), value.into());
        self
    }

    /// Current settings
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Token that cancels runs of this processor
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Run or resume `run_id` over `source`
    ///
    /// Fatal items, checkpoint write failures, source errors and cancellation
    /// end the run early and are reported in [`RunResult::failure`]. Misuse
    /// (duplicate run ids, stale or invalid commits) is returned as `Err`.
    pub async fn run(
        &self,
        source: &dyn WorkSource,
        processor: &dyn ItemProcessor,
        store: &dyn CheckpointStore,
        run_id: &str,
    ) -> Result<RunResult> {
        let context = CorrelationContext::new(run_id, source.source_id())
            .with_fields(self.config.correlation_fields.clone());

        context
            .scope(self.run_in_context(&context, source, processor, store))
            .await
    }

    async fn run_in_context(
        &self,
        context: &CorrelationContext,
        source: &dyn WorkSource,
        processor: &dyn ItemProcessor,
        store: &dyn CheckpointStore,
    ) -> Result<RunResult> {
        let metrics = RunMetrics::new(source.source_id());

        let record = match self.open_run(source, store, context.run_id()).await? {
            Startup::Finished(result) => {
                info!(
                    status = %result.status,
                    processed = result.processed,
                    failed = result.failed,
                    "Run already finished; returning stored result"
                );
                return Ok(result);
            }
            Startup::Ready(record) => record,
        };

        let _active = metrics.record_run_start();
        let result = self
            .execute(context, source, processor, store, record, &metrics)
            .await;

        match &result {
            Ok(run) => {
                metrics.record_run_end(run.status.as_str());
                info!(
                    status = %run.status,
                    processed = run.processed,
                    failed = run.failed,
                    cursor = ?run.cursor,
                    failure = ?run.failure,
                    "Run finished"
                );
            }
            Err(e) => {
                metrics.record_run_end("error");
                error!(error = %e, "Run aborted");
            }
        }
        result
    }

    async fn open_run(
        &self,
        source: &dyn WorkSource,
        store: &dyn CheckpointStore,
        run_id: &str,
    ) -> Result<Startup> {
        match store.load_run(run_id).await {
            Ok(record) => {
                if !self.config.resume {
                    return Err(CheckpointError::DuplicateRun(run_id.to_string()).into());
                }
                if record.source_id != source.source_id() {
                    return Err(BatchRunError::SourceMismatch {
                        run_id: run_id.to_string(),
                        stored: record.source_id,
                        given: source.source_id().to_string(),
                    });
                }
                if record.status.is_terminal() {
                    return Ok(Startup::Finished(RunResult::from_record(&record, None)));
                }

                info!(
                    status = %record.status,
                    cursor = ?record.cursor,
                    processed = record.processed_count,
                    failed = record.failed_items.len(),
                    batch_size = record.batch_size,
                    "Resuming run"
                );
                let request = CommitRequest::status_only(record.cursor.clone(), RunStatus::Running);
                let record = store.commit_progress(run_id, request).await?;
                Ok(Startup::Ready(record))
            }
            Err(CheckpointError::NotFound(_)) => {
                let total = source.total_items().await;
                store
                    .create_run(run_id, source.source_id(), self.config.batch_size, total)
                    .await?;
                info!(batch_size = self.config.batch_size, total_items = ?total, "Starting run");
                let request = CommitRequest::status_only(None, RunStatus::Running);
                let record = store.commit_progress(run_id, request).await?;
                Ok(Startup::Ready(record))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn execute(
        &self,
        context: &CorrelationContext,
        source: &dyn WorkSource,
        processor: &dyn ItemProcessor,
        store: &dyn CheckpointStore,
        mut record: RunRecord,
        metrics: &RunMetrics,
    ) -> Result<RunResult> {
        let tracker = ProgressTracker::new(record.total_items)
            .with_description(record.source_id.clone())
            .with_baseline(record.accounted(), record.failed_items.len() as u64);
        let batch_size = record.batch_size.max(1) as usize;

        let mut items = match source.resume_from(record.cursor.as_deref()).await {
            Ok(items) => items,
            Err(e) => return self.stop_on_source_error(store, &record, e, metrics).await,
        };

        loop {
            if self.cancellation.is_cancelled() {
                info!(cursor = ?record.cursor, "Cancellation requested; interrupting run");
                return self
                    .stop(store, &record, RunStatus::Interrupted, RunFailure::Cancelled, metrics)
                    .await;
            }

            let batch_seq = record.batches_committed + 1;
            let span = context.batch_span(batch_seq);

            let pulled = match pull_batch(&mut items, batch_size).instrument(span.clone()).await {
                Ok(pulled) => pulled,
                Err(e) => return self.stop_on_source_error(store, &record, e, metrics).await,
            };

            let tally = self
                .process_batch(processor, &pulled.items)
                .instrument(span.clone())
                .await;

            let new_status = if tally.fatal.is_some() {
                RunStatus::Interrupted
            } else if pulled.exhausted {
                RunStatus::Completed
            } else {
                RunStatus::Running
            };

            let request = CommitRequest {
                expected_cursor: record.cursor.clone(),
                new_cursor: tally.last_key.clone().or_else(|| record.cursor.clone()),
                processed_delta: tally.succeeded,
                newly_failed: tally.failures.clone(),
                new_status,
            };
            let accounts_items = request.accounts_items();

            let timer = Timer::start();
            let updated = match store.commit_progress(&record.run_id, request).await {
                Ok(updated) => updated,
                Err(e) if e.is_storage_failure() => {
                    metrics.record_commit_failure("storage");
                    error!(
                        parent: &span,
                        error = %e,
                        cursor = ?record.cursor,
                        "Checkpoint write failed; batch will be redone on resume"
                    );
                    return Ok(self.abandon(store, &record, e).await);
                }
                Err(e) => {
                    metrics.record_commit_failure(commit_failure_kind(&e));
                    error!(parent: &span, error = %e, "Checkpoint commit rejected");
                    return Err(e.into());
                }
            };
            metrics.record_commit(updated.status.as_str(), &timer);
            metrics.record_items(Outcome::Success.label(), tally.succeeded);
            metrics.record_items("retryable", tally.failures.len() as u64);

            tracker.increment(tally.succeeded);
            let snapshot = tracker.record_failed(tally.failures.len() as u64);
            record = updated;

            if accounts_items {
                info!(
                    parent: &span,
                    cursor = ?record.cursor,
                    succeeded = tally.succeeded,
                    failed = tally.failures.len(),
                    processed_total = record.processed_count,
                    progress = %tracker.render(),
                    "Batch committed"
                );

                if let Some(callback) = &self.progress_callback {
                    callback(&ProgressUpdate {
                        run_id: record.run_id.clone(),
                        batch_seq: record.batches_committed,
                        processed: record.processed_count,
                        failed: record.failed_items.len() as u64,
                        cursor: record.cursor.clone(),
                        status: record.status,
                        snapshot,
                    });
                }
            }

            if let Some((item_key, reason)) = tally.fatal {
                metrics.record_items("fatal", 1);
                warn!(
                    parent: &span,
                    item_key = %item_key,
                    reason = %reason,
                    "Fatal item; run interrupted"
                );
                return Ok(RunResult::from_record(
                    &record,
                    Some(RunFailure::Fatal { item_key, reason }),
                ));
            }

            if pulled.exhausted {
                return Ok(RunResult::from_record(&record, None));
            }
        }
    }

    async fn process_batch(&self, processor: &dyn ItemProcessor, items: &[Item]) -> BatchTally {
        let pending: Vec<_> = items
            .iter()
            .map(|item| self.process_item(processor, item))
            .collect();
        let mut outcomes = stream::iter(pending)
            .buffered(self.config.concurrency.max(1));

        let mut tally = BatchTally::default();
        while let Some((item, outcome)) = outcomes.next().await {
            match outcome {
                Outcome::Success => {
                    tally.succeeded += 1;
                }
                Outcome::Retryable(reason) => {
                    debug!(item_key = %item.key, reason = %reason, "Item failed");
                    tally.failures.push(NewFailure::new(item.key.clone(), reason));
                }
                Outcome::Fatal(reason) => {
                    tally.fatal = Some((item.key.clone(), reason));
                    break;
                }
            }
            tally.last_key = Some(item.key.clone());
        }
        tally
    }

    async fn process_item<'a>(
        &self,
        processor: &dyn ItemProcessor,
        item: &'a Item,
    ) -> (&'a Item, Outcome) {
        let outcome = match self.config.item_timeout {
            Some(limit) => match tokio::time::timeout(limit, processor.process(item)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let reason = format!("timed out after {:?}", limit);
                    warn!(item_key = %item.key, timeout = ?limit, "Item timed out");
                    match self.config.timeout_policy {
                        TimeoutPolicy::Retryable => Outcome::Retryable(reason),
                        TimeoutPolicy::Fatal => Outcome::Fatal(reason),
                    }
                }
            },
            None => processor.process(item).await,
        };
        (item, outcome)
    }

    /// Record a final status without accounting any items
    async fn stop(
        &self,
        store: &dyn CheckpointStore,
        record: &RunRecord,
        status: RunStatus,
        failure: RunFailure,
        metrics: &RunMetrics,
    ) -> Result<RunResult> {
        let request = CommitRequest::status_only(record.cursor.clone(), status);
        let timer = Timer::start();
        match store.commit_progress(&record.run_id, request).await {
            Ok(updated) => {
                metrics.record_commit(updated.status.as_str(), &timer);
                Ok(RunResult::from_record(&updated, Some(failure)))
            }
            Err(e) if e.is_storage_failure() => {
                metrics.record_commit_failure("storage");
                error!(error = %e, "Could not record final run status");
                Ok(interrupted(record, RunFailure::CheckpointWrite { message: e.to_string() }))
            }
            Err(e) => {
                metrics.record_commit_failure(commit_failure_kind(&e));
                Err(e.into())
            }
        }
    }

    async fn stop_on_source_error(
        &self,
        store: &dyn CheckpointStore,
        record: &RunRecord,
        err: WorkSourceError,
        metrics: &RunMetrics,
    ) -> Result<RunResult> {
        let status = if err.is_transient() {
            RunStatus::Interrupted
        } else {
            RunStatus::Failed
        };
        error!(error = %err, status = %status, cursor = ?record.cursor, "Work source failed");
        let failure = RunFailure::Source {
            message: err.message().to_string(),
            transient: err.is_transient(),
        };
        self.stop(store, record, status, failure, metrics).await
    }

    /// Give up after a failed checkpoint write
    ///
    /// Counters stay at the last committed state. Marking the run interrupted
    /// is attempted once; if the store is still failing the record stays
    /// `running` until stale-run recovery picks it up.
    async fn abandon(
        &self,
        store: &dyn CheckpointStore,
        record: &RunRecord,
        err: CheckpointError,
    ) -> RunResult {
        let request = CommitRequest::status_only(record.cursor.clone(), RunStatus::Interrupted);
        if let Err(e) = store.commit_progress(&record.run_id, request).await {
            debug!(error = %e, "Could not mark run interrupted");
        }
        interrupted(record, RunFailure::CheckpointWrite { message: err.to_string() })
    }
}

fn interrupted(record: &RunRecord, failure: RunFailure) -> RunResult {
    let mut result = RunResult::from_record(record, Some(failure));
    result.status = RunStatus::Interrupted;
    result
}

fn commit_failure_kind(err: &CheckpointError) -> &'static str {
    match err {
        CheckpointError::NotFound(_) => "not_found",
        CheckpointError::DuplicateRun(_) => "duplicate_run",
        CheckpointError::StaleCheckpoint { .. } => "stale_checkpoint",
        CheckpointError::InvalidTransition { .. } => "invalid_transition",
        CheckpointError::CountExceeded { .. } => "count_exceeded",
        CheckpointError::Storage(_) => "storage",
        CheckpointError::InvalidData(_) => "invalid_data",
    }
}

async fn pull_batch(
    items: &mut ItemStream<'_>,
    batch_size: usize,
) -> std::result::Result<Pulled, WorkSourceError> {
    let mut batch = Vec::with_capacity(batch_size);
    while batch.len() < batch_size {
        match items.next().await {
            Some(Ok(item)) => batch.push(item),
            Some(Err(e)) => return Err(e),
            None => {
                return Ok(Pulled {
                    items: batch,
                    exhausted: true,
                })
            }
        }
    }
    Ok(Pulled {
        items: batch,
        exhausted: false,
    })
}
