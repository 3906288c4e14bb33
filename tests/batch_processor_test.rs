//! Run-level behavior of BatchProcessor against the in-memory store
//!
//! The five-item source `s1..s5` with batch size 2 is used throughout.

use async_trait::async_trait;
use batchrun::batch::{
    processor_fn, BatchProcessor, Item, ItemStream, Outcome, ProgressUpdate, RunFailure,
    VecWorkSource, WorkSource, WorkSourceError,
};
use batchrun::checkpoint::{
    CheckpointError, CheckpointStore, CommitRequest, FailedItem, MemoryCheckpointStore, RunRecord,
    RunStatus,
};
use batchrun::BatchRunError;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const KEYS: [&str; 5] = ["s1", "s2", "s3", "s4", "s5"];

fn five_items() -> VecWorkSource {
    VecWorkSource::from_keys("denns", KEYS)
}

/// Keys passed to the processor, in call order
#[derive(Clone, Default)]
struct Calls(Arc<Mutex<Vec<String>>>);

impl Calls {
    fn record(&self, key: &str) {
        self.0.lock().push(key.to_string());
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }
}

fn keys(list: &[&str]) -> Vec<String> {
    list.iter().map(|key| key.to_string()).collect()
}

/// Store wrapper that records every successful commit
#[derive(Default)]
struct RecordingStore {
    inner: MemoryCheckpointStore,
    commits: Mutex<Vec<(Option<String>, u64, RunStatus)>>,
}

#[async_trait]
impl CheckpointStore for RecordingStore {
    async fn create_run(
        &self,
        run_id: &str,
        source_id: &str,
        batch_size: u32,
        total_items: Option<u64>,
    ) -> Result<RunRecord, CheckpointError> {
        self.inner.create_run(run_id, source_id, batch_size, total_items).await
    }

    async fn load_run(&self, run_id: &str) -> Result<RunRecord, CheckpointError> {
        self.inner.load_run(run_id).await
    }

    async fn commit_progress(
        &self,
        run_id: &str,
        request: CommitRequest,
    ) -> Result<RunRecord, CheckpointError> {
        let entry = (request.new_cursor.clone(), request.processed_delta, request.new_status);
        let record = self.inner.commit_progress(run_id, request).await?;
        self.commits.lock().push(entry);
        Ok(record)
    }

    async fn list_incomplete_runs(
        &self,
        source_id: Option<&str>,
    ) -> Result<Vec<RunRecord>, CheckpointError> {
        self.inner.list_incomplete_runs(source_id).await
    }

    async fn list_runs(
        &self,
        source_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<RunRecord>, CheckpointError> {
        self.inner.list_runs(source_id, limit).await
    }

    async fn archive_runs(
        &self,
        source_id: Option<&str>,
        keep_recent: usize,
    ) -> Result<u64, CheckpointError> {
        self.inner.archive_runs(source_id, keep_recent).await
    }
}

/// Store whose commit to a given cursor fails once with a storage error
struct FlakyStore {
    inner: MemoryCheckpointStore,
    fail_on_cursor: String,
    armed: AtomicBool,
}

impl FlakyStore {
    fn new(fail_on_cursor: &str) -> Self {
        Self {
            inner: MemoryCheckpointStore::new(),
            fail_on_cursor: fail_on_cursor.to_string(),
            armed: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl CheckpointStore for FlakyStore {
    async fn create_run(
        &self,
        run_id: &str,
        source_id: &str,
        batch_size: u32,
        total_items: Option<u64>,
    ) -> Result<RunRecord, CheckpointError> {
        self.inner.create_run(run_id, source_id, batch_size, total_items).await
    }

    async fn load_run(&self, run_id: &str) -> Result<RunRecord, CheckpointError> {
        self.inner.load_run(run_id).await
    }

    async fn commit_progress(
        &self,
        run_id: &str,
        request: CommitRequest,
    ) -> Result<RunRecord, CheckpointError> {
        if request.new_cursor.as_deref() == Some(self.fail_on_cursor.as_str())
            && self.armed.swap(false, Ordering::SeqCst)
        {
            return Err(CheckpointError::Storage("connection reset by peer".into()));
        }
        self.inner.commit_progress(run_id, request).await
    }

    async fn list_incomplete_runs(
        &self,
        source_id: Option<&str>,
    ) -> Result<Vec<RunRecord>, CheckpointError> {
        self.inner.list_incomplete_runs(source_id).await
    }

    async fn list_runs(
        &self,
        source_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<RunRecord>, CheckpointError> {
        self.inner.list_runs(source_id, limit).await
    }

    async fn archive_runs(
        &self,
        source_id: Option<&str>,
        keep_recent: usize,
    ) -> Result<u64, CheckpointError> {
        self.inner.archive_runs(source_id, keep_recent).await
    }
}

/// Source that yields some items and then fails
struct BrokenSource {
    items: Vec<Item>,
    error: WorkSourceError,
}

#[async_trait]
impl WorkSource for BrokenSource {
    fn source_id(&self) -> &str {
        "globus"
    }

    async fn resume_from(&self, cursor: Option<&str>) -> Result<ItemStream<'_>, WorkSourceError> {
        let start = cursor
            .and_then(|cursor| self.items.iter().position(|item| item.key == cursor))
            .map_or(0, |position| position + 1);
        let items = self.items[start..].iter().cloned().map(Ok);
        Ok(stream::iter(items)
            .chain(stream::once(futures::future::ready(Err(self.error.clone()))))
            .boxed())
    }
}

#[tokio::test]
async fn test_completed_run_is_not_reprocessed() {
    let store = MemoryCheckpointStore::new();
    let source = five_items();
    let calls = Calls::default();
    let processor = {
        let calls = calls.clone();
        processor_fn(move |item: Item| {
            calls.record(&item.key);
            async { Outcome::Success }
        })
    };
    let engine = BatchProcessor::new().with_batch_size(2);

    let first = engine.run(&source, &processor, &store, "run-1").await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.processed, 5);
    assert_eq!(calls.take(), keys(&KEYS));

    let second = engine.run(&source, &processor, &store, "run-1").await.unwrap();
    assert!(calls.take().is_empty(), "completed run must not invoke the processor");
    assert_eq!(second, first);
}

#[tokio::test]
async fn test_crash_mid_batch_resumes_after_committed_cursor() {
    let store = MemoryCheckpointStore::new();
    let source = five_items();
    let calls = Calls::default();
    let hang = Arc::new(AtomicBool::new(true));

    let processor = {
        let calls = calls.clone();
        let hang = hang.clone();
        processor_fn(move |item: Item| {
            calls.record(&item.key);
            let hang = hang.clone();
            async move {
                if item.key == "s4" && hang.load(Ordering::SeqCst) {
                    std::future::pending::<()>().await;
                }
                Outcome::Success
            }
        })
    };
    let engine = BatchProcessor::new().with_batch_size(2);

    // The process "dies" while s4 is in flight
    let crashed = tokio::time::timeout(
        Duration::from_millis(200),
        engine.run(&source, &processor, &store, "run-crash"),
    )
    .await;
    assert!(crashed.is_err());

    let record = store.load_run("run-crash").await.unwrap();
    assert_eq!(record.status, RunStatus::Running);
    assert_eq!(record.cursor.as_deref(), Some("s2"));
    assert_eq!(record.processed_count, 2);
    assert_eq!(calls.take(), keys(&["s1", "s2", "s3", "s4"]));

    hang.store(false, Ordering::SeqCst);
    let result = engine.run(&source, &processor, &store, "run-crash").await.unwrap();

    assert_eq!(calls.take(), keys(&["s3", "s4", "s5"]));
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.processed, 5);
    assert_eq!(result.cursor.as_deref(), Some("s5"));
}

#[tokio::test]
async fn test_retryable_failure_is_isolated() {
    let store = MemoryCheckpointStore::new();
    let processor = processor_fn(|item: Item| async move {
        if item.key == "s3" {
            Outcome::retryable("malformed store page")
        } else {
            Outcome::Success
        }
    });

    let result = BatchProcessor::new()
        .with_batch_size(2)
        .run(&five_items(), &processor, &store, "run-partial")
        .await
        .unwrap();
    assert_eq!(result.failure, None);

    let record = store.load_run("run-partial").await.unwrap();
    assert_eq!(record.processed_count, 4);
    assert_eq!(
        record.failed_items,
        vec![FailedItem {
            item_key: "s3".to_string(),
            error_message: "malformed store page".to_string(),
            attempt_count: 1,
        }]
    );
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.cursor.as_deref(), Some("s5"));
}

#[tokio::test]
async fn test_fatal_aborts_and_resume_continues_past_it() {
    let store = MemoryCheckpointStore::new();
    let source = five_items();
    let calls = Calls::default();
    let broken = Arc::new(AtomicBool::new(true));

    let processor = {
        let calls = calls.clone();
        let broken = broken.clone();
        processor_fn(move |item: Item| {
            calls.record(&item.key);
            let fatal = item.key == "s3" && broken.load(Ordering::SeqCst);
            async move {
                if fatal {
                    Outcome::fatal("site layout changed")
                } else {
                    Outcome::Success
                }
            }
        })
    };
    let engine = BatchProcessor::new().with_batch_size(2);

    let aborted = engine.run(&source, &processor, &store, "run-fatal").await.unwrap();
    assert_eq!(aborted.status, RunStatus::Interrupted);
    assert_eq!(aborted.processed, 2);
    assert_eq!(aborted.cursor.as_deref(), Some("s2"));
    assert_eq!(
        aborted.failure,
        Some(RunFailure::Fatal {
            item_key: "s3".to_string(),
            reason: "site layout changed".to_string(),
        })
    );
    assert_ne!(aborted.exit_code(), 0);
    assert_eq!(calls.take(), keys(&["s1", "s2", "s3"]));

    broken.store(false, Ordering::SeqCst);
    let resumed = engine.run(&source, &processor, &store, "run-fatal").await.unwrap();
    assert_eq!(calls.take(), keys(&["s3", "s4", "s5"]));
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.processed, 5);
    assert_eq!(resumed.exit_code(), 0);
}

#[tokio::test]
async fn test_commits_follow_batches_in_order() {
    let store = RecordingStore::default();
    let processor = processor_fn(|_item: Item| async { Outcome::Success });

    BatchProcessor::new()
        .with_batch_size(2)
        .run(&five_items(), &processor, &store, "run-order")
        .await
        .unwrap();

    let commits = store.commits.lock().clone();
    assert_eq!(
        commits,
        vec![
            (None, 0, RunStatus::Running),
            (Some("s2".to_string()), 2, RunStatus::Running),
            (Some("s4".to_string()), 2, RunStatus::Running),
            (Some("s5".to_string()), 1, RunStatus::Completed),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_runs_are_isolated() {
    let store = Arc::new(MemoryCheckpointStore::new());
    // Each run waits for the other inside its first item, so the test only
    // finishes if both make progress at the same time.
    let barrier = Arc::new(tokio::sync::Barrier::new(2));

    let spawn_run = |run_id: &'static str, source: VecWorkSource| {
        let store = store.clone();
        let barrier = barrier.clone();
        tokio::spawn(async move {
            let waited = Arc::new(AtomicBool::new(false));
            let processor = processor_fn(move |_item: Item| {
                let barrier = barrier.clone();
                let waited = waited.clone();
                async move {
                    if !waited.swap(true, Ordering::SeqCst) {
                        barrier.wait().await;
                    }
                    Outcome::Success
                }
            });
            BatchProcessor::new()
                .with_batch_size(2)
                .run(&source, &processor, store.as_ref(), run_id)
                .await
        })
    };

    let a = spawn_run("run-a", VecWorkSource::from_keys("denns", ["a1", "a2", "a3"]));
    let b = spawn_run("run-b", VecWorkSource::from_keys("rewe", ["b1", "b2", "b3", "b4"]));

    let (a, b) = tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(a, b) })
        .await
        .expect("runs blocked each other");
    let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());

    assert_eq!((a.processed, a.cursor.as_deref()), (3, Some("a3")));
    assert_eq!((b.processed, b.cursor.as_deref()), (4, Some("b4")));

    let record_a = store.load_run("run-a").await.unwrap();
    let record_b = store.load_run("run-b").await.unwrap();
    assert_eq!(record_a.source_id, "denns");
    assert_eq!(record_b.source_id, "rewe");
    assert!(record_a.failed_items.is_empty() && record_b.failed_items.is_empty());
}

#[tokio::test]
async fn test_cancellation_interrupts_at_batch_boundary() {
    let store = MemoryCheckpointStore::new();
    let source = five_items();
    let token = CancellationToken::new();

    let processor = {
        let token = token.clone();
        processor_fn(move |item: Item| {
            if item.key == "s1" {
                token.cancel();
            }
            async { Outcome::Success }
        })
    };

    let result = BatchProcessor::new()
        .with_batch_size(2)
        .with_cancellation(token)
        .run(&source, &processor, &store, "run-cancel")
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Interrupted);
    assert_eq!(result.failure, Some(RunFailure::Cancelled));
    assert_eq!(result.processed, 2);
    assert_eq!(result.cursor.as_deref(), Some("s2"));

    let incomplete = store.list_incomplete_runs(Some("denns")).await.unwrap();
    assert_eq!(incomplete.len(), 1);

    let ok = processor_fn(|_item: Item| async { Outcome::Success });
    let resumed = BatchProcessor::new()
        .run(&source, &ok, &store, "run-cancel")
        .await
        .unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.processed, 5);
}

#[tokio::test]
async fn test_checkpoint_write_failure_redoes_batch() {
    let store = FlakyStore::new("s4");
    let source = five_items();
    let calls = Calls::default();
    let processor = {
        let calls = calls.clone();
        processor_fn(move |item: Item| {
            calls.record(&item.key);
            async { Outcome::Success }
        })
    };
    let engine = BatchProcessor::new().with_batch_size(2);

    let failed = engine.run(&source, &processor, &store, "run-flaky").await.unwrap();
    assert_eq!(failed.status, RunStatus::Interrupted);
    assert_eq!(failed.processed, 2);
    assert_eq!(failed.cursor.as_deref(), Some("s2"));
    assert!(matches!(failed.failure, Some(RunFailure::CheckpointWrite { .. })));

    let stored = store.load_run("run-flaky").await.unwrap();
    assert_eq!(stored.processed_count, 2);
    assert_eq!(stored.status, RunStatus::Interrupted);
    calls.take();

    let resumed = engine.run(&source, &processor, &store, "run-flaky").await.unwrap();
    assert_eq!(calls.take(), keys(&["s3", "s4", "s5"]));
    assert_eq!(resumed.processed, 5);
    assert_eq!(resumed.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_foreign_commit_surfaces_stale_checkpoint() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let processor = {
        let store = store.clone();
        processor_fn(move |item: Item| {
            let store = store.clone();
            async move {
                if item.key == "s3" {
                    // a second writer advances the same run behind our back
                    store
                        .commit_progress(
                            "run-stale",
                            CommitRequest {
                                expected_cursor: Some("s2".into()),
                                new_cursor: Some("s3".into()),
                                processed_delta: 1,
                                newly_failed: Vec::new(),
                                new_status: RunStatus::Running,
                            },
                        )
                        .await
                        .unwrap();
                }
                Outcome::Success
            }
        })
    };

    let err = BatchProcessor::new()
        .with_batch_size(2)
        .run(&five_items(), &processor, store.as_ref(), "run-stale")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BatchRunError::Checkpoint(CheckpointError::StaleCheckpoint { .. })
    ));
    let record = store.load_run("run-stale").await.unwrap();
    assert_eq!(record.processed_count, 3);
    assert_eq!(record.cursor.as_deref(), Some("s3"));
}

#[tokio::test]
async fn test_existing_run_without_resume_is_rejected() {
    let store = MemoryCheckpointStore::new();
    let processor = processor_fn(|_item: Item| async { Outcome::Success });
    BatchProcessor::new()
        .run(&five_items(), &processor, &store, "run-dup")
        .await
        .unwrap();

    let err = BatchProcessor::new()
        .with_resume(false)
        .run(&five_items(), &processor, &store, "run-dup")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BatchRunError::Checkpoint(CheckpointError::DuplicateRun(_))
    ));

    let other_source = VecWorkSource::from_keys("rewe", ["s1"]);
    let err = BatchProcessor::new()
        .run(&other_source, &processor, &store, "run-dup")
        .await
        .unwrap_err();
    assert!(matches!(err, BatchRunError::SourceMismatch { .. }));
}

#[tokio::test]
async fn test_progress_callback_after_each_commit() {
    let store = MemoryCheckpointStore::new();
    let updates: Arc<Mutex<Vec<ProgressUpdate>>> = Arc::default();
    let processor = processor_fn(|_item: Item| async { Outcome::Success });

    let result = BatchProcessor::new()
        .with_batch_size(2)
        .with_progress_callback({
            let updates = updates.clone();
            move |update: &ProgressUpdate| updates.lock().push(update.clone())
        })
        .run(&five_items(), &processor, &store, "run-progress")
        .await
        .unwrap();
    assert!(result.is_completed());

    let updates = updates.lock();
    let seen: Vec<(u64, u64, Option<&str>)> = updates
        .iter()
        .map(|update| (update.batch_seq, update.processed, update.cursor.as_deref()))
        .collect();
    assert_eq!(
        seen,
        vec![(1, 2, Some("s2")), (2, 4, Some("s4")), (3, 5, Some("s5"))]
    );
    assert_eq!(updates[2].snapshot.percentage(), Some(100.0));
    assert_eq!(updates[2].status, RunStatus::Completed);
}

#[tokio::test]
async fn test_concurrent_items_are_accounted_in_source_order() {
    let store = MemoryCheckpointStore::new();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let processor = {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        processor_fn(move |item: Item| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                // earlier items finish last
                let delay = match item.key.as_str() {
                    "s1" => 40,
                    "s2" => 30,
                    "s3" => 20,
                    _ => 5,
                };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                if item.key == "s2" || item.key == "s4" {
                    Outcome::retryable(format!("{} unavailable", item.key))
                } else {
                    Outcome::Success
                }
            }
        })
    };

    let result = BatchProcessor::new()
        .with_batch_size(5)
        .with_concurrency(5)
        .run(&five_items(), &processor, &store, "run-parallel")
        .await
        .unwrap();

    assert!(peak.load(Ordering::SeqCst) > 1);
    assert_eq!(result.cursor.as_deref(), Some("s5"));
    assert_eq!(result.processed, 3);
    let record = store.load_run("run-parallel").await.unwrap();
    let failed: Vec<&str> = record.failed_items.iter().map(|f| f.item_key.as_str()).collect();
    assert_eq!(failed, vec!["s2", "s4"]);
}

#[tokio::test]
async fn test_fatal_with_concurrency_discards_later_results() {
    let store = MemoryCheckpointStore::new();
    let processor = processor_fn(|item: Item| async move {
        match item.key.as_str() {
            "s3" => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Outcome::fatal("captcha wall")
            }
            _ => Outcome::Success,
        }
    });

    let result = BatchProcessor::new()
        .with_batch_size(5)
        .with_concurrency(5)
        .run(&five_items(), &processor, &store, "run-parallel-fatal")
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Interrupted);
    assert_eq!(result.processed, 2);
    assert_eq!(result.cursor.as_deref(), Some("s2"));
}

#[tokio::test]
async fn test_source_errors_end_the_run() {
    let store = MemoryCheckpointStore::new();
    let processor = processor_fn(|_item: Item| async { Outcome::Success });
    let items: Vec<Item> = ["g1", "g2", "g3"].into_iter().map(Item::keyed).collect();

    let transient = BrokenSource {
        items: items.clone(),
        error: WorkSourceError::Transient("listing page timed out".into()),
    };
    let result = BatchProcessor::new()
        .with_batch_size(2)
        .run(&transient, &processor, &store, "run-transient")
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Interrupted);
    // g3 was pulled with the failing read and is not accounted
    assert_eq!(result.processed, 2);
    assert_eq!(result.cursor.as_deref(), Some("g2"));
    assert_eq!(
        result.failure,
        Some(RunFailure::Source {
            message: "listing page timed out".into(),
            transient: true,
        })
    );

    let permanent = BrokenSource {
        items,
        error: WorkSourceError::Permanent("source removed".into()),
    };
    let result = BatchProcessor::new()
        .with_batch_size(2)
        .run(&permanent, &processor, &store, "run-permanent")
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Failed);

    // failed runs are terminal and return their stored state
    let again = BatchProcessor::new()
        .run(&permanent, &processor, &store, "run-permanent")
        .await
        .unwrap();
    assert_eq!(again.status, RunStatus::Failed);
    assert_eq!(again.processed, 2);
}

#[tokio::test]
async fn test_resumed_run_keeps_stored_batch_size() {
    let store = RecordingStore::default();
    let token = CancellationToken::new();
    let processor = {
        let token = token.clone();
        processor_fn(move |_item: Item| {
            token.cancel();
            async { Outcome::Success }
        })
    };

    BatchProcessor::new()
        .with_batch_size(2)
        .with_cancellation(token)
        .run(&five_items(), &processor, &store, "run-size")
        .await
        .unwrap();

    let ok = processor_fn(|_item: Item| async { Outcome::Success });
    BatchProcessor::new()
        .with_batch_size(10)
        .run(&five_items(), &ok, &store, "run-size")
        .await
        .unwrap();

    let cursors: Vec<Option<String>> = store
        .commits
        .lock()
        .iter()
        .filter(|(_, delta, _)| *delta > 0)
        .map(|(cursor, _, _)| cursor.clone())
        .collect();
    assert_eq!(
        cursors,
        vec![Some("s2".into()), Some("s4".into()), Some("s5".into())]
    );
}
