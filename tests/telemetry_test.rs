//! Correlation and progress as seen from inside a run

use batchrun::batch::{processor_fn, BatchProcessor, Item, Outcome, VecWorkSource};
use batchrun::checkpoint::MemoryCheckpointStore;
use batchrun::telemetry::{current, CorrelationContext, ProgressTracker, RenderMode};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_processor_sees_only_its_own_run() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let mut handles = Vec::new();

    for (run_id, source_id) in [("run-denns", "denns"), ("run-rewe", "rewe")] {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let processor = {
                let seen = seen.clone();
                processor_fn(move |_item: Item| {
                    let seen = seen.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        seen.lock().push(current().expect("context bound inside run"));
                        Outcome::Success
                    }
                })
            };
            let source = VecWorkSource::from_keys(source_id, (1..=6).map(|i| format!("{}{}", source_id, i)));
            BatchProcessor::new()
                .with_batch_size(2)
                .with_correlation_field("trigger", "nightly")
                .run(&source, &processor, store.as_ref(), run_id)
                .await
                .unwrap();
            let fields = seen.lock().clone();
            (run_id, source_id, fields)
        }));
    }

    for handle in handles {
        let (run_id, source_id, fields) = handle.await.unwrap();
        assert_eq!(fields.len(), 6);
        assert!(fields.iter().all(|f| f.run_id == run_id && f.source_id == source_id));
        assert!(fields.iter().all(|f| f.extra.get("trigger").map(String::as_str) == Some("nightly")));
        let seqs: Vec<u64> = fields.iter().map(|f| f.batch_seq).collect();
        assert_eq!(seqs, vec![1, 1, 2, 2, 3, 3]);
    }

    assert!(current().is_none(), "context must not leak out of the run");
}

#[tokio::test]
async fn test_run_events_carry_run_identity() {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .json()
            .with_span_list(true)
            .with_writer(move || writer.clone()),
    );
    let _default = tracing::subscriber::set_default(subscriber);

    let store = MemoryCheckpointStore::new();
    let processor = processor_fn(|_item: Item| async { Outcome::Success });
    BatchProcessor::new()
        .with_batch_size(2)
        .run(
            &VecWorkSource::from_keys("vollcorner", ["s1", "s2", "s3"]),
            &processor,
            &store,
            "run-traced",
        )
        .await
        .unwrap();

    let output = String::from_utf8(captured.0.lock().clone()).unwrap();
    let committed: Vec<&str> = output
        .lines()
        .filter(|line| line.contains("Batch committed"))
        .collect();
    assert_eq!(committed.len(), 2);
    for line in committed {
        assert!(line.contains("\"run_id\":\"run-traced\""), "{}", line);
        assert!(line.contains("\"source_id\":\"vollcorner\""), "{}", line);
        assert!(line.contains("\"batch_seq\""), "{}", line);
    }
}

#[tokio::test]
async fn test_nested_scopes_restore_outer_context() {
    let outer = CorrelationContext::new("outer", "globus");
    let inner = CorrelationContext::new("inner", "globus");

    let seen = outer
        .scope(async {
            let before = current().unwrap().run_id;
            let nested = inner.scope(async { current().unwrap().run_id }).await;
            let after = current().unwrap().run_id;
            (before, nested, after)
        })
        .await;

    assert_eq!(seen, ("outer".to_string(), "inner".to_string(), "outer".to_string()));
}

#[test]
fn test_tracker_is_thread_safe() {
    let tracker = Arc::new(ProgressTracker::new(Some(800)).with_mode(RenderMode::Text));
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let tracker = tracker.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    tracker.increment(1);
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.completed, 800);
    assert_eq!(snapshot.percentage(), Some(100.0));
    assert_eq!(tracker.render(), "800/800 items processed");
}
