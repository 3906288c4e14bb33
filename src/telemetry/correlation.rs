//! Run-scoped correlation of diagnostics
//!
//! A [`CorrelationContext`] carries the identity of one run. It can be bound
//! to the current thread with [`CorrelationContext::enter`] or to an async
//! task with [`CorrelationContext::scope`]. Both also open a `batch_run`
//! tracing span, so every event emitted inside carries `run_id` and
//! `source_id`. Collaborators that need the values themselves (for example to
//! pass them to a child process) read them with [`current`].
//!
//! Contexts of concurrent runs never share state. Bindings are undone when
//! the guard or the scoped future is dropped, including during unwinding.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::Instrument;

tokio::task_local! {
    static TASK_CONTEXT: CorrelationContext;
}

thread_local! {
    static THREAD_CONTEXT: RefCell<Option<CorrelationContext>> = const { RefCell::new(None) };
}

/// Plain values of a correlation context
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrelationFields {
    /// Run identifier
    pub run_id: String,
    /// Source identifier
    pub source_id: String,
    /// Sequence number of the batch in progress
    pub batch_seq: u64,
    /// Caller-supplied fields
    pub extra: BTreeMap<String, String>,
}

/// Identity of one run, shared by everything executing on its behalf
#[derive(Debug, Clone)]
pub struct CorrelationContext {
    run_id: Arc<str>,
    source_id: Arc<str>,
    extra: Arc<BTreeMap<String, String>>,
    batch_seq: Arc<AtomicU64>,
}

impl CorrelationContext {
    /// Context for a run
    pub fn new(run_id: &str, source_id: &str) -> Self {
        Self {
            run_id: Arc::from(run_id),
            source_id: Arc::from(source_id),
            extra: Arc::new(BTreeMap::new()),
            batch_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Attach an extra field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.extra).insert(key.into(), value.into());
        self
    }

    /// Attach several extra fields
    pub fn with_fields<I, K, V>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let extra = Arc::make_mut(&mut self.extra);
        for (key, value) in fields {
            extra.insert(key.into(), value.into());
        }
        self
    }

    /// Run identifier
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Source identifier
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Update the batch sequence number seen by readers of this context
    pub fn set_batch_seq(&self, seq: u64) {
        self.batch_seq.store(seq, Ordering::Release);
    }

    /// Batch sequence number
    pub fn batch_seq(&self) -> u64 {
        self.batch_seq.load(Ordering::Acquire)
    }

    /// Snapshot of all fields
    pub fn fields(&self) -> CorrelationFields {
        CorrelationFields {
            run_id: self.run_id.to_string(),
            source_id: self.source_id.to_string(),
            batch_seq: self.batch_seq(),
            extra: self.extra.as_ref().clone(),
        }
    }

    /// Span carrying the run identity
    pub fn span(&self) -> tracing::Span {
        let span = tracing::info_span!(
            "batch_run",
            run_id = %self.run_id,
            source_id = %self.source_id,
            fields = tracing::field::Empty,
        );
        if !self.extra.is_empty() {
            let rendered = self
                .extra
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect::<Vec<_>>()
                .join(",");
            span.record("fields", rendered.as_str());
        }
        span
    }

    /// Span for one batch, nested in whatever span is current
    pub fn batch_span(&self, seq: u64) -> tracing::Span {
        self.set_batch_seq(seq);
        tracing::info_span!("batch", batch_seq = seq)
    }

    /// Bind this context to the current thread until the guard drops
    pub fn enter(&self) -> CorrelationGuard {
        let previous = THREAD_CONTEXT.with(|slot| slot.replace(Some(self.clone())));
        CorrelationGuard {
            previous,
            _span: self.span().entered(),
            _not_send: PhantomData,
        }
    }

    /// Run `future` with this context bound to it
    pub async fn scope<F>(&self, future: F) -> F::Output
    where
        F: Future,
    {
        TASK_CONTEXT
            .scope(self.clone(), future.instrument(self.span()))
            .await
    }
}

/// Thread binding created by [`CorrelationContext::enter`]
#[must_use = "the context is unbound as soon as the guard is dropped"]
pub struct CorrelationGuard {
    previous: Option<CorrelationContext>,
    _span: tracing::span::EnteredSpan,
    _not_send: PhantomData<*const ()>,
}

impl Drop for CorrelationGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        THREAD_CONTEXT.with(|slot| *slot.borrow_mut() = previous);
    }
}

/// Fields of the innermost active context, task binding first
pub fn current() -> Option<CorrelationFields> {
    TASK_CONTEXT
        .try_with(CorrelationContext::fields)
        .ok()
        .or_else(|| THREAD_CONTEXT.with(|slot| slot.borrow().as_ref().map(CorrelationContext::fields)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_binds_and_restores() {
        assert!(current().is_none());
        {
            let _outer = CorrelationContext::new("run-a", "denns").enter();
            assert_eq!(current().unwrap().run_id, "run-a");
            {
                let _inner = CorrelationContext::new("run-b", "rewe").enter();
                assert_eq!(current().unwrap().run_id, "run-b");
            }
            assert_eq!(current().unwrap().run_id, "run-a");
        }
        assert!(current().is_none());
    }

    #[test]
    fn test_guard_released_on_panic() {
        let result = std::panic::catch_unwind(|| {
            let _guard = CorrelationContext::new("run-panic", "denns").enter();
            panic!("boom");
        });
        assert!(result.is_err());
        assert!(current().is_none());
    }

    #[test]
    fn test_extra_fields_and_batch_seq() {
        let ctx = CorrelationContext::new("run-a", "denns")
            .with_field("region", "berlin")
            .with_fields([("operator", "cron")]);
        ctx.set_batch_seq(3);

        let fields = ctx.fields();
        assert_eq!(fields.batch_seq, 3);
        assert_eq!(fields.extra.get("region").map(String::as_str), Some("berlin"));
        assert_eq!(fields.extra.len(), 2);
    }

    #[tokio::test]
    async fn test_scope_is_task_local() {
        let ctx = CorrelationContext::new("run-task", "globus");
        let seen = ctx
            .scope(async {
                tokio::task::yield_now().await;
                current().map(|fields| fields.run_id)
            })
            .await;
        assert_eq!(seen.as_deref(), Some("run-task"));
        assert!(current().is_none());
    }
}
