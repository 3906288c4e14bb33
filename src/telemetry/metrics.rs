//! Prometheus metrics for batch runs
//!
//! Metrics live in the default process registry; [`gather`] renders them in
//! the text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    /// Finished runs by final status
    static ref RUNS: IntCounterVec = register_int_counter_vec!(
        "batchrun_runs_total",
        "Total number of finished runs",
        &["source_id", "status"]
    ).unwrap();

    /// Runs currently executing in this process
    static ref ACTIVE_RUNS: IntGauge = register_int_gauge!(
        "batchrun_active_runs",
        "Number of runs currently executing"
    ).unwrap();

    /// Processed items by outcome
    static ref ITEMS: IntCounterVec = register_int_counter_vec!(
        "batchrun_items_total",
        "Total number of processed items",
        &["source_id", "outcome"]
    ).unwrap();

    /// Successful checkpoint commits by resulting status
    static ref COMMITS: IntCounterVec = register_int_counter_vec!(
        "batchrun_checkpoint_commits_total",
        "Total number of successful checkpoint commits",
        &["status"]
    ).unwrap();

    /// Rejected or failed checkpoint commits
    static ref COMMIT_FAILURES: IntCounterVec = register_int_counter_vec!(
        "batchrun_checkpoint_failures_total",
        "Total number of failed checkpoint commits",
        &["kind"]
    ).unwrap();

    /// Commit latency
    static ref COMMIT_DURATION: HistogramVec = register_histogram_vec!(
        "batchrun_checkpoint_commit_seconds",
        "Checkpoint commit duration in seconds",
        &["backend"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();
}

/// Metrics recorder bound to one run's source
#[derive(Debug, Clone)]
pub struct RunMetrics {
    source_id: String,
}

impl RunMetrics {
    /// Recorder for runs over `source_id`
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
        }
    }

    /// A run started executing
    pub fn record_run_start(&self) -> ActiveRun {
        ACTIVE_RUNS.inc();
        ActiveRun { _private: () }
    }

    /// A run returned with `status`
    pub fn record_run_end(&self, status: &str) {
        RUNS.with_label_values(&[&self.source_id, status]).inc();
    }

    /// Items finished with `outcome`
    pub fn record_items(&self, outcome: &str, count: u64) {
        if count > 0 {
            ITEMS
                .with_label_values(&[&self.source_id, outcome])
                .inc_by(count);
        }
    }

    /// A commit succeeded
    pub fn record_commit(&self, status: &str, timer: &Timer) {
        COMMITS.with_label_values(&[status]).inc();
        COMMIT_DURATION
            .with_label_values(&["store"])
            .observe(timer.elapsed_secs());
    }

    /// A commit was rejected or could not be written
    pub fn record_commit_failure(&self, kind: &str) {
        COMMIT_FAILURES.with_label_values(&[kind]).inc();
    }
}

/// Keeps the active-runs gauge raised while alive
#[derive(Debug)]
pub struct ActiveRun {
    _private: (),
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        ACTIVE_RUNS.dec();
    }
}

/// Timer for measuring operation duration
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer
    #[inline]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed time in seconds
    #[inline]
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Render all registered metrics in the Prometheus text format
pub fn gather() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_exported() {
        let metrics = RunMetrics::new("metrics-test");
        {
            let _active = metrics.record_run_start();
            metrics.record_items("success", 3);
            metrics.record_commit("running", &Timer::start());
            metrics.record_run_end("completed");
        }

        let text = gather().unwrap();
        assert!(text.contains("batchrun_runs_total"));
        assert!(text.contains("batchrun_items_total"));
        assert!(text.contains("metrics-test"));
    }
}
