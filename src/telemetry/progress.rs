//! Progress tracking with rate and ETA estimation
//!
//! `ProgressTracker` is a thread-safe pair of counters plus a start time;
//! everything else is derived on demand in a [`ProgressSnapshot`].

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::checkpoint::RunRecord;

const BAR_WIDTH: usize = 30;

/// How `render` formats a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// `[#####-----] 50.0% (5/10)`
    #[default]
    Bar,
    /// `50.0% (5/10)`
    Percentage,
    /// `5/10 items processed, 1 failed`
    Text,
}

/// Point-in-time view of a run's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Items accounted for, failures included
    pub completed: u64,
    /// Items that failed
    pub failed: u64,
    /// Total items, when known
    pub total: Option<u64>,
    /// Items per second since the tracker started
    pub rate: f64,
    /// Estimated time remaining; `None` when total or rate is unknown
    pub eta: Option<Duration>,
    /// Time since the tracker started
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Completion percentage capped at 100, or `None` without a total
    pub fn percentage(&self) -> Option<f64> {
        let total = self.total?;
        if total == 0 {
            return Some(100.0);
        }
        Some((self.completed as f64 / total as f64 * 100.0).min(100.0))
    }

    /// Successful items
    pub fn succeeded(&self) -> u64 {
        self.completed.saturating_sub(self.failed)
    }

    /// Whether every known item has been accounted for
    pub fn is_complete(&self) -> bool {
        self.total.is_some_and(|total| self.completed >= total)
    }

    /// Progress of a stored run, rate measured from its creation time
    pub fn from_record(record: &RunRecord) -> Self {
        let elapsed = (record.updated_at - record.created_at)
            .to_std()
            .unwrap_or_default();
        let completed = record.accounted();
        let mut snapshot = Self::derive(
            completed,
            record.failed_items.len() as u64,
            record.total_items,
            completed,
            elapsed,
        );
        if record.status.is_terminal() {
            snapshot.eta = None;
        }
        snapshot
    }

    /// Same as `from_record`, measuring elapsed time up to now
    pub fn from_record_now(record: &RunRecord) -> Self {
        let elapsed = (Utc::now() - record.created_at).to_std().unwrap_or_default();
        let completed = record.accounted();
        Self::derive(
            completed,
            record.failed_items.len() as u64,
            record.total_items,
            completed,
            elapsed,
        )
    }

    fn derive(
        completed: u64,
        failed: u64,
        total: Option<u64>,
        measured: u64,
        elapsed: Duration,
    ) -> Self {
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 { measured as f64 / secs } else { 0.0 };
        let eta = total.and_then(|total| {
            let remaining = total.saturating_sub(completed);
            if remaining == 0 {
                Some(Duration::ZERO)
            } else if rate > 0.0 {
                Some(Duration::from_secs_f64(remaining as f64 / rate))
            } else {
                None
            }
        });

        Self {
            completed,
            failed,
            total,
            rate,
            eta,
            elapsed,
        }
    }

    /// Render this snapshot in the given mode
    pub fn render(&self, mode: RenderMode, description: &str) -> String {
        let mut out = String::new();
        if !description.is_empty() {
            let _ = write!(out, "[{}] ", description);
        }

        let counts = match self.total {
            Some(total) => format!("{}/{}", self.completed, total),
            None => format!("{} items", self.completed),
        };

        match mode {
            RenderMode::Bar => {
                match self.percentage() {
                    Some(percentage) => {
                        let filled = ((percentage / 100.0) * BAR_WIDTH as f64) as usize;
                        let _ = write!(
                            out,
                            "[{}{}] {:.1}% ({})",
                            "#".repeat(filled),
                            "-".repeat(BAR_WIDTH - filled),
                            percentage,
                            counts
                        );
                    }
                    None => {
                        let _ = write!(out, "({})", counts);
                    }
                }
                let _ = write!(out, " {:.1}/s", self.rate);
                if let Some(eta) = self.eta {
                    let _ = write!(out, " ETA {}", format_duration(eta));
                }
            }
            RenderMode::Percentage => match self.percentage() {
                Some(percentage) => {
                    let _ = write!(out, "{:.1}% ({})", percentage, counts);
                }
                None => {
                    let _ = write!(out, "n/a ({})", counts);
                }
            },
            RenderMode::Text => {
                let _ = write!(out, "{} items processed", counts);
            }
        }

        if self.failed > 0 {
            let _ = write!(out, ", {} failed", self.failed);
        }
        out
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m{:02}s", secs / 60, secs % 60),
        _ => format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

/// Thread-safe progress counters
#[derive(Debug)]
pub struct ProgressTracker {
    total: Option<u64>,
    description: String,
    mode: RenderMode,
    baseline: u64,
    completed: AtomicU64,
    failed: AtomicU64,
    started: Instant,
}

impl ProgressTracker {
    /// Tracker for `total` items (`None` when unknown)
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total,
            description: String::new(),
            mode: RenderMode::default(),
            baseline: 0,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Label shown by `render`
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Output format of `render`
    pub fn with_mode(mut self, mode: RenderMode) -> Self {
        self.mode = mode;
        self
    }

    /// Start from items accounted before this tracker existed
    ///
    /// Baseline items count toward completion but not toward the rate.
    pub fn with_baseline(mut self, completed: u64, failed: u64) -> Self {
        self.baseline = completed;
        self.completed = AtomicU64::new(completed);
        self.failed = AtomicU64::new(failed.min(completed));
        self
    }

    /// Account `n` more successful items
    pub fn increment(&self, n: u64) -> ProgressSnapshot {
        self.completed.fetch_add(n, Ordering::AcqRel);
        self.snapshot()
    }

    /// Account `n` more failed items
    pub fn record_failed(&self, n: u64) -> ProgressSnapshot {
        self.failed.fetch_add(n, Ordering::AcqRel);
        self.completed.fetch_add(n, Ordering::AcqRel);
        self.snapshot()
    }

    /// Current view of the counters
    pub fn snapshot(&self) -> ProgressSnapshot {
        let completed = self.completed.load(Ordering::Acquire);
        let failed = self.failed.load(Ordering::Acquire);
        ProgressSnapshot::derive(
            completed,
            failed,
            self.total,
            completed.saturating_sub(self.baseline),
            self.started.elapsed(),
        )
    }

    /// Textual progress indicator
    pub fn render(&self) -> String {
        self.snapshot().render(self.mode, &self.description)
    }

    /// Whether every known item has been accounted for
    pub fn is_complete(&self) -> bool {
        self.snapshot().is_complete()
    }

    /// Total items, when known
    pub fn total(&self) -> Option<u64> {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_capped() {
        let tracker = ProgressTracker::new(Some(4));
        tracker.increment(3);
        let snapshot = tracker.increment(3);
        assert_eq!(snapshot.percentage(), Some(100.0));
        assert!(tracker.is_complete());
    }

    #[test]
    fn test_unknown_total_has_no_percentage_or_eta() {
        let tracker = ProgressTracker::new(None);
        let snapshot = tracker.increment(10);
        assert_eq!(snapshot.percentage(), None);
        assert_eq!(snapshot.eta, None);
        assert!(!snapshot.is_complete());
        assert!(tracker.render().contains("10 items"));
    }

    #[test]
    fn test_failures_count_as_accounted() {
        let tracker = ProgressTracker::new(Some(5));
        tracker.increment(2);
        let snapshot = tracker.record_failed(1);
        assert_eq!(snapshot.completed, 3);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.succeeded(), 2);
    }

    #[test]
    fn test_baseline_excluded_from_rate() {
        let tracker = ProgressTracker::new(Some(100)).with_baseline(90, 2);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.completed, 90);
        assert_eq!(snapshot.failed, 2);
        assert_eq!(snapshot.rate, 0.0);
    }

    #[test]
    fn test_render_modes() {
        let snapshot = ProgressSnapshot {
            completed: 5,
            failed: 1,
            total: Some(10),
            rate: 2.5,
            eta: Some(Duration::from_secs(2)),
            elapsed: Duration::from_secs(2),
        };
        let bar = snapshot.render(RenderMode::Bar, "denns");
        assert!(bar.starts_with("[denns] ["));
        assert!(bar.contains("50.0% (5/10)"));
        assert!(bar.contains("ETA 2s"));
        assert!(bar.ends_with(", 1 failed"));

        assert_eq!(snapshot.render(RenderMode::Percentage, ""), "50.0% (5/10), 1 failed");
        assert_eq!(
            snapshot.render(RenderMode::Text, ""),
            "5/10 items processed, 1 failed"
        );
    }

    #[test]
    fn test_eta_from_rate_and_remaining() {
        let snapshot = ProgressSnapshot::derive(5, 0, Some(10), 5, Duration::from_secs(5));
        assert_eq!(snapshot.rate, 1.0);
        assert_eq!(snapshot.eta, Some(Duration::from_secs(5)));

        let resumed = ProgressSnapshot::derive(8, 1, Some(10), 4, Duration::from_secs(2));
        assert_eq!(resumed.eta, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_eta_zero_when_nothing_remains() {
        let snapshot = ProgressSnapshot::derive(10, 0, Some(10), 10, Duration::from_secs(4));
        assert_eq!(snapshot.eta, Some(Duration::ZERO));

        let idle = ProgressSnapshot::derive(0, 0, Some(10), 0, Duration::ZERO);
        assert_eq!(idle.eta, None);
    }

    #[test]
    fn test_eta_from_stored_record() {
        let mut record = RunRecord::new("run-1", "denns", 5, Some(10));
        record.processed_count = 5;
        record.updated_at = record.created_at + chrono::Duration::seconds(5);

        record.status = crate::checkpoint::RunStatus::Interrupted;
        let snapshot = ProgressSnapshot::from_record(&record);
        assert_eq!(snapshot.eta, Some(Duration::from_secs(5)));
        assert_eq!(snapshot.percentage(), Some(50.0));

        record.status = crate::checkpoint::RunStatus::Completed;
        assert_eq!(ProgressSnapshot::from_record(&record).eta, None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m05s");
        assert_eq!(format_duration(Duration::from_secs(7260)), "2h01m");
    }
}
