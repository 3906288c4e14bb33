//! # batchrun
//!
//! A checkpointed batch-execution engine. It drives large, fallible workloads
//! to completion with per-item failure isolation, crash recovery and progress
//! observability.
//!
//! ## Quick Start
//!
//! ```rust
//! use batchrun::batch::{processor_fn, BatchProcessor, Item, Outcome, VecWorkSource};
//! use batchrun::checkpoint::{MemoryCheckpointStore, RunStatus};
//!
//! # async fn example() -> batchrun::Result<()> {
//! let store = MemoryCheckpointStore::new();
//! let source = VecWorkSource::from_keys("stores", ["s1", "s2", "s3"]);
//! let processor = processor_fn(|item: Item| async move {
//!     if item.key == "s2" {
//!         Outcome::retryable("upstream returned 503")
//!     } else {
//!         Outcome::Success
//!     }
//! });
//!
//! let result = BatchProcessor::new()
//!     .with_batch_size(2)
//!     .run(&source, &processor, &store, "stores-nightly")
//!     .await?;
//!
//! assert_eq!(result.status, RunStatus::Completed);
//! assert_eq!((result.processed, result.failed), (2, 1));
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - Items are accounted strictly in source order and a checkpoint is
//!   committed after every batch.
//! - The item processor is never invoked again for an item covered by a
//!   committed cursor. A batch whose commit failed is redone on resume.
//! - Re-running a finished run returns its stored result without processing
//!   anything.
//! - Commits are optimistic: a writer that lost track of the stored cursor
//!   gets [`checkpoint::CheckpointError::StaleCheckpoint`] instead of
//!   overwriting progress.
//!
//! ## Modules
//!
//! - [`checkpoint`]: durable run state (memory, SQLite, PostgreSQL)
//! - [`batch`]: work sources, item processors and the run loop
//! - [`telemetry`]: correlation, progress, metrics and logging
//! - [`config`]: environment-driven configuration

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for batchrun operations
pub type Result<T> = std::result::Result<T, BatchRunError>;

/// Main error type for batchrun operations
#[derive(Error, Debug)]
pub enum BatchRunError {
    /// Checkpoint store error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] checkpoint::CheckpointError),

    /// Work source error outside of a run
    #[error("Work source error: {0}")]
    Source(#[from] batch::WorkSourceError),

    /// Existing run belongs to another source
    #[error("Run {run_id} belongs to source '{stored}', not '{given}'")]
    SourceMismatch {
        /// Run being resumed
        run_id: String,
        /// Source stored with the run
        stored: String,
        /// Source passed by the caller
        given: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable run state and checkpoint stores
pub mod checkpoint;

/// Batch execution over work sources
pub mod batch;

/// Correlation, progress, metrics and logging
pub mod telemetry;

/// Environment-driven configuration
pub mod config;
