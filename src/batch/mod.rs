//! Batch execution over resumable work sources
//!
//! A run pulls items from a [`WorkSource`] in batches, hands each to an
//! [`ItemProcessor`], and commits progress to a
//! [`CheckpointStore`](crate::checkpoint::CheckpointStore) after every batch.

pub mod executor;
pub mod processor;
pub mod recovery;
pub mod source;
pub mod types;

pub use executor::BatchProcessor;
pub use processor::{processor_fn, CommandProcessor, FnProcessor, ItemProcessor};
pub use recovery::recover_stale_runs;
pub use source::{ItemStream, LinesWorkSource, VecWorkSource, WorkSource, WorkSourceError};
pub use types::{
    BatchConfig, Item, Outcome, ProgressCallback, ProgressUpdate, RunFailure, RunResult,
    TimeoutPolicy,
};
