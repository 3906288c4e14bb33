//! Observability: correlation, progress, metrics and logging

pub mod correlation;
pub mod logging;
pub mod metrics;
pub mod progress;

pub use correlation::{current, CorrelationContext, CorrelationFields, CorrelationGuard};
pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::RunMetrics;
pub use progress::{ProgressSnapshot, ProgressTracker, RenderMode};
