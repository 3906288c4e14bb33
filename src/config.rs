//! Engine configuration loaded from the environment

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::batch::TimeoutPolicy;
use crate::checkpoint::{
    CheckpointStore, MemoryCheckpointStore, PostgresCheckpointStore, PostgresConfig,
    SqliteCheckpointStore, SqliteConfig,
};
use crate::telemetry::logging::{LogFormat, LoggingConfig};
use crate::{BatchRunError, Result};

/// Default checkpoint database
pub const DEFAULT_DATABASE_URL: &str = "sqlite://batchrun.db";

/// Checkpoint backend selected by URL scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    /// Process-local store, lost on exit
    Memory,
    /// SQLite file or in-memory database
    Sqlite(String),
    /// PostgreSQL database
    Postgres(String),
}

impl FromStr for StoreConfig {
    type Err = BatchRunError;

    fn from_str(url: &str) -> Result<Self> {
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme {
            "memory" => Ok(StoreConfig::Memory),
            "sqlite" => Ok(StoreConfig::Sqlite(url.to_string())),
            "postgres" | "postgresql" => Ok(StoreConfig::Postgres(url.to_string())),
            _ => Err(BatchRunError::Config(format!(
                "unsupported checkpoint database URL '{}'",
                url
            ))),
        }
    }
}

impl StoreConfig {
    /// Open the configured store, creating its schema if needed
    pub async fn connect(&self) -> Result<Arc<dyn CheckpointStore>> {
        let store: Arc<dyn CheckpointStore> = match self {
            StoreConfig::Memory => Arc::new(MemoryCheckpointStore::new()),
            StoreConfig::Sqlite(url) => {
                Arc::new(SqliteCheckpointStore::new(SqliteConfig::with_url(url.clone())).await?)
            }
            StoreConfig::Postgres(url) => Arc::new(
                PostgresCheckpointStore::new(PostgresConfig::with_url(url.clone())).await?,
            ),
        };
        info!(backend = self.backend_name(), "Checkpoint store connected");
        Ok(store)
    }

    /// Short backend name for diagnostics
    pub fn backend_name(&self) -> &'static str {
        match self {
            StoreConfig::Memory => "memory",
            StoreConfig::Sqlite(_) => "sqlite",
            StoreConfig::Postgres(_) => "postgres",
        }
    }
}

/// Settings shared by the CLI and embedding applications
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Checkpoint backend
    pub store: StoreConfig,
    /// Items per batch for new runs
    pub batch_size: u32,
    /// Items processed concurrently within a batch
    pub concurrency: usize,
    /// Per-item timeout
    pub item_timeout: Option<Duration>,
    /// Classification of timed-out items
    pub timeout_policy: TimeoutPolicy,
    /// Age after which a `running` run counts as dead
    pub stale_after: Duration,
    /// Logging setup
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::Sqlite(DEFAULT_DATABASE_URL.to_string()),
            batch_size: 50,
            concurrency: 1,
            item_timeout: None,
            timeout_policy: TimeoutPolicy::Retryable,
            stale_after: Duration::from_secs(900),
            logging: LoggingConfig::default(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| BatchRunError::Config(format!("{} has an invalid value '{}'", name, value)))
}

impl EngineConfig {
    /// Load from `BATCHRUN_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load using `lookup` to read variables
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("BATCHRUN_DATABASE_URL") {
            config.store = url.parse()?;
        }
        if let Some(value) = lookup("BATCHRUN_BATCH_SIZE") {
            let batch_size: u32 = parse_var("BATCHRUN_BATCH_SIZE", &value)?;
            if batch_size == 0 {
                return Err(BatchRunError::Config("BATCHRUN_BATCH_SIZE must be at least 1".into()));
            }
            config.batch_size = batch_size;
        }
        if let Some(value) = lookup("BATCHRUN_CONCURRENCY") {
            config.concurrency = parse_var::<usize>("BATCHRUN_CONCURRENCY", &value)?.max(1);
        }
        if let Some(value) = lookup("BATCHRUN_ITEM_TIMEOUT_SECS") {
            let secs: f64 = parse_var("BATCHRUN_ITEM_TIMEOUT_SECS", &value)?;
            config.item_timeout = Duration::try_from_secs_f64(secs)
                .ok()
                .filter(|timeout| !timeout.is_zero());
        }
        if let Some(value) = lookup("BATCHRUN_TIMEOUT_POLICY") {
            config.timeout_policy = match value.trim().to_ascii_lowercase().as_str() {
                "retryable" => TimeoutPolicy::Retryable,
                "fatal" => TimeoutPolicy::Fatal,
                other => {
                    return Err(BatchRunError::Config(format!(
                        "BATCHRUN_TIMEOUT_POLICY has an invalid value '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(value) = lookup("BATCHRUN_STALE_AFTER_SECS") {
            config.stale_after =
                Duration::from_secs(parse_var("BATCHRUN_STALE_AFTER_SECS", &value)?);
        }
        if let Some(level) = lookup("BATCHRUN_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(format) = lookup("BATCHRUN_LOG_FORMAT") {
            config.logging.format = format.parse::<LogFormat>()?;
        }
        if let Some(dir) = lookup("BATCHRUN_LOG_DIR").filter(|dir| !dir.is_empty()) {
            config.logging.log_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }
}
