//! SQLite checkpoint storage.
//!
//! The default durable backend for single-machine runs. SQLite takes one
//! write lock for the whole database, so commits of unrelated runs queue
//! behind each other for the length of one short transaction; WAL mode keeps
//! readers from blocking on it.

use crate::checkpoint::rows::{classify_rejected_commit, FailedRow, RunRow, RUN_COLUMNS};
use crate::checkpoint::{
    runs_to_archive, CheckpointError, CheckpointStore, CommitRequest, RunRecord,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// SQLite configuration for the checkpoint store
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// `sqlite://path/to/file.db` or `sqlite::memory:`
    pub database_url: String,
    /// Pool size (forced to 1 for in-memory databases)
    pub max_connections: u32,
    /// How long a writer waits for the database lock
    pub busy_timeout_secs: u64,
    /// Prefix for table names
    pub table_prefix: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://batchrun.db".to_string(),
            max_connections: 4,
            busy_timeout_secs: 30,
            table_prefix: String::new(),
        }
    }
}

impl SqliteConfig {
    /// Config for a given URL with default pool settings
    pub fn with_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }

    /// Ephemeral in-memory database
    pub fn in_memory() -> Self {
        Self::with_url("sqlite::memory:")
    }

    fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }
}

/// SQLite-backed checkpoint store
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    config: SqliteConfig,
}

impl SqliteCheckpointStore {
    /// Open (creating if needed) the database and its schema
    pub async fn new(config: SqliteConfig) -> Result<Self, CheckpointError> {
        let in_memory = config.is_in_memory();
        let mut options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|e| CheckpointError::Storage(format!("invalid SQLite URL: {}", e)))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to `:memory:` is its own database
        let max_connections = if in_memory { 1 } else { config.max_connections.max(1) };

        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| CheckpointError::Storage(format!("failed to open SQLite database: {}", e)))?;

        let store = Self { pool, config };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Ephemeral in-memory store
    pub async fn in_memory() -> Result<Self, CheckpointError> {
        Self::new(SqliteConfig::in_memory()).await
    }

    fn state_table(&self) -> String {
        format!("{}run_state", self.config.table_prefix)
    }

    fn failed_table(&self) -> String {
        format!("{}run_failed_items", self.config.table_prefix)
    }

    async fn run_migrations(&self) -> Result<(), CheckpointError> {
        let state = self.state_table();
        let failed = self.failed_table();

        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {state} (
                    run_id TEXT PRIMARY KEY,
                    source_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    total_items INTEGER,
                    processed_count INTEGER NOT NULL DEFAULT 0,
                    cursor TEXT,
                    batch_size INTEGER NOT NULL,
                    batches_committed INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )
                "#
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {failed} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES {state} (run_id) ON DELETE CASCADE,
                    item_key TEXT NOT NULL,
                    error_message TEXT NOT NULL,
                    attempt_count INTEGER NOT NULL DEFAULT 1,
                    recorded_at TEXT NOT NULL,
                    UNIQUE (run_id, item_key)
                )
                "#
            ),
            format!("CREATE INDEX IF NOT EXISTS idx_{state}_source_status ON {state} (source_id, status)"),
            format!("CREATE INDEX IF NOT EXISTS idx_{state}_created_at ON {state} (created_at)"),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        debug!(url = %self.config.database_url, "SQLite checkpoint schema ready");
        Ok(())
    }

    async fn fetch_record(
        &self,
        conn: &mut SqliteConnection,
        run_id: &str,
    ) -> Result<RunRecord, CheckpointError> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM {} WHERE run_id = ?",
            self.state_table()
        ))
        .bind(run_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| CheckpointError::NotFound(run_id.to_string()))?;

        let failed = self.fetch_failed(conn, run_id).await?;
        row.into_record(failed)
    }

    async fn fetch_failed(
        &self,
        conn: &mut SqliteConnection,
        run_id: &str,
    ) -> Result<Vec<FailedRow>, CheckpointError> {
        let rows = sqlx::query_as::<_, FailedRow>(&format!(
            "SELECT item_key, error_message, attempt_count FROM {} WHERE run_id = ? ORDER BY id",
            self.failed_table()
        ))
        .bind(run_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }

    async fn hydrate(&self, rows: Vec<RunRow>) -> Result<Vec<RunRecord>, CheckpointError> {
        let mut conn = self.pool.acquire().await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let failed = self.fetch_failed(&mut conn, &row.run_id).await?;
            records.push(row.into_record(failed)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    #[instrument(skip(self))]
    async fn create_run(
        &self,
        run_id: &str,
        source_id: &str,
        batch_size: u32,
        total_items: Option<u64>,
    ) -> Result<RunRecord, CheckpointError> {
        let record = RunRecord::new(run_id, source_id, batch_size, total_items);

        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {} (run_id, source_id, status, total_items, processed_count,
                            cursor, batch_size, batches_committed, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, NULL, ?, 0, ?, ?)
            ON CONFLICT (run_id) DO NOTHING
            "#,
            self.state_table()
        ))
        .bind(&record.run_id)
        .bind(&record.source_id)
        .bind(record.status.as_str())
        .bind(record.total_items.map(|total| total as i64))
        .bind(batch_size as i32)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CheckpointError::DuplicateRun(run_id.to_string()));
        }

        info!(run_id, source_id, batch_size, ?total_items, "Created run");
        Ok(record)
    }

    async fn load_run(&self, run_id: &str) -> Result<RunRecord, CheckpointError> {
        let mut conn = self.pool.acquire().await?;
        self.fetch_record(&mut conn, run_id).await
    }

    #[instrument(skip(self, request), fields(new_status = %request.new_status, cursor = ?request.new_cursor))]
    async fn commit_progress(
        &self,
        run_id: &str,
        request: CommitRequest,
    ) -> Result<RunRecord, CheckpointError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // The guarded UPDATE comes first so the transaction takes the write
        // lock before reading anything.
        let updated = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET cursor = ?1,
                processed_count = processed_count + ?2,
                status = ?3,
                batches_committed = batches_committed + ?4,
                updated_at = ?5
            WHERE run_id = ?6
              AND cursor IS ?7
              AND status IN ('pending', 'running', 'interrupted')
              AND ?3 <> 'pending'
              AND (total_items IS NULL OR processed_count + ?2 <= total_items)
            "#,
            self.state_table()
        ))
        .bind(request.new_cursor.as_deref())
        .bind(request.processed_delta as i64)
        .bind(request.new_status.as_str())
        .bind(i64::from(request.accounts_items()))
        .bind(now)
        .bind(run_id)
        .bind(request.expected_cursor.as_deref())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            let current = self.load_run(run_id).await?;
            let err = classify_rejected_commit(&current, &request);
            warn!(run_id, error = %err, "Commit rejected");
            return Err(err);
        }

        for failure in &request.newly_failed {
            sqlx::query(&format!(
                r#"
                INSERT INTO {} (run_id, item_key, error_message, attempt_count, recorded_at)
                VALUES (?1, ?2, ?3, 1, ?4)
                ON CONFLICT (run_id, item_key) DO UPDATE
                SET attempt_count = attempt_count + 1,
                    error_message = excluded.error_message,
                    recorded_at = excluded.recorded_at
                "#,
                self.failed_table()
            ))
            .bind(run_id)
            .bind(&failure.item_key)
            .bind(&failure.error_message)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let record = self.fetch_record(&mut *tx, run_id).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn list_incomplete_runs(
        &self,
        source_id: Option<&str>,
    ) -> Result<Vec<RunRecord>, CheckpointError> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM {}
            WHERE status IN ('running', 'interrupted')
              AND (?1 IS NULL OR source_id = ?1)
            ORDER BY created_at ASC, rowid ASC
            "#,
            self.state_table()
        ))
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows).await
    }

    async fn list_runs(
        &self,
        source_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<RunRecord>, CheckpointError> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM {}
            WHERE (?1 IS NULL OR source_id = ?1)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?2
            "#,
            self.state_table()
        ))
        .bind(source_id)
        .bind(limit.map_or(-1, |limit| limit as i64))
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows).await
    }

    #[instrument(skip(self))]
    async fn archive_runs(
        &self,
        source_id: Option<&str>,
        keep_recent: usize,
    ) -> Result<u64, CheckpointError> {
        let runs = self.list_runs(source_id, None).await?;
        let doomed = runs_to_archive(&runs, keep_recent);
        if doomed.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for run_id in &doomed {
            sqlx::query(&format!("DELETE FROM {} WHERE run_id = ?", self.failed_table()))
                .bind(run_id)
                .execute(&mut *tx)
                .await?;
            deleted += sqlx::query(&format!(
                "DELETE FROM {} WHERE run_id = ? AND status = 'completed'",
                self.state_table()
            ))
            .bind(run_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;

        info!(archived = deleted, "Archived completed runs");
        Ok(deleted)
    }
}
