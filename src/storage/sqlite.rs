//! SQLite implementation of the storage operations.
//!
//! Schema notes:
//! - Timestamps are integer Unix milliseconds; JSON values are UTF-8 text.
//! - `runs(status, created_at, id)` backs claim ordering; run ids are
//!   UUIDv7 so the id tiebreak is stable within one millisecond.
//! - The claim is one `UPDATE ... WHERE id = (SELECT ... LIMIT 1)
//!   RETURNING *` statement. SQLite admits a single writer at a time, so
//!   concurrent workers can never claim the same row.
//! - `cancel_requested` survives a claim: a cancel raised against a stale
//!   attempt lands on the attempt that resumes the run.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Sqlite};
use uuid::Uuid;

use super::{HeartbeatAck, NewRun, NewStep, Result, Storage, StorageError};
use crate::types::{
    LogEntry, LogLevel, Progress, Run, RunFilter, RunListEntry, RunStatus, Step, StepStatus,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id                 TEXT PRIMARY KEY,
    job_name           TEXT NOT NULL,
    status             TEXT NOT NULL DEFAULT 'pending',
    payload            TEXT NOT NULL DEFAULT 'null',
    output             TEXT,
    error              TEXT,
    progress           TEXT,
    current_step_index INTEGER NOT NULL DEFAULT 0,
    idempotency_key    TEXT,
    concurrency_key    TEXT,
    cancel_requested   INTEGER NOT NULL DEFAULT 0,
    created_at         INTEGER NOT NULL,
    started_at         INTEGER,
    completed_at       INTEGER,
    heartbeat_at       INTEGER
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_idempotency
    ON runs(job_name, idempotency_key) WHERE idempotency_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_runs_claim
    ON runs(status, created_at, id);
CREATE INDEX IF NOT EXISTS idx_runs_concurrency
    ON runs(concurrency_key, status);

CREATE TABLE IF NOT EXISTS steps (
    run_id       TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    name         TEXT NOT NULL,
    step_index   INTEGER NOT NULL,
    status       TEXT NOT NULL,
    output       TEXT,
    error        TEXT,
    started_at   INTEGER NOT NULL,
    completed_at INTEGER NOT NULL,
    PRIMARY KEY (run_id, name)
);

CREATE INDEX IF NOT EXISTS idx_steps_run_index
    ON steps(run_id, step_index);

CREATE TABLE IF NOT EXISTS logs (
    id        TEXT PRIMARY KEY,
    run_id    TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    step_name TEXT,
    level     TEXT NOT NULL,
    message   TEXT NOT NULL,
    data      TEXT,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_logs_run_ts
    ON logs(run_id, timestamp);
"#;

/// SQLite-backed store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if missing) the database file and configure the pool:
    /// WAL journaling, enforced foreign keys, and a busy timeout so
    /// concurrent writers queue instead of erroring.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// The underlying pool, for callers that need raw access (tests,
    /// migrations tooling).
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Distinguish "no such run" from "wrong status" after a guarded
    /// UPDATE matched zero rows.
    async fn classify_missed_update(&self, run_id: &str) -> StorageError {
        match self.get_run(run_id).await {
            Ok(run) => StorageError::InvalidTransition {
                run_id: run_id.to_string(),
                status: run.status,
            },
            Err(err) => err,
        }
    }
}

#[async_trait]
impl Storage for SqliteStore {
    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn create_run(&self, new_run: NewRun) -> Result<(Run, bool)> {
        if let Some(key) = &new_run.idempotency_key {
            if let Some(existing) = find_by_idempotency(&self.pool, &new_run.job_name, key).await? {
                return Ok((existing, false));
            }
        }

        let run = Run {
            id: Uuid::now_v7().to_string(),
            job_name: new_run.job_name.clone(),
            status: RunStatus::Pending,
            payload: new_run.payload,
            output: None,
            error: None,
            progress: None,
            current_step_index: 0,
            idempotency_key: new_run.idempotency_key.clone(),
            concurrency_key: new_run.concurrency_key,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            heartbeat_at: None,
        };

        let payload_json = serde_json::to_string(&run.payload)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO runs (id, job_name, status, payload, idempotency_key,
                              concurrency_key, created_at)
            VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&run.id)
        .bind(&run.job_name)
        .bind(&payload_json)
        .bind(&run.idempotency_key)
        .bind(&run.concurrency_key)
        .bind(run.created_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok((run, true)),
            // Two callers raced on the same idempotency key; the loser
            // resolves to the winner's row.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                if let Some(key) = &new_run.idempotency_key {
                    if let Some(existing) =
                        find_by_idempotency(&self.pool, &new_run.job_name, key).await?
                    {
                        return Ok((existing, false));
                    }
                }
                Err(StorageError::Database(sqlx::Error::Database(db)))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_run(&self, run_id: &str) -> Result<Run> {
        let row = sqlx::query_as::<_, RunRow>("SELECT * FROM runs WHERE id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(run_id.to_string()))?;

        row.into_run()
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunListEntry>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT r.*, (SELECT COUNT(*) FROM steps s WHERE s.run_id = r.id) AS step_count \
             FROM runs r WHERE 1 = 1",
        );
        if let Some(job_name) = &filter.job_name {
            qb.push(" AND r.job_name = ").push_bind(job_name);
        }
        if let Some(status) = filter.status {
            qb.push(" AND r.status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY r.created_at DESC, r.id DESC");
        qb.push(" LIMIT ").push_bind(filter.limit.unwrap_or(50));
        qb.push(" OFFSET ").push_bind(filter.offset.unwrap_or(0));

        let rows = qb
            .build_query_as::<RunListRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(RunListEntry {
                    run: row.run.into_run()?,
                    step_count: row.step_count,
                })
            })
            .collect()
    }

    async fn claim_next_pending_run(&self, worker_id: &str) -> Result<Option<Run>> {
        let now = Utc::now().timestamp_millis();
        let claimed = sqlx::query_as::<_, RunRow>(
            r#"
            UPDATE runs SET status = 'running', started_at = ?1, heartbeat_at = ?1
            WHERE id = (
                SELECT id FROM runs
                WHERE status = 'pending'
                  AND (concurrency_key IS NULL OR concurrency_key NOT IN (
                      SELECT concurrency_key FROM runs
                      WHERE status = 'running' AND concurrency_key IS NOT NULL))
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match claimed {
            Some(row) => {
                let run = row.into_run()?;
                tracing::debug!(run_id = %run.id, job = %run.job_name, worker_id, "claimed run");
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    async fn upsert_step(&self, run_id: &str, step: NewStep) -> Result<Step> {
        let completed_at = Utc::now();
        let output_json = step.output.as_ref().map(serde_json::to_string).transpose()?;

        let mut tx = self.pool.begin().await?;

        // A failed row under the same name is overwritten in place and
        // keeps its original index; a completed row is a name collision.
        let written = sqlx::query(
            r#"
            INSERT INTO steps (run_id, name, step_index, status, output, error,
                               started_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(run_id, name) DO UPDATE SET
                status = excluded.status,
                output = excluded.output,
                error = excluded.error,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at
            WHERE steps.status = 'failed'
            "#,
        )
        .bind(run_id)
        .bind(&step.name)
        .bind(step.index)
        .bind(step.status.as_str())
        .bind(&output_json)
        .bind(&step.error)
        .bind(step.started_at.timestamp_millis())
        .bind(completed_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        if written.rows_affected() == 0 {
            return Err(StorageError::DuplicateStepName {
                run_id: run_id.to_string(),
                name: step.name,
            });
        }

        let row = sqlx::query_as::<_, StepRow>(
            "SELECT * FROM steps WHERE run_id = ?1 AND name = ?2",
        )
        .bind(run_id)
        .bind(&step.name)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE runs SET current_step_index = ?1 WHERE id = ?2")
            .bind(row.step_index)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        row.into_step()
    }

    async fn get_step(&self, run_id: &str, name: &str) -> Result<Option<Step>> {
        let row = sqlx::query_as::<_, StepRow>(
            "SELECT * FROM steps WHERE run_id = ?1 AND name = ?2",
        )
        .bind(run_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StepRow::into_step).transpose()
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<Step>> {
        let rows = sqlx::query_as::<_, StepRow>(
            "SELECT * FROM steps WHERE run_id = ?1 ORDER BY step_index ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StepRow::into_step).collect()
    }

    async fn heartbeat(&self, run_id: &str) -> Result<HeartbeatAck> {
        let ack = sqlx::query_as::<_, (bool,)>(
            r#"
            UPDATE runs SET heartbeat_at = ?1
            WHERE id = ?2 AND status = 'running'
            RETURNING cancel_requested
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        match ack {
            Some((cancel_requested,)) => Ok(HeartbeatAck { cancel_requested }),
            None => match self.get_run(run_id).await {
                Ok(_) => Err(StorageError::NotRunning(run_id.to_string())),
                Err(err) => Err(err),
            },
        }
    }

    async fn complete_run(&self, run_id: &str, output: &Value) -> Result<Run> {
        let output_json = serde_json::to_string(output)?;
        let updated = sqlx::query(
            r#"
            UPDATE runs SET status = 'completed', output = ?1, error = NULL, completed_at = ?2
            WHERE id = ?3 AND status = 'running'
            "#,
        )
        .bind(&output_json)
        .bind(Utc::now().timestamp_millis())
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.classify_missed_update(run_id).await);
        }
        self.get_run(run_id).await
    }

    async fn fail_run(&self, run_id: &str, error: &str) -> Result<Run> {
        let updated = sqlx::query(
            r#"
            UPDATE runs SET status = 'failed', error = ?1, output = NULL, completed_at = ?2
            WHERE id = ?3 AND status = 'running'
            "#,
        )
        .bind(error)
        .bind(Utc::now().timestamp_millis())
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.classify_missed_update(run_id).await);
        }
        self.get_run(run_id).await
    }

    async fn cancel_run(&self, run_id: &str) -> Result<Run> {
        let updated = sqlx::query(
            r#"
            UPDATE runs SET status = 'cancelled', completed_at = ?1
            WHERE id = ?2 AND status IN ('pending', 'running')
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.classify_missed_update(run_id).await);
        }
        self.get_run(run_id).await
    }

    async fn request_cancel(&self, run_id: &str) -> Result<()> {
        let updated =
            sqlx::query("UPDATE runs SET cancel_requested = 1 WHERE id = ?1 AND status = 'running'")
                .bind(run_id)
                .execute(&self.pool)
                .await?;

        if updated.rows_affected() == 0 {
            return match self.get_run(run_id).await {
                Ok(_) => Err(StorageError::NotRunning(run_id.to_string())),
                Err(err) => Err(err),
            };
        }
        Ok(())
    }

    async fn reset_run_to_pending(&self, run_id: &str) -> Result<Run> {
        let updated = sqlx::query(
            r#"
            UPDATE runs SET status = 'pending', error = NULL, output = NULL, progress = NULL,
                            started_at = NULL, completed_at = NULL, heartbeat_at = NULL,
                            cancel_requested = 0
            WHERE id = ?1 AND status IN ('failed', 'cancelled')
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.classify_missed_update(run_id).await);
        }
        self.get_run(run_id).await
    }

    async fn reap_stale_runs(&self, threshold: Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now().timestamp_millis() - threshold.as_millis() as i64;
        let rows = sqlx::query_as::<_, (String,)>(
            r#"
            UPDATE runs SET status = 'pending', started_at = NULL, heartbeat_at = NULL
            WHERE status = 'running' AND heartbeat_at IS NOT NULL AND heartbeat_at < ?1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn update_progress(&self, run_id: &str, progress: &Progress) -> Result<()> {
        let progress_json = serde_json::to_string(progress)?;
        sqlx::query("UPDATE runs SET progress = ?1 WHERE id = ?2")
            .bind(&progress_json)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn write_log(&self, entry: &LogEntry) -> Result<()> {
        let data_json = entry.data.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO logs (id, run_id, step_name, level, message, data, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.run_id)
        .bind(&entry.step_name)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&data_json)
        .bind(entry.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_logs(&self, run_id: &str) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT * FROM logs WHERE run_id = ?1 ORDER BY timestamp ASC, id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LogRow::into_entry).collect()
    }

    async fn delete_run(&self, run_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            "DELETE FROM runs WHERE id = ?1 AND status IN ('completed', 'failed', 'cancelled')",
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.classify_missed_update(run_id).await);
        }

        // Explicit cascade: correct even on a connection where the
        // foreign_keys pragma was not applied.
        sqlx::query("DELETE FROM steps WHERE run_id = ?1")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM logs WHERE run_id = ?1")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn find_by_idempotency(
    pool: &Pool<Sqlite>,
    job_name: &str,
    key: &str,
) -> Result<Option<Run>> {
    let row = sqlx::query_as::<_, RunRow>(
        "SELECT * FROM runs WHERE job_name = ?1 AND idempotency_key = ?2",
    )
    .bind(job_name)
    .bind(key)
    .fetch_optional(pool)
    .await?;

    row.map(RunRow::into_run).transpose()
}

// ═══════════════════════════════════════════════════════════════════════════
// Row types for sqlx query_as
// ═══════════════════════════════════════════════════════════════════════════

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    job_name: String,
    status: String,
    payload: String,
    output: Option<String>,
    error: Option<String>,
    progress: Option<String>,
    current_step_index: i64,
    idempotency_key: Option<String>,
    concurrency_key: Option<String>,
    cancel_requested: bool,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    heartbeat_at: Option<i64>,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| StorageError::Decode(format!("unknown run status '{}'", self.status)))?;
        let progress = self
            .progress
            .as_deref()
            .map(serde_json::from_str::<Progress>)
            .transpose()?;

        Ok(Run {
            id: self.id,
            job_name: self.job_name,
            status,
            payload: serde_json::from_str(&self.payload)?,
            output: self.output.as_deref().map(serde_json::from_str).transpose()?,
            error: self.error,
            progress,
            current_step_index: self.current_step_index,
            idempotency_key: self.idempotency_key,
            concurrency_key: self.concurrency_key,
            cancel_requested: self.cancel_requested,
            created_at: from_millis(self.created_at),
            started_at: self.started_at.map(from_millis),
            completed_at: self.completed_at.map(from_millis),
            heartbeat_at: self.heartbeat_at.map(from_millis),
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunListRow {
    #[sqlx(flatten)]
    run: RunRow,
    step_count: i64,
}

#[derive(sqlx::FromRow)]
struct StepRow {
    run_id: String,
    name: String,
    step_index: i64,
    status: String,
    output: Option<String>,
    error: Option<String>,
    started_at: i64,
    completed_at: i64,
}

impl StepRow {
    fn into_step(self) -> Result<Step> {
        let status = StepStatus::parse(&self.status).ok_or_else(|| {
            StorageError::Decode(format!("unknown step status '{}'", self.status))
        })?;

        Ok(Step {
            run_id: self.run_id,
            name: self.name,
            index: self.step_index,
            status,
            output: self.output.as_deref().map(serde_json::from_str).transpose()?,
            error: self.error,
            started_at: from_millis(self.started_at),
            completed_at: from_millis(self.completed_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: String,
    run_id: String,
    step_name: Option<String>,
    level: String,
    message: String,
    data: Option<String>,
    timestamp: i64,
}

impl LogRow {
    fn into_entry(self) -> Result<LogEntry> {
        let level = LogLevel::parse(&self.level)
            .ok_or_else(|| StorageError::Decode(format!("unknown log level '{}'", self.level)))?;

        Ok(LogEntry {
            id: self.id,
            run_id: self.run_id,
            step_name: self.step_name,
            level,
            message: self.message,
            data: self.data.as_deref().map(serde_json::from_str).transpose()?,
            timestamp: from_millis(self.timestamp),
        })
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    struct TestStore {
        store: SqliteStore,
        _dir: TempDir, // keep alive so the db file survives the test
    }

    async fn open_store() -> TestStore {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("test.db")).await.unwrap();
        store.migrate().await.unwrap();
        TestStore { store, _dir: dir }
    }

    fn new_run(job: &str) -> NewRun {
        NewRun {
            job_name: job.to_string(),
            payload: json!({"n": 1}),
            idempotency_key: None,
            concurrency_key: None,
        }
    }

    fn completed_step(name: &str, index: i64, output: Value) -> NewStep {
        NewStep {
            name: name.to_string(),
            index,
            status: StepStatus::Completed,
            output: Some(output),
            error: None,
            started_at: Utc::now(),
        }
    }

    fn failed_step(name: &str, index: i64, error: &str) -> NewStep {
        NewStep {
            name: name.to_string(),
            index,
            status: StepStatus::Failed,
            output: None,
            error: Some(error.to_string()),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_and_get_run() {
        let ts = open_store().await;
        let (run, created) = ts.store.create_run(new_run("sum")).await.unwrap();
        assert!(created);

        let fetched = ts.store.get_run(&run.id).await.unwrap();
        assert_eq!(fetched.job_name, "sum");
        assert_eq!(fetched.status, RunStatus::Pending);
        assert_eq!(fetched.payload, json!({"n": 1}));
        assert!(fetched.started_at.is_none());
    }

    #[tokio::test]
    async fn idempotency_key_resolves_to_existing_row() {
        let ts = open_store().await;
        let mut first = new_run("sum");
        first.idempotency_key = Some("abc".to_string());
        let (run_a, created_a) = ts.store.create_run(first.clone()).await.unwrap();
        let (run_b, created_b) = ts.store.create_run(first).await.unwrap();

        assert!(created_a);
        assert!(!created_b);
        assert_eq!(run_a.id, run_b.id);

        // Same key under a different job is a separate run.
        let mut other_job = new_run("import");
        other_job.idempotency_key = Some("abc".to_string());
        let (run_c, created_c) = ts.store.create_run(other_job).await.unwrap();
        assert!(created_c);
        assert_ne!(run_a.id, run_c.id);
    }

    // Claim order ties break on the id column; spacing creations by a few
    // milliseconds keeps these assertions deterministic.
    async fn spaced() {
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    #[tokio::test]
    async fn claim_takes_oldest_pending_and_stamps_liveness() {
        let ts = open_store().await;
        let (first, _) = ts.store.create_run(new_run("sum")).await.unwrap();
        spaced().await;
        let (_second, _) = ts.store.create_run(new_run("sum")).await.unwrap();

        let claimed = ts.store.claim_next_pending_run("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, RunStatus::Running);
        assert!(claimed.started_at.is_some());
        assert!(claimed.heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn claim_returns_none_when_no_work() {
        let ts = open_store().await;
        assert!(ts.store.claim_next_pending_run("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_skips_concurrency_sibling_of_running_run() {
        let ts = open_store().await;
        let mut a = new_run("sum");
        a.concurrency_key = Some("k".to_string());
        let mut b = new_run("sum");
        b.concurrency_key = Some("k".to_string());
        let mut c = new_run("sum");
        c.concurrency_key = Some("other".to_string());

        let (run_a, _) = ts.store.create_run(a).await.unwrap();
        spaced().await;
        let (run_b, _) = ts.store.create_run(b).await.unwrap();
        spaced().await;
        let (run_c, _) = ts.store.create_run(c).await.unwrap();

        let first = ts.store.claim_next_pending_run("w1").await.unwrap().unwrap();
        assert_eq!(first.id, run_a.id);

        // b shares key "k" with the running a, so c claims next.
        let second = ts.store.claim_next_pending_run("w1").await.unwrap().unwrap();
        assert_eq!(second.id, run_c.id);
        assert!(ts.store.claim_next_pending_run("w1").await.unwrap().is_none());

        // Once a completes, b becomes claimable.
        ts.store.complete_run(&run_a.id, &json!(null)).await.unwrap();
        let third = ts.store.claim_next_pending_run("w1").await.unwrap().unwrap();
        assert_eq!(third.id, run_b.id);
    }

    #[tokio::test]
    async fn concurrent_claims_return_disjoint_runs() {
        let ts = open_store().await;
        for _ in 0..8 {
            ts.store.create_run(new_run("sum")).await.unwrap();
        }

        let store = std::sync::Arc::new(ts.store);
        let mut tasks = Vec::new();
        for worker in 0..4 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                let worker_id = format!("w{worker}");
                while let Some(run) = store.claim_next_pending_run(&worker_id).await.unwrap() {
                    claimed.push(run.id);
                }
                claimed
            }));
        }

        let mut all: Vec<String> = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        all.sort();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 8, "all pending runs were claimed");
        assert_eq!(all.len(), 8, "no run was claimed twice");
    }

    #[tokio::test]
    async fn upsert_step_assigns_index_and_rejects_completed_collision() {
        let ts = open_store().await;
        let (run, _) = ts.store.create_run(new_run("sum")).await.unwrap();
        ts.store.claim_next_pending_run("w1").await.unwrap();

        let a = ts
            .store
            .upsert_step(&run.id, completed_step("a", 0, json!(1)))
            .await
            .unwrap();
        let b = ts
            .store
            .upsert_step(&run.id, completed_step("b", 1, json!(2)))
            .await
            .unwrap();
        assert_eq!(a.index, 0);
        assert_eq!(b.index, 1);

        let err = ts
            .store
            .upsert_step(&run.id, completed_step("a", 2, json!(9)))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateStepName { name, .. } if name == "a"));

        let refreshed = ts.store.get_run(&run.id).await.unwrap();
        assert_eq!(refreshed.current_step_index, 1);
    }

    #[tokio::test]
    async fn failed_step_row_is_overwritten_in_place() {
        let ts = open_store().await;
        let (run, _) = ts.store.create_run(new_run("sum")).await.unwrap();
        ts.store.claim_next_pending_run("w1").await.unwrap();

        ts.store
            .upsert_step(&run.id, completed_step("a", 0, json!(7)))
            .await
            .unwrap();
        ts.store
            .upsert_step(&run.id, failed_step("b", 1, "boom"))
            .await
            .unwrap();

        // Re-execution of the failed step replaces the row, keeping index 1.
        let replayed = ts
            .store
            .upsert_step(&run.id, completed_step("b", 2, json!(9)))
            .await
            .unwrap();
        assert_eq!(replayed.index, 1);
        assert_eq!(replayed.status, StepStatus::Completed);
        assert_eq!(replayed.output, Some(json!(9)));

        let steps = ts.store.list_steps(&run.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].name, "b");
        assert!(steps[1].error.is_none());
    }

    #[tokio::test]
    async fn heartbeat_stamps_running_runs_and_reports_cancel() {
        let ts = open_store().await;
        let (run, _) = ts.store.create_run(new_run("sum")).await.unwrap();

        let err = ts.store.heartbeat(&run.id).await.unwrap_err();
        assert!(matches!(err, StorageError::NotRunning(_)));

        ts.store.claim_next_pending_run("w1").await.unwrap();
        let ack = ts.store.heartbeat(&run.id).await.unwrap();
        assert!(!ack.cancel_requested);

        ts.store.request_cancel(&run.id).await.unwrap();
        let ack = ts.store.heartbeat(&run.id).await.unwrap();
        assert!(ack.cancel_requested);

        let err = ts.store.heartbeat("missing").await.unwrap_err();
        assert!(matches!(err, StorageError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn terminal_transitions_are_guarded() {
        let ts = open_store().await;
        let (run, _) = ts.store.create_run(new_run("sum")).await.unwrap();

        // completed requires running
        let err = ts.store.complete_run(&run.id, &json!(null)).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { .. }));

        ts.store.claim_next_pending_run("w1").await.unwrap();
        let done = ts.store.complete_run(&run.id, &json!({"ok": true})).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.output, Some(json!({"ok": true})));
        assert!(done.completed_at.is_some());

        // terminal runs reject further transitions
        let err = ts.store.fail_run(&run.id, "late").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { .. }));
        let err = ts.store.cancel_run(&run.id).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn pending_runs_cancel_directly() {
        let ts = open_store().await;
        let (run, _) = ts.store.create_run(new_run("sum")).await.unwrap();

        let cancelled = ts.store.cancel_run(&run.id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
    }

    #[tokio::test]
    async fn reset_to_pending_preserves_steps() {
        let ts = open_store().await;
        let (run, _) = ts.store.create_run(new_run("sum")).await.unwrap();
        ts.store.claim_next_pending_run("w1").await.unwrap();
        ts.store
            .upsert_step(&run.id, completed_step("a", 0, json!(7)))
            .await
            .unwrap();
        ts.store.fail_run(&run.id, "boom").await.unwrap();

        let reset = ts.store.reset_run_to_pending(&run.id).await.unwrap();
        assert_eq!(reset.status, RunStatus::Pending);
        assert!(reset.error.is_none());
        assert!(reset.started_at.is_none());
        assert!(reset.completed_at.is_none());
        assert!(reset.heartbeat_at.is_none());

        let steps = ts.store.list_steps(&run.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].output, Some(json!(7)));

        // retry is only legal from failed/cancelled
        let err = ts.store.reset_run_to_pending(&run.id).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn reap_resets_only_stale_running_runs() {
        let ts = open_store().await;
        let (stale, _) = ts.store.create_run(new_run("sum")).await.unwrap();
        let (fresh, _) = ts.store.create_run(new_run("sum")).await.unwrap();
        ts.store.claim_next_pending_run("w1").await.unwrap();
        ts.store.claim_next_pending_run("w1").await.unwrap();

        // Backdate the first run's heartbeat far past any threshold.
        sqlx::query("UPDATE runs SET heartbeat_at = ?1 WHERE id = ?2")
            .bind(Utc::now().timestamp_millis() - 300_000)
            .bind(&stale.id)
            .execute(ts.store.pool())
            .await
            .unwrap();

        let reaped = ts
            .store
            .reap_stale_runs(Duration::from_millis(30_000))
            .await
            .unwrap();
        assert_eq!(reaped, vec![stale.id.clone()]);

        assert_eq!(
            ts.store.get_run(&stale.id).await.unwrap().status,
            RunStatus::Pending
        );
        assert_eq!(
            ts.store.get_run(&fresh.id).await.unwrap().status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn delete_requires_terminal_and_cascades() {
        let ts = open_store().await;
        let (run, _) = ts.store.create_run(new_run("sum")).await.unwrap();
        ts.store.claim_next_pending_run("w1").await.unwrap();
        ts.store
            .upsert_step(&run.id, completed_step("a", 0, json!(1)))
            .await
            .unwrap();
        ts.store
            .write_log(&LogEntry {
                id: Uuid::new_v4().to_string(),
                run_id: run.id.clone(),
                step_name: Some("a".to_string()),
                level: LogLevel::Info,
                message: "hello".to_string(),
                data: None,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        let err = ts.store.delete_run(&run.id).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { .. }));

        ts.store.complete_run(&run.id, &json!(null)).await.unwrap();
        ts.store.delete_run(&run.id).await.unwrap();

        assert!(matches!(
            ts.store.get_run(&run.id).await.unwrap_err(),
            StorageError::RunNotFound(_)
        ));
        assert!(ts.store.list_steps(&run.id).await.unwrap().is_empty());
        assert!(ts.store.list_logs(&run.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_runs_filters_and_embeds_step_counts() {
        let ts = open_store().await;
        let (sum_run, _) = ts.store.create_run(new_run("sum")).await.unwrap();
        spaced().await;
        ts.store.create_run(new_run("import")).await.unwrap();

        ts.store.claim_next_pending_run("w1").await.unwrap();
        ts.store
            .upsert_step(&sum_run.id, completed_step("a", 0, json!(1)))
            .await
            .unwrap();
        ts.store
            .upsert_step(&sum_run.id, completed_step("b", 1, json!(2)))
            .await
            .unwrap();

        let all = ts.store.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        // newest first
        assert_eq!(all[0].run.job_name, "import");
        assert_eq!(all[0].step_count, 0);
        assert_eq!(all[1].step_count, 2);

        let filtered = ts
            .store
            .list_runs(&RunFilter {
                job_name: Some("sum".to_string()),
                status: Some(RunStatus::Running),
                ..RunFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].run.id, sum_run.id);

        let paged = ts
            .store
            .list_runs(&RunFilter {
                limit: Some(1),
                offset: Some(1),
                ..RunFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].run.job_name, "sum");
    }

    #[tokio::test]
    async fn logs_round_trip_in_order() {
        let ts = open_store().await;
        let (run, _) = ts.store.create_run(new_run("sum")).await.unwrap();

        for (i, level) in [LogLevel::Info, LogLevel::Warn, LogLevel::Error]
            .into_iter()
            .enumerate()
        {
            ts.store
                .write_log(&LogEntry {
                    id: format!("{i:02}"),
                    run_id: run.id.clone(),
                    step_name: None,
                    level,
                    message: format!("line {i}"),
                    data: Some(json!({"i": i})),
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }

        let logs = ts.store.list_logs(&run.id).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].message, "line 0");
        assert_eq!(logs[2].level, LogLevel::Error);
        assert_eq!(logs[1].data, Some(json!({"i": 1})));
    }
}
