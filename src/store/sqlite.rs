//! # SQLite State Store
//!
//! Durable state store backed by sqlx's SQLite driver. One row per task
//! holds the indexed columns the scheduler filters on plus a JSON body with
//! the full record; an optimistic `version` column backs the
//! compare-and-set. Transitions are written in the same transaction as the
//! task update so the log never disagrees with the records.
//!
//! The pool is capped at a single connection, which serializes writers the
//! same way SQLite itself would and keeps `sqlite::memory:` databases alive
//! for the lifetime of the store.

use super::{
    assign_sequence, RunInsertion, StateStore, StoreError, StoreResult, TaskExpectation,
    TransitionOutcome,
};
use crate::models::{PipelineRun, SubJobBatch, Task, TaskId, TaskTransition};
use crate::state_machine::{TaskEvent, TaskStateMachine, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_runs (
        job_id TEXT PRIMARY KEY NOT NULL,
        created_at TEXT NOT NULL,
        body TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_tasks (
        id TEXT PRIMARY KEY NOT NULL,
        job_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        attempt_count INTEGER NOT NULL,
        version INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        body TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_pipeline_tasks_job ON pipeline_tasks (job_id, seq)",
    r#"
    CREATE TABLE IF NOT EXISTS sub_job_batches (
        job_id TEXT NOT NULL,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (job_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_transitions (
        sequence INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        task_id TEXT NOT NULL,
        from_status TEXT NOT NULL,
        to_status TEXT NOT NULL,
        event TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        attempt_token TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_transitions_job ON task_transitions (job_id, sequence)",
];

#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (creating if needed) the database at `url`, e.g.
    /// `sqlite://data/runs.db` or `sqlite::memory:`
    pub async fn open(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        Self::open_with(options).await
    }

    /// Open (creating if needed) the database file at `path`
    pub async fn open_path(path: impl AsRef<Path>) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        Self::open_with(options).await
    }

    async fn open_with(options: SqliteConnectOptions) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!("SQLite state store opened");
        Ok(Self { pool })
    }

    async fn next_seq(tx: &mut Transaction<'_, Sqlite>, job_id: &str) -> StoreResult<u64> {
        let next: i64 =
            sqlx::query("SELECT COALESCE(MAX(seq), -1) + 1 AS next_seq FROM pipeline_tasks WHERE job_id = ?")
                .bind(job_id)
                .fetch_one(&mut **tx)
                .await?
                .try_get("next_seq")?;
        Ok(next.max(0) as u64)
    }

    async fn insert_task(tx: &mut Transaction<'_, Sqlite>, task: &Task) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO pipeline_tasks (id, job_id, seq, kind, status, attempt_count, version, updated_at, body)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(task.id.as_str())
        .bind(&task.job_id)
        .bind(task.seq as i64)
        .bind(task.kind.as_str())
        .bind(task.status.as_str())
        .bind(i64::from(task.attempt_count))
        .bind(task.updated_at.to_rfc3339())
        .bind(serde_json::to_string(task)?)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateTask(task.id.to_string()));
        }
        Ok(())
    }

    async fn load_run<'e, E>(executor: E, job_id: &str) -> StoreResult<Option<PipelineRun>>
    where
        E: sqlx::SqliteExecutor<'e>,
    {
        let row = sqlx::query("SELECT body FROM pipeline_runs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(executor)
            .await?;
        row.map(|row| decode_body(&row)).transpose()
    }

    async fn save_run(tx: &mut Transaction<'_, Sqlite>, run: &PipelineRun) -> StoreResult<()> {
        sqlx::query("UPDATE pipeline_runs SET body = ? WHERE job_id = ?")
            .bind(serde_json::to_string(run)?)
            .bind(&run.job_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

fn decode_body<T: serde::de::DeserializeOwned>(row: &SqliteRow) -> StoreResult<T> {
    let body: String = row.try_get("body")?;
    Ok(serde_json::from_str(&body)?)
}

fn decode_transition(row: &SqliteRow) -> StoreResult<TaskTransition> {
    let parse_status = |column: &str| -> StoreResult<TaskStatus> {
        let raw: String = row.try_get(column)?;
        raw.parse().map_err(StoreError::Corrupt)
    };
    let token: Option<String> = row.try_get("attempt_token")?;
    let attempt_token = token
        .map(|raw| Uuid::parse_str(&raw))
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("attempt token: {e}")))?;
    let created_at: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| StoreError::Corrupt(format!("transition timestamp: {e}")))?
        .with_timezone(&Utc);
    let sequence: i64 = row.try_get("sequence")?;
    let attempt: i64 = row.try_get("attempt")?;
    let task_id: String = row.try_get("task_id")?;

    Ok(TaskTransition {
        sequence: sequence as u64,
        job_id: row.try_get("job_id")?,
        task_id: TaskId::from(task_id),
        from_status: parse_status("from_status")?,
        to_status: parse_status("to_status")?,
        event: row.try_get("event")?,
        attempt: attempt as u32,
        attempt_token,
        created_at,
    })
}

#[async_trait]
impl StateStore for SqliteStateStore {
    #[instrument(skip(self, run, tasks), fields(job_id = %run.job_id))]
    async fn insert_run(
        &self,
        run: PipelineRun,
        mut tasks: Vec<Task>,
    ) -> StoreResult<RunInsertion> {
        let mut tx = self.pool.begin().await?;

        if let Some(existing) = Self::load_run(&mut *tx, &run.job_id).await? {
            tx.rollback().await?;
            return Ok(RunInsertion::Existing(existing));
        }

        sqlx::query("INSERT INTO pipeline_runs (job_id, created_at, body) VALUES (?, ?, ?)")
            .bind(&run.job_id)
            .bind(run.created_at.to_rfc3339())
            .bind(serde_json::to_string(&run)?)
            .execute(&mut *tx)
            .await?;

        assign_sequence(&mut tasks, 0);
        for task in &tasks {
            Self::insert_task(&mut tx, task).await?;
        }

        tx.commit().await?;
        debug!(tasks = tasks.len(), "Inserted pipeline run");
        Ok(RunInsertion::Created(run))
    }

    async fn get_run(&self, job_id: &str) -> StoreResult<Option<PipelineRun>> {
        Self::load_run(&self.pool, job_id).await
    }

    async fn list_runs(&self) -> StoreResult<Vec<PipelineRun>> {
        let rows = sqlx::query("SELECT body FROM pipeline_runs ORDER BY created_at, job_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_body).collect()
    }

    async fn list_tasks(&self, job_id: &str) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query("SELECT body FROM pipeline_tasks WHERE job_id = ? ORDER BY seq")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_body).collect()
    }

    async fn get_task(&self, task_id: &TaskId) -> StoreResult<Option<Task>> {
        let row = sqlx::query("SELECT body FROM pipeline_tasks WHERE id = ?")
            .bind(task_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode_body(&row)).transpose()
    }

    #[instrument(skip(self, batch, tasks), fields(job_id = %batch.job_id, batch = %batch.name))]
    async fn append_batch(&self, batch: SubJobBatch, mut tasks: Vec<Task>) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        if Self::load_run(&mut *tx, &batch.job_id).await?.is_none() {
            tx.rollback().await?;
            return Err(StoreError::RunNotFound(batch.job_id.clone()));
        }

        let inserted = sqlx::query(
            "INSERT INTO sub_job_batches (job_id, name, created_at, body) VALUES (?, ?, ?, ?) ON CONFLICT (job_id, name) DO NOTHING",
        )
        .bind(&batch.job_id)
        .bind(&batch.name)
        .bind(batch.created_at.to_rfc3339())
        .bind(serde_json::to_string(&batch)?)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let next_seq = Self::next_seq(&mut tx, &batch.job_id).await?;
        assign_sequence(&mut tasks, next_seq);
        for task in &tasks {
            Self::insert_task(&mut tx, task).await?;
        }

        tx.commit().await?;
        debug!(members = batch.members.len(), tasks = tasks.len(), "Appended fan-out batch");
        Ok(true)
    }

    async fn get_batch(&self, job_id: &str, name: &str) -> StoreResult<Option<SubJobBatch>> {
        let row = sqlx::query("SELECT body FROM sub_job_batches WHERE job_id = ? AND name = ?")
            .bind(job_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode_body(&row)).transpose()
    }

    async fn list_batches(&self, job_id: &str) -> StoreResult<Vec<SubJobBatch>> {
        let rows = sqlx::query("SELECT body FROM sub_job_batches WHERE job_id = ? ORDER BY created_at, name")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_body).collect()
    }

    #[instrument(skip(self, expected, event), fields(task_id = %task_id, event = event.event_type()))]
    async fn transition(
        &self,
        task_id: &TaskId,
        expected: TaskExpectation,
        event: TaskEvent,
    ) -> StoreResult<TransitionOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT body, version FROM pipeline_tasks WHERE id = ?")
            .bind(task_id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        let mut task: Task = decode_body(&row)?;
        let version: i64 = row.try_get("version")?;

        if !expected.matches(&task) {
            tx.rollback().await?;
            return Ok(TransitionOutcome::Rejected {
                current: task.status,
            });
        }

        let from_status = TaskStateMachine::apply(&mut task, &event)?;

        let updated = sqlx::query(
            r#"
            UPDATE pipeline_tasks
            SET status = ?, attempt_count = ?, version = version + 1, updated_at = ?, body = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(task.status.as_str())
        .bind(i64::from(task.attempt_count))
        .bind(task.updated_at.to_rfc3339())
        .bind(serde_json::to_string(&task)?)
        .bind(task_id.as_str())
        .bind(version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(TransitionOutcome::Rejected {
                current: from_status,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO task_transitions
            (job_id, task_id, from_status, to_status, event, attempt, attempt_token, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.job_id)
        .bind(task_id.as_str())
        .bind(from_status.as_str())
        .bind(task.status.as_str())
        .bind(event.event_type())
        .bind(i64::from(task.attempt_count))
        .bind(task.current_attempt.map(|token| token.to_string()))
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(TransitionOutcome::Applied(task))
    }

    async fn request_cancellation(&self, job_id: &str) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let mut run = Self::load_run(&mut *tx, job_id)
            .await?
            .ok_or_else(|| StoreError::RunNotFound(job_id.to_string()))?;
        if run.cancellation_requested {
            tx.rollback().await?;
            return Ok(false);
        }
        run.cancellation_requested = true;
        Self::save_run(&mut tx, &run).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn archive_run(&self, job_id: &str) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let mut run = Self::load_run(&mut *tx, job_id)
            .await?
            .ok_or_else(|| StoreError::RunNotFound(job_id.to_string()))?;
        if run.archived_at.is_some() {
            tx.rollback().await?;
            return Ok(false);
        }
        run.archived_at = Some(Utc::now());
        Self::save_run(&mut tx, &run).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn transitions(&self, job_id: &str) -> StoreResult<Vec<TaskTransition>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, job_id, task_id, from_status, to_status, event, attempt, attempt_token, created_at
            FROM task_transitions
            WHERE job_id = ?
            ORDER BY sequence
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_transition).collect()
    }

    async fn close(&self) -> StoreResult<()> {
        self.pool.close().await;
        info!("SQLite state store closed");
        Ok(())
    }
}
