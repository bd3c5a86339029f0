//! # State Store
//!
//! The single source of truth for a run: durable task records, run records,
//! fan-out batch membership and an append-only transition log.
//!
//! Every task status change goes through [`StateStore::transition`], a
//! compare-and-set keyed by task id, expected status and (for results of an
//! attempt) the attempt token. Concurrent workers therefore cannot
//! double-claim a task, and a stale attempt cannot overwrite the result of a
//! newer one.
//!
//! A store is an explicit object with its own lifecycle: open it at process
//! start, hand it to the orchestrator by `Arc`, close it at shutdown.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStateStore;
pub use sqlite::SqliteStateStore;

use crate::config::{StateStoreConfig, StoreBackend};
use crate::models::{PipelineRun, SubJobBatch, Task, TaskId, TaskTransition};
use crate::state_machine::{StateMachineError, TaskEvent, TaskStatus};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Pipeline run not found: {0}")]
    RunNotFound(String),
    #[error("Task not found: {0}")]
    TaskNotFound(String),
    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),
    #[error(transparent)]
    InvalidTransition(#[from] StateMachineError),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    #[error("State store is closed")]
    Closed,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// What the caller believes the task looks like before the transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskExpectation {
    pub status: TaskStatus,
    /// When set, only the attempt holding this token may transition
    pub attempt_token: Option<Uuid>,
}

impl TaskExpectation {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status,
            attempt_token: None,
        }
    }

    /// The running attempt identified by `token`
    pub fn attempt(token: Uuid) -> Self {
        Self {
            status: TaskStatus::Running,
            attempt_token: Some(token),
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        task.status == self.status
            && self
                .attempt_token
                .map_or(true, |token| task.current_attempt == Some(token))
    }
}

/// Result of a compare-and-set
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// Expectation held; the updated task is returned
    Applied(Task),
    /// Someone else moved the task first
    Rejected { current: TaskStatus },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn applied(self) -> Option<Task> {
        match self {
            Self::Applied(task) => Some(task),
            Self::Rejected { .. } => None,
        }
    }
}

/// Result of inserting a run, which is idempotent per job id
#[derive(Debug, Clone, PartialEq)]
pub enum RunInsertion {
    Created(PipelineRun),
    Existing(PipelineRun),
}

impl RunInsertion {
    pub fn into_run(self) -> PipelineRun {
        match self {
            Self::Created(run) | Self::Existing(run) => run,
        }
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a run and its static tasks atomically. Returns the existing run
    /// untouched when `run.job_id` is already present.
    async fn insert_run(&self, run: PipelineRun, tasks: Vec<Task>) -> StoreResult<RunInsertion>;

    async fn get_run(&self, job_id: &str) -> StoreResult<Option<PipelineRun>>;

    async fn list_runs(&self) -> StoreResult<Vec<PipelineRun>>;

    /// All tasks of a run in creation order
    async fn list_tasks(&self, job_id: &str) -> StoreResult<Vec<Task>>;

    async fn get_task(&self, task_id: &TaskId) -> StoreResult<Option<Task>>;

    /// Append fan-out children and their batch record in one step. Returns
    /// `false` without writing when the batch already exists.
    async fn append_batch(&self, batch: SubJobBatch, tasks: Vec<Task>) -> StoreResult<bool>;

    async fn get_batch(&self, job_id: &str, name: &str) -> StoreResult<Option<SubJobBatch>>;

    async fn list_batches(&self, job_id: &str) -> StoreResult<Vec<SubJobBatch>>;

    /// Compare-and-set a task transition and append it to the log
    async fn transition(
        &self,
        task_id: &TaskId,
        expected: TaskExpectation,
        event: TaskEvent,
    ) -> StoreResult<TransitionOutcome>;

    /// Set the run's cancellation flag. Returns `false` if it was already set.
    async fn request_cancellation(&self, job_id: &str) -> StoreResult<bool>;

    /// Mark the run archived. Returns `false` if it was already archived.
    async fn archive_run(&self, job_id: &str) -> StoreResult<bool>;

    /// Applied transitions of a run, ordered by sequence
    async fn transitions(&self, job_id: &str) -> StoreResult<Vec<TaskTransition>>;

    async fn close(&self) -> StoreResult<()>;
}

/// Open the backend selected by `config`
pub async fn open_store(config: &StateStoreConfig) -> StoreResult<Arc<dyn StateStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryStateStore::new())),
        StoreBackend::Sqlite => Ok(Arc::new(SqliteStateStore::open(&config.url).await?)),
    }
}

/// Assign creation sequence numbers continuing after `start`
pub(crate) fn assign_sequence(tasks: &mut [Task], start: u64) {
    for (offset, task) in tasks.iter_mut().enumerate() {
        task.seq = start + offset as u64;
    }
}
