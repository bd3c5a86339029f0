//! In-memory state store for tests and ephemeral runs.
//!
//! All state sits behind one `parking_lot::Mutex`, so every operation
//! (including the compare-and-set) is trivially atomic. Share one instance
//! between orchestrators by `Arc` to simulate a process restart against the
//! same records.

use super::{
    assign_sequence, RunInsertion, StateStore, StoreError, StoreResult, TaskExpectation,
    TransitionOutcome,
};
use crate::models::{PipelineRun, SubJobBatch, Task, TaskId, TaskTransition};
use crate::state_machine::{TaskEvent, TaskStateMachine};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct MemoryState {
    runs: HashMap<String, PipelineRun>,
    run_order: Vec<String>,
    tasks: HashMap<TaskId, Task>,
    run_tasks: HashMap<String, Vec<TaskId>>,
    batches: HashMap<String, Vec<SubJobBatch>>,
    transitions: Vec<TaskTransition>,
    closed: bool,
}

impl MemoryState {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn insert_tasks(&mut self, job_id: &str, tasks: Vec<Task>) {
        let ids = self.run_tasks.entry(job_id.to_string()).or_default();
        for task in tasks {
            ids.push(task.id.clone());
            self.tasks.insert(task.id.clone(), task);
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn insert_run(
        &self,
        run: PipelineRun,
        mut tasks: Vec<Task>,
    ) -> StoreResult<RunInsertion> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        if let Some(existing) = state.runs.get(&run.job_id) {
            return Ok(RunInsertion::Existing(existing.clone()));
        }
        if let Some(dup) = tasks.iter().find(|t| state.tasks.contains_key(&t.id)) {
            return Err(StoreError::DuplicateTask(dup.id.to_string()));
        }

        assign_sequence(&mut tasks, 0);
        state.insert_tasks(&run.job_id, tasks);
        state.run_order.push(run.job_id.clone());
        state.runs.insert(run.job_id.clone(), run.clone());
        Ok(RunInsertion::Created(run))
    }

    async fn get_run(&self, job_id: &str) -> StoreResult<Option<PipelineRun>> {
        let state = self.state.lock();
        state.ensure_open()?;
        Ok(state.runs.get(job_id).cloned())
    }

    async fn list_runs(&self) -> StoreResult<Vec<PipelineRun>> {
        let state = self.state.lock();
        state.ensure_open()?;
        Ok(state
            .run_order
            .iter()
            .filter_map(|job_id| state.runs.get(job_id).cloned())
            .collect())
    }

    async fn list_tasks(&self, job_id: &str) -> StoreResult<Vec<Task>> {
        let state = self.state.lock();
        state.ensure_open()?;
        Ok(state
            .run_tasks
            .get(job_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.tasks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_task(&self, task_id: &TaskId) -> StoreResult<Option<Task>> {
        let state = self.state.lock();
        state.ensure_open()?;
        Ok(state.tasks.get(task_id).cloned())
    }

    async fn append_batch(&self, batch: SubJobBatch, mut tasks: Vec<Task>) -> StoreResult<bool> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        if !state.runs.contains_key(&batch.job_id) {
            return Err(StoreError::RunNotFound(batch.job_id.clone()));
        }
        let exists = state
            .batches
            .get(&batch.job_id)
            .is_some_and(|batches| batches.iter().any(|b| b.name == batch.name));
        if exists {
            return Ok(false);
        }
        if let Some(dup) = tasks.iter().find(|t| state.tasks.contains_key(&t.id)) {
            return Err(StoreError::DuplicateTask(dup.id.to_string()));
        }

        let next_seq = state
            .run_tasks
            .get(&batch.job_id)
            .map(|ids| ids.len() as u64)
            .unwrap_or(0);
        assign_sequence(&mut tasks, next_seq);
        let job_id = batch.job_id.clone();
        state.insert_tasks(&job_id, tasks);
        state.batches.entry(job_id).or_default().push(batch);
        Ok(true)
    }

    async fn get_batch(&self, job_id: &str, name: &str) -> StoreResult<Option<SubJobBatch>> {
        let state = self.state.lock();
        state.ensure_open()?;
        Ok(state
            .batches
            .get(job_id)
            .and_then(|batches| batches.iter().find(|b| b.name == name).cloned()))
    }

    async fn list_batches(&self, job_id: &str) -> StoreResult<Vec<SubJobBatch>> {
        let state = self.state.lock();
        state.ensure_open()?;
        Ok(state.batches.get(job_id).cloned().unwrap_or_default())
    }

    async fn transition(
        &self,
        task_id: &TaskId,
        expected: TaskExpectation,
        event: TaskEvent,
    ) -> StoreResult<TransitionOutcome> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        let sequence = state.transitions.len() as u64 + 1;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

        if !expected.matches(task) {
            return Ok(TransitionOutcome::Rejected {
                current: task.status,
            });
        }

        // Apply to a copy so a rejected event leaves the record untouched
        let mut updated = task.clone();
        let from_status = TaskStateMachine::apply(&mut updated, &event)?;
        *task = updated.clone();

        state.transitions.push(TaskTransition {
            sequence,
            job_id: updated.job_id.clone(),
            task_id: updated.id.clone(),
            from_status,
            to_status: updated.status,
            event: event.event_type().to_string(),
            attempt: updated.attempt_count,
            attempt_token: updated.current_attempt,
            created_at: Utc::now(),
        });

        Ok(TransitionOutcome::Applied(updated))
    }

    async fn request_cancellation(&self, job_id: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let run = state
            .runs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::RunNotFound(job_id.to_string()))?;
        if run.cancellation_requested {
            return Ok(false);
        }
        run.cancellation_requested = true;
        Ok(true)
    }

    async fn archive_run(&self, job_id: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let run = state
            .runs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::RunNotFound(job_id.to_string()))?;
        if run.archived_at.is_some() {
            return Ok(false);
        }
        run.archived_at = Some(Utc::now());
        Ok(true)
    }

    async fn transitions(&self, job_id: &str) -> StoreResult<Vec<TaskTransition>> {
        let state = self.state.lock();
        state.ensure_open()?;
        Ok(state
            .transitions
            .iter()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn close(&self) -> StoreResult<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}
