//! # Run Snapshot
//!
//! Point-in-time view of one run loaded from the state store: the run
//! record, every task in creation order and every materialized batch. All
//! readiness, fan-in and status decisions are computed from a snapshot, so
//! the store stays the single source of truth and a restarted process
//! derives exactly what the crashed one would have.

use crate::error::{ReelforgeError, Result};
use crate::models::{PipelineRun, SubJobBatch, Task, TaskId};
use crate::orchestration::task_finalizer::derive_status;
use crate::orchestration::task_handler::{BatchResults, UnitFailure, UnitSuccess};
use crate::state_machine::{RunStatus, TaskStatus};
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Where one fan-out member chain stands
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemberOutcome<'a> {
    /// Some chain task is still pending, ready, running or awaiting a retry
    InFlight,
    /// The chain's tail is done
    Succeeded(&'a Task),
    /// A chain task failed terminally
    Failed(&'a Task),
}

impl MemberOutcome<'_> {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::InFlight)
    }
}

#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub run: PipelineRun,
    /// Creation order
    pub tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    batches: HashMap<String, SubJobBatch>,
}

impl RunSnapshot {
    pub fn new(run: PipelineRun, tasks: Vec<Task>, batches: Vec<SubJobBatch>) -> Self {
        let index = tasks
            .iter()
            .enumerate()
            .map(|(position, task)| (task.id.clone(), position))
            .collect();
        let batches = batches
            .into_iter()
            .map(|batch| (batch.name.clone(), batch))
            .collect();
        Self {
            run,
            tasks,
            index,
            batches,
        }
    }

    pub async fn load(store: &dyn StateStore, job_id: &str) -> Result<Self> {
        let run = store
            .get_run(job_id)
            .await?
            .ok_or_else(|| ReelforgeError::RunNotFound(job_id.to_string()))?;
        let tasks = store.list_tasks(job_id).await?;
        let batches = store.list_batches(job_id).await?;
        Ok(Self::new(run, tasks, batches))
    }

    pub fn job_id(&self) -> &str {
        &self.run.job_id
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).map(|&position| &self.tasks[position])
    }

    pub fn root(&self) -> Option<&Task> {
        self.task(&self.run.root_task_id)
    }

    pub fn batch(&self, name: &str) -> Option<&SubJobBatch> {
        self.batches.get(name)
    }

    /// Batches ordered by creation
    pub fn batches(&self) -> Vec<&SubJobBatch> {
        let mut batches: Vec<_> = self.batches.values().collect();
        batches.sort_by_key(|batch| (batch.created_at, batch.name.clone()));
        batches
    }

    pub fn status(&self) -> RunStatus {
        derive_status(self)
    }

    pub fn cancellation_requested(&self) -> bool {
        self.run.cancellation_requested
    }

    pub fn dependencies_done(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.task(dep)
                .is_some_and(|dep| dep.status.satisfies_dependencies())
        })
    }

    pub fn member_outcome(&self, batch: &SubJobBatch, unit_index: usize) -> MemberOutcome<'_> {
        let Some(member) = batch.member(unit_index) else {
            return MemberOutcome::InFlight;
        };
        let chain: Vec<&Task> = member
            .task_ids
            .iter()
            .filter_map(|id| self.task(id))
            .collect();
        if let Some(failed) = chain.iter().find(|task| task.is_terminally_failed()) {
            return MemberOutcome::Failed(*failed);
        }
        match member.tail().and_then(|tail| self.task(tail)) {
            Some(tail) if tail.status == TaskStatus::Done => MemberOutcome::Succeeded(tail),
            _ => MemberOutcome::InFlight,
        }
    }

    /// Every member of the batch is terminal
    pub fn batch_settled(&self, batch: &SubJobBatch) -> bool {
        batch
            .members
            .iter()
            .all(|member| self.member_outcome(batch, member.unit_index).is_settled())
    }

    /// A join may become ready once its batch exists and has settled
    pub fn join_viable(&self, task: &Task) -> bool {
        match &task.join_batch {
            None => true,
            Some(name) => self
                .batch(name)
                .is_some_and(|batch| self.batch_settled(batch)),
        }
    }

    pub fn batch_results(&self, batch: &SubJobBatch) -> BatchResults {
        let mut results = BatchResults {
            batch_name: batch.name.clone(),
            ..BatchResults::default()
        };
        for member in &batch.members {
            match self.member_outcome(batch, member.unit_index) {
                MemberOutcome::Succeeded(tail) => results.succeeded.push(UnitSuccess {
                    unit_index: member.unit_index,
                    task_id: tail.id.clone(),
                    payload: tail
                        .output
                        .as_ref()
                        .map(|output| output.payload.clone())
                        .unwrap_or_default(),
                }),
                MemberOutcome::Failed(task) => results.failed.push(UnitFailure {
                    unit_index: member.unit_index,
                    task_id: task.id.clone(),
                    error: task.last_error.clone(),
                }),
                MemberOutcome::InFlight => {}
            }
        }
        results
    }

    /// `(succeeded, failed)` units across every batch
    pub fn unit_counts(&self) -> (usize, usize) {
        self.batches.values().fold((0, 0), |(ok, failed), batch| {
            batch.members.iter().fold((ok, failed), |(ok, failed), member| {
                match self.member_outcome(batch, member.unit_index) {
                    MemberOutcome::Succeeded(_) => (ok + 1, failed),
                    MemberOutcome::Failed(_) => (ok, failed + 1),
                    MemberOutcome::InFlight => (ok, failed),
                }
            })
        })
    }

    /// Ready tasks in dispatch order: priority, then creation order
    pub fn ready_queue(&self) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Ready)
            .collect();
        ready.sort_by_key(|task| task.scheduling_key());
        ready
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> impl Iterator<Item = &Task> + '_ {
        self.tasks.iter().filter(move |task| task.status == status)
    }

    pub fn earliest_retry(&self) -> Option<DateTime<Utc>> {
        self.tasks
            .iter()
            .filter_map(|task| task.next_retry_at)
            .min()
    }

    /// The earliest-created task whose terminal failure aborts the run
    pub fn run_terminal_failure(&self) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|task| task.is_run_terminal_failure())
    }

    /// Most recent error recorded on any task
    pub fn latest_error(&self) -> Option<&Task> {
        self.tasks
            .iter()
            .filter(|task| task.last_error.is_some())
            .max_by_key(|task| task.last_error.as_ref().map(|error| error.occurred_at))
    }

    pub fn count_done(&self) -> usize {
        self.tasks_with_status(TaskStatus::Done).count()
    }

    pub fn has_running(&self) -> bool {
        self.tasks.iter().any(|task| task.status.is_active())
    }
}
