//! # Viable Task Discovery
//!
//! Moves tasks toward dispatch from a [`RunSnapshot`]:
//!
//! - PENDING → READY when every dependency is DONE and, for a join, its
//!   batch exists and every member has reached a terminal state
//! - FAILED → READY when a scheduled retry has come due
//!
//! Every promotion is a compare-and-set against the status observed in the
//! snapshot; a task moved by someone else in the meantime is skipped. No
//! promotion happens once cancellation is requested or the run has hit a
//! terminal failure, so blocked dependents never leave PENDING.

use crate::constants::events;
use crate::error::Result;
use crate::events::EventPublisher;
use crate::models::Task;
use crate::orchestration::run_snapshot::RunSnapshot;
use crate::state_machine::{TaskEvent, TaskStatus};
use crate::store::{StateStore, TaskExpectation, TransitionOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

/// Status counts for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReadinessSummary {
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub done: usize,
    /// Terminally failed
    pub failed: usize,
    pub retry_pending: usize,
}

impl TaskReadinessSummary {
    pub fn from_snapshot(snapshot: &RunSnapshot) -> Self {
        let mut summary = Self {
            total: snapshot.tasks.len(),
            ..Self::default()
        };
        for task in &snapshot.tasks {
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Ready => summary.ready += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Done => summary.done += 1,
                TaskStatus::Failed if task.is_retry_pending() => summary.retry_pending += 1,
                TaskStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    /// Done tasks over every task known at this moment
    pub fn progress_percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.done as f64 / self.total as f64) * 100.0
    }

    pub fn has_ready_work(&self) -> bool {
        self.ready > 0
    }
}

#[derive(Debug, Clone)]
pub struct ViableTaskDiscovery {
    events: EventPublisher,
}

impl ViableTaskDiscovery {
    pub fn new(events: EventPublisher) -> Self {
        Self { events }
    }

    /// Whether the snapshot allows any new work to start
    pub fn accepting_work(snapshot: &RunSnapshot) -> bool {
        !snapshot.cancellation_requested() && snapshot.run_terminal_failure().is_none()
    }

    /// PENDING tasks whose dependencies (and batch, for a join) are satisfied
    pub fn viable_pending<'a>(snapshot: &'a RunSnapshot) -> Vec<&'a Task> {
        snapshot
            .tasks_with_status(TaskStatus::Pending)
            .filter(|task| snapshot.dependencies_done(task) && snapshot.join_viable(task))
            .collect()
    }

    /// Promote viable PENDING tasks to READY
    #[instrument(skip(self, store, snapshot), fields(job_id = %snapshot.job_id()))]
    pub async fn promote_ready(
        &self,
        store: &dyn StateStore,
        snapshot: &RunSnapshot,
    ) -> Result<Vec<Task>> {
        if !Self::accepting_work(snapshot) {
            return Ok(Vec::new());
        }
        let mut promoted = Vec::new();
        for task in Self::viable_pending(snapshot) {
            let outcome = store
                .transition(
                    &task.id,
                    TaskExpectation::status(TaskStatus::Pending),
                    TaskEvent::MarkReady,
                )
                .await?;
            match outcome {
                TransitionOutcome::Applied(task) => {
                    debug!(task_id = %task.id, kind = %task.kind, "Task ready");
                    self.events.publish(
                        events::TASK_READY,
                        json!({"job_id": task.job_id, "task_id": task.id, "kind": task.kind}),
                    );
                    promoted.push(task);
                }
                TransitionOutcome::Rejected { current } => {
                    debug!(task_id = %task.id, current = %current, "Promotion lost race");
                }
            }
        }
        Ok(promoted)
    }

    /// Return FAILED tasks whose retry time has passed to READY
    #[instrument(skip(self, store, snapshot), fields(job_id = %snapshot.job_id()))]
    pub async fn release_due_retries(
        &self,
        store: &dyn StateStore,
        snapshot: &RunSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        if !Self::accepting_work(snapshot) {
            return Ok(Vec::new());
        }
        let due: Vec<&Task> = snapshot
            .tasks
            .iter()
            .filter(|task| task.is_retry_pending() && task.next_retry_at.is_some_and(|at| at <= now))
            .collect();

        let mut released = Vec::new();
        for task in due {
            let outcome = store
                .transition(
                    &task.id,
                    TaskExpectation::status(TaskStatus::Failed),
                    TaskEvent::RetryScheduled,
                )
                .await?;
            if let TransitionOutcome::Applied(task) = outcome {
                debug!(
                    task_id = %task.id,
                    attempt_count = task.attempt_count,
                    "Retry released"
                );
                self.events.publish(
                    events::TASK_READY,
                    json!({
                        "job_id": task.job_id,
                        "task_id": task.id,
                        "kind": task.kind,
                        "retry": true,
                    }),
                );
                released.push(task);
            }
        }
        Ok(released)
    }
}
