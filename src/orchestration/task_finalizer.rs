//! # Task Finalizer
//!
//! Derives run-level status and progress from task statuses. Run status is
//! never stored: it is recomputed from the snapshot on every query, so it
//! cannot drift from the records it summarizes.
//!
//! ```text
//! PENDING ──▶ RUNNING ──▶ COMPLETED   root task done
//!                    ├──▶ FAILED      a run-terminal failure exists
//!                    └──▶ CANCELED    cancel requested, nothing running
//! ```

use crate::constants::events;
use crate::events::EventPublisher;
use crate::logging::log_run_operation;
use crate::models::{TaskError, TaskKind};
use crate::orchestration::run_snapshot::RunSnapshot;
use crate::orchestration::viable_task_discovery::TaskReadinessSummary;
use crate::state_machine::{RunStatus, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::info;

/// Derive the run's overall status from its tasks
pub fn derive_status(snapshot: &RunSnapshot) -> RunStatus {
    if snapshot
        .root()
        .is_some_and(|root| root.status == TaskStatus::Done)
    {
        return RunStatus::Completed;
    }
    if snapshot.run_terminal_failure().is_some() {
        return RunStatus::Failed;
    }
    if snapshot.cancellation_requested() {
        return if snapshot.has_running() {
            RunStatus::Running
        } else {
            RunStatus::Canceled
        };
    }
    if snapshot
        .tasks
        .iter()
        .all(|task| task.status == TaskStatus::Pending)
    {
        return RunStatus::Pending;
    }
    RunStatus::Running
}

/// Progress of one stage (task kind)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    pub kind: TaskKind,
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub running: usize,
}

/// Answer to a status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: String,
    pub overall_status: RunStatus,
    /// Stage the run is in, or ended in
    pub stage: TaskKind,
    /// Done tasks over every task known at query time
    pub percent_complete: f64,
    pub succeeded_units: usize,
    pub failed_units: usize,
    /// Most specific description available: stage, unit and error text
    pub message: String,
    pub last_error: Option<TaskError>,
    pub stages: Vec<StageProgress>,
    pub cancellation_requested: bool,
    pub archived: bool,
}

/// Final result of driving a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub job_id: String,
    pub status: RunStatus,
    pub succeeded_units: usize,
    pub failed_units: usize,
    pub done_tasks: usize,
    pub total_tasks: usize,
    pub last_error: Option<TaskError>,
    /// Output payload of the root task, when completed
    pub output: Option<Value>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

#[derive(Debug, Clone)]
pub struct TaskFinalizer {
    events: EventPublisher,
}

impl TaskFinalizer {
    pub fn new(events: EventPublisher) -> Self {
        Self { events }
    }

    pub fn outcome(snapshot: &RunSnapshot) -> RunOutcome {
        let status = snapshot.status();
        let (succeeded_units, failed_units) = snapshot.unit_counts();
        RunOutcome {
            job_id: snapshot.job_id().to_string(),
            status,
            succeeded_units,
            failed_units,
            done_tasks: snapshot.count_done(),
            total_tasks: snapshot.tasks.len(),
            last_error: Self::reported_error(snapshot, status),
            output: snapshot
                .root()
                .and_then(|root| root.output.as_ref())
                .map(|output| output.payload.clone()),
        }
    }

    /// Record the end of a driven run
    pub fn finalize(&self, snapshot: &RunSnapshot) -> RunOutcome {
        let outcome = Self::outcome(snapshot);
        info!(
            job_id = %outcome.job_id,
            status = %outcome.status,
            succeeded_units = outcome.succeeded_units,
            failed_units = outcome.failed_units,
            "Run finished"
        );
        log_run_operation(
            "finish",
            &outcome.job_id,
            &outcome.status.to_string(),
            outcome.last_error.as_ref().map(|e| e.message.as_str()),
        );
        self.events.publish(
            events::RUN_FINISHED,
            json!({
                "job_id": outcome.job_id,
                "status": outcome.status,
                "succeeded_units": outcome.succeeded_units,
                "failed_units": outcome.failed_units,
            }),
        );
        outcome
    }

    pub fn status_report(snapshot: &RunSnapshot) -> JobStatusReport {
        let status = snapshot.status();
        let summary = TaskReadinessSummary::from_snapshot(snapshot);
        let (succeeded_units, failed_units) = snapshot.unit_counts();
        let stage = Self::current_stage(snapshot, status);
        let last_error = Self::reported_error(snapshot, status);

        JobStatusReport {
            job_id: snapshot.job_id().to_string(),
            overall_status: status,
            stage,
            percent_complete: summary.progress_percentage(),
            succeeded_units,
            failed_units,
            message: Self::message(snapshot, status, stage, &summary, (succeeded_units, failed_units)),
            last_error,
            stages: Self::stage_progress(snapshot),
            cancellation_requested: snapshot.cancellation_requested(),
            archived: snapshot.run.is_archived(),
        }
    }

    /// For a failed run the originating task's error, otherwise the most
    /// recent error recorded anywhere in the run
    fn reported_error(snapshot: &RunSnapshot, status: RunStatus) -> Option<TaskError> {
        if status == RunStatus::Failed {
            if let Some(task) = snapshot.run_terminal_failure() {
                return task.last_error.clone();
            }
        }
        snapshot
            .latest_error()
            .and_then(|task| task.last_error.clone())
    }

    fn current_stage(snapshot: &RunSnapshot, status: RunStatus) -> TaskKind {
        let root_kind = snapshot
            .root()
            .map(|root| root.kind)
            .unwrap_or(TaskKind::StoreFinal);
        match status {
            RunStatus::Completed => return root_kind,
            RunStatus::Failed => {
                if let Some(task) = snapshot.run_terminal_failure() {
                    return task.kind;
                }
            }
            _ => {}
        }

        // The kind with the most active tasks, earliest created on ties
        let mut active: HashMap<TaskKind, (usize, u64)> = HashMap::new();
        for task in &snapshot.tasks {
            let is_active = matches!(task.status, TaskStatus::Running | TaskStatus::Ready)
                || task.is_retry_pending();
            if is_active {
                let entry = active.entry(task.kind).or_insert((0, task.seq));
                entry.0 += 1;
                entry.1 = entry.1.min(task.seq);
            }
        }
        if let Some((kind, _)) = active
            .into_iter()
            .max_by(|(_, (a_count, a_seq)), (_, (b_count, b_seq))| {
                a_count.cmp(b_count).then(b_seq.cmp(a_seq))
            })
        {
            return kind;
        }

        snapshot
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Pending)
            .min_by_key(|task| task.seq)
            .map(|task| task.kind)
            .unwrap_or(root_kind)
    }

    fn stage_progress(snapshot: &RunSnapshot) -> Vec<StageProgress> {
        let mut stages: Vec<StageProgress> = Vec::new();
        for task in &snapshot.tasks {
            let position = match stages.iter().position(|stage| stage.kind == task.kind) {
                Some(position) => position,
                None => {
                    stages.push(StageProgress {
                        kind: task.kind,
                        total: 0,
                        done: 0,
                        failed: 0,
                        running: 0,
                    });
                    stages.len() - 1
                }
            };
            let stage = &mut stages[position];
            stage.total += 1;
            match task.status {
                TaskStatus::Done => stage.done += 1,
                TaskStatus::Running => stage.running += 1,
                TaskStatus::Failed if task.is_terminally_failed() => stage.failed += 1,
                _ => {}
            }
        }
        stages
    }

    fn message(
        snapshot: &RunSnapshot,
        status: RunStatus,
        stage: TaskKind,
        summary: &TaskReadinessSummary,
        (succeeded_units, failed_units): (usize, usize),
    ) -> String {
        let units = if succeeded_units + failed_units > 0 {
            format!(", {succeeded_units} units succeeded, {failed_units} failed")
        } else {
            String::new()
        };

        match status {
            RunStatus::Pending => "waiting to start".to_string(),
            RunStatus::Completed => {
                format!("completed: {}/{} tasks done{units}", summary.done, summary.total)
            }
            RunStatus::Canceled => format!(
                "canceled during {stage}: {}/{} tasks done{units}",
                summary.done, summary.total
            ),
            RunStatus::Failed => match snapshot.run_terminal_failure() {
                Some(task) => {
                    let unit = task
                        .batch
                        .as_ref()
                        .map(|membership| format!(" unit {}", membership.unit_index))
                        .unwrap_or_default();
                    let error = task
                        .last_error
                        .as_ref()
                        .map(|e| format!("{}: {}", e.code, e.message))
                        .unwrap_or_else(|| "unknown error".to_string());
                    format!("failed at {}{unit} ({}): {error}", task.kind, task.id)
                }
                None => format!("failed during {stage}"),
            },
            RunStatus::Running => {
                let mut message = format!(
                    "running {stage}: {}/{} tasks done{units}",
                    summary.done, summary.total
                );
                if snapshot.cancellation_requested() {
                    message.push_str("; cancellation requested");
                }
                let latest_unit_failure = snapshot
                    .tasks
                    .iter()
                    .filter(|task| task.batch.is_some() && task.is_terminally_failed())
                    .max_by_key(|task| task.last_error.as_ref().map(|e| e.occurred_at));
                if let Some(task) = latest_unit_failure {
                    if let (Some(membership), Some(error)) = (&task.batch, &task.last_error) {
                        message.push_str(&format!(
                            "; unit {} {} failed: {}",
                            membership.unit_index, task.kind, error.message
                        ));
                    }
                }
                message
            }
        }
    }
}
