//! # Fan-out / Fan-in Coordinator
//!
//! A generator task declares a [`FanOutTemplate`] at creation and returns a
//! [`FanOutSpec`] with its output. Materialization is two-phase: the
//! generator's output is validated and persisted first, then one member
//! chain per spec entry is appended to the run together with its
//! [`SubJobBatch`] record. The append is idempotent per batch name, so a
//! generator that completed just before a crash is re-materialized from its
//! persisted output on resume.
//!
//! Member chains are linear: the first task depends on the generator, every
//! later task on the one before it. When a chain task fails terminally the
//! rest of the chain is failed with [`TaskEvent::SkipUpstreamFailed`] so the
//! member settles and the join can run.

use crate::constants::{events, UPSTREAM_FAILED_CODE};
use crate::error::Result;
use crate::events::EventPublisher;
use crate::logging::log_run_operation;
use crate::models::{
    BatchMember, FailureClass, FanOutSpec, FanOutTemplate, SubJobBatch, Task, TaskError, TaskId,
};
use crate::orchestration::run_snapshot::RunSnapshot;
use crate::orchestration::task_handler::TaskFailure;
use crate::orchestration::viable_task_discovery::ViableTaskDiscovery;
use crate::state_machine::{TaskEvent, TaskStatus};
use crate::store::{StateStore, TaskExpectation, TransitionOutcome};
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, error, info, instrument};

#[derive(Debug, Clone)]
pub struct FanOutCoordinator {
    events: EventPublisher,
}

impl FanOutCoordinator {
    pub fn new(events: EventPublisher) -> Self {
        Self { events }
    }

    /// Check a generator's returned spec against its declared template.
    ///
    /// A mismatch is a defect in the generator, so it fails the run rather
    /// than being retried.
    pub fn validate_spec(
        template: Option<&FanOutTemplate>,
        spec: Option<&FanOutSpec>,
    ) -> std::result::Result<(), TaskFailure> {
        let (template, spec) = match (template, spec) {
            (None, None) => return Ok(()),
            (Some(template), Some(spec)) => (template, spec),
            (Some(template), None) => {
                return Err(TaskFailure::terminal_run(
                    "missing_fan_out",
                    format!("generator of batch '{}' returned no fan-out", template.batch_name),
                ))
            }
            (None, Some(_)) => {
                return Err(TaskFailure::terminal_run(
                    "unexpected_fan_out",
                    "task returned a fan-out but declares no batch",
                ))
            }
        };

        let distinct: HashSet<_> = template.member_kinds.iter().collect();
        if distinct.len() != template.member_kinds.len() {
            return Err(TaskFailure::terminal_run(
                "invalid_fan_out",
                format!("batch '{}' repeats a member kind", template.batch_name),
            ));
        }

        for (index, member) in spec.members.iter().enumerate() {
            let kinds: Vec<_> = member.parameters.iter().map(|p| p.kind()).collect();
            if kinds != template.member_kinds {
                return Err(TaskFailure::terminal_run(
                    "invalid_fan_out",
                    format!(
                        "member {index} of batch '{}' has kinds {kinds:?}, expected {:?}",
                        template.batch_name, template.member_kinds
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Build the batch record and member chains for a completed generator
    pub fn build_children(
        generator: &Task,
        template: &FanOutTemplate,
        spec: &FanOutSpec,
    ) -> (SubJobBatch, Vec<Task>) {
        let mut tasks = Vec::new();
        let mut members = Vec::with_capacity(spec.members.len());

        for (unit_index, member) in spec.members.iter().enumerate() {
            let discriminator = unit_index.to_string();
            let mut previous: TaskId = generator.id.clone();
            let mut chain = Vec::with_capacity(member.parameters.len());
            for parameters in &member.parameters {
                let task = Task::new(
                    &generator.job_id,
                    parameters.clone(),
                    Some(&discriminator),
                    [previous.clone()],
                )
                .in_batch(&template.batch_name, unit_index);
                previous = task.id.clone();
                chain.push(task.id.clone());
                tasks.push(task);
            }
            members.push(BatchMember {
                unit_index,
                task_ids: chain,
            });
        }

        let batch = SubJobBatch {
            job_id: generator.job_id.clone(),
            name: template.batch_name.clone(),
            generator_task_id: generator.id.clone(),
            join_task_id: template.join_task_id.clone(),
            members,
            created_at: Utc::now(),
        };
        (batch, tasks)
    }

    /// Materialize the batch of every done generator that does not have one yet
    #[instrument(skip(self, store, snapshot), fields(job_id = %snapshot.job_id()))]
    pub async fn materialize_pending(
        &self,
        store: &dyn StateStore,
        snapshot: &RunSnapshot,
    ) -> Result<Vec<SubJobBatch>> {
        if !ViableTaskDiscovery::accepting_work(snapshot) {
            return Ok(Vec::new());
        }

        let mut materialized = Vec::new();
        for generator in snapshot.tasks_with_status(TaskStatus::Done) {
            let Some(template) = generator.fan_out.as_ref() else {
                continue;
            };
            if snapshot.batch(&template.batch_name).is_some() {
                continue;
            }
            let spec = match generator.output.as_ref().and_then(|o| o.fan_out.as_ref()) {
                Some(spec) => spec.clone(),
                None => {
                    // Outputs are validated before completion; an empty batch
                    // lets the join fail the run instead of blocking forever.
                    error!(
                        task_id = %generator.id,
                        batch = %template.batch_name,
                        "Done generator has no fan-out in its output"
                    );
                    FanOutSpec { members: Vec::new() }
                }
            };

            let (batch, tasks) = Self::build_children(generator, template, &spec);
            let child_count = tasks.len();
            if store.append_batch(batch.clone(), tasks).await? {
                info!(
                    batch = %batch.name,
                    members = batch.len(),
                    tasks = child_count,
                    generator = %generator.id,
                    "Materialized fan-out batch"
                );
                log_run_operation(
                    "materialize_batch",
                    snapshot.job_id(),
                    "running",
                    Some(&format!("{} with {} members", batch.name, batch.len())),
                );
                self.events.publish(
                    events::BATCH_MATERIALIZED,
                    json!({
                        "job_id": batch.job_id,
                        "batch": batch.name,
                        "members": batch.len(),
                        "generator_task_id": batch.generator_task_id,
                        "join_task_id": batch.join_task_id,
                    }),
                );
                materialized.push(batch);
            } else {
                debug!(batch = %batch.name, "Batch already materialized");
            }
        }
        Ok(materialized)
    }

    /// Fail the remainder of every member chain behind a terminal failure
    #[instrument(skip(self, store, snapshot), fields(job_id = %snapshot.job_id()))]
    pub async fn propagate_member_failures(
        &self,
        store: &dyn StateStore,
        snapshot: &RunSnapshot,
    ) -> Result<Vec<Task>> {
        let mut skipped = Vec::new();
        for batch in snapshot.batches() {
            for member in &batch.members {
                let mut upstream_failure: Option<&Task> = None;
                for task_id in &member.task_ids {
                    let Some(task) = snapshot.task(task_id) else {
                        continue;
                    };
                    match upstream_failure {
                        None if task.is_terminally_failed() => upstream_failure = Some(task),
                        Some(failed) if task.status == TaskStatus::Pending => {
                            let error = TaskError {
                                class: FailureClass::TerminalUnit,
                                code: UPSTREAM_FAILED_CODE.to_string(),
                                message: format!(
                                    "unit {} skipped: {} failed: {}",
                                    member.unit_index,
                                    failed.id,
                                    failed
                                        .last_error
                                        .as_ref()
                                        .map(|e| e.message.as_str())
                                        .unwrap_or("unknown error")
                                ),
                                attempt: task.attempt_count,
                                occurred_at: Utc::now(),
                            };
                            let outcome = store
                                .transition(
                                    &task.id,
                                    TaskExpectation::status(TaskStatus::Pending),
                                    TaskEvent::SkipUpstreamFailed { error },
                                )
                                .await?;
                            if let TransitionOutcome::Applied(task) = outcome {
                                debug!(task_id = %task.id, upstream = %failed.id, "Skipped chain task");
                                self.events.publish(
                                    events::TASK_SKIPPED,
                                    json!({
                                        "job_id": task.job_id,
                                        "task_id": task.id,
                                        "upstream_task_id": failed.id,
                                        "unit_index": member.unit_index,
                                    }),
                                );
                                skipped.push(task);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(skipped)
    }
}
