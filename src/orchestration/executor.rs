//! # Task Executor
//!
//! Drives one run from its current persisted state to a terminal status.
//!
//! ## Loop
//!
//! 1. **Settle**: fail the rest of member chains behind a terminal failure,
//!    materialize batches of done generators, release due retries and
//!    promote PENDING tasks whose dependencies are done. Repeated until a
//!    pass changes nothing.
//! 2. **Dispatch**: claim READY tasks in priority order while a global and a
//!    per-resource-class permit are available. Each claim is a
//!    compare-and-set READY → RUNNING carrying a fresh attempt token; the
//!    attempt runs on its own tokio task under the timeout of its kind.
//! 3. **Wait** for the first of: an attempt finishing, the earliest
//!    scheduled retry, a scheduler tick when ready work is gated, or an
//!    external wake-up (cancel, regenerate).
//!
//! Steps 1 and 2, recording a finished attempt and the decision to exit
//! happen under the run's [`DriverControl`] round lock, which the job facade
//! also takes before resetting tasks.
//!
//! The loop never waits on a specific task. An attempt's result is written
//! with a compare-and-set on its attempt token, so only that attempt can
//! record it. On start, RUNNING tasks left behind by a crashed driver are
//! returned to READY (or failed when re-running them is not allowed), which
//! is how resume recovers without redoing finished work.

use crate::config::OrchestratorConfig;
use crate::constants::{events, NO_SUCCESSFUL_UNITS_CODE};
use crate::error::{ReelforgeError, Result};
use crate::events::EventPublisher;
use crate::logging::{log_error, log_task_operation};
use crate::models::{FailureClass, Task, TaskId, TaskOutput};
use crate::orchestration::fan_out::FanOutCoordinator;
use crate::orchestration::resource_limits::{DispatchPermit, ResourceGates};
use crate::orchestration::retry_policy::{RetryDecision, RetryPolicy};
use crate::orchestration::run_snapshot::RunSnapshot;
use crate::orchestration::task_finalizer::{RunOutcome, TaskFinalizer};
use crate::orchestration::task_handler::{
    BatchResults, DependencyOutput, HandlerRegistry, TaskExecutionContext, TaskFailure, TaskHandler,
};
use crate::orchestration::viable_task_discovery::ViableTaskDiscovery;
use crate::state_machine::{TaskEvent, TaskStatus};
use crate::store::{StateStore, TaskExpectation, TransitionOutcome};
use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Upper bound on settle passes before dispatching anyway
const MAX_SETTLE_PASSES: usize = 8;

/// Result of one attempt, sent back to the driver
#[derive(Debug)]
struct AttemptReport {
    task_id: TaskId,
    attempt_token: Uuid,
    result: std::result::Result<TaskOutput, TaskFailure>,
}

/// An attempt this driver owns
#[derive(Debug)]
struct InFlightAttempt {
    task: Task,
    retry_budget: u32,
}

#[derive(Debug, Default)]
struct DispatchRound {
    dispatched: usize,
    /// Ready work was left waiting on a resource gate
    gated: bool,
    /// Attempts recorded without running a handler
    resolved_inline: usize,
}

/// What a driver waits for between rounds
#[derive(Debug)]
struct RoundWait {
    retry_wait: Option<Duration>,
    gated: bool,
}

#[derive(Debug)]
enum RoundStep {
    Wait(RoundWait),
    Finished(RunOutcome),
}

/// Shared between one run's driver and callers that change the run while
/// it is driven. `exited` is only set while the round lock is held.
#[derive(Debug, Default)]
pub struct DriverControl {
    round: Mutex<()>,
    wake: Notify,
    exited: AtomicBool,
}

impl DriverControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold while changing the run's persisted tasks. The driver neither
    /// settles, dispatches nor exits meanwhile.
    pub async fn lock_round(&self) -> MutexGuard<'_, ()> {
        self.round.lock().await
    }

    /// Ask for another round. Returns `false` when the driver has exited
    /// and will never see the request.
    pub fn wake(&self) -> bool {
        if self.has_exited() {
            return false;
        }
        self.wake.notify_one();
        true
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
    }

    async fn notified(&self) {
        self.wake.notified().await
    }
}

#[derive(Clone)]
pub struct TaskExecutor {
    store: Arc<dyn StateStore>,
    registry: Arc<HandlerRegistry>,
    config: Arc<OrchestratorConfig>,
    gates: ResourceGates,
    retry_policy: RetryPolicy,
    discovery: ViableTaskDiscovery,
    fan_out: FanOutCoordinator,
    finalizer: TaskFinalizer,
    events: EventPublisher,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("registry", &self.registry)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<HandlerRegistry>,
        config: Arc<OrchestratorConfig>,
        events: EventPublisher,
    ) -> Self {
        Self {
            gates: ResourceGates::new(&config.execution, &config.resource_limits),
            retry_policy: RetryPolicy::from_config(&config.backoff),
            discovery: ViableTaskDiscovery::new(events.clone()),
            fan_out: FanOutCoordinator::new(events.clone()),
            finalizer: TaskFinalizer::new(events.clone()),
            store,
            registry,
            config,
            events,
        }
    }

    pub fn gates(&self) -> &ResourceGates {
        &self.gates
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Drive `job_id` until it reaches a terminal status and every attempt
    /// this driver started has been recorded.
    ///
    /// Each round (recording a finished attempt, settling, dispatching and the
    /// decision to exit) runs under `control`'s round lock. Callers that reset
    /// tasks take the same lock, so they either land before a round and are
    /// seen by it, or find the driver already exited and start a new one.
    #[instrument(skip(self, control), fields(job_id = %job_id))]
    pub async fn drive(&self, job_id: &str, control: Arc<DriverControl>) -> Result<RunOutcome> {
        let mut in_flight: JoinSet<AttemptReport> = JoinSet::new();
        let mut owned: HashMap<TaskId, InFlightAttempt> = HashMap::new();
        let mut report: Option<AttemptReport> = None;
        let mut recover = true;

        loop {
            let round = control.lock_round().await;
            let step = self
                .run_round(job_id, recover, report.take(), &mut in_flight, &mut owned)
                .await;
            recover = false;
            let wait = match step {
                Ok(RoundStep::Wait(wait)) => wait,
                Ok(RoundStep::Finished(outcome)) => {
                    control.mark_exited();
                    return Ok(outcome);
                }
                Err(e) => {
                    control.mark_exited();
                    return Err(e);
                }
            };
            drop(round);

            let tick = self.config.execution.scheduler_tick();
            tokio::select! {
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined {
                        Ok(joined) => report = Some(joined),
                        Err(e) => {
                            let _round = control.lock_round().await;
                            control.mark_exited();
                            return Err(ReelforgeError::Orchestration(format!(
                                "attempt task of run {job_id} aborted: {e}"
                            )));
                        }
                    }
                }
                _ = tokio::time::sleep(wait.retry_wait.unwrap_or(tick)), if wait.retry_wait.is_some() => {}
                _ = tokio::time::sleep(tick), if wait.gated => {}
                _ = control.notified() => {
                    debug!("Driver woken");
                }
            }
        }
    }

    /// One scheduler round. Returns what to wait for next, or the run's
    /// outcome once it is terminal with nothing left in flight.
    async fn run_round(
        &self,
        job_id: &str,
        recover: bool,
        report: Option<AttemptReport>,
        in_flight: &mut JoinSet<AttemptReport>,
        owned: &mut HashMap<TaskId, InFlightAttempt>,
    ) -> Result<RoundStep> {
        if recover {
            let snapshot = RunSnapshot::load(self.store.as_ref(), job_id).await?;
            self.recover_orphans(&snapshot).await?;
        }
        if let Some(report) = report {
            if let Some(attempt) = owned.remove(&report.task_id) {
                self.record_attempt(&attempt.task, report.attempt_token, report.result, attempt.retry_budget)
                    .await?;
            }
        }

        loop {
            let snapshot = self.settle(job_id).await?;
            let accepting = ViableTaskDiscovery::accepting_work(&snapshot);

            let dispatch = if accepting {
                self.dispatch_ready(&snapshot, in_flight, owned).await?
            } else {
                DispatchRound::default()
            };
            if dispatch.resolved_inline > 0 {
                continue;
            }

            let retry_wait = if accepting {
                snapshot.earliest_retry().map(|at| {
                    (at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                })
            } else {
                None
            };

            if in_flight.is_empty() {
                let status = snapshot.status();
                if status.is_terminal() {
                    return Ok(RoundStep::Finished(self.finalizer.finalize(&snapshot)));
                }
                if retry_wait.is_none() && !dispatch.gated {
                    let message = format!("run {job_id} stalled in status {status} with no runnable work");
                    log_error("executor", "drive", &message, None);
                    return Err(ReelforgeError::Orchestration(message));
                }
            }

            debug!(
                in_flight = in_flight.len(),
                dispatched = dispatch.dispatched,
                gated = dispatch.gated,
                retry_wait_ms = retry_wait.map(|d| d.as_millis() as u64),
                "Waiting for scheduler event"
            );
            return Ok(RoundStep::Wait(RoundWait {
                retry_wait,
                gated: dispatch.gated,
            }));
        }
    }

    /// Bring the run's persisted state up to date until nothing changes
    pub async fn settle(&self, job_id: &str) -> Result<RunSnapshot> {
        let store = self.store.as_ref();
        let mut snapshot = RunSnapshot::load(store, job_id).await?;
        for _ in 0..MAX_SETTLE_PASSES {
            let mut changed = 0;
            changed += self.fan_out.propagate_member_failures(store, &snapshot).await?.len();
            changed += self.fan_out.materialize_pending(store, &snapshot).await?.len();
            changed += self
                .discovery
                .release_due_retries(store, &snapshot, Utc::now())
                .await?
                .len();
            changed += self.discovery.promote_ready(store, &snapshot).await?.len();
            if changed == 0 {
                break;
            }
            snapshot = RunSnapshot::load(store, job_id).await?;
        }
        Ok(snapshot)
    }

    /// Return RUNNING tasks with no live attempt to the ready queue
    async fn recover_orphans(&self, snapshot: &RunSnapshot) -> Result<()> {
        let orphans: Vec<&Task> = snapshot.tasks_with_status(TaskStatus::Running).collect();
        for task in orphans {
            let expectation = match task.current_attempt {
                Some(token) => TaskExpectation::attempt(token),
                None => TaskExpectation::status(TaskStatus::Running),
            };
            let idempotent = self
                .registry
                .get(task.kind)
                .map(|handler| handler.is_idempotent())
                .unwrap_or_else(|| task.kind.is_idempotent());
            let budget = self.retry_budget_for(task);

            if idempotent || task.attempts_in_generation() <= budget {
                let outcome = self
                    .store
                    .transition(&task.id, expectation, TaskEvent::Recover)
                    .await?;
                if let Some(recovered) = outcome.applied() {
                    log_task_operation("recover", &recovered, Some("attempt interrupted before recording a result"));
                    self.events.publish(
                        events::TASK_RECOVERED,
                        json!({"job_id": recovered.job_id, "task_id": recovered.id, "attempt_count": recovered.attempt_count}),
                    );
                }
            } else {
                let class = if task.batch.is_some() {
                    FailureClass::TerminalUnit
                } else {
                    FailureClass::TerminalRun
                };
                let failure = TaskFailure::new(
                    class,
                    "attempt_interrupted",
                    format!(
                        "{} was interrupted on attempt {} and is not safe to re-run",
                        task.id, task.attempt_count
                    ),
                );
                warn!(task_id = %task.id, "Interrupted non-idempotent attempt has no budget left");
                let event = TaskEvent::Fail {
                    error: failure.to_task_error(task.attempt_count),
                    retry_at: None,
                };
                self.store.transition(&task.id, expectation, event).await?;
            }
        }
        Ok(())
    }

    async fn dispatch_ready(
        &self,
        snapshot: &RunSnapshot,
        in_flight: &mut JoinSet<AttemptReport>,
        owned: &mut HashMap<TaskId, InFlightAttempt>,
    ) -> Result<DispatchRound> {
        let mut round = DispatchRound::default();

        for task in snapshot.ready_queue() {
            let handler = self.registry.get(task.kind);
            let class = handler
                .as_ref()
                .map(|handler| handler.resource_class())
                .unwrap_or_else(|| task.kind.resource_class());
            let Some(permit) = self.gates.try_acquire(class) else {
                round.gated = true;
                continue;
            };

            let attempt_token = Uuid::new_v4();
            let outcome = self
                .store
                .transition(
                    &task.id,
                    TaskExpectation::status(TaskStatus::Ready),
                    TaskEvent::Claim { attempt_token },
                )
                .await?;
            let Some(claimed) = outcome.applied() else {
                debug!(task_id = %task.id, "Claim lost race");
                continue;
            };

            log_task_operation("claim", &claimed, None);
            self.events.publish(
                events::TASK_CLAIMED,
                json!({
                    "job_id": claimed.job_id,
                    "task_id": claimed.id,
                    "kind": claimed.kind,
                    "attempt": claimed.attempt_count,
                }),
            );

            let retry_budget = self.retry_budget_for(&claimed);

            let Some(handler) = handler else {
                let failure = TaskFailure::terminal_run(
                    "no_handler",
                    format!("no handler registered for task kind {}", claimed.kind),
                );
                self.record_attempt(&claimed, attempt_token, Err(failure), retry_budget)
                    .await?;
                round.resolved_inline += 1;
                continue;
            };

            let batch_results = claimed
                .join_batch
                .as_ref()
                .and_then(|name| snapshot.batch(name))
                .map(|batch| snapshot.batch_results(batch));
            if let Some(results) = batch_results.as_ref().filter(|r| r.succeeded.is_empty()) {
                let failure = TaskFailure::terminal_run(
                    NO_SUCCESSFUL_UNITS_CODE,
                    format!(
                        "all {} units of batch '{}' failed",
                        results.total(),
                        results.batch_name
                    ),
                );
                self.record_attempt(&claimed, attempt_token, Err(failure), retry_budget)
                    .await?;
                round.resolved_inline += 1;
                continue;
            }

            let context = Self::build_context(snapshot, &claimed, attempt_token, batch_results);
            let timeout = self
                .config
                .execution
                .timeout_for(claimed.kind.timeout_profile());
            let in_batch = claimed.batch.is_some();
            owned.insert(
                claimed.id.clone(),
                InFlightAttempt {
                    task: claimed.clone(),
                    retry_budget,
                },
            );
            in_flight.spawn(run_attempt(
                handler,
                context,
                permit,
                timeout,
                in_batch,
            ));
            round.dispatched += 1;
        }

        Ok(round)
    }

    fn build_context(
        snapshot: &RunSnapshot,
        task: &Task,
        attempt_token: Uuid,
        batch_results: Option<BatchResults>,
    ) -> TaskExecutionContext {
        let dependencies = task
            .dependencies
            .iter()
            .filter_map(|id| snapshot.task(id))
            .map(|dep| DependencyOutput {
                task_id: dep.id.clone(),
                kind: dep.kind,
                payload: dep
                    .output
                    .as_ref()
                    .map(|output| output.payload.clone())
                    .unwrap_or_default(),
            })
            .collect();

        TaskExecutionContext {
            job_id: task.job_id.clone(),
            correlation_id: snapshot.run.correlation_id,
            task_id: task.id.clone(),
            kind: task.kind,
            parameters: task.parameters.clone(),
            attempt: task.attempt_count,
            attempt_token,
            unit_index: task.batch.as_ref().map(|membership| membership.unit_index),
            run_parameters: snapshot.run.parameters.clone(),
            dependencies,
            batch_results,
        }
    }

    fn retry_budget_for(&self, task: &Task) -> u32 {
        self.registry
            .get(task.kind)
            .and_then(|handler| handler.retry_budget())
            .unwrap_or_else(|| self.config.backoff.retry_budget_for(task.kind))
    }

    /// Persist the result of the attempt identified by `attempt_token`
    async fn record_attempt(
        &self,
        task: &Task,
        attempt_token: Uuid,
        result: std::result::Result<TaskOutput, TaskFailure>,
        retry_budget: u32,
    ) -> Result<()> {
        let result = result.and_then(|output| {
            FanOutCoordinator::validate_spec(task.fan_out.as_ref(), output.fan_out.as_ref())
                .map(|()| output)
        });

        match result {
            Ok(output) => {
                let outcome = self
                    .store
                    .transition(
                        &task.id,
                        TaskExpectation::attempt(attempt_token),
                        TaskEvent::Complete { output },
                    )
                    .await?;
                match outcome {
                    TransitionOutcome::Applied(done) => {
                        log_task_operation("complete", &done, None);
                        self.events.publish(
                            events::TASK_COMPLETED,
                            json!({
                                "job_id": done.job_id,
                                "task_id": done.id,
                                "kind": done.kind,
                                "attempt": done.attempt_count,
                            }),
                        );
                    }
                    TransitionOutcome::Rejected { current } => {
                        warn!(task_id = %task.id, current = %current, "Discarded result of stale attempt");
                    }
                }
            }
            Err(failure) => {
                let decision = self.retry_policy.decide(
                    task.attempts_in_generation(),
                    failure.class,
                    retry_budget,
                    failure.retry_after,
                );
                let retry_at = decision.delay().map(|delay| {
                    Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(86_400))
                });
                let error = failure.to_task_error(task.attempt_count);
                let outcome = self
                    .store
                    .transition(
                        &task.id,
                        TaskExpectation::attempt(attempt_token),
                        TaskEvent::Fail {
                            error: error.clone(),
                            retry_at,
                        },
                    )
                    .await?;

                if let TransitionOutcome::Rejected { current } = outcome {
                    warn!(task_id = %task.id, current = %current, "Discarded failure of stale attempt");
                    return Ok(());
                }

                match decision {
                    RetryDecision::RetryAfter(delay) => {
                        info!(
                            task_id = %task.id,
                            attempt = task.attempt_count,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure,
                            "Attempt failed; retry scheduled"
                        );
                        self.events.publish(
                            events::TASK_RETRY_SCHEDULED,
                            json!({
                                "job_id": task.job_id,
                                "task_id": task.id,
                                "attempt": task.attempt_count,
                                "delay_ms": delay.as_millis() as u64,
                                "code": error.code,
                            }),
                        );
                    }
                    RetryDecision::Terminal => {
                        log_error(
                            "executor",
                            "record_attempt",
                            &failure.to_string(),
                            Some(task.id.as_str()),
                        );
                        self.events.publish(
                            events::TASK_FAILED,
                            json!({
                                "job_id": task.job_id,
                                "task_id": task.id,
                                "kind": task.kind,
                                "class": error.class,
                                "code": error.code,
                                "message": error.message,
                            }),
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

/// One attempt on its own task: holds the dispatch permit for its duration,
/// bounded by `timeout`, with handler panics turned into failures.
async fn run_attempt(
    handler: Arc<dyn TaskHandler>,
    context: TaskExecutionContext,
    permit: DispatchPermit,
    timeout: Duration,
    in_batch: bool,
) -> AttemptReport {
    let _permit = permit;
    let task_id = context.task_id.clone();
    let attempt_token = context.attempt_token;

    let execution = AssertUnwindSafe(handler.execute(context)).catch_unwind();
    let result = match tokio::time::timeout(timeout, execution).await {
        Ok(Ok(result)) => result,
        Ok(Err(_panic)) => {
            let class = if in_batch {
                FailureClass::TerminalUnit
            } else {
                FailureClass::TerminalRun
            };
            Err(TaskFailure::new(class, "handler_panicked", format!("handler for {task_id} panicked")))
        }
        Err(_) => Err(TaskFailure::timeout(timeout)),
    };

    AttemptReport {
        task_id,
        attempt_token,
        result,
    }
}
