//! # Job Facade
//!
//! Entry point for the request layer. Maps a job request to a task graph,
//! persists it as a [`PipelineRun`] and drives it in the background; answers
//! status queries by deriving them from the state store.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use reelforge_core::orchestration::job_facade::Orchestrator;
//! use reelforge_core::pipeline::{register_handlers, MarketingVideoPipeline};
//! use reelforge_core::collaborators::simulated::SimulatedCollaborators;
//! use reelforge_core::orchestration::task_handler::HandlerRegistry;
//! use std::sync::Arc;
//!
//! # async fn example() -> reelforge_core::Result<()> {
//! let collaborators = SimulatedCollaborators::new().collaborators();
//! let mut registry = HandlerRegistry::new();
//! register_handlers(&mut registry, collaborators, Default::default());
//!
//! let orchestrator = Orchestrator::builder()
//!     .registry(registry)
//!     .graph_builder(Arc::new(MarketingVideoPipeline::default()))
//!     .build()?;
//!
//! let brief = serde_json::json!({
//!     "campaign_id": "spring",
//!     "title": "Spring launch",
//!     "brief": "bright and fast",
//!     "asset_urls": ["a.png", "b.png", "c.png"],
//! });
//! orchestrator.create_run("job-42", brief).await?;
//! let outcome = orchestrator.wait("job-42").await?;
//! println!("{} units succeeded", outcome.succeeded_units);
//! # Ok(())
//! # }
//! ```

use crate::config::{ConfigurationError, OrchestratorConfig};
use crate::constants::{actions, events};
use crate::error::{ReelforgeError, Result};
use crate::events::EventPublisher;
use crate::logging::{log_error, log_run_operation};
use crate::models::{PipelineRun, Task, TaskGraph, TaskId};
use crate::orchestration::dependency_resolver::DependencyResolver;
use crate::orchestration::executor::{DriverControl, TaskExecutor};
use crate::orchestration::run_snapshot::{MemberOutcome, RunSnapshot};
use crate::orchestration::task_finalizer::{JobStatusReport, RunOutcome, TaskFinalizer};
use crate::orchestration::task_handler::{HandlerRegistry, TaskHandler};
use crate::state_machine::{RunStatus, TaskEvent, TaskStatus};
use crate::store::{InMemoryStateStore, RunInsertion, StateStore, TaskExpectation};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// Maps a job's root parameters to its static task graph
pub trait GraphBuilder: Send + Sync {
    fn build(&self, job_id: &str, parameters: &Value) -> Result<TaskGraph>;
}

/// Background task driving one run
struct RunDriver {
    handle: JoinHandle<()>,
    control: Arc<DriverControl>,
    finished: watch::Receiver<bool>,
}

impl RunDriver {
    fn is_active(&self) -> bool {
        !self.handle.is_finished() && !self.control.has_exited()
    }

    /// `false` when the driver is gone and a new one is needed
    fn wake(&self) -> bool {
        !self.handle.is_finished() && self.control.wake()
    }
}

#[derive(Debug, Deserialize)]
struct RegenerateUnitPayload {
    unit_index: usize,
    #[serde(default)]
    batch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RetryTaskPayload {
    task_id: String,
}

pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    registry: Arc<HandlerRegistry>,
    graph_builder: Arc<dyn GraphBuilder>,
    executor: TaskExecutor,
    events: EventPublisher,
    config: Arc<OrchestratorConfig>,
    drivers: DashMap<String, RunDriver>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("active_drivers", &self.drivers.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Create and start a run. Calling it again with the same job id returns
    /// the existing run without creating anything.
    #[instrument(skip(self, parameters), fields(job_id = %job_id))]
    pub async fn create_run(&self, job_id: &str, parameters: Value) -> Result<PipelineRun> {
        if let Some(existing) = self.store.get_run(job_id).await? {
            info!("Run already exists");
            return Ok(existing);
        }

        let graph = self.graph_builder.build(job_id, &parameters)?;
        self.registry.validate_graph(&graph)?;
        let plan = DependencyResolver::resolve(&graph.root, &graph.tasks)?;
        let required: HashSet<&TaskId> = plan.order.iter().collect();
        for task in &graph.tasks {
            if let Some(template) = &task.fan_out {
                if !required.contains(&template.join_task_id) {
                    return Err(ReelforgeError::Structural(format!(
                        "join task {} of batch '{}' is not part of the graph",
                        template.join_task_id, template.batch_name
                    )));
                }
            }
        }
        let tasks: Vec<Task> = graph
            .tasks
            .iter()
            .filter(|task| required.contains(&task.id))
            .cloned()
            .collect();

        let run = PipelineRun::new(job_id, graph.root.clone(), parameters);
        match self.store.insert_run(run, tasks).await? {
            RunInsertion::Created(run) => {
                log_run_operation(
                    "create",
                    job_id,
                    "pending",
                    Some(&format!("{} tasks", plan.len())),
                );
                self.events.publish(
                    events::RUN_CREATED,
                    json!({"job_id": run.job_id, "root_task_id": run.root_task_id, "tasks": plan.len()}),
                );
                self.wake_or_spawn(job_id);
                Ok(run)
            }
            RunInsertion::Existing(run) => Ok(run),
        }
    }

    pub async fn get_run(&self, job_id: &str) -> Result<PipelineRun> {
        self.store
            .get_run(job_id)
            .await?
            .ok_or_else(|| ReelforgeError::RunNotFound(job_id.to_string()))
    }

    pub async fn list_runs(&self) -> Result<Vec<PipelineRun>> {
        Ok(self.store.list_runs().await?)
    }

    pub async fn get_status(&self, job_id: &str) -> Result<JobStatusReport> {
        let snapshot = RunSnapshot::load(self.store.as_ref(), job_id).await?;
        Ok(TaskFinalizer::status_report(&snapshot))
    }

    /// Stop dispatching new work for the run. Running attempts finish and
    /// record their results; the run then reports CANCELED.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        let snapshot = RunSnapshot::load(self.store.as_ref(), job_id).await?;
        let status = snapshot.status();
        if matches!(status, RunStatus::Completed | RunStatus::Failed) {
            return Err(ReelforgeError::invalid_action(
                job_id,
                "cancel",
                format!("run already {status}"),
            ));
        }

        if self.store.request_cancellation(job_id).await? {
            log_run_operation("cancel", job_id, &status.to_string(), None);
            self.events
                .publish(events::RUN_CANCEL_REQUESTED, json!({"job_id": job_id}));
        }
        self.wake_driver(job_id);
        Ok(())
    }

    /// Re-attach to a persisted run and continue it from its stored state
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn resume(&self, job_id: &str) -> Result<PipelineRun> {
        let snapshot = RunSnapshot::load(self.store.as_ref(), job_id).await?;
        let status = snapshot.status();
        if status.is_terminal() {
            info!(status = %status, "Run already finished; nothing to resume");
            return Ok(snapshot.run);
        }
        if self.wake_driver(job_id) {
            return Ok(snapshot.run);
        }

        log_run_operation(
            "resume",
            job_id,
            &status.to_string(),
            Some(&format!("{}/{} tasks done", snapshot.count_done(), snapshot.tasks.len())),
        );
        self.events.publish(
            events::RUN_RESUMED,
            json!({"job_id": job_id, "done_tasks": snapshot.count_done()}),
        );
        self.wake_or_spawn(job_id);
        Ok(snapshot.run)
    }

    /// Stage-specific operations. Returns the ids of the tasks reset.
    #[instrument(skip(self, payload), fields(job_id = %job_id, action = %action))]
    pub async fn action(&self, job_id: &str, action: &str, payload: Value) -> Result<Vec<TaskId>> {
        // Validate and reset within one driver round so the driver cannot
        // promote a join or exit on a stale view in between
        let control = self.control(job_id);
        let _round = match &control {
            Some(control) => Some(control.lock_round().await),
            None => None,
        };
        let snapshot = RunSnapshot::load(self.store.as_ref(), job_id).await?;
        if snapshot.cancellation_requested() {
            return Err(ReelforgeError::invalid_action(
                job_id,
                action,
                "cancellation was requested for this run",
            ));
        }

        let targets = match action {
            actions::REGENERATE_UNIT => {
                let payload: RegenerateUnitPayload = serde_json::from_value(payload)?;
                Self::regenerate_targets(&snapshot, payload)?
            }
            actions::RETRY_TASK => {
                let payload: RetryTaskPayload = serde_json::from_value(payload)?;
                Self::retry_targets(&snapshot, payload)?
            }
            other => {
                return Err(ReelforgeError::invalid_action(
                    job_id,
                    other,
                    "unknown action",
                ))
            }
        };

        let mut reset = Vec::with_capacity(targets.len());
        for task_id in targets {
            let outcome = self
                .store
                .transition(
                    &task_id,
                    TaskExpectation::status(TaskStatus::Failed),
                    TaskEvent::Reset,
                )
                .await?;
            if let Some(task) = outcome.applied() {
                self.events.publish(
                    events::TASK_RESET,
                    json!({"job_id": job_id, "task_id": task.id, "action": action}),
                );
                reset.push(task.id);
            } else {
                warn!(task_id = %task_id, "Task changed before it could be reset");
            }
        }

        log_run_operation(
            action,
            job_id,
            "running",
            Some(&format!("{} tasks reset", reset.len())),
        );
        self.wake_or_spawn(job_id);
        Ok(reset)
    }

    fn regenerate_targets(snapshot: &RunSnapshot, payload: RegenerateUnitPayload) -> Result<Vec<TaskId>> {
        let job_id = snapshot.job_id();
        let invalid = |reason: String| ReelforgeError::invalid_action(job_id, actions::REGENERATE_UNIT, reason);

        let batch = match payload.batch.as_deref() {
            Some(name) => snapshot
                .batch(name)
                .ok_or_else(|| invalid(format!("no batch named '{name}'")))?,
            None => match snapshot.batches().as_slice() {
                [only] => *only,
                [] => return Err(invalid("run has no fan-out batch yet".to_string())),
                _ => return Err(invalid("run has several batches; name one".to_string())),
            },
        };
        let member = batch
            .member(payload.unit_index)
            .ok_or_else(|| invalid(format!("batch '{}' has no unit {}", batch.name, payload.unit_index)))?;
        if !matches!(
            snapshot.member_outcome(batch, member.unit_index),
            MemberOutcome::Failed(_)
        ) {
            return Err(invalid(format!("unit {} has not failed", member.unit_index)));
        }

        let join = snapshot
            .task(&batch.join_task_id)
            .ok_or_else(|| invalid(format!("join task {} is missing", batch.join_task_id)))?;
        let join_failed = join.is_terminally_failed();
        if !(join.status == TaskStatus::Pending || join_failed) {
            return Err(invalid(format!(
                "join {} is already {}",
                join.id, join.status
            )));
        }
        if let Some(blocking) = snapshot.run_terminal_failure() {
            if blocking.id != join.id {
                return Err(invalid(format!(
                    "run failed at {}; retry that task instead",
                    blocking.id
                )));
            }
        }

        let mut targets: Vec<TaskId> = member
            .task_ids
            .iter()
            .filter_map(|id| snapshot.task(id))
            .filter(|task| task.is_terminally_failed())
            .map(|task| task.id.clone())
            .collect();
        if join_failed {
            targets.push(join.id.clone());
        }
        Ok(targets)
    }

    fn retry_targets(snapshot: &RunSnapshot, payload: RetryTaskPayload) -> Result<Vec<TaskId>> {
        let job_id = snapshot.job_id();
        let invalid = |reason: String| ReelforgeError::invalid_action(job_id, actions::RETRY_TASK, reason);

        let task_id = TaskId::from(payload.task_id);
        let task = snapshot
            .task(&task_id)
            .ok_or_else(|| invalid(format!("run has no task {task_id}")))?;
        if task.batch.is_some() {
            return Err(invalid(format!(
                "{task_id} belongs to a fan-out unit; use {}",
                actions::REGENERATE_UNIT
            )));
        }
        if !task.is_terminally_failed() {
            return Err(invalid(format!("{task_id} is {} and cannot be retried", task.status)));
        }
        Ok(vec![task_id])
    }

    /// Wait for the run's driver to stop and return the run's outcome
    pub async fn wait(&self, job_id: &str) -> Result<RunOutcome> {
        loop {
            let finished = self.drivers.get(job_id).map(|driver| driver.finished.clone());
            if let Some(mut finished) = finished {
                // An error means the driver was aborted before finishing
                let _ = finished.wait_for(|done| *done).await;
            }

            let snapshot = RunSnapshot::load(self.store.as_ref(), job_id).await?;
            let outcome = TaskFinalizer::outcome(&snapshot);
            if outcome.status.is_terminal() {
                return Ok(outcome);
            }
            // An action may have handed the run to a new driver meanwhile
            if !self.is_active(job_id) {
                return Err(ReelforgeError::Orchestration(format!(
                    "run {job_id} is not being driven (status {})",
                    outcome.status
                )));
            }
            tokio::task::yield_now().await;
        }
    }

    /// Archive a finished run. Archived runs stay queryable.
    pub async fn purge(&self, job_id: &str) -> Result<bool> {
        let snapshot = RunSnapshot::load(self.store.as_ref(), job_id).await?;
        let status = snapshot.status();
        if !status.is_terminal() || snapshot.has_running() {
            return Err(ReelforgeError::invalid_action(
                job_id,
                "purge",
                format!("run is still {status}"),
            ));
        }
        let archived = self.store.archive_run(job_id).await?;
        if archived {
            self.events
                .publish(events::RUN_ARCHIVED, json!({"job_id": job_id}));
        }
        Ok(archived)
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.drivers
            .get(job_id)
            .is_some_and(|driver| driver.is_active())
    }

    /// Abort every active driver without touching persisted state. Running
    /// tasks stay RUNNING in the store until a later `resume` recovers them.
    pub fn shutdown(&self) {
        for entry in self.drivers.iter() {
            entry.handle.abort();
        }
        self.drivers.clear();
        info!("Orchestrator drivers stopped");
    }

    fn control(&self, job_id: &str) -> Option<Arc<DriverControl>> {
        self.drivers
            .get(job_id)
            .map(|driver| Arc::clone(&driver.control))
    }

    fn wake_driver(&self, job_id: &str) -> bool {
        self.drivers.get(job_id).is_some_and(|driver| driver.wake())
    }

    /// Hand new work to the run's driver, starting one if it has exited
    fn wake_or_spawn(&self, job_id: &str) {
        match self.drivers.entry(job_id.to_string()) {
            Entry::Occupied(entry) if entry.get().wake() => {}
            Entry::Occupied(mut entry) => {
                entry.insert(self.start_driver(job_id));
            }
            Entry::Vacant(entry) => {
                entry.insert(self.start_driver(job_id));
            }
        }
    }

    fn start_driver(&self, job_id: &str) -> RunDriver {
        let control = Arc::new(DriverControl::new());
        let (finished_tx, finished) = watch::channel(false);
        let executor = self.executor.clone();
        let store = Arc::clone(&self.store);
        let publisher = self.events.clone();
        let job_id = job_id.to_string();
        let driver_control = Arc::clone(&control);

        let handle = tokio::spawn(async move {
            match executor.drive(&job_id, driver_control).await {
                Ok(outcome) if outcome.status == RunStatus::Completed => {
                    match store.archive_run(&job_id).await {
                        Ok(true) => publisher.publish(events::RUN_ARCHIVED, json!({"job_id": job_id})),
                        Ok(false) => {}
                        Err(e) => log_error("job_facade", "archive", &e.to_string(), Some(&job_id)),
                    }
                }
                Ok(_) => {}
                Err(e) => log_error("job_facade", "drive", &e.to_string(), Some(&job_id)),
            }
            let _ = finished_tx.send(true);
        });

        RunDriver {
            handle,
            control,
            finished,
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        for entry in self.drivers.iter() {
            entry.handle.abort();
        }
    }
}

/// Wires a store, handlers, a graph builder and configuration together
#[derive(Default)]
pub struct OrchestratorBuilder {
    store: Option<Arc<dyn StateStore>>,
    registry: HandlerRegistry,
    graph_builder: Option<Arc<dyn GraphBuilder>>,
    config: OrchestratorConfig,
    events: Option<EventPublisher>,
}

impl OrchestratorBuilder {
    /// Defaults to a fresh in-memory store
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.registry.register(handler);
        self
    }

    pub fn graph_builder(mut self, graph_builder: Arc<dyn GraphBuilder>) -> Self {
        self.graph_builder = Some(graph_builder);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn events(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        let graph_builder = self.graph_builder.ok_or_else(|| {
            ConfigurationError::invalid_value("graph_builder", "none", "an orchestrator needs a graph builder")
        })?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStateStore::new()));
        let publisher = self
            .events
            .unwrap_or_else(|| EventPublisher::new(self.config.events.channel_capacity));
        let config = Arc::new(self.config);
        let registry = Arc::new(self.registry);
        let executor = TaskExecutor::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&config),
            publisher.clone(),
        );

        Ok(Orchestrator {
            store,
            registry,
            graph_builder,
            executor,
            events: publisher,
            config,
            drivers: DashMap::new(),
        })
    }
}
