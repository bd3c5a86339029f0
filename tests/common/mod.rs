//! Shared fixtures for the integration tests: scripted handlers with
//! per-task outcome scripts and call counters, fast configuration and a
//! harness wiring them into an [`Orchestrator`].

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use reelforge_core::config::OrchestratorConfig;
use reelforge_core::error::Result;
use reelforge_core::models::{
    FanOutMember, FanOutSpec, PipelineRun, ResourceClass, SubJobBatch, Task, TaskGraph, TaskId,
    TaskKind, TaskOutput, TaskParameters, TaskTransition,
};
use reelforge_core::orchestration::{
    BatchResults, GraphBuilder, HandlerRegistry, Orchestrator, TaskExecutionContext, TaskFailure,
    TaskHandler,
};
use reelforge_core::pipeline::MarketingVideoPipeline;
use reelforge_core::state_machine::{RunStatus, TaskEvent, TaskStatus};
use reelforge_core::store::{
    InMemoryStateStore, RunInsertion, StateStore, StoreResult, TaskExpectation, TransitionOutcome,
};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration with millisecond ticks and backoff so scenarios settle fast
pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.execution.scheduler_tick_ms = 5;
    config.execution.metadata_timeout_ms = 2_000;
    config.execution.generation_timeout_ms = 2_000;
    config.execution.media_timeout_ms = 2_000;
    config.execution.generation_poll_interval_ms = 1;
    config.backoff.base_delay_ms = 5;
    config.backoff.max_delay_ms = 40;
    config
}

pub fn brief() -> Value {
    json!({
        "campaign_id": "spring",
        "title": "Spring launch",
        "brief": "bright and fast",
        "asset_urls": ["a.png", "b.png", "c.png"],
    })
}

/// Parameters of `kind` suitable for any scripted scenario
pub fn parameters_for(kind: TaskKind, unit_index: usize) -> TaskParameters {
    match kind {
        TaskKind::CollectAssets => TaskParameters::CollectAssets {
            asset_urls: vec!["a.png".to_string(), "b.png".to_string()],
        },
        TaskKind::SelectPairs => TaskParameters::SelectPairs {
            brief: "brief".to_string(),
            max_pairs: 8,
        },
        TaskKind::GenerateSubclip => TaskParameters::GenerateSubclip {
            unit_index,
            prompt: format!("scene {unit_index}"),
            first_asset: "a.png".to_string(),
            second_asset: "b.png".to_string(),
            duration_seconds: 1.0,
        },
        TaskKind::DownloadResult => TaskParameters::DownloadResult {
            unit_index,
            destination_key: format!("clips/{unit_index}.mp4"),
        },
        TaskKind::GenerateAudio => TaskParameters::GenerateAudio { voice: None },
        TaskKind::CombineClips => TaskParameters::CombineClips {
            destination_key: "combined.mp4".to_string(),
        },
        TaskKind::MergeAudio => TaskParameters::MergeAudio {
            destination_key: "merged.mp4".to_string(),
        },
        TaskKind::StoreFinal => TaskParameters::StoreFinal {
            destination_key: "final.mp4".to_string(),
        },
    }
}

/// What one scripted attempt does
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeed,
    Fail(TaskFailure),
    Panic,
    /// Sleep, then succeed
    Sleep(Duration),
}

pub fn transient() -> Outcome {
    Outcome::Fail(TaskFailure::retryable("transient_error", "503 from generation service"))
}

pub fn rejected() -> Outcome {
    Outcome::Fail(TaskFailure::terminal_unit("rejected", "content policy"))
}

pub fn fatal() -> Outcome {
    Outcome::Fail(TaskFailure::terminal_run("invalid_input", "brief cannot be interpreted"))
}

/// Handler whose attempts follow per-task scripts.
///
/// Scripts are keyed by a task id suffix such as `generate-subclip:2`; once a
/// script runs dry (or for tasks without one) attempts take the default
/// outcome.
pub struct ScriptedHandler {
    kind: TaskKind,
    default: Mutex<Outcome>,
    latency: Mutex<Duration>,
    scripts: DashMap<String, VecDeque<Outcome>>,
    calls: DashMap<TaskId, usize>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    /// Member count and kinds for a generator
    fan_out: Mutex<Option<(usize, Vec<TaskKind>)>>,
    idempotent: Option<bool>,
    retry_budget: Option<u32>,
    resource_class: Option<ResourceClass>,
    batches_seen: Mutex<Vec<BatchResults>>,
}

impl ScriptedHandler {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            default: Mutex::new(Outcome::Succeed),
            latency: Mutex::new(Duration::ZERO),
            scripts: DashMap::new(),
            calls: DashMap::new(),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            fan_out: Mutex::new(None),
            idempotent: None,
            retry_budget: None,
            resource_class: None,
            batches_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn generator(kind: TaskKind, members: usize, member_kinds: Vec<TaskKind>) -> Self {
        let handler = Self::new(kind);
        *handler.fan_out.lock() = Some((members, member_kinds));
        handler
    }

    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = Some(budget);
        self
    }

    /// Draw concurrency from `class` instead of the kind's own class
    pub fn with_resource_class(mut self, class: ResourceClass) -> Self {
        self.resource_class = Some(class);
        self
    }

    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn set_default(&self, outcome: Outcome) {
        *self.default.lock() = outcome;
    }

    pub fn set_members(&self, members: usize) {
        if let Some((count, _)) = self.fan_out.lock().as_mut() {
            *count = members;
        }
    }

    pub fn script(&self, task_suffix: &str, outcomes: Vec<Outcome>) {
        self.scripts
            .entry(task_suffix.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn calls_for(&self, task_suffix: &str) -> usize {
        self.calls
            .iter()
            .filter(|entry| entry.key().as_str().ends_with(task_suffix))
            .map(|entry| *entry.value())
            .sum()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.iter().map(|entry| *entry.value()).sum()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn batches_seen(&self) -> Vec<BatchResults> {
        self.batches_seen.lock().clone()
    }

    fn next_outcome(&self, task_id: &TaskId) -> Outcome {
        for mut entry in self.scripts.iter_mut() {
            if task_id.as_str().ends_with(entry.key().as_str()) {
                if let Some(outcome) = entry.value_mut().pop_front() {
                    return outcome;
                }
            }
        }
        self.default.lock().clone()
    }

    fn output(&self, context: &TaskExecutionContext) -> TaskOutput {
        let payload = json!({
            "task_id": context.task_id,
            "attempt": context.attempt,
            "unit_index": context.unit_index,
        });
        match self.fan_out.lock().clone() {
            Some((members, kinds)) => TaskOutput::with_fan_out(
                payload,
                FanOutSpec {
                    members: (0..members)
                        .map(|index| FanOutMember {
                            parameters: kinds.iter().map(|kind| parameters_for(*kind, index)).collect(),
                        })
                        .collect(),
                },
            ),
            None => TaskOutput::new(payload),
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn is_idempotent(&self) -> bool {
        self.idempotent.unwrap_or_else(|| self.kind.is_idempotent())
    }

    fn resource_class(&self) -> ResourceClass {
        self.resource_class
            .unwrap_or_else(|| self.kind.resource_class())
    }

    fn retry_budget(&self) -> Option<u32> {
        self.retry_budget
    }

    async fn execute(&self, context: TaskExecutionContext) -> std::result::Result<TaskOutput, TaskFailure> {
        *self.calls.entry(context.task_id.clone()).or_insert(0) += 1;
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        if let Some(results) = &context.batch_results {
            self.batches_seen.lock().push(results.clone());
        }

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match self.next_outcome(&context.task_id) {
            Outcome::Succeed => Ok(self.output(&context)),
            Outcome::Fail(failure) => Err(failure),
            Outcome::Panic => panic!("scripted panic in {}", context.task_id),
            Outcome::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(self.output(&context))
            }
        }
    }
}

/// Scripted handlers for every marketing-video stage, with `select-pairs`
/// fanning out into `members` chains of `[generate-subclip, download-result]`
pub struct PipelineHandlers {
    pub handlers: HashMap<TaskKind, Arc<ScriptedHandler>>,
}

impl PipelineHandlers {
    pub fn new(members: usize) -> Self {
        let mut handlers = HashMap::new();
        for kind in TaskKind::ALL {
            let handler = if kind == TaskKind::SelectPairs {
                ScriptedHandler::generator(
                    kind,
                    members,
                    vec![TaskKind::GenerateSubclip, TaskKind::DownloadResult],
                )
            } else {
                ScriptedHandler::new(kind)
            };
            handlers.insert(kind, Arc::new(handler));
        }
        Self { handlers }
    }

    pub fn get(&self, kind: TaskKind) -> &Arc<ScriptedHandler> {
        &self.handlers[&kind]
    }

    pub fn replace(&mut self, handler: ScriptedHandler) {
        self.handlers.insert(handler.kind, Arc::new(handler));
    }

    pub fn registry(&self) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        for handler in self.handlers.values() {
            registry.register(handler.clone());
        }
        registry
    }
}

/// Graph builder backed by a closure, for hand-written scenario graphs
pub struct FnGraph<F>(pub F);

impl<F> GraphBuilder for FnGraph<F>
where
    F: Fn(&str, &Value) -> Result<TaskGraph> + Send + Sync,
{
    fn build(&self, job_id: &str, parameters: &Value) -> Result<TaskGraph> {
        (self.0)(job_id, parameters)
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<dyn StateStore>,
    pub handlers: PipelineHandlers,
}

impl Harness {
    pub fn pipeline(members: usize) -> Self {
        Self::with(PipelineHandlers::new(members), Arc::new(InMemoryStateStore::new()), fast_config())
    }

    pub fn with(handlers: PipelineHandlers, store: Arc<dyn StateStore>, config: OrchestratorConfig) -> Self {
        let orchestrator = Orchestrator::builder()
            .store(store.clone())
            .registry(handlers.registry())
            .graph_builder(Arc::new(MarketingVideoPipeline::new(config.pipeline.clone())))
            .config(config)
            .build()
            .expect("orchestrator builds");
        Self {
            orchestrator,
            store,
            handlers,
        }
    }

    pub fn handler(&self, kind: TaskKind) -> &Arc<ScriptedHandler> {
        self.handlers.get(kind)
    }

    pub async fn tasks(&self, job_id: &str) -> Vec<Task> {
        self.store.list_tasks(job_id).await.expect("list tasks")
    }

    pub async fn task(&self, job_id: &str, suffix: &str) -> Task {
        self.tasks(job_id)
            .await
            .into_iter()
            .find(|task| task.id.as_str().ends_with(suffix))
            .unwrap_or_else(|| panic!("no task ending in {suffix}"))
    }

    pub async fn status(&self, job_id: &str) -> RunStatus {
        self.orchestrator
            .get_status(job_id)
            .await
            .expect("status")
            .overall_status
    }
}

/// Poll `store` until `predicate` holds for the run's tasks or `timeout` passes
pub async fn wait_for_tasks<F>(store: &dyn StateStore, job_id: &str, timeout: Duration, predicate: F) -> bool
where
    F: Fn(&[Task]) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let tasks = store.list_tasks(job_id).await.unwrap_or_default();
        if predicate(&tasks) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

pub fn count_status(tasks: &[Task], kind: TaskKind, status: TaskStatus) -> usize {
    tasks
        .iter()
        .filter(|task| task.kind == kind && task.status == status)
        .count()
}

tokio::task_local! {
    static UNDELAYED: ();
}

/// Run `future` with batch reads at full speed on a [`SlowBatchStore`]
pub async fn undelayed<F: std::future::Future>(future: F) -> F::Output {
    UNDELAYED.scope((), future).await
}

/// In-memory store whose batch reads are slow for everyone outside
/// [`undelayed`]. Run snapshots read batches last, so a driver spends the
/// delay holding a view of its tasks that the test can act behind.
pub struct SlowBatchStore {
    inner: InMemoryStateStore,
    delay: Duration,
}

impl SlowBatchStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryStateStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl StateStore for SlowBatchStore {
    async fn insert_run(&self, run: PipelineRun, tasks: Vec<Task>) -> StoreResult<RunInsertion> {
        self.inner.insert_run(run, tasks).await
    }

    async fn get_run(&self, job_id: &str) -> StoreResult<Option<PipelineRun>> {
        self.inner.get_run(job_id).await
    }

    async fn list_runs(&self) -> StoreResult<Vec<PipelineRun>> {
        self.inner.list_runs().await
    }

    async fn list_tasks(&self, job_id: &str) -> StoreResult<Vec<Task>> {
        self.inner.list_tasks(job_id).await
    }

    async fn get_task(&self, task_id: &TaskId) -> StoreResult<Option<Task>> {
        self.inner.get_task(task_id).await
    }

    async fn append_batch(&self, batch: SubJobBatch, tasks: Vec<Task>) -> StoreResult<bool> {
        self.inner.append_batch(batch, tasks).await
    }

    async fn get_batch(&self, job_id: &str, name: &str) -> StoreResult<Option<SubJobBatch>> {
        self.inner.get_batch(job_id, name).await
    }

    async fn list_batches(&self, job_id: &str) -> StoreResult<Vec<SubJobBatch>> {
        if UNDELAYED.try_with(|_| ()).is_err() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.list_batches(job_id).await
    }

    async fn transition(
        &self,
        task_id: &TaskId,
        expected: TaskExpectation,
        event: TaskEvent,
    ) -> StoreResult<TransitionOutcome> {
        self.inner.transition(task_id, expected, event).await
    }

    async fn request_cancellation(&self, job_id: &str) -> StoreResult<bool> {
        self.inner.request_cancellation(job_id).await
    }

    async fn archive_run(&self, job_id: &str) -> StoreResult<bool> {
        self.inner.archive_run(job_id).await
    }

    async fn transitions(&self, job_id: &str) -> StoreResult<Vec<TaskTransition>> {
        self.inner.transitions(job_id).await
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.close().await
    }
}
