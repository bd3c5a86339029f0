//! # Task Handlers
//!
//! A task kind's behavior lives behind the [`TaskHandler`] trait: a function
//! from `(parameters, resolved dependency outputs)` to an output or a
//! classified [`TaskFailure`], plus the scheduling declarations the executor
//! needs (idempotency, resource class, retry budget). The executor never
//! inspects task semantics beyond these declarations.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use reelforge_core::models::{TaskKind, TaskOutput};
//! use reelforge_core::orchestration::task_handler::{
//!     HandlerRegistry, TaskExecutionContext, TaskFailure, TaskHandler,
//! };
//! use std::sync::Arc;
//!
//! struct CollectAssets;
//!
//! #[async_trait::async_trait]
//! impl TaskHandler for CollectAssets {
//!     fn kind(&self) -> TaskKind {
//!         TaskKind::CollectAssets
//!     }
//!
//!     async fn execute(&self, _context: TaskExecutionContext) -> Result<TaskOutput, TaskFailure> {
//!         Ok(TaskOutput::new(serde_json::json!({"assets": []})))
//!     }
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(Arc::new(CollectAssets));
//! assert!(registry.contains(TaskKind::CollectAssets));
//! ```

use crate::error::{ReelforgeError, Result};
use crate::models::{
    FailureClass, ResourceClass, TaskError, TaskGraph, TaskId, TaskKind, TaskOutput,
    TaskParameters,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Classified failure returned by a task body
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub class: FailureClass,
    pub code: String,
    pub message: String,
    /// Server-provided hint (e.g. a rate-limit `Retry-After`)
    pub retry_after: Option<Duration>,
}

impl TaskFailure {
    pub fn new(class: FailureClass, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class,
            code: code.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureClass::Retryable, code, message)
    }

    pub fn terminal_unit(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureClass::TerminalUnit, code, message)
    }

    pub fn terminal_run(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureClass::TerminalRun, code, message)
    }

    /// An attempt that exceeded its kind's timeout
    pub fn timeout(after: Duration) -> Self {
        Self::retryable("timeout", format!("attempt timed out after {after:?}"))
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn to_task_error(&self, attempt: u32) -> TaskError {
        TaskError {
            class: self.class,
            code: self.code.clone(),
            message: self.message.clone(),
            attempt,
            occurred_at: Utc::now(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.class, self.message)
    }
}

/// Output of one completed dependency
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyOutput {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitSuccess {
    pub unit_index: usize,
    pub task_id: TaskId,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitFailure {
    pub unit_index: usize,
    pub task_id: TaskId,
    pub error: Option<TaskError>,
}

/// What a join task receives about its batch: every member is terminal
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchResults {
    pub batch_name: String,
    pub succeeded: Vec<UnitSuccess>,
    pub failed: Vec<UnitFailure>,
}

impl BatchResults {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Everything a task body may read for one attempt
#[derive(Debug, Clone)]
pub struct TaskExecutionContext {
    pub job_id: String,
    pub correlation_id: Uuid,
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub parameters: TaskParameters,
    /// 1-based attempt number since creation
    pub attempt: u32,
    pub attempt_token: Uuid,
    /// Fan-out unit this task belongs to, if any
    pub unit_index: Option<usize>,
    /// Request parameters of the run
    pub run_parameters: Value,
    pub dependencies: Vec<DependencyOutput>,
    /// Present only for join tasks
    pub batch_results: Option<BatchResults>,
}

impl TaskExecutionContext {
    /// Payload of the (first) completed dependency of `kind`
    pub fn dependency_payload(&self, kind: TaskKind) -> Option<&Value> {
        self.dependencies
            .iter()
            .find(|dep| dep.kind == kind)
            .map(|dep| &dep.payload)
    }

    /// Deserialize the output of the dependency of `kind`.
    ///
    /// A missing or malformed upstream output is a wiring defect, not a
    /// transient condition, so it fails the run.
    pub fn dependency_as<T: DeserializeOwned>(&self, kind: TaskKind) -> std::result::Result<T, TaskFailure> {
        let payload = self.dependency_payload(kind).ok_or_else(|| {
            TaskFailure::terminal_run(
                "missing_dependency_output",
                format!("{} has no completed {kind} dependency", self.task_id),
            )
        })?;
        serde_json::from_value(payload.clone()).map_err(|e| {
            TaskFailure::terminal_run(
                "malformed_dependency_output",
                format!("output of {kind} could not be read by {}: {e}", self.kind),
            )
        })
    }

    pub fn run_parameters_as<T: DeserializeOwned>(&self) -> std::result::Result<T, TaskFailure> {
        serde_json::from_value(self.run_parameters.clone()).map_err(|e| {
            TaskFailure::terminal_run("malformed_run_parameters", e.to_string())
        })
    }

    pub fn is_fan_out_member(&self) -> bool {
        self.unit_index.is_some()
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Whether an interrupted attempt may be re-run without side-effect risk
    fn is_idempotent(&self) -> bool {
        self.kind().is_idempotent()
    }

    fn resource_class(&self) -> ResourceClass {
        self.kind().resource_class()
    }

    /// Overrides the configured retry budget for this kind
    fn retry_budget(&self) -> Option<u32> {
        None
    }

    async fn execute(&self, context: TaskExecutionContext) -> std::result::Result<TaskOutput, TaskFailure>;
}

/// Handlers by task kind
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`, replacing any handler of the same kind
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(handler.kind(), handler);
        self
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: TaskKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Every static task and every declared fan-out member kind needs a handler
    pub fn validate_graph(&self, graph: &TaskGraph) -> Result<()> {
        for task in &graph.tasks {
            let member_kinds = task
                .fan_out
                .as_ref()
                .map(|template| template.member_kinds.as_slice())
                .unwrap_or_default();
            for kind in std::iter::once(&task.kind).chain(member_kinds) {
                if !self.contains(*kind) {
                    return Err(ReelforgeError::Structural(format!(
                        "no handler registered for task kind {kind} (task {})",
                        task.id
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskGraphBuilder, TaskParameters};
    use serde_json::json;

    struct Noop(TaskKind);

    #[async_trait]
    impl TaskHandler for Noop {
        fn kind(&self) -> TaskKind {
            self.0
        }

        async fn execute(&self, _context: TaskExecutionContext) -> std::result::Result<TaskOutput, TaskFailure> {
            Ok(TaskOutput::new(json!({})))
        }
    }

    fn context_with(dependencies: Vec<DependencyOutput>) -> TaskExecutionContext {
        TaskExecutionContext {
            job_id: "job-1".to_string(),
            correlation_id: Uuid::new_v4(),
            task_id: TaskId::from("job-1:select-pairs"),
            kind: TaskKind::SelectPairs,
            parameters: TaskParameters::SelectPairs {
                brief: "launch".to_string(),
                max_pairs: 3,
            },
            attempt: 1,
            attempt_token: Uuid::new_v4(),
            unit_index: None,
            run_parameters: json!({}),
            dependencies,
            batch_results: None,
        }
    }

    #[test]
    fn test_registry_validates_member_kinds() {
        let mut builder = TaskGraphBuilder::new("job-1");
        let select = builder.add(
            TaskParameters::SelectPairs {
                brief: "b".to_string(),
                max_pairs: 2,
            },
            &[],
        );
        let combine = builder.add(
            TaskParameters::CombineClips {
                destination_key: "out.mp4".to_string(),
            },
            &[select.clone()],
        );
        builder
            .fan_out(&select, "subclips", vec![TaskKind::GenerateSubclip], &combine)
            .unwrap();
        let graph = builder.build(combine);

        let mut registry = HandlerRegistry::new();
        registry
            .register(Arc::new(Noop(TaskKind::SelectPairs)))
            .register(Arc::new(Noop(TaskKind::CombineClips)));
        let err = registry.validate_graph(&graph).unwrap_err();
        assert!(err.is_structural());
        assert!(err.to_string().contains("generate-subclip"));

        registry.register(Arc::new(Noop(TaskKind::GenerateSubclip)));
        assert!(registry.validate_graph(&graph).is_ok());
    }

    #[test]
    fn test_dependency_as_reports_missing_output_as_run_terminal() {
        let context = context_with(vec![]);
        let failure = context
            .dependency_as::<serde_json::Value>(TaskKind::CollectAssets)
            .unwrap_err();
        assert_eq!(failure.class, FailureClass::TerminalRun);

        let context = context_with(vec![DependencyOutput {
            task_id: TaskId::from("job-1:collect-assets"),
            kind: TaskKind::CollectAssets,
            payload: json!({"assets": ["a", "b"]}),
        }]);
        let payload: serde_json::Value = context.dependency_as(TaskKind::CollectAssets).unwrap();
        assert_eq!(payload["assets"][1], "b");
    }

    #[test]
    fn test_failure_to_task_error() {
        let failure = TaskFailure::timeout(Duration::from_secs(30));
        assert_eq!(failure.class, FailureClass::Retryable);
        let error = failure.to_task_error(2);
        assert_eq!(error.attempt, 2);
        assert_eq!(error.code, "timeout");
    }
}
