//! # Orchestration Core
//!
//! Resolution, scheduling, fan-out/fan-in, retry and run-level reporting for
//! pipeline runs.
//!
//! ## Components
//!
//! - [`dependency_resolver`]: closure and topological order of a static graph
//! - [`executor`]: the per-run driver loop (settle, dispatch, wait)
//! - [`viable_task_discovery`]: PENDING → READY promotion and retry release
//! - [`fan_out`]: batch materialization and member-chain failure propagation
//! - [`retry_policy`]: pure retry/backoff decision
//! - [`error_classifier`]: collaborator errors → failure classes
//! - [`resource_limits`]: global and per-resource-class dispatch gates
//! - [`task_finalizer`]: derived run status, progress and outcome
//! - [`job_facade`]: create/status/cancel/resume/action entry point
//!
//! Every decision is computed from a [`run_snapshot::RunSnapshot`] loaded
//! from the state store; the executor keeps no state that a restarted
//! process could not re-derive.

pub mod dependency_resolver;
pub mod error_classifier;
pub mod executor;
pub mod fan_out;
pub mod job_facade;
pub mod resource_limits;
pub mod retry_policy;
pub mod run_snapshot;
pub mod task_finalizer;
pub mod task_handler;
pub mod viable_task_discovery;

pub use dependency_resolver::{DependencyResolver, ExecutionPlan, ResolutionError};
pub use error_classifier::{
    ErrorCategory, ErrorClassification, ErrorClassifier, ErrorContext, StandardErrorClassifier,
};
pub use executor::{DriverControl, TaskExecutor};
pub use fan_out::FanOutCoordinator;
pub use job_facade::{GraphBuilder, Orchestrator, OrchestratorBuilder};
pub use resource_limits::{DispatchPermit, ResourceGates};
pub use retry_policy::{RetryDecision, RetryPolicy};
pub use run_snapshot::{MemberOutcome, RunSnapshot};
pub use task_finalizer::{derive_status, JobStatusReport, RunOutcome, StageProgress, TaskFinalizer};
pub use task_handler::{
    BatchResults, DependencyOutput, HandlerRegistry, TaskExecutionContext, TaskFailure,
    TaskHandler, UnitFailure, UnitSuccess,
};
pub use viable_task_discovery::{TaskReadinessSummary, ViableTaskDiscovery};
