//! # Data Model
//!
//! Tasks, runs, fan-out batches and the transition log, plus the
//! [`TaskGraph`] builder used to express a job as a dependency graph.

pub mod pipeline_run;
pub mod sub_job_batch;
pub mod task;
pub mod task_graph;
pub mod task_kind;
pub mod task_transition;

pub use pipeline_run::PipelineRun;
pub use sub_job_batch::{BatchMember, SubJobBatch};
pub use task::{
    BatchMembership, FailureClass, FanOutMember, FanOutSpec, FanOutTemplate, Task, TaskError,
    TaskId, TaskOutput, TaskParameters,
};
pub use task_graph::{TaskGraph, TaskGraphBuilder};
pub use task_kind::{ResourceClass, TaskKind, TimeoutProfile};
pub use task_transition::TaskTransition;
