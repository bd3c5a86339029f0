//! # System Constants
//!
//! Lifecycle event names published on the [`EventPublisher`](crate::events::EventPublisher),
//! action names accepted by the job facade and well-known batch names.

/// Lifecycle events published by the scheduler and job facade
pub mod events {
    // Task lifecycle events
    pub const TASK_READY: &str = "task.ready";
    pub const TASK_CLAIMED: &str = "task.claimed";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_RETRY_SCHEDULED: &str = "task.retry_scheduled";
    pub const TASK_RECOVERED: &str = "task.recovered";
    pub const TASK_SKIPPED: &str = "task.skipped";
    pub const TASK_RESET: &str = "task.reset";

    // Fan-out events
    pub const BATCH_MATERIALIZED: &str = "batch.materialized";

    // Run lifecycle events
    pub const RUN_CREATED: &str = "run.created";
    pub const RUN_RESUMED: &str = "run.resumed";
    pub const RUN_CANCEL_REQUESTED: &str = "run.cancel_requested";
    pub const RUN_FINISHED: &str = "run.finished";
    pub const RUN_ARCHIVED: &str = "run.archived";
}

/// Stage-specific operations accepted by `Orchestrator::action`
pub mod actions {
    /// Explicitly retry one terminally failed fan-out unit
    pub const REGENERATE_UNIT: &str = "regenerate_unit";
    /// Explicitly retry one terminally failed stage task
    pub const RETRY_TASK: &str = "retry_task";
}

/// Batch produced by select-pairs in the marketing-video pipeline
pub const SUBCLIP_BATCH: &str = "subclips";

/// Error code recorded on chain tasks skipped because an upstream member failed
pub const UPSTREAM_FAILED_CODE: &str = "upstream_failed";

/// Error code recorded on a join whose batch produced no successful unit
pub const NO_SUCCESSFUL_UNITS_CODE: &str = "no_successful_units";
