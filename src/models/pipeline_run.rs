//! # Pipeline Run
//!
//! The run-level record for one job. Overall status is never stored here; it
//! is always derived from the run's tasks (see `orchestration::task_finalizer`).

use super::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub job_id: String,
    pub root_task_id: TaskId,
    /// Request parameters the task graph was built from
    pub parameters: Value,
    pub correlation_id: Uuid,
    pub cancellation_requested: bool,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(job_id: impl Into<String>, root_task_id: TaskId, parameters: Value) -> Self {
        Self {
            job_id: job_id.into(),
            root_task_id,
            parameters,
            correlation_id: Uuid::new_v4(),
            cancellation_requested: false,
            created_at: Utc::now(),
            archived_at: None,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}
