//! Append-only audit record of every applied compare-and-set transition.

use super::task::TaskId;
use crate::state_machine::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTransition {
    /// Store-wide monotonic sequence; orders transitions across tasks
    pub sequence: u64,
    pub job_id: String,
    pub task_id: TaskId,
    pub from_status: TaskStatus,
    pub to_status: TaskStatus,
    pub event: String,
    pub attempt: u32,
    pub attempt_token: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
