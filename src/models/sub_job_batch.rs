//! # Sub-Job Batch
//!
//! Membership record for a materialized fan-out. Each member is a chain of
//! tasks (one per member kind); the join asks the batch whether every chain
//! has reached a terminal state instead of re-deriving membership per poll.

use super::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubJobBatch {
    pub job_id: String,
    pub name: String,
    pub generator_task_id: TaskId,
    pub join_task_id: TaskId,
    pub members: Vec<BatchMember>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMember {
    pub unit_index: usize,
    /// Chain tasks in execution order
    pub task_ids: Vec<TaskId>,
}

impl BatchMember {
    /// Last task of the chain; its output is the unit's result
    pub fn tail(&self) -> Option<&TaskId> {
        self.task_ids.last()
    }
}

impl SubJobBatch {
    pub fn member(&self, unit_index: usize) -> Option<&BatchMember> {
        self.members.iter().find(|m| m.unit_index == unit_index)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
