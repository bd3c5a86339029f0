//! # Task
//!
//! A `Task` is the smallest unit of orchestrated work: a stage kind, typed
//! parameters fixed at creation, an immutable dependency set and the mutable
//! execution record (status, output, attempts, last error) that the state
//! store guards with compare-and-set transitions.

use super::task_kind::TaskKind;
use crate::state_machine::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Stable task identity: `{job_id}:{kind}` or `{job_id}:{kind}:{discriminator}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(job_id: &str, kind: TaskKind, discriminator: Option<&str>) -> Self {
        match discriminator {
            Some(disc) => Self(format!("{job_id}:{kind}:{disc}")),
            None => Self(format!("{job_id}:{kind}")),
        }
    }

    /// Identity of the member-chain task for fan-out unit `index`
    pub fn for_unit(job_id: &str, kind: TaskKind, index: usize) -> Self {
        Self::new(job_id, kind, Some(&index.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Typed, immutable parameters for each stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TaskParameters {
    CollectAssets {
        asset_urls: Vec<String>,
    },
    SelectPairs {
        brief: String,
        max_pairs: usize,
    },
    GenerateSubclip {
        unit_index: usize,
        prompt: String,
        first_asset: String,
        second_asset: String,
        duration_seconds: f32,
    },
    DownloadResult {
        unit_index: usize,
        destination_key: String,
    },
    GenerateAudio {
        voice: Option<String>,
    },
    CombineClips {
        destination_key: String,
    },
    MergeAudio {
        destination_key: String,
    },
    StoreFinal {
        destination_key: String,
    },
}

impl TaskParameters {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::CollectAssets { .. } => TaskKind::CollectAssets,
            Self::SelectPairs { .. } => TaskKind::SelectPairs,
            Self::GenerateSubclip { .. } => TaskKind::GenerateSubclip,
            Self::DownloadResult { .. } => TaskKind::DownloadResult,
            Self::GenerateAudio { .. } => TaskKind::GenerateAudio,
            Self::CombineClips { .. } => TaskKind::CombineClips,
            Self::MergeAudio { .. } => TaskKind::MergeAudio,
            Self::StoreFinal { .. } => TaskKind::StoreFinal,
        }
    }
}

/// Result payload of a successful attempt.
///
/// A generator task additionally returns the specification of the batch it
/// fans out into; children are materialized from it after the generator is
/// marked done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_out: Option<FanOutSpec>,
}

impl TaskOutput {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            fan_out: None,
        }
    }

    pub fn with_fan_out(payload: Value, spec: FanOutSpec) -> Self {
        Self {
            payload,
            fan_out: Some(spec),
        }
    }
}

/// Runtime cardinality and per-member parameters of a fan-out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutSpec {
    pub members: Vec<FanOutMember>,
}

/// Parameters for one member chain, one entry per chain task in template order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutMember {
    pub parameters: Vec<TaskParameters>,
}

/// Declared on a generator task at creation: which batch it produces, the
/// kinds of each member chain and which task joins the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutTemplate {
    pub batch_name: String,
    pub member_kinds: Vec<TaskKind>,
    pub join_task_id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMembership {
    pub batch_name: String,
    pub unit_index: usize,
}

/// Three-way classification the executor acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Timeout, transient service error or rate limit
    Retryable,
    /// Permanent failure confined to one task or sub-unit
    TerminalUnit,
    /// Permanent failure that aborts the whole run
    TerminalRun,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => write!(f, "retryable"),
            Self::TerminalUnit => write!(f, "terminal_unit"),
            Self::TerminalRun => write!(f, "terminal_run"),
        }
    }
}

/// Error recorded on the task by a failed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub class: FailureClass,
    pub code: String,
    pub message: String,
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: String,
    pub kind: TaskKind,
    pub parameters: TaskParameters,
    pub dependencies: BTreeSet<TaskId>,
    pub priority: i32,
    /// Creation order within the run, assigned by the state store on insert
    pub seq: u64,
    pub status: TaskStatus,
    pub output: Option<TaskOutput>,
    pub attempt_count: u32,
    /// `attempt_count` at the last explicit retry; the retry budget applies
    /// to attempts made after it
    pub attempt_offset: u32,
    /// Token of the attempt currently allowed to write a result
    pub current_attempt: Option<Uuid>,
    pub last_error: Option<TaskError>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub fan_out: Option<FanOutTemplate>,
    pub join_batch: Option<String>,
    pub batch: Option<BatchMembership>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        job_id: &str,
        parameters: TaskParameters,
        discriminator: Option<&str>,
        dependencies: impl IntoIterator<Item = TaskId>,
    ) -> Self {
        let kind = parameters.kind();
        let now = Utc::now();
        Self {
            id: TaskId::new(job_id, kind, discriminator),
            job_id: job_id.to_string(),
            kind,
            parameters,
            dependencies: dependencies.into_iter().collect(),
            priority: kind.default_priority(),
            seq: 0,
            status: TaskStatus::Pending,
            output: None,
            attempt_count: 0,
            attempt_offset: 0,
            current_attempt: None,
            last_error: None,
            next_retry_at: None,
            fan_out: None,
            join_batch: None,
            batch: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_fan_out(mut self, template: FanOutTemplate) -> Self {
        self.fan_out = Some(template);
        self
    }

    pub fn joining(mut self, batch_name: impl Into<String>) -> Self {
        self.join_batch = Some(batch_name.into());
        self
    }

    pub fn in_batch(mut self, batch_name: impl Into<String>, unit_index: usize) -> Self {
        self.batch = Some(BatchMembership {
            batch_name: batch_name.into(),
            unit_index,
        });
        self
    }

    /// Attempts made since creation or the last explicit retry
    pub fn attempts_in_generation(&self) -> u32 {
        self.attempt_count.saturating_sub(self.attempt_offset)
    }

    /// Failed with no retry scheduled
    pub fn is_terminally_failed(&self) -> bool {
        self.status == TaskStatus::Failed && self.next_retry_at.is_none()
    }

    /// Done, or failed with no retry scheduled
    pub fn is_terminal(&self) -> bool {
        self.status == TaskStatus::Done || self.is_terminally_failed()
    }

    pub fn is_retry_pending(&self) -> bool {
        self.status == TaskStatus::Failed && self.next_retry_at.is_some()
    }

    /// A terminal failure that aborts the run: any failure outside a fan-out
    /// member chain, or one explicitly classified as run-terminal.
    pub fn is_run_terminal_failure(&self) -> bool {
        self.is_terminally_failed()
            && (self.batch.is_none()
                || self
                    .last_error
                    .as_ref()
                    .is_some_and(|error| error.class == FailureClass::TerminalRun))
    }

    /// Scheduling key: higher priority first, then creation order
    pub fn scheduling_key(&self) -> (std::cmp::Reverse<i32>, u64) {
        (std::cmp::Reverse(self.priority), self.seq)
    }
}
