use crate::models::{TaskError, TaskOutput};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events that can trigger task status transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Every dependency is done
    MarkReady,
    /// Start a new attempt; only the holder of `attempt_token` may finish it
    Claim { attempt_token: Uuid },
    /// Record the attempt's output
    Complete { output: TaskOutput },
    /// Record a failed attempt, with a retry time when budget remains
    Fail {
        error: TaskError,
        retry_at: Option<DateTime<Utc>>,
    },
    /// A preceding task in the same fan-out member chain failed terminally
    SkipUpstreamFailed { error: TaskError },
    /// A scheduled retry came due
    RetryScheduled,
    /// Operator-requested retry of a terminally failed task
    Reset,
    /// Return an attempt orphaned by a crashed process to the ready queue
    Recover,
}

impl TaskEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MarkReady => "mark_ready",
            Self::Claim { .. } => "claim",
            Self::Complete { .. } => "complete",
            Self::Fail { .. } => "fail",
            Self::SkipUpstreamFailed { .. } => "skip_upstream_failed",
            Self::RetryScheduled => "retry_scheduled",
            Self::Reset => "reset",
            Self::Recover => "recover",
        }
    }

    /// Extract the error if this is a failure event
    pub fn error(&self) -> Option<&TaskError> {
        match self {
            Self::Fail { error, .. } | Self::SkipUpstreamFailed { error } => Some(error),
            _ => None,
        }
    }
}
