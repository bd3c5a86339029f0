use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-task execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting on dependencies
    #[default]
    Pending,
    /// All dependencies done, waiting for a dispatch slot
    Ready,
    /// Claimed by an attempt
    Running,
    /// Completed with an output
    Done,
    /// Last attempt failed; terminal unless a retry is scheduled
    Failed,
}

impl TaskStatus {
    /// Check if this task satisfies dependencies for other tasks
    pub fn satisfies_dependencies(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Check if this is an active status (an attempt is in flight)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// Overall run status, always derived from task statuses and the
/// cancellation flag, never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Root not started, nothing dispatched yet
    Pending,
    Running,
    /// Root task done
    Completed,
    /// A non-bypassable terminal failure was reached
    Failed,
    /// Cancellation requested and nothing left running
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}
