//! # Error Classifier
//!
//! Collaborator errors are classified at the task-body boundary, before they
//! reach the executor. The executor only ever sees the three-way
//! [`FailureClass`]: retryable, terminal for one unit, or terminal for the run.
//!
//! The same permanent error means different things depending on where it
//! happens: a rejected prompt inside a fan-out member chain costs one scene,
//! while a rejected brief in a single-instance stage ends the run.

use crate::collaborators::CollaboratorError;
use crate::models::{FailureClass, TaskId, TaskKind};
use crate::orchestration::task_handler::TaskFailure;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Where an error happened
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub task_id: TaskId,
    pub kind: TaskKind,
    /// 1-based attempt number
    pub attempt_number: u32,
    /// Collaborator operation that failed, e.g. `generation.submit`
    pub operation: String,
    /// Whether the task belongs to a fan-out member chain
    pub in_fan_out: bool,
}

impl ErrorContext {
    pub fn new(task_id: TaskId, kind: TaskKind, attempt_number: u32, operation: impl Into<String>) -> Self {
        Self {
            task_id,
            kind,
            attempt_number,
            operation: operation.into(),
            in_fan_out: false,
        }
    }

    pub fn in_fan_out(mut self, in_fan_out: bool) -> Self {
        self.in_fan_out = in_fan_out;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    RateLimit,
    Transient,
    Network,
    /// Invalid input; retrying the same parameters cannot succeed
    Validation,
    /// Permanent rejection by the external service
    Rejection,
    NotFound,
}

impl ErrorCategory {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimit | Self::Transient | Self::Network
        )
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Timeout => "collaborator_timeout",
            Self::RateLimit => "rate_limited",
            Self::Transient => "transient_error",
            Self::Network => "network_error",
            Self::Validation => "invalid_input",
            Self::Rejection => "rejected",
            Self::NotFound => "not_found",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "Timeout"),
            Self::RateLimit => write!(f, "Rate Limit"),
            Self::Transient => write!(f, "Transient"),
            Self::Network => write!(f, "Network"),
            Self::Validation => write!(f, "Validation"),
            Self::Rejection => write!(f, "Rejection"),
            Self::NotFound => write!(f, "Not Found"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub class: FailureClass,
    /// Delay requested by the collaborator, if any
    pub retry_after: Option<Duration>,
    pub code: String,
    pub message: String,
}

impl ErrorClassification {
    pub fn is_retryable(&self) -> bool {
        self.class == FailureClass::Retryable
    }

    pub fn into_failure(self) -> TaskFailure {
        TaskFailure::new(self.class, self.code, self.message).with_retry_after(self.retry_after)
    }
}

/// Trait for error classification strategies
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &CollaboratorError, context: &ErrorContext) -> ErrorClassification;

    /// Classify straight into the failure a task body returns
    fn to_failure(&self, error: &CollaboratorError, context: &ErrorContext) -> TaskFailure {
        self.classify(error, context).into_failure()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardErrorClassifier;

impl StandardErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    fn category_of(error: &CollaboratorError) -> ErrorCategory {
        match error {
            CollaboratorError::Timeout(_) => ErrorCategory::Timeout,
            CollaboratorError::RateLimited { .. } => ErrorCategory::RateLimit,
            CollaboratorError::Transient(_) => ErrorCategory::Transient,
            CollaboratorError::Network(_) => ErrorCategory::Network,
            CollaboratorError::InvalidInput(_) => ErrorCategory::Validation,
            CollaboratorError::Rejected(_) => ErrorCategory::Rejection,
            CollaboratorError::NotFound(_) => ErrorCategory::NotFound,
        }
    }
}

impl ErrorClassifier for StandardErrorClassifier {
    fn classify(&self, error: &CollaboratorError, context: &ErrorContext) -> ErrorClassification {
        let category = Self::category_of(error);
        let class = if category.is_retryable() {
            FailureClass::Retryable
        } else if context.in_fan_out {
            FailureClass::TerminalUnit
        } else {
            FailureClass::TerminalRun
        };
        let retry_after = match error {
            CollaboratorError::RateLimited { retry_after } => *retry_after,
            _ => None,
        };

        ErrorClassification {
            category,
            class,
            retry_after,
            code: category.code().to_string(),
            message: format!(
                "{} failed during {} (attempt {}): {error}",
                context.task_id, context.operation, context.attempt_number
            ),
        }
    }
}
