//! Error types for the reelforge orchestration core.
//!
//! Each layer owns a narrow error enum (store, state machine, resolver,
//! configuration); everything converges on [`ReelforgeError`] at the facade.

use crate::config::ConfigurationError;
use crate::orchestration::dependency_resolver::ResolutionError;
use crate::state_machine::StateMachineError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReelforgeError {
    /// Graph cycles, unknown dependencies or task kinds without a handler.
    /// Raised before anything is persisted and never retried.
    #[error("Structural error: {0}")]
    Structural(String),
    #[error("State store error: {0}")]
    Store(#[from] StoreError),
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Pipeline run not found: {0}")]
    RunNotFound(String),
    #[error("Invalid action '{action}' for run {job_id}: {reason}")]
    InvalidAction {
        job_id: String,
        action: String,
        reason: String,
    },
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("Orchestration error: {0}")]
    Orchestration(String),
}

impl From<ResolutionError> for ReelforgeError {
    fn from(error: ResolutionError) -> Self {
        ReelforgeError::Structural(error.to_string())
    }
}

impl From<StateMachineError> for ReelforgeError {
    fn from(error: StateMachineError) -> Self {
        ReelforgeError::Store(StoreError::InvalidTransition(error))
    }
}

impl From<serde_json::Error> for ReelforgeError {
    fn from(error: serde_json::Error) -> Self {
        ReelforgeError::InvalidParameters(format!("JSON serialization error: {error}"))
    }
}

impl ReelforgeError {
    pub fn invalid_action(
        job_id: impl Into<String>,
        action: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidAction {
            job_id: job_id.into(),
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Structural errors fail a run at creation and are never retried
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Structural(_))
    }
}

pub type Result<T> = std::result::Result<T, ReelforgeError>;
