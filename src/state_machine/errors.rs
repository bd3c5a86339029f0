use super::states::TaskStatus;
use thiserror::Error;

/// Errors raised by the task state machine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("Invalid transition from {from} on event {event}")]
    InvalidTransition { from: TaskStatus, event: String },

    #[error("Guard condition failed: {reason}")]
    GuardFailed { reason: String },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
