//! # Task State Machine
//!
//! Pure transition table for task statuses. Both state store backends apply
//! events through [`TaskStateMachine::apply`] inside their compare-and-set,
//! so the in-memory and durable stores cannot diverge on what a transition
//! means.
//!
//! ```text
//!  Pending ──MarkReady──▶ Ready ──Claim──▶ Running ──Complete──▶ Done
//!     │  ▲                 ▲  ▲              │
//!     │  └────Reset────┐   │  └───Recover────┤
//!     │                │   │                 │ Fail
//!     └─SkipUpstream──▶ Failed ◀─────────────┘
//!                          └──RetryScheduled──▶ Ready
//! ```

use super::errors::{StateMachineError, StateMachineResult};
use super::events::TaskEvent;
use super::states::TaskStatus;
use crate::models::Task;
use chrono::Utc;

#[derive(Debug, Clone, Copy, Default)]
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Determine the target status for `event` from `current`
    pub fn determine_target_state(
        current: TaskStatus,
        event: &TaskEvent,
    ) -> StateMachineResult<TaskStatus> {
        let target = match (current, event) {
            (TaskStatus::Pending, TaskEvent::MarkReady) => TaskStatus::Ready,
            (TaskStatus::Ready, TaskEvent::Claim { .. }) => TaskStatus::Running,
            (TaskStatus::Running, TaskEvent::Complete { .. }) => TaskStatus::Done,
            (TaskStatus::Running, TaskEvent::Fail { .. }) => TaskStatus::Failed,
            (TaskStatus::Pending, TaskEvent::SkipUpstreamFailed { .. }) => TaskStatus::Failed,
            (TaskStatus::Failed, TaskEvent::RetryScheduled) => TaskStatus::Ready,
            (TaskStatus::Failed, TaskEvent::Reset) => TaskStatus::Pending,
            (TaskStatus::Running, TaskEvent::Recover) => TaskStatus::Ready,
            (from, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from,
                    event: event.event_type().to_string(),
                })
            }
        };
        Ok(target)
    }

    /// Apply `event` to `task`, returning the status it moved out of
    pub fn apply(task: &mut Task, event: &TaskEvent) -> StateMachineResult<TaskStatus> {
        let from = task.status;
        let target = Self::determine_target_state(from, event)?;
        Self::check_guards(task, event)?;

        match event {
            TaskEvent::MarkReady => {}
            TaskEvent::Claim { attempt_token } => {
                task.attempt_count += 1;
                task.current_attempt = Some(*attempt_token);
                task.output = None;
                task.next_retry_at = None;
            }
            TaskEvent::Complete { output } => {
                task.output = Some(output.clone());
                task.current_attempt = None;
                task.next_retry_at = None;
            }
            TaskEvent::Fail { error, retry_at } => {
                task.last_error = Some(error.clone());
                task.next_retry_at = *retry_at;
                task.current_attempt = None;
                task.output = None;
            }
            TaskEvent::SkipUpstreamFailed { error } => {
                task.last_error = Some(error.clone());
                task.next_retry_at = None;
            }
            TaskEvent::RetryScheduled => {
                task.next_retry_at = None;
            }
            TaskEvent::Reset => {
                task.attempt_offset = task.attempt_count;
                task.last_error = None;
                task.next_retry_at = None;
                task.output = None;
            }
            TaskEvent::Recover => {
                task.current_attempt = None;
            }
        }

        task.status = target;
        task.updated_at = Utc::now();
        Ok(from)
    }

    fn check_guards(task: &Task, event: &TaskEvent) -> StateMachineResult<()> {
        match event {
            TaskEvent::RetryScheduled if task.next_retry_at.is_none() => {
                Err(StateMachineError::GuardFailed {
                    reason: format!("task {} has no retry scheduled", task.id),
                })
            }
            TaskEvent::Reset if task.next_retry_at.is_some() => Err(StateMachineError::GuardFailed {
                reason: format!("task {} already has a retry scheduled", task.id),
            }),
            _ => Ok(()),
        }
    }
}
