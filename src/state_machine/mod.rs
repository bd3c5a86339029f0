//! Task and run status modeling.
//!
//! Task statuses move through a pure transition table; run status is derived
//! and never stored.

pub mod errors;
pub mod events;
pub mod states;
pub mod task_state_machine;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::TaskEvent;
pub use states::{RunStatus, TaskStatus};
pub use task_state_machine::TaskStateMachine;
