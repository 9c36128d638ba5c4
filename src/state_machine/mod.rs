//! Task and workflow step state machines.
//!
//! Each machine is a transition table (`determine_target_state`), a set of
//! pure guards evaluated over snapshots, a compare-and-set through the
//! [`TaskStore`](crate::database::TaskStore), and post-transition actions
//! (lifecycle events and logging).

pub mod actions;
pub mod errors;
pub mod events;
pub mod guards;
pub mod states;
pub mod step_state_machine;
pub mod task_state_machine;

pub use actions::{StateAction, TransitionContext};
pub use errors::{ActionError, GuardError, PersistenceError, StateMachineError, StateMachineResult};
pub use events::{StepEvent, TaskEvent};
pub use guards::StateGuard;
pub use states::{TaskState, WorkflowStepState};
pub use step_state_machine::StepStateMachine;
pub use task_state_machine::TaskStateMachine;
