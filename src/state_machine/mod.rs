mod state;
mod task;

pub use state::{Stage, StateMachine, Transition};
pub use task::{Task, TaskId, TaskOutcome, TaskRecord};
