//! Step graphs of device operations, their assembly and their execution.

mod action;
mod builder;
mod context;
mod executor;
mod graph;
mod step;

pub use action::StepAction;
pub use builder::StepBuilder;
pub use context::{Device, StepContext};
pub use executor::{WorkflowExecutor, WorkflowOutcome};
pub use graph::Workflow;
pub use step::{StepId, StepPolicy, StepState, WaitFor, WorkflowStep};
