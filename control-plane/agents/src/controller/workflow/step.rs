use super::StepAction;
use serde::{Deserialize, Serialize};
use stor_port::types::v0::transport::StorageSystemId;
use strum_macros::Display;

stor_port::impl_string_uuid!(StepId, "UUID of a workflow step");

/// The predecessor key of a step.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub enum WaitFor {
    /// A single step.
    Step(StepId),
    /// Every step created so far with the given group label.
    Group(String),
}

impl WaitFor {
    /// Wait for all steps of the group.
    pub fn group(label: impl Into<String>) -> Self {
        Self::Group(label.into())
    }
}

/// What a step failure means for the rest of the workflow.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub enum StepPolicy {
    /// The workflow stops and rolls back.
    Abort,
    /// Only the labelled group of steps is abandoned and rolled back; the workflow
    /// completes with a warning.
    Tolerate(String),
}

/// Execution state of a step.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Display)]
pub enum StepState {
    Pending,
    Executing,
    Succeeded,
    Failed,
    /// Never executed because a step it depends on failed.
    Skipped,
    /// Succeeded and later compensated.
    Compensated,
    /// Succeeded, but its compensation failed.
    CompensationFailed,
}

/// A node of the step graph.
#[derive(Debug, Clone)]
pub struct WorkflowStep {
    pub(super) id: StepId,
    pub(super) group: String,
    pub(super) description: String,
    pub(super) system: StorageSystemId,
    pub(super) wait_for: Option<WaitFor>,
    /// Indexes of the predecessors, resolved when the step is added to the workflow.
    pub(super) depends_on: Vec<usize>,
    pub(super) execute: StepAction,
    pub(super) compensate: Option<StepAction>,
    pub(super) locks: Vec<String>,
    pub(super) policy: StepPolicy,
}

impl WorkflowStep {
    /// Create a new step of the `group` which runs `execute` against the storage `system`.
    pub fn new(
        group: impl Into<String>,
        description: impl Into<String>,
        system: &StorageSystemId,
        execute: StepAction,
    ) -> Self {
        Self {
            id: StepId::new(),
            group: group.into(),
            description: description.into(),
            system: system.clone(),
            wait_for: None,
            depends_on: vec![],
            execute,
            compensate: None,
            locks: vec![],
            policy: StepPolicy::Abort,
        }
    }
    /// Run only once the predecessors have succeeded.
    #[must_use]
    pub fn wait_for(mut self, wait_for: Option<WaitFor>) -> Self {
        self.wait_for = wait_for;
        self
    }
    /// Undo the step with `action` when the workflow rolls back.
    #[must_use]
    pub fn rollback(mut self, action: StepAction) -> Self {
        self.compensate = Some(action);
        self
    }
    /// Hold the given scope locks while executing.
    #[must_use]
    pub fn locks(mut self, locks: Vec<String>) -> Self {
        self.locks = locks;
        self
    }
    /// A failure only abandons the steps of the labelled group.
    #[must_use]
    pub fn tolerate(mut self, label: impl Into<String>) -> Self {
        self.policy = StepPolicy::Tolerate(label.into());
        self
    }

    /// The step id.
    pub fn id(&self) -> &StepId {
        &self.id
    }
    /// The group label.
    pub fn group(&self) -> &str {
        &self.group
    }
    /// The human description.
    pub fn description(&self) -> &str {
        &self.description
    }
    /// The target storage system.
    pub fn system(&self) -> &StorageSystemId {
        &self.system
    }
    /// The execute action.
    pub fn action(&self) -> &StepAction {
        &self.execute
    }
    /// The compensating action.
    pub fn compensation(&self) -> Option<&StepAction> {
        self.compensate.as_ref()
    }
    /// The scope locks.
    pub fn lock_keys(&self) -> &[String] {
        &self.locks
    }
    /// The failure policy.
    pub fn policy(&self) -> &StepPolicy {
        &self.policy
    }
    /// Indexes of the predecessor steps.
    pub fn depends_on(&self) -> &[usize] {
        &self.depends_on
    }
    /// Check if the step has something to run on rollback.
    pub fn is_compensable(&self) -> bool {
        self.compensate
            .as_ref()
            .map(|action| !action.is_null())
            .unwrap_or(false)
    }
}
