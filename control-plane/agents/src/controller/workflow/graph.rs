use super::{StepId, WaitFor, WorkflowStep};
use crate::errors::SvcError;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use stor_port::types::v0::{store::workflow::WorkflowMarkers, transport::WorkflowId};

/// A step graph.
/// Steps may only wait for steps created before them, so the creation order is a
/// topological order of the graph.
#[derive(Debug)]
pub struct Workflow {
    id: WorkflowId,
    name: String,
    steps: Vec<WorkflowStep>,
    index: HashMap<StepId, usize>,
    /// Data learned by a step at execution time, for its successors.
    step_data: Mutex<HashMap<StepId, Value>>,
    warnings: Vec<String>,
}

impl Workflow {
    /// Create a new empty workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(WorkflowId::new(), name)
    }
    /// Create a new empty workflow with a known id, used to resume a workflow which was
    /// previously interrupted.
    pub fn with_id(id: WorkflowId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            steps: vec![],
            index: HashMap::new(),
            step_data: Mutex::new(HashMap::new()),
            warnings: vec![],
        }
    }

    /// The workflow id.
    pub fn id(&self) -> &WorkflowId {
        &self.id
    }
    /// The workflow name.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The steps, in creation order.
    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }
    /// Get the step by id.
    pub fn step(&self, id: &StepId) -> Option<&WorkflowStep> {
        self.index.get(id).map(|index| &self.steps[*index])
    }
    /// Steps of the given group label.
    pub fn group(&self, label: &str) -> Vec<&WorkflowStep> {
        self.steps.iter().filter(|s| s.group == label).collect()
    }
    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }
    /// Check if there are no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Add the step to the graph, returning the key successors use to wait for it.
    pub fn create_step(&mut self, mut step: WorkflowStep) -> WaitFor {
        step.depends_on = match &step.wait_for {
            None => vec![],
            Some(WaitFor::Step(id)) => match self.index.get(id) {
                Some(index) => vec![*index],
                None => {
                    tracing::warn!(step.id=%step.id, wait_for=%id, "Waiting for an unknown step");
                    vec![]
                }
            },
            Some(WaitFor::Group(label)) => self
                .steps
                .iter()
                .enumerate()
                .filter(|(_, s)| &s.group == label)
                .map(|(index, _)| index)
                .collect(),
        };
        tracing::trace!(
            workflow.id=%self.id,
            step.id=%step.id,
            step.group=%step.group,
            "{}",
            step.description
        );
        let id = step.id.clone();
        self.index.insert(id.clone(), self.steps.len());
        self.steps.push(step);
        WaitFor::Step(id)
    }

    /// Record a condition which did not prevent assembly but must be reported.
    pub fn add_warning(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!(workflow.id=%self.id, %warning, "Workflow assembly warning");
        self.warnings.push(warning);
    }
    /// Assembly warnings.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Store data learned by the step, returning its serialised form.
    pub fn set_step_data(&self, step: &StepId, data: impl Serialize) -> Result<Value, SvcError> {
        let value = serde_json::to_value(data).map_err(|error| SvcError::Internal {
            details: format!("Failed to serialise the data of step '{step}': {error}"),
        })?;
        self.step_data.lock().insert(step.clone(), value.clone());
        Ok(value)
    }
    /// Get the data stored by the step.
    pub fn step_data<T: DeserializeOwned>(&self, step: &StepId) -> Result<T, SvcError> {
        let value = self
            .step_data
            .lock()
            .get(step)
            .cloned()
            .ok_or_else(|| SvcError::Internal {
                details: format!("Step '{step}' has not recorded any data"),
            })?;
        serde_json::from_value(value).map_err(|error| SvcError::Internal {
            details: format!("Invalid data recorded by step '{step}': {error}"),
        })
    }

    /// Marker recorded once the step at `index` executed.
    pub(super) fn executed_marker(&self, index: usize) -> String {
        format!("{index}:{}", self.steps[index].group)
    }
    /// Marker recorded once the step at `index` was rolled back.
    pub(super) fn rollback_marker(&self, index: usize) -> String {
        format!("{index}:{}:rollback", self.steps[index].group)
    }
    /// Marker under which the data of the step at `index` is recorded.
    pub(super) fn data_marker(&self, index: usize) -> String {
        format!("{index}:{}:data", self.steps[index].group)
    }
    /// Position of the step in the graph.
    pub(super) fn step_index(&self, step: &StepId) -> Option<usize> {
        self.index.get(step).copied()
    }
    /// Reload the data recorded by the steps of a previous execution of the workflow.
    pub(super) fn restore_step_data(&self, markers: &WorkflowMarkers) {
        let mut data = self.step_data.lock();
        for (index, step) in self.steps.iter().enumerate() {
            if let Some(value) = markers.data(&self.data_marker(index)) {
                data.entry(step.id.clone()).or_insert_with(|| value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::workflow::StepAction;
    use stor_port::types::v0::transport::StorageSystemId;

    fn step(group: &str, wait_for: Option<WaitFor>) -> WorkflowStep {
        WorkflowStep::new(group, group, &StorageSystemId::from("sys-1"), StepAction::Null)
            .wait_for(wait_for)
    }

    #[test]
    fn wait_for_resolution() {
        let mut workflow = Workflow::new("test");
        let first = workflow.create_step(step("create", None));
        workflow.create_step(step("create", None));
        let add = workflow.create_step(step("add", Some(WaitFor::group("create"))));
        workflow.create_step(step("propagate", Some(add)));
        workflow.create_step(step("after", Some(first)));
        workflow.create_step(step("none", Some(WaitFor::group("missing"))));

        let deps = workflow
            .steps()
            .iter()
            .map(|s| s.depends_on().to_vec())
            .collect::<Vec<_>>();
        assert_eq!(deps, vec![vec![], vec![], vec![0, 1], vec![2], vec![0], vec![]]);
        assert_eq!(workflow.group("create").len(), 2);
        assert_eq!(workflow.executed_marker(2), "2:add");
        assert_eq!(workflow.rollback_marker(2), "2:add:rollback");
    }

    #[test]
    fn step_data() {
        let workflow = Workflow::new("test");
        let id = StepId::new();
        assert!(workflow.step_data::<String>(&id).is_err());
        workflow.set_step_data(&id, "session-1").unwrap();
        assert_eq!(workflow.step_data::<String>(&id).unwrap(), "session-1");
    }

    #[test]
    fn recorded_step_data() {
        let mut workflow = Workflow::with_id(WorkflowId::new(), "test");
        workflow.create_step(step("create", None));
        let link = workflow.create_step(step("link", None));
        let WaitFor::Step(link) = link else {
            panic!("a step key is expected");
        };
        assert_eq!(workflow.data_marker(1), "1:link:data");

        let mut markers = WorkflowMarkers::new(workflow.id());
        markers
            .data
            .insert(workflow.data_marker(1), Value::from("session-1"));
        workflow.restore_step_data(&markers);
        assert_eq!(workflow.step_data::<String>(&link).unwrap(), "session-1");
        assert_eq!(workflow.step_index(&link), Some(1));
    }
}
