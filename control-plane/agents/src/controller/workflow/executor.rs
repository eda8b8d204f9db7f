use super::{StepAction, StepContext, StepId, StepPolicy, StepState, Workflow, WorkflowStep};
use crate::{
    config::OrchestratorConfig,
    controller::{
        completer::{CompletionState, TaskCompleter},
        driver::DriverRegistry,
        lock::LockManager,
    },
    errors::SvcError,
};
use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};
use stor_port::{
    transport_api::ErrorChain,
    types::v0::{
        store::{workflow::WorkflowMarkers, Repository},
        transport::{OperationId, StorageSystemId, WorkflowId},
    },
};
use tokio::sync::Semaphore;
use tracing::Instrument;

/// The outcome of a workflow execution.
#[derive(Debug)]
pub struct WorkflowOutcome {
    /// The workflow id.
    pub workflow: WorkflowId,
    /// The operation whose status was recorded on the target entities.
    pub operation: OperationId,
    /// Terminal state of the operation.
    pub state: CompletionState,
    /// Final state of every step, in creation order.
    pub steps: Vec<(StepId, StepState)>,
    /// The cause of the failure, if any.
    pub error: Option<SvcError>,
    /// Partial failures which did not fail the workflow.
    pub warnings: Vec<String>,
}

impl WorkflowOutcome {
    /// Get the final state of the step.
    pub fn step_state(&self, id: &StepId) -> Option<StepState> {
        self.steps
            .iter()
            .find(|(step, _)| step == id)
            .map(|(_, state)| *state)
    }
    /// Check if the workflow succeeded, possibly with warnings.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
    /// Convert into the failure cause, if any.
    pub fn into_result(self) -> Result<Self, SvcError> {
        match self.error {
            None => Ok(self),
            Some(error) => Err(error),
        }
    }
}

enum Readiness {
    Blocked,
    Ready,
    Skip,
}

/// Runs step graphs: independent steps run concurrently, bounded per storage system, and
/// on failure the succeeded steps are compensated in reverse creation order.
#[derive(Debug, Clone)]
pub struct WorkflowExecutor {
    repository: Arc<dyn Repository>,
    drivers: DriverRegistry,
    locks: LockManager,
    config: OrchestratorConfig,
    limiters: Arc<Mutex<HashMap<StorageSystemId, Arc<Semaphore>>>>,
}

impl WorkflowExecutor {
    /// Create a new `Self`.
    pub fn new(
        config: OrchestratorConfig,
        repository: Arc<dyn Repository>,
        drivers: DriverRegistry,
        locks: LockManager,
    ) -> Self {
        Self {
            repository,
            drivers,
            locks,
            config,
            limiters: Default::default(),
        }
    }

    /// The lock manager shared by every workflow of this executor.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    fn limiter(&self, system: &StorageSystemId) -> Arc<Semaphore> {
        self.limiters
            .lock()
            .entry(system.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.system_concurrency())))
            .clone()
    }

    /// Execute the workflow, reporting its outcome through the completer.
    pub async fn execute(&self, workflow: &Workflow, completer: &TaskCompleter) -> WorkflowOutcome {
        let span = tracing::info_span!(
            "workflow",
            workflow.id = %workflow.id(),
            workflow.name = %workflow.name()
        );
        self.execute_steps(workflow, completer).instrument(span).await
    }

    async fn execute_steps(&self, workflow: &Workflow, completer: &TaskCompleter) -> WorkflowOutcome {
        let steps = workflow.steps();
        let mut states = vec![StepState::Pending; steps.len()];

        if let Err(error) = completer.executing().await {
            return self.finish(workflow, completer, states, Some(error)).await;
        }
        for warning in workflow.warnings() {
            completer.add_warning(warning.clone());
        }
        let markers = match self.repository.workflow_markers(workflow.id()).await {
            Ok(markers) => markers,
            Err(error) => {
                return self
                    .finish(workflow, completer, states, Some(error.into()))
                    .await
            }
        };
        workflow.restore_step_data(&markers);
        for (index, step) in steps.iter().enumerate() {
            if markers.contains(&workflow.executed_marker(index)) {
                tracing::info!(step.id=%step.id, step.group=%step.group, "Step already executed");
                states[index] = StepState::Succeeded;
                completer.step_succeeded(&step.id);
            }
        }
        tracing::info!(steps = steps.len(), "Executing workflow");

        let mut failure = None;
        let mut failed_groups = BTreeSet::new();
        let mut running = FuturesUnordered::<BoxFuture<'_, (usize, Result<(), SvcError>)>>::new();
        loop {
            if failure.is_none() {
                for index in 0 .. steps.len() {
                    if states[index] != StepState::Pending {
                        continue;
                    }
                    match Self::readiness(steps, &states, &failed_groups, index) {
                        Readiness::Blocked => {}
                        Readiness::Skip => {
                            tracing::warn!(step.id=%steps[index].id, step.group=%steps[index].group, "Skipping step");
                            states[index] = StepState::Skipped;
                        }
                        Readiness::Ready => {
                            states[index] = StepState::Executing;
                            completer.step_executing(&steps[index].id);
                            let step = &steps[index];
                            running.push(
                                self.run_action(workflow, step, &step.execute, completer, false)
                                    .map(move |result| (index, result))
                                    .boxed(),
                            );
                        }
                    }
                }
            }

            let Some((index, result)) = running.next().await else {
                break;
            };
            let step = &steps[index];
            match result {
                Ok(()) => {
                    states[index] = StepState::Succeeded;
                    self.add_marker(workflow, workflow.executed_marker(index))
                        .await;
                    completer.step_succeeded(&step.id);
                }
                Err(error) => {
                    states[index] = StepState::Failed;
                    completer.step_failed(&step.id, &error);
                    match &step.policy {
                        StepPolicy::Tolerate(group) => {
                            let warning = SvcError::PartialGroupFailure {
                                group: group.clone(),
                                details: error.full_string(),
                            };
                            completer.add_warning(warning.to_string());
                            failed_groups.insert(group.clone());
                        }
                        StepPolicy::Abort if failure.is_none() => failure = Some(error),
                        StepPolicy::Abort => {}
                    }
                }
            }
        }

        match failure {
            Some(cause) => {
                completer.set_rolling_back(true);
                let all = (0 .. steps.len()).rev().collect::<Vec<_>>();
                self.rollback(workflow, completer, &markers, &mut states, &all)
                    .await;
                completer.set_rolling_back(false);
                self.finish(workflow, completer, states, Some(cause)).await
            }
            None => {
                for group in &failed_groups {
                    tracing::warn!(group, "Rolling back the abandoned group");
                    let members = (0 .. steps.len())
                        .rev()
                        .filter(|index| {
                            matches!(&steps[*index].policy, StepPolicy::Tolerate(g) if g == group)
                        })
                        .collect::<Vec<_>>();
                    self.rollback(workflow, completer, &markers, &mut states, &members)
                        .await;
                }
                self.finish(workflow, completer, states, None).await
            }
        }
    }

    /// A step is ready once all of its predecessors succeeded. A failed predecessor of a
    /// tolerated group only holds back the steps of that same group.
    fn readiness(
        steps: &[WorkflowStep],
        states: &[StepState],
        failed_groups: &BTreeSet<String>,
        index: usize,
    ) -> Readiness {
        let step = &steps[index];
        if let StepPolicy::Tolerate(group) = &step.policy {
            if failed_groups.contains(group) {
                return Readiness::Skip;
            }
        }
        for dependency in &step.depends_on {
            match states[*dependency] {
                StepState::Succeeded => {}
                StepState::Pending | StepState::Executing => return Readiness::Blocked,
                _ => match (&steps[*dependency].policy, &step.policy) {
                    (StepPolicy::Tolerate(failed), StepPolicy::Tolerate(group)) if failed == group => {
                        return Readiness::Skip
                    }
                    (StepPolicy::Tolerate(_), _) => {}
                    (StepPolicy::Abort, _) => return Readiness::Skip,
                },
            }
        }
        Readiness::Ready
    }

    /// Compensate the succeeded steps among `indexes`, in the given order.
    /// Every compensation is attempted once, regardless of the others.
    async fn rollback(
        &self,
        workflow: &Workflow,
        completer: &TaskCompleter,
        markers: &WorkflowMarkers,
        states: &mut [StepState],
        indexes: &[usize],
    ) {
        for index in indexes.iter().copied() {
            if states[index] != StepState::Succeeded {
                continue;
            }
            let step = &workflow.steps()[index];
            let Some(action) = step.compensate.as_ref().filter(|a| !a.is_null()) else {
                continue;
            };
            let marker = workflow.rollback_marker(index);
            if markers.contains(&marker) {
                tracing::info!(step.id=%step.id, "Step already rolled back");
                states[index] = StepState::Compensated;
                continue;
            }
            match self
                .run_action(workflow, step, action, completer, true)
                .await
            {
                Ok(()) => {
                    states[index] = StepState::Compensated;
                    self.add_marker(workflow, marker).await;
                }
                Err(error) => {
                    tracing::error!(
                        step.id=%step.id,
                        step.group=%step.group,
                        error=%error.full_string(),
                        "Failed to compensate step"
                    );
                    states[index] = StepState::CompensationFailed;
                }
            }
        }
    }

    /// Run an action of the step under its scope locks and its system's concurrency limit.
    async fn run_action(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        action: &StepAction,
        completer: &TaskCompleter,
        rollback: bool,
    ) -> Result<(), SvcError> {
        let span = tracing::info_span!(
            "step",
            step.id = %step.id,
            step.group = %step.group,
            storage.system = %step.system,
            rollback
        );
        async move {
            let guard = match step.locks.is_empty() {
                true => None,
                false => Some(
                    self.locks
                        .acquire(&step.locks, self.config.lock_timeout())
                        .await?,
                ),
            };
            let _permit = self
                .limiter(&step.system)
                .acquire_owned()
                .await
                .map_err(|error| SvcError::Internal {
                    details: error.to_string(),
                })?;

            tracing::info!("{}", step.description);
            let ctx = StepContext::new(
                step,
                workflow,
                &self.repository,
                &self.drivers,
                &self.config,
                completer,
            );
            let result = action.execute(&ctx).await;
            drop(guard);
            result
        }
        .instrument(span)
        .await
    }

    async fn add_marker(&self, workflow: &Workflow, marker: String) {
        if let Err(error) = self
            .repository
            .add_workflow_marker(workflow.id(), &marker)
            .await
        {
            tracing::warn!(marker, error=%error.full_string(), "Failed to record workflow marker");
        }
    }

    async fn finish(
        &self,
        workflow: &Workflow,
        completer: &TaskCompleter,
        states: Vec<StepState>,
        error: Option<SvcError>,
    ) -> WorkflowOutcome {
        let terminal = match &error {
            None => completer.ready().await,
            Some(cause) => completer.error(cause).await,
        };
        if let Err(persist) = terminal {
            tracing::error!(error=%persist.full_string(), "Failed to persist the operation status");
        }
        match &error {
            None => tracing::info!(state=%completer.state(), "Workflow completed"),
            Some(cause) => tracing::error!(error=%cause.full_string(), "Workflow failed"),
        }
        WorkflowOutcome {
            workflow: workflow.id().clone(),
            operation: completer.operation(),
            state: completer.state(),
            steps: workflow
                .steps()
                .iter()
                .map(|step| step.id.clone())
                .zip(states)
                .collect(),
            error,
            warnings: completer.warnings(),
        }
    }
}
