use super::{StepId, Workflow, WorkflowStep};
use crate::{
    config::OrchestratorConfig,
    controller::{
        completer::TaskCompleter,
        driver::{
            DeviceDriver, DriverCapabilities, DriverError, DriverOutcome, DriverRegistry,
            DriverResult, JobStatus, NativeIds,
        },
        records::RepositoryExt,
    },
    errors::SvcError,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{future::Future, sync::Arc, time::Duration};
use stor_port::types::v0::{store::Repository, transport::StorageSystemId};
use tokio::time::Instant;

/// Everything an action needs while its step executes.
pub struct StepContext<'a> {
    step: &'a WorkflowStep,
    workflow: &'a Workflow,
    repository: &'a Arc<dyn Repository>,
    drivers: &'a DriverRegistry,
    config: &'a OrchestratorConfig,
    completer: &'a TaskCompleter,
}

impl<'a> StepContext<'a> {
    pub(super) fn new(
        step: &'a WorkflowStep,
        workflow: &'a Workflow,
        repository: &'a Arc<dyn Repository>,
        drivers: &'a DriverRegistry,
        config: &'a OrchestratorConfig,
        completer: &'a TaskCompleter,
    ) -> Self {
        Self {
            step,
            workflow,
            repository,
            drivers,
            config,
            completer,
        }
    }

    /// Id of the executing step.
    pub fn step_id(&self) -> &StepId {
        &self.step.id
    }
    /// The storage system the step targets.
    pub fn system(&self) -> &StorageSystemId {
        &self.step.system
    }
    /// The domain records.
    pub fn repository(&self) -> &dyn Repository {
        self.repository.as_ref()
    }
    /// The completer of the operation, for entities which complete independently.
    pub fn completer(&self) -> &TaskCompleter {
        self.completer
    }

    /// The device driver of the step's storage system.
    pub async fn device(&self) -> Result<Device, SvcError> {
        let system = self.repository().get_storage_system(self.system()).await?;
        let driver = self.drivers.driver(system.technology)?;
        Ok(Device {
            system: system.id,
            driver,
            deadline: self.config.device_deadline(),
            poll_period: self.config.job_poll_period(),
            sync_period: self.config.sync_poll_period(),
        })
    }

    /// Store data learned by this step for its successors.
    /// The data is recorded along with the workflow markers, for a resumed workflow.
    pub async fn set_data(&self, data: impl Serialize) -> Result<(), SvcError> {
        let value = self.workflow.set_step_data(self.step_id(), data)?;
        if let Some(index) = self.workflow.step_index(self.step_id()) {
            self.repository()
                .put_workflow_data(self.workflow.id(), &self.workflow.data_marker(index), &value)
                .await?;
        }
        Ok(())
    }
    /// Get the data stored by the given step.
    pub fn data<T: DeserializeOwned>(&self, step: &StepId) -> Result<T, SvcError> {
        self.workflow.step_data(step)
    }
}

/// A device driver bound to a storage system, enforcing the execution deadline of every call.
#[derive(Debug, Clone)]
pub struct Device {
    system: StorageSystemId,
    driver: Arc<dyn DeviceDriver>,
    deadline: Duration,
    poll_period: Duration,
    sync_period: Duration,
}

impl Device {
    /// The storage system.
    pub fn system(&self) -> &StorageSystemId {
        &self.system
    }
    /// The driver.
    pub fn driver(&self) -> &dyn DeviceDriver {
        self.driver.as_ref()
    }
    /// The driver's capabilities.
    pub fn capabilities(&self) -> DriverCapabilities {
        self.driver.capabilities()
    }

    fn failed(&self, operation: &str, source: DriverError) -> SvcError {
        SvcError::Device {
            operation: operation.to_string(),
            system: self.system.clone(),
            source,
        }
    }
    fn timed_out(&self, operation: &str) -> SvcError {
        SvcError::DeviceTimeout {
            operation: operation.to_string(),
            system: self.system.clone(),
            deadline: self.deadline,
        }
    }

    /// Run the driver call, polling its job if the array answers with one, until it
    /// completes or the deadline expires.
    pub async fn run(
        &self,
        operation: &str,
        call: impl Future<Output = DriverResult>,
    ) -> Result<NativeIds, SvcError> {
        let deadline = Instant::now() + self.deadline;
        let outcome = tokio::time::timeout_at(deadline, call)
            .await
            .map_err(|_| self.timed_out(operation))?
            .map_err(|source| self.failed(operation, source))?;

        let job = match outcome {
            DriverOutcome::Completed(ids) => return Ok(ids),
            DriverOutcome::Pending(job) => job,
        };
        tracing::debug!(%job, operation, "Polling device job");
        loop {
            tokio::time::sleep_until(deadline.min(Instant::now() + self.poll_period)).await;
            if Instant::now() >= deadline {
                return Err(self.timed_out(operation));
            }
            let status = tokio::time::timeout_at(deadline, self.driver.poll_job(&self.system, &job))
                .await
                .map_err(|_| self.timed_out(operation))?
                .map_err(|source| self.failed(operation, source))?;
            match status {
                JobStatus::Running => continue,
                JobStatus::Completed(ids) => return Ok(ids),
                JobStatus::Failed { reason } => {
                    return Err(self.failed(
                        operation,
                        DriverError::JobFailed {
                            job: job.to_string(),
                            reason,
                        },
                    ))
                }
            }
        }
    }

    /// Poll `check` until it reports completion or the deadline expires.
    pub async fn wait_until<F, Fut>(&self, operation: &str, mut check: F) -> Result<(), SvcError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, DriverError>>,
    {
        let deadline = Instant::now() + self.deadline;
        loop {
            let done = tokio::time::timeout_at(deadline, check())
                .await
                .map_err(|_| self.timed_out(operation))?
                .map_err(|source| self.failed(operation, source))?;
            if done {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(self.timed_out(operation));
            }
            tracing::trace!(operation, "Waiting for synchronization");
            tokio::time::sleep_until(deadline.min(Instant::now() + self.sync_period)).await;
        }
    }
}
