use super::{StepAction, WaitFor, Workflow, WorkflowStep};
use crate::{
    controller::{
        driver::{DriverCapabilities, DriverRegistry},
        records::RepositoryExt,
    },
    errors::SvcError,
};
use std::sync::Arc;
use stor_port::types::v0::{
    store::Repository,
    transport::{StorageSystemId, Technology},
};

/// Assembles the steps of the supported operations into workflows.
/// Each operation appends its steps after the given `wait_for` key and returns the key of its
/// own last steps; an operation with nothing to do returns the given key unchanged.
#[derive(Debug, Clone)]
pub struct StepBuilder {
    repository: Arc<dyn Repository>,
    drivers: DriverRegistry,
}

impl StepBuilder {
    /// Create a new `Self`.
    pub fn new(repository: Arc<dyn Repository>, drivers: DriverRegistry) -> Self {
        Self {
            repository,
            drivers,
        }
    }

    /// The domain records.
    pub fn repository(&self) -> &dyn Repository {
        self.repository.as_ref()
    }

    /// Technology of the storage system.
    pub(crate) async fn technology(&self, system: &StorageSystemId) -> Result<Technology, SvcError> {
        Ok(self.repository().get_storage_system(system).await?.technology)
    }
    /// Capabilities of the storage system's driver.
    pub(crate) async fn capabilities(
        &self,
        system: &StorageSystemId,
    ) -> Result<DriverCapabilities, SvcError> {
        let technology = self.technology(system).await?;
        self.drivers.capabilities(technology)
    }

    /// The frontier after an assembly phase: its group if it created any step, otherwise
    /// the unchanged `wait_for`.
    pub(crate) fn frontier(
        created: bool,
        group: &str,
        wait_for: Option<WaitFor>,
    ) -> Option<WaitFor> {
        match created {
            true => Some(WaitFor::group(group)),
            false => wait_for,
        }
    }

    /// End a chain with a no-op step of the `group`, so that waiting for the group waits for
    /// every chain ended this way, however many parallel chains an operation appended.
    pub(crate) fn append_chain_end(
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        group: &str,
        system: &StorageSystemId,
    ) -> WaitFor {
        workflow.create_step(
            WorkflowStep::new(group, format!("End of a '{group}' chain"), system, StepAction::Null)
                .wait_for(wait_for),
        )
    }
}
