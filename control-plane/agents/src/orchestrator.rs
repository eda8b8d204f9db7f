use crate::{
    config::OrchestratorConfig,
    controller::{
        completer::TaskCompleter,
        driver::DriverRegistry,
        lock::LockManager,
        workflow::{StepBuilder, WaitFor, Workflow, WorkflowExecutor, WorkflowOutcome},
    },
    errors::SvcError,
    replica::ReplicaOperation,
};
use std::sync::Arc;
use stor_port::{
    transport_api::ErrorChain,
    types::v0::{
        store::{operation::OperationType, volume::VolumeSpec, Repository, ResourceId},
        transport::{ConsistencyGroupId, CopyMode, OperationId, ReplicaId, ReplicaKind, VolumeId},
    },
};

fn volumes(ids: &[VolumeId]) -> Vec<ResourceId> {
    ids.iter().map(ResourceId::from).collect()
}
fn replicas(ids: &[ReplicaId]) -> Vec<ResourceId> {
    ids.iter().map(ResourceId::from).collect()
}

/// Runs the supported operations: each request is assembled into a workflow whose outcome
/// is recorded on the targeted entities under a new operation id.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    repository: Arc<dyn Repository>,
    builder: StepBuilder,
    executor: WorkflowExecutor,
}

impl Orchestrator {
    /// Create a new `Self` with its own lock manager.
    pub fn new(
        config: OrchestratorConfig,
        repository: Arc<dyn Repository>,
        drivers: DriverRegistry,
    ) -> Self {
        let locks = LockManager::new(config.lock_ttl());
        Self::with_locks(config, repository, drivers, locks)
    }
    /// Create a new `Self` sharing the given lock manager.
    pub fn with_locks(
        config: OrchestratorConfig,
        repository: Arc<dyn Repository>,
        drivers: DriverRegistry,
        locks: LockManager,
    ) -> Self {
        Self {
            builder: StepBuilder::new(repository.clone(), drivers.clone()),
            executor: WorkflowExecutor::new(config, repository.clone(), drivers, locks),
            repository,
        }
    }

    /// The step builder.
    pub fn builder(&self) -> &StepBuilder {
        &self.builder
    }
    /// The workflow executor.
    pub fn executor(&self) -> &WorkflowExecutor {
        &self.executor
    }

    /// Execute an assembled workflow, or record the assembly failure on the targets.
    async fn run(
        &self,
        kind: OperationType,
        targets: Vec<ResourceId>,
        workflow: Workflow,
        assembled: Result<Option<WaitFor>, SvcError>,
    ) -> Result<WorkflowOutcome, SvcError> {
        let completer =
            TaskCompleter::new(self.repository.clone(), &OperationId::new(), kind, targets);
        if let Err(error) = assembled {
            tracing::error!(operation=%kind, error=%error.full_string(), "Failed to assemble the workflow");
            completer.error(&error).await?;
            return Err(error);
        }
        tracing::info!(operation=%kind, workflow.id=%workflow.id(), steps=workflow.len(), "Executing workflow");
        Ok(self.executor.execute(&workflow, &completer).await)
    }

    /// Create the volumes.
    pub async fn create_volumes(
        &self,
        specs: Vec<VolumeSpec>,
    ) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::CreateVolumes;
        let targets = specs.iter().map(|v| ResourceId::from(&v.uuid)).collect();
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self.builder.create_volumes(&mut workflow, None, specs).await;
        self.run(kind, targets, workflow, assembled).await
    }
    /// Delete the volumes along with their replicas.
    pub async fn delete_volumes(&self, ids: &[VolumeId]) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::DeleteVolumes;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self.builder.delete_volumes(&mut workflow, None, ids).await;
        self.run(kind, volumes(ids), workflow, assembled).await
    }
    /// Expand the volumes to the given size.
    pub async fn expand_volumes(
        &self,
        ids: &[VolumeId],
        size: u64,
    ) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::ExpandVolumes;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self
            .builder
            .expand_volumes(&mut workflow, None, ids, size)
            .await;
        self.run(kind, volumes(ids), workflow, assembled).await
    }

    /// Add volumes to, and remove volumes from, a consistency group.
    pub async fn update_consistency_group(
        &self,
        group: &ConsistencyGroupId,
        add: &[VolumeId],
        remove: &[VolumeId],
    ) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::UpdateConsistencyGroup;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self
            .builder
            .update_consistency_group(&mut workflow, None, group, add, remove)
            .await;
        self.run(kind, vec![ResourceId::from(group)], workflow, assembled)
            .await
    }

    /// Create a mirror of each volume.
    pub async fn create_mirrors(
        &self,
        ids: &[VolumeId],
        label: &str,
    ) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::CreateMirrors;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self
            .builder
            .create_mirrors(&mut workflow, None, ids, label)
            .await;
        self.run(kind, volumes(ids), workflow, assembled).await
    }
    /// Detach the mirrors, promoting them to volumes or deleting them.
    pub async fn detach_mirrors(
        &self,
        ids: &[ReplicaId],
        promote: bool,
    ) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::DetachMirrors;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self
            .builder
            .detach_mirrors(&mut workflow, None, ids, promote)
            .await;
        self.run(kind, replicas(ids), workflow, assembled).await
    }
    /// Delete the mirrors.
    pub async fn delete_mirrors(&self, ids: &[ReplicaId]) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::DeleteMirrors;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self.builder.delete_mirrors(&mut workflow, None, ids).await;
        self.run(kind, replicas(ids), workflow, assembled).await
    }

    /// Create a snapshot of each volume.
    pub async fn create_snapshots(
        &self,
        ids: &[VolumeId],
        label: &str,
    ) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::CreateSnapshots;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self
            .builder
            .create_snapshots(&mut workflow, None, ids, label)
            .await;
        self.run(kind, volumes(ids), workflow, assembled).await
    }
    /// Delete the snapshots.
    pub async fn delete_snapshots(&self, ids: &[ReplicaId]) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::DeleteSnapshots;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self.builder.delete_snapshots(&mut workflow, None, ids).await;
        self.run(kind, replicas(ids), workflow, assembled).await
    }

    /// Create a full copy of each volume, inactive unless `activate` is set.
    pub async fn create_full_copies(
        &self,
        ids: &[VolumeId],
        label: &str,
        activate: bool,
    ) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::CreateFullCopies;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self
            .builder
            .create_full_copies(&mut workflow, None, ids, label, activate)
            .await;
        self.run(kind, volumes(ids), workflow, assembled).await
    }
    /// Detach the full copies from their sources.
    pub async fn detach_full_copies(
        &self,
        ids: &[ReplicaId],
    ) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::DetachFullCopies;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self
            .builder
            .detach_full_copies(&mut workflow, None, ids)
            .await;
        self.run(kind, replicas(ids), workflow, assembled).await
    }
    /// Restore the source volumes from the full copies.
    pub async fn restore_from_full_copies(
        &self,
        ids: &[ReplicaId],
    ) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::RestoreFromFullCopies;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self
            .builder
            .restore_from_full_copies(&mut workflow, None, ids)
            .await;
        self.run(kind, replicas(ids), workflow, assembled).await
    }
    /// Delete the full copies.
    pub async fn delete_full_copies(
        &self,
        ids: &[ReplicaId],
    ) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::DeleteFullCopies;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self
            .builder
            .delete_full_copies(&mut workflow, None, ids)
            .await;
        self.run(kind, replicas(ids), workflow, assembled).await
    }

    /// Apply a lifecycle transition to replicas of the given kind: fracture, resume, resync
    /// or activate them, or restore their sources from snapshots.
    pub async fn replica_operation(
        &self,
        kind: ReplicaKind,
        operation: ReplicaOperation,
        ids: &[ReplicaId],
    ) -> Result<WorkflowOutcome, SvcError> {
        let operation_type = match (kind, operation) {
            (ReplicaKind::Mirror, ReplicaOperation::Fracture) => OperationType::FractureMirrors,
            (ReplicaKind::Mirror, ReplicaOperation::Resume) => OperationType::ResumeMirrors,
            (ReplicaKind::Snapshot, ReplicaOperation::Restore) => OperationType::RestoreSnapshot,
            (ReplicaKind::Snapshot, ReplicaOperation::Resync) => OperationType::ResyncSnapshots,
            (ReplicaKind::FullCopy, ReplicaOperation::Activate) => {
                OperationType::ActivateFullCopies
            }
            (ReplicaKind::FullCopy, ReplicaOperation::Fracture) => {
                OperationType::FractureFullCopies
            }
            (ReplicaKind::FullCopy, ReplicaOperation::Resync) => OperationType::ResyncFullCopies,
            _ => {
                return Err(SvcError::InvalidArguments {
                    details: format!("Operation '{operation}' is not supported on {kind} replicas"),
                })
            }
        };
        let mut workflow = Workflow::new(operation_type.to_string());
        let assembled = self
            .builder
            .replica_operation(&mut workflow, None, kind, operation, ids)
            .await;
        self.run(operation_type, replicas(ids), workflow, assembled)
            .await
    }

    /// Create a snapshot session of each volume, or of their replication groups.
    pub async fn create_snapshot_sessions(
        &self,
        ids: &[VolumeId],
        label: &str,
    ) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::CreateSnapshotSessions;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self
            .builder
            .create_snapshot_sessions(&mut workflow, None, ids, label)
            .await;
        self.run(kind, volumes(ids), workflow, assembled).await
    }
    /// Link `count` new targets of each source volume to the session.
    pub async fn link_targets(
        &self,
        session: &ReplicaId,
        count: u32,
        label: &str,
        mode: CopyMode,
    ) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::LinkTargets;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self
            .builder
            .link_targets(&mut workflow, None, session, count, label, mode)
            .await;
        self.run(kind, vec![ResourceId::from(session)], workflow, assembled)
            .await
    }
    /// Relink the targets to the session.
    pub async fn relink_targets(
        &self,
        session: &ReplicaId,
        targets: &[ReplicaId],
    ) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::RelinkTargets;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self
            .builder
            .relink_targets(&mut workflow, None, session, targets)
            .await;
        self.run(kind, replicas(targets), workflow, assembled).await
    }
    /// Unlink the targets from the session, optionally deleting them.
    pub async fn unlink_targets(
        &self,
        session: &ReplicaId,
        targets: &[ReplicaId],
        delete_targets: bool,
    ) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::UnlinkTargets;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self
            .builder
            .unlink_targets(&mut workflow, None, session, targets, delete_targets)
            .await;
        self.run(kind, replicas(targets), workflow, assembled).await
    }
    /// Restore the source volumes from the session.
    pub async fn restore_snapshot_session(
        &self,
        session: &ReplicaId,
    ) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::RestoreSnapshotSession;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self
            .builder
            .restore_snapshot_session(&mut workflow, None, session)
            .await;
        self.run(kind, vec![ResourceId::from(session)], workflow, assembled)
            .await
    }
    /// Delete the session and its linked targets.
    pub async fn delete_snapshot_session(
        &self,
        session: &ReplicaId,
    ) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::DeleteSnapshotSession;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self
            .builder
            .delete_snapshot_session(&mut workflow, None, session)
            .await;
        self.run(kind, vec![ResourceId::from(session)], workflow, assembled)
            .await
    }
    /// Restore the source volume of the linked target from the target.
    pub async fn restore_from_linked_target(
        &self,
        target: &ReplicaId,
    ) -> Result<WorkflowOutcome, SvcError> {
        let kind = OperationType::RestoreFromLinkedTarget;
        let mut workflow = Workflow::new(kind.to_string());
        let assembled = self
            .builder
            .restore_from_linked_target(&mut workflow, None, target)
            .await;
        self.run(kind, vec![ResourceId::from(target)], workflow, assembled)
            .await
    }
}
