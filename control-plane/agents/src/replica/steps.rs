use super::{actions::ReplicaAction, state::ReplicaOperation};
use crate::{
    consistency_group::GroupAction,
    controller::{
        lock::LockScope,
        records::RepositoryExt,
        workflow::{StepBuilder, WaitFor, Workflow, WorkflowStep},
    },
    errors::SvcError,
};
use indexmap::IndexMap;
use stor_port::types::v0::{
    store::{
        replica::{FullCopyState, MirrorState, ReplicaSpec, ReplicaState},
        ResourceId,
    },
    transport::{ReplicaId, ReplicaKind, StorageSystemId, VolumeId},
};

/// Replicas sharing a storage system and an array replication group.
#[derive(Debug, Clone)]
pub struct ReplicaBatch {
    pub system: StorageSystemId,
    pub group: Option<String>,
    pub replicas: Vec<ReplicaSpec>,
}

impl ReplicaBatch {
    /// Segregate the replicas by storage system and replication group, keeping their order.
    pub fn segregate(replicas: impl IntoIterator<Item = ReplicaSpec>) -> Vec<Self> {
        let mut batches = IndexMap::<(StorageSystemId, Option<String>), Vec<ReplicaSpec>>::new();
        for replica in replicas {
            batches
                .entry((replica.system.clone(), replica.replication_group.clone()))
                .or_default()
                .push(replica);
        }
        batches
            .into_iter()
            .map(|((system, group), replicas)| Self {
                system,
                group,
                replicas,
            })
            .collect()
    }
    /// Ids of the replicas.
    pub fn ids(&self) -> Vec<ReplicaId> {
        self.replicas.iter().map(|r| r.uuid.clone()).collect()
    }
    /// The replicas as replication group members.
    pub fn members(&self) -> Vec<ResourceId> {
        self.replicas
            .iter()
            .map(|r| ResourceId::from(&r.uuid))
            .collect()
    }
    /// The scope locks of the batch's replication group.
    pub fn locks(&self) -> Vec<String> {
        self.group
            .iter()
            .map(|group| LockScope::ReplicationGroup.key(group, &self.system))
            .collect()
    }
    /// The batch restricted to the replicas matching the predicate.
    pub fn filter(&self, predicate: impl Fn(&ReplicaSpec) -> bool) -> Self {
        Self {
            system: self.system.clone(),
            group: self.group.clone(),
            replicas: self
                .replicas
                .iter()
                .filter(|r| predicate(r))
                .cloned()
                .collect(),
        }
    }
    fn describe(&self, what: &str) -> String {
        let group = match &self.group {
            Some(group) => format!(" of group '{group}'"),
            None => String::new(),
        };
        format!(
            "{what} {} replica(s){group} on storage system '{}'",
            self.replicas.len(),
            self.system
        )
    }
}

/// Apply the failure policy of propagation steps.
pub(crate) fn with_policy(step: WorkflowStep, tolerate: Option<&str>) -> WorkflowStep {
    match tolerate {
        Some(label) => step.tolerate(label),
        None => step,
    }
}

impl StepBuilder {
    /// Record new pending replicas of the volumes, referenced by their sources.
    /// Replicas of consistency group members are placed into the `label` replication group.
    async fn prepare_replicas(
        &self,
        kind: ReplicaKind,
        volumes: &[VolumeId],
        label: &str,
    ) -> Result<Vec<ReplicaSpec>, SvcError> {
        let repository = self.repository();
        let mut sources = Vec::with_capacity(volumes.len());
        for volume in volumes {
            let volume = repository.get_volume(volume).await?;
            if volume.inactive {
                return Err(SvcError::InvalidArguments {
                    details: format!("Volume '{}' has been deleted", volume.uuid),
                });
            }
            sources.push(volume);
        }

        let mut replicas = Vec::with_capacity(sources.len());
        let count = sources.len();
        for (index, mut volume) in sources.into_iter().enumerate() {
            let name = match count {
                1 => label.to_string(),
                _ => format!("{label}-{}", index + 1),
            };
            let mut replica = ReplicaSpec::new(kind, name, &volume);
            if volume.consistency_group.is_some() {
                replica.replication_group = Some(label.to_string());
            }
            if kind == ReplicaKind::FullCopy {
                replica.set_name = Some(label.to_string());
            }
            repository.put_replica(&replica).await?;
            volume.replica_refs_mut(kind).insert(replica.uuid.clone());
            repository.put_volume(&volume).await?;
            replicas.push(replica);
        }
        Ok(replicas)
    }

    /// Load the active replicas of the given kind, skipping stale references.
    pub(crate) async fn active_replicas_of(
        &self,
        kind: ReplicaKind,
        ids: &[ReplicaId],
    ) -> Result<Vec<ReplicaSpec>, SvcError> {
        let replicas = self.repository().active_replicas(ids).await?;
        if let Some(replica) = replicas.iter().find(|r| r.kind() != kind) {
            return Err(SvcError::InvalidArguments {
                details: format!("Replica '{}' is a {}, not a {kind}", replica.uuid, replica.kind()),
            });
        }
        Ok(replicas)
    }

    /// Check if the batch covers every active replica of its replication group, in which case
    /// the array can apply the operation to the whole group at once.
    async fn whole_group(&self, batch: &ReplicaBatch) -> Result<bool, SvcError> {
        let Some(group) = &batch.group else {
            return Ok(false);
        };
        let members = self
            .repository()
            .replicas_in_replication_group(&batch.system, group)
            .await?;
        Ok(members
            .iter()
            .all(|member| batch.replicas.iter().any(|r| r.uuid == member.uuid)))
    }

    /// Append the creation of the pending replica batches.
    /// A batch whose replication group does not exist yet is created with a single group
    /// operation; a batch joining an existing group is created as a list and then added to it.
    pub(crate) async fn append_create_replicas(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        kind: ReplicaKind,
        batches: Vec<ReplicaBatch>,
        label: &str,
        activate: bool,
        tolerate: Option<&str>,
    ) -> Result<Option<WaitFor>, SvcError> {
        let mut created = false;
        for batch in batches.into_iter().filter(|b| !b.replicas.is_empty()) {
            let group_exists = match &batch.group {
                Some(group) => self
                    .repository()
                    .replicas_in_replication_group(&batch.system, group)
                    .await?
                    .iter()
                    .any(|member| !batch.replicas.iter().any(|r| r.uuid == member.uuid)),
                None => false,
            };
            let grouped = batch.group.is_some() && !group_exists;
            let step = WorkflowStep::new(
                label,
                batch.describe(&format!("Create {kind}")),
                &batch.system,
                ReplicaAction::Transition {
                    kind,
                    operation: ReplicaOperation::Create,
                    replicas: batch.ids(),
                    grouped,
                }
                .into(),
            )
            .wait_for(wait_for.clone())
            .rollback(
                ReplicaAction::RollbackCreate {
                    replicas: batch.ids(),
                }
                .into(),
            )
            .locks(batch.locks());
            let mut last = workflow.create_step(with_policy(step, tolerate));

            if let (Some(group), true) = (&batch.group, group_exists) {
                let step = WorkflowStep::new(
                    label,
                    batch.describe("Add to the replication group"),
                    &batch.system,
                    GroupAction::AddToReplicationGroup {
                        group: None,
                        name: group.clone(),
                        members: batch.members(),
                    }
                    .into(),
                )
                .wait_for(Some(last))
                .rollback(
                    GroupAction::RemoveFromReplicationGroup {
                        group: None,
                        name: group.clone(),
                        members: batch.members(),
                    }
                    .into(),
                )
                .locks(batch.locks());
                last = workflow.create_step(with_policy(step, tolerate));
            }

            if activate {
                let step = WorkflowStep::new(
                    label,
                    batch.describe(&format!("Activate {kind}")),
                    &batch.system,
                    ReplicaAction::Transition {
                        kind,
                        operation: ReplicaOperation::Activate,
                        replicas: batch.ids(),
                        grouped: batch.group.is_some(),
                    }
                    .into(),
                )
                .wait_for(Some(last))
                .locks(batch.locks());
                workflow.create_step(with_policy(step, tolerate));
            }
            created = true;
        }
        Ok(Self::frontier(created, label, wait_for))
    }

    /// Append one transition step per batch.
    pub(crate) async fn append_transition(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        kind: ReplicaKind,
        operation: ReplicaOperation,
        batches: &[ReplicaBatch],
    ) -> Result<Option<WaitFor>, SvcError> {
        let label = format!("{operation}:{kind}");
        let mut created = false;
        for batch in batches.iter().filter(|b| !b.replicas.is_empty()) {
            let grouped = self.whole_group(batch).await?;
            workflow.create_step(
                WorkflowStep::new(
                    &label,
                    batch.describe(&format!("{operation} {kind}")),
                    &batch.system,
                    ReplicaAction::Transition {
                        kind,
                        operation,
                        replicas: batch.ids(),
                        grouped,
                    }
                    .into(),
                )
                .wait_for(wait_for.clone())
                .locks(batch.locks()),
            );
            created = true;
        }
        Ok(Self::frontier(created, &label, wait_for))
    }

    /// Apply the lifecycle operation to the replicas.
    pub async fn replica_operation(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        kind: ReplicaKind,
        operation: ReplicaOperation,
        replicas: &[ReplicaId],
    ) -> Result<Option<WaitFor>, SvcError> {
        let replicas = self.active_replicas_of(kind, replicas).await?;
        let batches = ReplicaBatch::segregate(replicas);
        self.append_transition(workflow, wait_for, kind, operation, &batches)
            .await
    }

    /// Remove the replicas from their replication groups, deleting the groups they leave empty.
    /// The replicas survive as standalone replicas.
    pub(crate) async fn append_leave_replica_groups(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        replicas: Vec<ReplicaSpec>,
        label: &str,
    ) -> Result<Option<WaitFor>, SvcError> {
        let mut created = false;
        for batch in ReplicaBatch::segregate(replicas) {
            let Some(group) = batch.group.clone() else {
                continue;
            };
            workflow.create_step(
                WorkflowStep::new(
                    label,
                    batch.describe("Remove from the replication group"),
                    &batch.system,
                    GroupAction::LeaveReplicationGroup {
                        name: group.clone(),
                        members: batch.members(),
                    }
                    .into(),
                )
                .wait_for(wait_for.clone())
                .rollback(
                    GroupAction::RejoinReplicationGroup {
                        name: group,
                        members: batch.members(),
                    }
                    .into(),
                )
                .locks(batch.locks()),
            );
            created = true;
        }
        Ok(Self::frontier(created, label, wait_for))
    }

    /// Append the deletion of the replicas: they leave their replication groups, are
    /// fractured when still synchronizing, and are deleted.
    pub(crate) async fn append_delete_replicas(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        kind: ReplicaKind,
        replicas: Vec<ReplicaSpec>,
    ) -> Result<Option<WaitFor>, SvcError> {
        if replicas.is_empty() {
            return Ok(wait_for);
        }
        let label = format!("Delete:{kind}");
        let wait_for = self
            .append_leave_replica_groups(workflow, wait_for, replicas.clone(), &label)
            .await?;
        let standalone = replicas
            .into_iter()
            .map(|replica| ReplicaSpec {
                replication_group: None,
                ..replica
            })
            .collect::<Vec<_>>();
        let batches = ReplicaBatch::segregate(standalone);

        let fracture = batches
            .iter()
            .map(|batch| batch.filter(|r| needs_fracture(r.state)))
            .collect::<Vec<_>>();
        let wait_for = self
            .append_transition(workflow, wait_for, kind, ReplicaOperation::Fracture, &fracture)
            .await?;
        self.append_transition(workflow, wait_for, kind, ReplicaOperation::Delete, &batches)
            .await
    }

    /// Create a mirror of each volume.
    pub async fn create_mirrors(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        volumes: &[VolumeId],
        label: &str,
    ) -> Result<Option<WaitFor>, SvcError> {
        let replicas = self
            .prepare_replicas(ReplicaKind::Mirror, volumes, label)
            .await?;
        let batches = ReplicaBatch::segregate(replicas);
        self.append_create_replicas(
            workflow,
            wait_for,
            ReplicaKind::Mirror,
            batches,
            "CreateMirrors",
            false,
            None,
        )
        .await
    }

    /// Pause the synchronization of the mirrors.
    pub async fn fracture_mirrors(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        mirrors: &[ReplicaId],
    ) -> Result<Option<WaitFor>, SvcError> {
        self.replica_operation(
            workflow,
            wait_for,
            ReplicaKind::Mirror,
            ReplicaOperation::Fracture,
            mirrors,
        )
        .await
    }

    /// Resume the synchronization of fractured mirrors.
    pub async fn resume_mirrors(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        mirrors: &[ReplicaId],
    ) -> Result<Option<WaitFor>, SvcError> {
        self.replica_operation(
            workflow,
            wait_for,
            ReplicaKind::Mirror,
            ReplicaOperation::Resume,
            mirrors,
        )
        .await
    }

    /// Wait until the replicas are synchronized with their sources.
    pub async fn wait_for_synchronization(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        kind: ReplicaKind,
        replicas: &[ReplicaId],
    ) -> Result<Option<WaitFor>, SvcError> {
        let label = format!("Synchronize:{kind}");
        let replicas = self.active_replicas_of(kind, replicas).await?;
        let mut created = false;
        for batch in ReplicaBatch::segregate(replicas) {
            workflow.create_step(
                WorkflowStep::new(
                    &label,
                    batch.describe("Wait for the synchronization of"),
                    &batch.system,
                    ReplicaAction::WaitForSynchronization {
                        replicas: batch.ids(),
                    }
                    .into(),
                )
                .wait_for(wait_for.clone()),
            );
            created = true;
        }
        Ok(Self::frontier(created, &label, wait_for))
    }

    /// Detach the mirrors from their sources, either promoting them to standalone volumes or
    /// deleting them.
    pub async fn detach_mirrors(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        mirrors: &[ReplicaId],
        promote: bool,
    ) -> Result<Option<WaitFor>, SvcError> {
        let kind = ReplicaKind::Mirror;
        let mirrors = self.active_replicas_of(kind, mirrors).await?;
        if mirrors.is_empty() {
            return Ok(wait_for);
        }
        let wait_for = self
            .append_leave_replica_groups(workflow, wait_for, mirrors.clone(), "DetachMirrors")
            .await?;
        let batches = ReplicaBatch::segregate(mirrors.into_iter().map(|mirror| ReplicaSpec {
            replication_group: None,
            ..mirror
        }));
        let fracture = batches
            .iter()
            .map(|batch| {
                batch.filter(|r| {
                    matches!(
                        r.state,
                        ReplicaState::Mirror(MirrorState::Created | MirrorState::Synchronizing)
                    )
                })
            })
            .collect::<Vec<_>>();
        let wait_for = self
            .append_transition(workflow, wait_for, kind, ReplicaOperation::Fracture, &fracture)
            .await?;
        let detach = batches
            .iter()
            .map(|batch| batch.filter(|r| r.state != ReplicaState::Mirror(MirrorState::Detached)))
            .collect::<Vec<_>>();
        let wait_for = self
            .append_transition(workflow, wait_for, kind, ReplicaOperation::Detach, &detach)
            .await?;
        if !promote {
            return self
                .append_transition(workflow, wait_for, kind, ReplicaOperation::Delete, &batches)
                .await;
        }
        let mut created = false;
        for batch in &batches {
            workflow.create_step(
                WorkflowStep::new(
                    "PromoteMirrors",
                    batch.describe("Promote to volumes"),
                    &batch.system,
                    ReplicaAction::PromoteMirrors {
                        mirrors: batch.ids(),
                    }
                    .into(),
                )
                .wait_for(wait_for.clone()),
            );
            created = true;
        }
        Ok(Self::frontier(created, "PromoteMirrors", wait_for))
    }

    /// Delete the mirrors.
    pub async fn delete_mirrors(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        mirrors: &[ReplicaId],
    ) -> Result<Option<WaitFor>, SvcError> {
        let mirrors = self.active_replicas_of(ReplicaKind::Mirror, mirrors).await?;
        self.append_delete_replicas(workflow, wait_for, ReplicaKind::Mirror, mirrors)
            .await
    }

    /// Create a snapshot of each volume, activating them on technologies which require it.
    pub async fn create_snapshots(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        volumes: &[VolumeId],
        label: &str,
    ) -> Result<Option<WaitFor>, SvcError> {
        let replicas = self
            .prepare_replicas(ReplicaKind::Snapshot, volumes, label)
            .await?;
        let mut wait_for = wait_for;
        for batch in ReplicaBatch::segregate(replicas) {
            let activate = self.capabilities(&batch.system).await?.snapshot_activation;
            wait_for = self
                .append_create_replicas(
                    workflow,
                    wait_for,
                    ReplicaKind::Snapshot,
                    vec![batch],
                    "CreateSnapshots",
                    activate,
                    None,
                )
                .await?;
        }
        Ok(wait_for)
    }

    /// Delete the snapshots; the deletion of the last snapshot of a replication group
    /// deletes the group.
    pub async fn delete_snapshots(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        snapshots: &[ReplicaId],
    ) -> Result<Option<WaitFor>, SvcError> {
        let snapshots = self
            .active_replicas_of(ReplicaKind::Snapshot, snapshots)
            .await?;
        if let Some(linked) = snapshots.iter().find(|s| s.is_linked_target()) {
            return Err(SvcError::InvalidArguments {
                details: format!(
                    "Snapshot '{}' is a linked target, unlink it from its session instead",
                    linked.uuid
                ),
            });
        }
        self.append_delete_replicas(workflow, wait_for, ReplicaKind::Snapshot, snapshots)
            .await
    }

    /// Restore the source volumes from the snapshots.
    pub async fn restore_snapshots(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        snapshots: &[ReplicaId],
    ) -> Result<Option<WaitFor>, SvcError> {
        self.replica_operation(
            workflow,
            wait_for,
            ReplicaKind::Snapshot,
            ReplicaOperation::Restore,
            snapshots,
        )
        .await
    }

    /// Resynchronize the snapshots with their sources.
    pub async fn resync_snapshots(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        snapshots: &[ReplicaId],
    ) -> Result<Option<WaitFor>, SvcError> {
        self.replica_operation(
            workflow,
            wait_for,
            ReplicaKind::Snapshot,
            ReplicaOperation::Resync,
            snapshots,
        )
        .await
    }

    /// Create a full copy of each volume, leaving them inactive unless `activate` is set.
    pub async fn create_full_copies(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        volumes: &[VolumeId],
        label: &str,
        activate: bool,
    ) -> Result<Option<WaitFor>, SvcError> {
        let replicas = self
            .prepare_replicas(ReplicaKind::FullCopy, volumes, label)
            .await?;
        let batches = ReplicaBatch::segregate(replicas);
        self.append_create_replicas(
            workflow,
            wait_for,
            ReplicaKind::FullCopy,
            batches,
            "CreateFullCopies",
            activate,
            None,
        )
        .await
    }

    /// Activate inactive full copies, starting their synchronization.
    pub async fn activate_full_copies(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        clones: &[ReplicaId],
    ) -> Result<Option<WaitFor>, SvcError> {
        self.replica_operation(
            workflow,
            wait_for,
            ReplicaKind::FullCopy,
            ReplicaOperation::Activate,
            clones,
        )
        .await
    }

    /// Fracture the full copies from their sources.
    pub async fn fracture_full_copies(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        clones: &[ReplicaId],
    ) -> Result<Option<WaitFor>, SvcError> {
        self.replica_operation(
            workflow,
            wait_for,
            ReplicaKind::FullCopy,
            ReplicaOperation::Fracture,
            clones,
        )
        .await
    }

    /// Resynchronize the full copies with their sources.
    pub async fn resync_full_copies(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        clones: &[ReplicaId],
    ) -> Result<Option<WaitFor>, SvcError> {
        self.replica_operation(
            workflow,
            wait_for,
            ReplicaKind::FullCopy,
            ReplicaOperation::Resync,
            clones,
        )
        .await
    }

    /// Restore the source volumes from the full copies, fracturing them before and
    /// resynchronizing them after as the technology requires.
    pub async fn restore_from_full_copies(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        clones: &[ReplicaId],
    ) -> Result<Option<WaitFor>, SvcError> {
        let kind = ReplicaKind::FullCopy;
        let clones = self.active_replicas_of(kind, clones).await?;
        let mut wait_for = wait_for;
        for batch in ReplicaBatch::segregate(clones) {
            let capabilities = self.capabilities(&batch.system).await?;
            if capabilities.fracture_before_clone_restore {
                let fracture = batch.filter(|r| {
                    !matches!(r.state, ReplicaState::FullCopy(FullCopyState::Fractured))
                });
                wait_for = self
                    .append_transition(workflow, wait_for, kind, ReplicaOperation::Fracture, &[fracture])
                    .await?;
            }
            wait_for = self
                .append_transition(
                    workflow,
                    wait_for,
                    kind,
                    ReplicaOperation::Restore,
                    std::slice::from_ref(&batch),
                )
                .await?;
            if capabilities.resync_after_clone_restore {
                wait_for = self
                    .append_transition(
                        workflow,
                        wait_for,
                        kind,
                        ReplicaOperation::Resync,
                        std::slice::from_ref(&batch),
                    )
                    .await?;
            }
        }
        Ok(wait_for)
    }

    /// Detach the full copies from their sources, they survive as independent copies.
    pub async fn detach_full_copies(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        clones: &[ReplicaId],
    ) -> Result<Option<WaitFor>, SvcError> {
        let kind = ReplicaKind::FullCopy;
        let clones = self.active_replicas_of(kind, clones).await?;
        let clones = clones
            .into_iter()
            .filter(|r| !matches!(r.state, ReplicaState::FullCopy(FullCopyState::Detached)))
            .collect::<Vec<_>>();
        if clones.is_empty() {
            return Ok(wait_for);
        }
        let wait_for = self
            .append_leave_replica_groups(workflow, wait_for, clones.clone(), "DetachFullCopies")
            .await?;
        let batches = ReplicaBatch::segregate(clones.into_iter().map(|clone| ReplicaSpec {
            replication_group: None,
            ..clone
        }));
        self.append_transition(workflow, wait_for, kind, ReplicaOperation::Detach, &batches)
            .await
    }

    /// Delete the full copies.
    pub async fn delete_full_copies(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        clones: &[ReplicaId],
    ) -> Result<Option<WaitFor>, SvcError> {
        let clones = self.active_replicas_of(ReplicaKind::FullCopy, clones).await?;
        self.append_delete_replicas(workflow, wait_for, ReplicaKind::FullCopy, clones)
            .await
    }
}

/// Replicas which must be fractured from their source before they can be deleted.
fn needs_fracture(state: ReplicaState) -> bool {
    matches!(
        state,
        ReplicaState::Mirror(MirrorState::Synchronizing | MirrorState::Synchronized)
            | ReplicaState::FullCopy(
                FullCopyState::Synchronizing
                    | FullCopyState::Synchronized
                    | FullCopyState::Restored
                    | FullCopyState::Resynchronized
            )
    )
}
