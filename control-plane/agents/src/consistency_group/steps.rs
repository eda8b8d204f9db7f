use super::actions::GroupAction;
use crate::{
    controller::{
        lock::LockScope,
        records::RepositoryExt,
        workflow::{StepAction, StepBuilder, WaitFor, Workflow, WorkflowStep},
    },
    errors::SvcError,
};
use indexmap::IndexMap;
use stor_port::types::v0::{
    store::{consistency_group::ConsistencyGroupSpec, volume::VolumeSpec, ResourceId},
    transport::{ConsistencyGroupId, StorageSystemId, VolumeId},
};

/// Scope locks of a consistency group and its replication group on a storage system.
pub(crate) fn group_locks(
    group: &ConsistencyGroupSpec,
    name: &str,
    system: &StorageSystemId,
) -> Vec<String> {
    vec![
        LockScope::ConsistencyGroup.key(group.uuid.as_str(), system),
        LockScope::ReplicationGroup.key(name, system),
    ]
}

/// Label of the steps ending the join chain of each storage system.
pub(crate) const JOINED: &str = "JoinedConsistencyGroup";

fn members(volumes: &[VolumeSpec]) -> Vec<ResourceId> {
    volumes.iter().map(|v| ResourceId::from(&v.uuid)).collect()
}

/// Segregate volumes by storage system, keeping their order.
pub(crate) fn by_system(volumes: Vec<VolumeSpec>) -> IndexMap<StorageSystemId, Vec<VolumeSpec>> {
    let mut systems = IndexMap::<StorageSystemId, Vec<VolumeSpec>>::new();
    for volume in volumes {
        systems.entry(volume.system.clone()).or_default().push(volume);
    }
    systems
}

impl StepBuilder {
    /// Provision the consistency group's replication group on the system unless it has
    /// already been created there. Returns the new frontier and the replication group name.
    pub(crate) fn append_group_precedence(
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        group: &ConsistencyGroupSpec,
        system: &StorageSystemId,
    ) -> (Option<WaitFor>, String) {
        let name = group.group_name_on(system);
        if group.created_on(system, &name) {
            return (wait_for, name);
        }
        let created = workflow.create_step(
            WorkflowStep::new(
                "CreateConsistencyGroup",
                format!("Create replication group '{name}' of consistency group '{}'", group.label),
                system,
                GroupAction::CreateConsistencyGroup {
                    group: group.uuid.clone(),
                    name: name.clone(),
                }
                .into(),
            )
            .wait_for(wait_for)
            .rollback(
                GroupAction::DeleteConsistencyGroup {
                    group: group.uuid.clone(),
                    name: name.clone(),
                }
                .into(),
            )
            .locks(group_locks(group, &name, system)),
        );
        (Some(created), name)
    }

    /// Add the provisioned volumes of one system to the consistency group's replication group.
    pub(crate) fn append_join_group(
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        group: &ConsistencyGroupSpec,
        name: &str,
        system: &StorageSystemId,
        volumes: &[VolumeSpec],
    ) -> WaitFor {
        workflow.create_step(
            WorkflowStep::new(
                "AddToConsistencyGroup",
                format!(
                    "Add {} volume(s) to replication group '{name}' of consistency group '{}'",
                    volumes.len(),
                    group.label
                ),
                system,
                GroupAction::AddToReplicationGroup {
                    group: Some(group.uuid.clone()),
                    name: name.to_string(),
                    members: members(volumes),
                }
                .into(),
            )
            .wait_for(wait_for)
            .rollback(
                GroupAction::RemoveFromReplicationGroup {
                    group: Some(group.uuid.clone()),
                    name: name.to_string(),
                    members: members(volumes),
                }
                .into(),
            )
            .locks(group_locks(group, name, system)),
        )
    }

    /// Remove the volumes from their replication groups, and from the consistency group when
    /// given. The removal of deleted volumes is never undone.
    pub(crate) fn append_leave_group(
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        group: Option<&ConsistencyGroupSpec>,
        volumes: &[VolumeSpec],
        deleting: bool,
    ) -> Option<WaitFor> {
        let label = "RemoveFromConsistencyGroup";
        let mut batches = IndexMap::<(StorageSystemId, String), Vec<VolumeSpec>>::new();
        for volume in volumes {
            let name = match (&volume.replication_group, group) {
                (Some(name), _) => name.clone(),
                (None, Some(group)) => group.group_name_on(&volume.system),
                (None, None) => continue,
            };
            batches
                .entry((volume.system.clone(), name))
                .or_default()
                .push(volume.clone());
        }
        let mut created = false;
        for ((system, name), volumes) in batches {
            let mut locks = vec![LockScope::ReplicationGroup.key(&name, &system)];
            if let Some(group) = group {
                locks.push(LockScope::ConsistencyGroup.key(group.uuid.as_str(), &system));
            }
            let rollback = match deleting {
                true => StepAction::Null,
                false => GroupAction::AddToReplicationGroup {
                    group: group.map(|g| g.uuid.clone()),
                    name: name.clone(),
                    members: members(&volumes),
                }
                .into(),
            };
            workflow.create_step(
                WorkflowStep::new(
                    label,
                    format!(
                        "Remove {} volume(s) from replication group '{name}'",
                        volumes.len()
                    ),
                    &system,
                    GroupAction::RemoveFromReplicationGroup {
                        group: group.map(|g| g.uuid.clone()),
                        name: name.clone(),
                        members: members(&volumes),
                    }
                    .into(),
                )
                .wait_for(wait_for.clone())
                .rollback(rollback)
                .locks(locks),
            );
            created = true;
        }
        Self::frontier(created, label, wait_for)
    }

    /// Update the membership of a consistency group.
    /// Removed volumes leave the group and their replicas leave their replica groups first.
    /// Added volumes join the group, which is provisioned on their system when needed, and
    /// receive the group replicas carried by the surviving members.
    pub async fn update_consistency_group(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        group: &ConsistencyGroupId,
        add: &[VolumeId],
        remove: &[VolumeId],
    ) -> Result<Option<WaitFor>, SvcError> {
        let group = self.repository().get_consistency_group(group).await?;
        if group.inactive {
            return Err(SvcError::InvalidArguments {
                details: format!("Consistency group '{}' has been deleted", group.uuid),
            });
        }
        if let Some(volume) = add.iter().find(|v| remove.contains(v)) {
            return Err(SvcError::InvalidArguments {
                details: format!("Volume '{volume}' cannot be both added and removed"),
            });
        }

        let removed = self.repository().get_volumes(remove).await?;
        if let Some(volume) = removed
            .iter()
            .find(|v| v.consistency_group.as_ref() != Some(&group.uuid))
        {
            return Err(SvcError::InvalidArguments {
                details: format!(
                    "Volume '{}' is not a member of consistency group '{}'",
                    volume.uuid, group.uuid
                ),
            });
        }
        let added = self.repository().get_volumes(add).await?;
        for volume in &added {
            if volume.inactive || !volume.is_provisioned() {
                return Err(SvcError::InvalidArguments {
                    details: format!("Volume '{}' is not an active volume", volume.uuid),
                });
            }
            if volume.consistency_group.is_some() || volume.replication_group.is_some() {
                return Err(SvcError::InvalidArguments {
                    details: format!("Volume '{}' is already a group member", volume.uuid),
                });
            }
        }

        let mut wait_for = wait_for;
        if !removed.is_empty() {
            wait_for = self
                .propagate_removed_members(workflow, wait_for, &removed)
                .await?;
            wait_for = Self::append_leave_group(workflow, wait_for, Some(&group), &removed, false);
        }

        let mut joined = vec![];
        for (system, volumes) in by_system(added) {
            let (frontier, name) =
                Self::append_group_precedence(workflow, wait_for.clone(), &group, &system);
            let join = Self::append_join_group(workflow, frontier, &group, &name, &system, &volumes);
            joined.push((join, system, volumes));
        }
        let created = !joined.is_empty();
        for (join, system, volumes) in joined {
            let propagated = self
                .propagate_added_members(workflow, Some(join), &group, &volumes)
                .await?;
            Self::append_chain_end(workflow, propagated, JOINED, &system);
        }
        Ok(Self::frontier(created, JOINED, wait_for))
    }
}
