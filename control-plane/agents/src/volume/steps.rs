use super::actions::VolumeAction;
use crate::{
    consistency_group::{by_system, JOINED},
    controller::{
        records::RepositoryExt,
        workflow::{StepBuilder, WaitFor, Workflow, WorkflowStep},
    },
    errors::SvcError,
};
use indexmap::IndexMap;
use stor_port::types::v0::{
    store::{consistency_group::ConsistencyGroupSpec, volume::VolumeSpec},
    transport::{ConsistencyGroupId, PoolId, StorageSystemId, VolumeId},
};

const CREATE: &str = "CreateVolumes";

/// Volumes which can be created by a single device call.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
struct CreateBatchKey {
    system: StorageSystemId,
    pool: PoolId,
    size: u64,
    thin: bool,
    meta_member_count: u32,
}

impl From<&VolumeSpec> for CreateBatchKey {
    fn from(volume: &VolumeSpec) -> Self {
        Self {
            system: volume.system.clone(),
            pool: volume.pool.clone(),
            size: volume.size,
            thin: volume.thin,
            meta_member_count: volume.meta_member_count,
        }
    }
}

impl StepBuilder {
    /// Create the requested volumes.
    /// Volumes of a consistency group join its replication group once created, after the
    /// group has been provisioned on their system, and receive the group replicas carried by
    /// the existing members. A missing consistency group is reported as a warning and the
    /// volume is created outside of any group.
    pub async fn create_volumes(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        volumes: Vec<VolumeSpec>,
    ) -> Result<Option<WaitFor>, SvcError> {
        let repository = self.repository();
        let mut members = IndexMap::<ConsistencyGroupId, Vec<VolumeSpec>>::new();
        let mut groups = IndexMap::<ConsistencyGroupId, ConsistencyGroupSpec>::new();
        let mut pending = Vec::with_capacity(volumes.len());
        for mut volume in volumes {
            if volume.size == 0 {
                return Err(SvcError::InvalidArguments {
                    details: format!("Volume '{}' must have a non-zero size", volume.label),
                });
            }
            repository.get_storage_system(&volume.system).await?;
            if let Some(group) = volume.consistency_group.take() {
                match repository.get_consistency_group(&group).await {
                    Ok(spec) if !spec.inactive => {
                        members.entry(group.clone()).or_default().push(volume.clone());
                        groups.insert(group, spec);
                    }
                    Ok(_) | Err(SvcError::NotFound { .. }) => {
                        let warning = format!(
                            "Consistency group '{group}' of volume '{}' does not exist, the volume is created outside of any group",
                            volume.label
                        );
                        tracing::warn!(%warning);
                        workflow.add_warning(warning);
                    }
                    Err(error) => return Err(error),
                }
            }
            volume.native_id = None;
            volume.inactive = false;
            volume.replication_group = None;
            pending.push(volume);
        }
        // nothing is recorded unless every volume is valid
        for volume in &pending {
            repository.put_volume(volume).await?;
        }

        // the groups must exist on the array before any member joins them
        let mut wait_for = wait_for;
        let mut precedence = false;
        let mut names = IndexMap::<(ConsistencyGroupId, StorageSystemId), String>::new();
        for (group, volumes) in &members {
            let Some(spec) = groups.get(group) else {
                continue;
            };
            for system in by_system(volumes.clone()).into_keys() {
                let (frontier, name) =
                    Self::append_group_precedence(workflow, wait_for.clone(), spec, &system);
                precedence |= frontier != wait_for;
                names.insert((group.clone(), system), name);
            }
        }
        if precedence {
            wait_for = Some(WaitFor::group("CreateConsistencyGroup"));
        }

        let mut batches = IndexMap::<CreateBatchKey, Vec<VolumeSpec>>::new();
        for volume in pending {
            batches.entry(CreateBatchKey::from(&volume)).or_default().push(volume);
        }
        let created = !batches.is_empty();
        for (key, volumes) in batches {
            self.append_create_batch(workflow, wait_for.clone(), key, volumes)
                .await?;
        }

        let mut joined = false;
        for (group, volumes) in members {
            let Some(spec) = groups.get(&group) else {
                continue;
            };
            for (system, volumes) in by_system(volumes) {
                let name = names
                    .get(&(group.clone(), system.clone()))
                    .cloned()
                    .unwrap_or_else(|| spec.group_name_on(&system));
                let join = Self::append_join_group(
                    workflow,
                    Some(WaitFor::group(CREATE)),
                    spec,
                    &name,
                    &system,
                    &volumes,
                );
                let propagated = self
                    .propagate_added_members(workflow, Some(join), spec, &volumes)
                    .await?;
                Self::append_chain_end(workflow, propagated, JOINED, &system);
                joined = true;
            }
        }
        match joined {
            true => Ok(Some(WaitFor::group(JOINED))),
            false => Ok(Self::frontier(created, CREATE, wait_for)),
        }
    }

    /// Create a batch of identical volumes with one step. Meta volumes are created along with
    /// their members when the driver supports it, otherwise each member is created by its own
    /// step, after the previous one.
    async fn append_create_batch(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        key: CreateBatchKey,
        volumes: Vec<VolumeSpec>,
    ) -> Result<(), SvcError> {
        let meta = key.meta_member_count > 1;
        let batched = !meta || self.capabilities(&key.system).await?.batched_meta_members;
        let ids = volumes.iter().map(|v| v.uuid.clone()).collect::<Vec<_>>();
        let created = workflow.create_step(
            WorkflowStep::new(
                CREATE,
                format!(
                    "Create {} volume(s) of {} bytes in pool '{}'",
                    ids.len(),
                    key.size,
                    key.pool
                ),
                &key.system,
                VolumeAction::CreateVolumes {
                    pool: key.pool.clone(),
                    volumes: ids.clone(),
                    meta_members: batched,
                }
                .into(),
            )
            .wait_for(wait_for)
            .rollback(VolumeAction::RollbackCreateVolumes { volumes: ids }.into()),
        );
        if batched {
            return Ok(());
        }
        for volume in volumes {
            let mut previous = created.clone();
            for member in 2 ..= key.meta_member_count {
                previous = workflow.create_step(
                    WorkflowStep::new(
                        CREATE,
                        format!("Create meta member {member} of volume '{}'", volume.label),
                        &key.system,
                        VolumeAction::CreateMetaMembers {
                            volume: volume.uuid.clone(),
                            members: vec![member],
                        }
                        .into(),
                    )
                    .wait_for(Some(previous))
                    .rollback(
                        VolumeAction::DeleteMetaMembers {
                            volume: volume.uuid.clone(),
                            members: vec![member],
                        }
                        .into(),
                    ),
                );
            }
        }
        Ok(())
    }

    /// Delete the volumes, dismantling their replicas and group memberships first.
    pub async fn delete_volumes(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        volumes: &[VolumeId],
    ) -> Result<Option<WaitFor>, SvcError> {
        let volumes = self
            .repository()
            .get_volumes(volumes)
            .await?
            .into_iter()
            .filter(|v| !v.inactive)
            .collect::<Vec<_>>();
        if volumes.is_empty() {
            return Ok(wait_for);
        }

        let mut wait_for = self.dismantle_replicas(workflow, wait_for, &volumes).await?;

        let mut grouped = IndexMap::<Option<ConsistencyGroupId>, Vec<VolumeSpec>>::new();
        for volume in volumes.iter().filter(|v| v.replication_group.is_some()) {
            grouped
                .entry(volume.consistency_group.clone())
                .or_default()
                .push(volume.clone());
        }
        for (group, members) in grouped {
            let spec = match group {
                Some(group) => Some(self.repository().get_consistency_group(&group).await?),
                None => None,
            };
            wait_for = Self::append_leave_group(workflow, wait_for, spec.as_ref(), &members, true);
        }

        let mut created = false;
        for (system, volumes) in by_system(volumes) {
            workflow.create_step(
                WorkflowStep::new(
                    "DeleteVolumes",
                    format!("Delete {} volume(s)", volumes.len()),
                    &system,
                    VolumeAction::DeleteVolumes {
                        volumes: volumes.iter().map(|v| v.uuid.clone()).collect(),
                    }
                    .into(),
                )
                .wait_for(wait_for.clone()),
            );
            created = true;
        }
        Ok(Self::frontier(created, "DeleteVolumes", wait_for))
    }

    /// Expand the volumes to the given size.
    pub async fn expand_volumes(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        volumes: &[VolumeId],
        size: u64,
    ) -> Result<Option<WaitFor>, SvcError> {
        let volumes = self.repository().get_volumes(volumes).await?;
        if let Some(volume) = volumes.iter().find(|v| v.inactive || v.size >= size) {
            return Err(SvcError::InvalidArguments {
                details: format!(
                    "Volume '{}' of {} bytes cannot be expanded to {size} bytes",
                    volume.uuid, volume.size
                ),
            });
        }
        let mut created = false;
        for volume in volumes {
            workflow.create_step(
                WorkflowStep::new(
                    "ExpandVolumes",
                    format!("Expand volume '{}' to {size} bytes", volume.label),
                    &volume.system,
                    VolumeAction::ExpandVolume {
                        volume: volume.uuid.clone(),
                        size,
                    }
                    .into(),
                )
                .wait_for(wait_for.clone()),
            );
            created = true;
        }
        Ok(Self::frontier(created, "ExpandVolumes", wait_for))
    }
}
