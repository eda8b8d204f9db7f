use crate::{
    controller::{records::RepositoryExt, workflow::StepContext},
    errors::SvcError,
};
use serde::{Deserialize, Serialize};
use stor_port::{
    transport_api::{ErrorChain, ResourceKind},
    types::v0::{
        store::{replica::ReplicaSpec, volume::VolumeSpec, ResourceId},
        transport::ConsistencyGroupId,
    },
};

/// Array group commands run by workflow steps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum GroupAction {
    /// Provision the replication group `name` of the consistency group, unless it already exists.
    CreateConsistencyGroup {
        group: ConsistencyGroupId,
        name: String,
    },
    DeleteConsistencyGroup {
        group: ConsistencyGroupId,
        name: String,
    },
    /// Add volumes or replicas to the replication group `name`. Volumes also join the
    /// consistency group, if given.
    AddToReplicationGroup {
        group: Option<ConsistencyGroupId>,
        name: String,
        members: Vec<ResourceId>,
    },
    /// Remove volumes or replicas from the replication group `name`. Volumes also leave the
    /// consistency group, if given.
    RemoveFromReplicationGroup {
        group: Option<ConsistencyGroupId>,
        name: String,
        members: Vec<ResourceId>,
    },
    /// Remove replicas from the replication group `name`, deleting the group on the array
    /// when they were its last members. Both happen under the group lock, so concurrent
    /// removals delete an emptied group exactly once.
    LeaveReplicationGroup {
        name: String,
        members: Vec<ResourceId>,
    },
    /// Undo `LeaveReplicationGroup`: the replicas rejoin the group, unless it was deleted
    /// when it lost its last member, in which case they stay standalone.
    RejoinReplicationGroup {
        name: String,
        members: Vec<ResourceId>,
    },
}

impl GroupAction {
    pub(crate) async fn execute(&self, ctx: &StepContext<'_>) -> Result<(), SvcError> {
        match self {
            Self::CreateConsistencyGroup { group, name } => create(ctx, group, name).await,
            Self::DeleteConsistencyGroup { group, name } => delete(ctx, group, name).await,
            Self::AddToReplicationGroup {
                group,
                name,
                members,
            } => add_members(ctx, group.as_ref(), name, members).await,
            Self::RemoveFromReplicationGroup {
                group,
                name,
                members,
            } => remove_members(ctx, group.as_ref(), name, members).await,
            Self::LeaveReplicationGroup { name, members } => {
                leave_replica_group(ctx, name, members).await
            }
            Self::RejoinReplicationGroup { name, members } => {
                rejoin_replica_group(ctx, name, members).await
            }
        }
    }
}

async fn create(
    ctx: &StepContext<'_>,
    group: &ConsistencyGroupId,
    name: &str,
) -> Result<(), SvcError> {
    let repository = ctx.repository();
    let mut group = repository.get_consistency_group(group).await?;
    if group.created_on(ctx.system(), name) {
        tracing::debug!(
            consistency_group.id=%group.uuid,
            name,
            "Replication group already exists on the storage system"
        );
        return Ok(());
    }
    let device = ctx.device().await?;
    let result = device
        .run(
            "create:consistencyGroup",
            device
                .driver()
                .create_consistency_group(ctx.system(), &group, name),
        )
        .await;
    result?;
    group.add_system_group(ctx.system(), name);
    repository.put_consistency_group(&group).await?;
    tracing::info!(consistency_group.id=%group.uuid, name, storage.system=%ctx.system(), "Created replication group");
    Ok(())
}

async fn delete(
    ctx: &StepContext<'_>,
    group: &ConsistencyGroupId,
    name: &str,
) -> Result<(), SvcError> {
    let repository = ctx.repository();
    let mut group = repository.get_consistency_group(group).await?;
    if !group.created_on(ctx.system(), name) {
        return Ok(());
    }
    let device = ctx.device().await?;
    let result = device
        .run(
            "delete:consistencyGroup",
            device
                .driver()
                .delete_consistency_group(ctx.system(), &group, name),
        )
        .await;
    match result {
        Ok(_) => {}
        Err(error) if error.is_stale_reference() => {
            tracing::warn!(error=%error.full_string(), "Replication group is already gone");
        }
        Err(error) => return Err(error),
    }
    group.remove_system_group(ctx.system(), name);
    repository.put_consistency_group(&group).await?;
    tracing::info!(consistency_group.id=%group.uuid, name, storage.system=%ctx.system(), "Deleted replication group");
    Ok(())
}

/// Records of the replication group members.
#[derive(Default)]
struct Members {
    volumes: Vec<VolumeSpec>,
    replicas: Vec<ReplicaSpec>,
}

impl Members {
    async fn load(ctx: &StepContext<'_>, members: &[ResourceId]) -> Result<Self, SvcError> {
        let repository = ctx.repository();
        let mut loaded = Self::default();
        for member in members {
            match member {
                ResourceId::Volume(id) => loaded.volumes.push(repository.get_volume(id).await?),
                ResourceId::Replica(id) => loaded.replicas.push(repository.get_replica(id).await?),
                other => {
                    return Err(SvcError::InvalidArguments {
                        details: format!("'{other}' cannot be a replication group member"),
                    })
                }
            }
        }
        Ok(loaded)
    }

    /// Native ids of the provisioned members.
    fn native_ids(&self) -> Vec<String> {
        let volumes = self.volumes.iter().filter_map(|v| v.native_id.clone());
        let replicas = self.replicas.iter().filter_map(|r| r.native_id.clone());
        volumes.chain(replicas).collect()
    }

    /// Fail if any member has not been provisioned yet.
    fn ensure_provisioned(&self) -> Result<(), SvcError> {
        if let Some(volume) = self.volumes.iter().find(|v| !v.is_provisioned()) {
            return Err(SvcError::NotProvisioned {
                kind: ResourceKind::Volume,
                id: volume.uuid.to_string(),
            });
        }
        if let Some(replica) = self.replicas.iter().find(|r| r.is_pending()) {
            return Err(SvcError::NotProvisioned {
                kind: replica.kind().into(),
                id: replica.uuid.to_string(),
            });
        }
        Ok(())
    }

    async fn store(&self, ctx: &StepContext<'_>) -> Result<(), SvcError> {
        let repository = ctx.repository();
        for volume in &self.volumes {
            repository.put_volume(volume).await?;
        }
        for replica in &self.replicas {
            repository.put_replica(replica).await?;
        }
        Ok(())
    }
}

async fn add_members(
    ctx: &StepContext<'_>,
    group: Option<&ConsistencyGroupId>,
    name: &str,
    members: &[ResourceId],
) -> Result<(), SvcError> {
    let mut loaded = Members::load(ctx, members).await?;
    loaded.ensure_provisioned()?;

    let device = ctx.device().await?;
    let native_ids = loaded.native_ids();
    let result = device
        .run(
            "add:replicationGroup",
            device
                .driver()
                .add_to_replication_group(ctx.system(), name, &native_ids),
        )
        .await;
    result?;

    for volume in &mut loaded.volumes {
        volume.replication_group = Some(name.to_string());
        if let Some(group) = group {
            volume.consistency_group = Some(group.clone());
        }
    }
    for replica in &mut loaded.replicas {
        replica.replication_group = Some(name.to_string());
    }
    loaded.store(ctx).await?;
    tracing::info!(
        replication_group = name,
        storage.system = %ctx.system(),
        members = members.len(),
        "Added members to the replication group"
    );
    Ok(())
}

async fn remove_members(
    ctx: &StepContext<'_>,
    group: Option<&ConsistencyGroupId>,
    name: &str,
    members: &[ResourceId],
) -> Result<(), SvcError> {
    let mut loaded = Members::load(ctx, members).await?;
    let native_ids = loaded.native_ids();
    if !native_ids.is_empty() {
        let device = ctx.device().await?;
        let result = device
            .run(
                "remove:replicationGroup",
                device
                    .driver()
                    .remove_from_replication_group(ctx.system(), name, &native_ids),
            )
            .await;
        match result {
            Ok(_) => {}
            Err(error) if error.is_stale_reference() => {
                tracing::warn!(error=%error.full_string(), "Members already left the replication group");
            }
            Err(error) => return Err(error),
        }
    }

    for volume in &mut loaded.volumes {
        volume.replication_group = None;
        if group.is_some() {
            volume.consistency_group = None;
        }
    }
    for replica in &mut loaded.replicas {
        replica.replication_group = None;
    }
    loaded.store(ctx).await?;
    tracing::info!(
        replication_group = name,
        storage.system = %ctx.system(),
        members = members.len(),
        "Removed members from the replication group"
    );
    Ok(())
}

async fn delete_replication_group(ctx: &StepContext<'_>, name: &str) -> Result<(), SvcError> {
    let device = ctx.device().await?;
    let result = device
        .run(
            "delete:replicationGroup",
            device.driver().delete_replication_group(ctx.system(), name),
        )
        .await;
    match result {
        Ok(_) => {
            tracing::info!(replication_group = name, storage.system = %ctx.system(), "Deleted replication group");
            Ok(())
        }
        Err(error) if error.is_stale_reference() => Ok(()),
        Err(error) => Err(error),
    }
}

async fn leave_replica_group(
    ctx: &StepContext<'_>,
    name: &str,
    members: &[ResourceId],
) -> Result<(), SvcError> {
    remove_members(ctx, None, name, members).await?;
    let remaining = ctx
        .repository()
        .replicas_in_replication_group(ctx.system(), name)
        .await?;
    if remaining.is_empty() {
        delete_replication_group(ctx, name).await?;
    } else {
        tracing::debug!(
            replication_group = name,
            remaining = remaining.len(),
            "Replication group keeps members"
        );
    }
    Ok(())
}

async fn rejoin_replica_group(
    ctx: &StepContext<'_>,
    name: &str,
    members: &[ResourceId],
) -> Result<(), SvcError> {
    let remaining = ctx
        .repository()
        .replicas_in_replication_group(ctx.system(), name)
        .await?;
    if remaining.is_empty() {
        tracing::warn!(
            replication_group = name,
            storage.system = %ctx.system(),
            members = members.len(),
            "Replication group was deleted with its last member, the replicas stay standalone"
        );
        return Ok(());
    }
    add_members(ctx, None, name, members).await
}
