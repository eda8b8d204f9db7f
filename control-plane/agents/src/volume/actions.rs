use crate::{
    controller::{driver::VolumeCapabilities, records::RepositoryExt, workflow::StepContext},
    errors::SvcError,
};
use serde::{Deserialize, Serialize};
use stor_port::{
    transport_api::{ErrorChain, ResourceKind},
    types::v0::{
        store::{volume::VolumeSpec, Repository, ResourceId},
        transport::{PoolId, VolumeId},
    },
};

/// Volume commands run by workflow steps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum VolumeAction {
    /// Create pending volumes sharing pool and attributes with a single device call.
    /// Meta volumes are created along with their members only with `meta_members`.
    CreateVolumes {
        pool: PoolId,
        volumes: Vec<VolumeId>,
        meta_members: bool,
    },
    /// Undo the creation of the volumes.
    RollbackCreateVolumes { volumes: Vec<VolumeId> },
    CreateMetaMembers { volume: VolumeId, members: Vec<u32> },
    DeleteMetaMembers { volume: VolumeId, members: Vec<u32> },
    DeleteVolumes { volumes: Vec<VolumeId> },
    ExpandVolume { volume: VolumeId, size: u64 },
}

impl VolumeAction {
    pub(crate) async fn execute(&self, ctx: &StepContext<'_>) -> Result<(), SvcError> {
        match self {
            Self::CreateVolumes {
                pool,
                volumes,
                meta_members,
            } => create(ctx, pool, volumes, *meta_members).await,
            Self::RollbackCreateVolumes { volumes } => rollback_create(ctx, volumes).await,
            Self::CreateMetaMembers { volume, members } => {
                create_members(ctx, volume, members).await
            }
            Self::DeleteMetaMembers { volume, members } => {
                delete_members(ctx, volume, members).await
            }
            Self::DeleteVolumes { volumes } => delete(ctx, volumes).await,
            Self::ExpandVolume { volume, size } => expand(ctx, volume, *size).await,
        }
    }
}

/// Soft-delete the volume records.
async fn retire(repository: &dyn Repository, volumes: &mut [VolumeSpec]) -> Result<(), SvcError> {
    for volume in volumes {
        volume.inactive = true;
        repository.put_volume(volume).await?;
        tracing::debug!(volume.id=%volume.uuid, "Volume record marked inactive");
    }
    Ok(())
}

async fn create(
    ctx: &StepContext<'_>,
    pool: &PoolId,
    ids: &[VolumeId],
    meta_members: bool,
) -> Result<(), SvcError> {
    let repository = ctx.repository();
    let mut volumes = repository.get_volumes(ids).await?;
    let Some(first) = volumes.first() else {
        return Ok(());
    };
    let mut capabilities = VolumeCapabilities::from(first);
    if !meta_members {
        capabilities.meta_member_count = 0;
    }

    let device = ctx.device().await?;
    let result = device
        .run(
            "create:volumes",
            device
                .driver()
                .create_volumes(ctx.system(), pool, &volumes, &capabilities),
        )
        .await;
    let native_ids = match result {
        Ok(native_ids) => native_ids,
        Err(error) => {
            retire(repository, &mut volumes).await?;
            return Err(error);
        }
    };

    let mut missing = None;
    for volume in &mut volumes {
        match native_ids.get(volume.uuid.as_str()) {
            Some(native_id) => {
                volume.native_id = Some(native_id.clone());
                // the head volume is the first member
                if volume.is_meta() {
                    volume.meta_members = match meta_members {
                        true => (1 ..= volume.meta_member_count).collect(),
                        false => [1].into(),
                    };
                }
                repository.put_volume(volume).await?;
                tracing::info!(volume.id=%volume.uuid, volume.native_id=%native_id, "Volume created");
            }
            None => {
                missing.get_or_insert_with(|| volume.uuid.clone());
                retire(repository, std::slice::from_mut(volume)).await?;
            }
        }
    }
    let Some(id) = missing else {
        return Ok(());
    };
    // the step fails without its compensation, so the provisioned part of the batch goes now
    let mut created = volumes
        .into_iter()
        .filter(|v| !v.inactive)
        .collect::<Vec<_>>();
    if let Err(error) = delete_provisioned(ctx, "rollback:volumes", &mut created).await {
        tracing::error!(
            error=%error.full_string(),
            "Failed to delete the volumes created along with a volume missing its native id"
        );
    }
    Err(SvcError::MissingNativeId {
        operation: "create:volumes".to_string(),
        system: ctx.system().clone(),
        kind: ResourceKind::Volume,
        id: id.to_string(),
    })
}

/// Delete the provisioned volumes on the array, while pending ones are only marked inactive.
async fn delete_provisioned(
    ctx: &StepContext<'_>,
    operation: &str,
    volumes: &mut [VolumeSpec],
) -> Result<(), SvcError> {
    let repository = ctx.repository();
    let provisioned = volumes
        .iter()
        .filter(|v| v.is_provisioned())
        .cloned()
        .collect::<Vec<_>>();
    if !provisioned.is_empty() {
        let device = ctx.device().await?;
        let result = device
            .run(
                operation,
                device.driver().delete_volumes(ctx.system(), &provisioned),
            )
            .await;
        match result {
            Ok(_) => {}
            Err(error) if error.is_stale_reference() => {
                tracing::warn!(error=%error.full_string(), "Volumes are already gone");
            }
            Err(error) => return Err(error),
        }
    }
    retire(repository, volumes).await
}

async fn rollback_create(ctx: &StepContext<'_>, ids: &[VolumeId]) -> Result<(), SvcError> {
    let mut volumes = active_volumes(ctx.repository(), ids).await?;
    delete_provisioned(ctx, "rollback:volumes", &mut volumes).await
}

async fn delete(ctx: &StepContext<'_>, ids: &[VolumeId]) -> Result<(), SvcError> {
    let mut volumes = active_volumes(ctx.repository(), ids).await?;
    delete_provisioned(ctx, "delete:volumes", &mut volumes).await?;
    for volume in &volumes {
        ctx.completer()
            .entity_ready(&ResourceId::from(&volume.uuid))
            .await?;
    }
    Ok(())
}

async fn active_volumes(
    repository: &dyn Repository,
    ids: &[VolumeId],
) -> Result<Vec<VolumeSpec>, SvcError> {
    let mut volumes = Vec::with_capacity(ids.len());
    for id in ids {
        match repository.get_volume(id).await {
            Ok(volume) if !volume.inactive => volumes.push(volume),
            Ok(_) => {}
            Err(error) if error.is_stale_reference() => {
                tracing::warn!(volume.id=%id, "Skipping stale volume reference");
            }
            Err(error) => return Err(error),
        }
    }
    Ok(volumes)
}

fn provisioned(volume: VolumeSpec) -> Result<VolumeSpec, SvcError> {
    match volume.is_provisioned() {
        true => Ok(volume),
        false => Err(SvcError::NotProvisioned {
            kind: ResourceKind::Volume,
            id: volume.uuid.to_string(),
        }),
    }
}

async fn create_members(
    ctx: &StepContext<'_>,
    volume: &VolumeId,
    members: &[u32],
) -> Result<(), SvcError> {
    let repository = ctx.repository();
    let mut volume = provisioned(repository.get_volume(volume).await?)?;
    let device = ctx.device().await?;
    let result = device
        .run(
            "create:metaMembers",
            device
                .driver()
                .create_meta_members(ctx.system(), &volume, members),
        )
        .await;
    let native_ids = result?;
    for member in members {
        let key = format!("{}/{member}", volume.uuid);
        if native_ids.contains_key(&key) {
            volume.meta_members.insert(*member);
        }
    }
    repository.put_volume(&volume).await?;
    match members.iter().find(|m| !volume.meta_members.contains(m)) {
        Some(member) => Err(SvcError::MissingNativeId {
            operation: "create:metaMembers".to_string(),
            system: ctx.system().clone(),
            kind: ResourceKind::Volume,
            id: format!("{}/{member}", volume.uuid),
        }),
        None => Ok(()),
    }
}

async fn delete_members(
    ctx: &StepContext<'_>,
    volume: &VolumeId,
    members: &[u32],
) -> Result<(), SvcError> {
    let repository = ctx.repository();
    let mut volume = repository.get_volume(volume).await?;
    let created = members
        .iter()
        .copied()
        .filter(|m| volume.meta_members.contains(m))
        .collect::<Vec<_>>();
    if created.is_empty() {
        return Ok(());
    }
    let device = ctx.device().await?;
    let result = device
        .run(
            "delete:metaMembers",
            device
                .driver()
                .delete_meta_members(ctx.system(), &volume, &created),
        )
        .await;
    match result {
        Err(error) if !error.is_stale_reference() => return Err(error),
        _ => {}
    }
    for member in created {
        volume.meta_members.remove(&member);
    }
    repository.put_volume(&volume).await?;
    Ok(())
}

async fn expand(ctx: &StepContext<'_>, volume: &VolumeId, size: u64) -> Result<(), SvcError> {
    let repository = ctx.repository();
    let mut volume = provisioned(repository.get_volume(volume).await?)?;
    if volume.size >= size {
        return Ok(());
    }
    let device = ctx.device().await?;
    let result = device
        .run(
            "expand:volume",
            device.driver().expand_volume(ctx.system(), &volume, size),
        )
        .await;
    result?;
    tracing::info!(volume.id=%volume.uuid, from=volume.size, to=size, "Volume expanded");
    volume.size = size;
    repository.put_volume(&volume).await?;
    Ok(())
}
