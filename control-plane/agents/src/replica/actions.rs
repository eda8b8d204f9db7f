use super::{
    session,
    state::{guard, next_state, ReplicaOperation},
};
use crate::{
    controller::{
        driver::{DeviceDriver, DriverResult},
        records::RepositoryExt,
        workflow::{StepContext, StepId},
    },
    errors::SvcError,
};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use stor_port::{
    transport_api::{ErrorChain, ResourceKind},
    types::v0::{
        store::{
            replica::{ReplicaSource, ReplicaSpec, ReplicaState},
            volume::VolumeSpec,
            Repository, ResourceId,
        },
        transport::{ReplicaId, ReplicaKind, StorageSystemId, VolumeId},
    },
};

/// Replica commands run by workflow steps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ReplicaAction {
    /// Apply the lifecycle operation to a batch of replicas of the same kind, as a single
    /// array group operation when `grouped`.
    Transition {
        kind: ReplicaKind,
        operation: ReplicaOperation,
        replicas: Vec<ReplicaId>,
        grouped: bool,
    },
    /// Undo the creation of the replicas.
    RollbackCreate { replicas: Vec<ReplicaId> },
    /// Wait until the replicas are synchronized with their sources.
    WaitForSynchronization { replicas: Vec<ReplicaId> },
    /// Register detached mirrors as standalone volumes.
    PromoteMirrors { mirrors: Vec<ReplicaId> },
    CreateSnapshotSession { session: ReplicaId },
    LinkTargets {
        session: ReplicaId,
        targets: Vec<ReplicaId>,
    },
    RelinkTargets {
        session: ReplicaId,
        targets: Vec<ReplicaId>,
    },
    UnlinkTargets {
        session: ReplicaId,
        targets: Vec<ReplicaId>,
        delete_targets: bool,
    },
    RestoreSession { session: ReplicaId },
    DeleteSnapshotSession { session: ReplicaId },
    /// Restore the source volume directly from its linked target.
    RestoreFromTarget { target: ReplicaId },
    TerminateRestoreSessions { volume: VolumeId },
    /// Create a session on the linked target, recording its native id as step data.
    CreateTemporarySession { target: ReplicaId },
    LinkSourceToTemporarySession { session_step: StepId, volume: VolumeId },
    WaitForTemporaryLink { session_step: StepId, volume: VolumeId },
    UnlinkSourceFromTemporarySession { session_step: StepId, volume: VolumeId },
    DeleteTemporarySession { session_step: StepId },
}

impl ReplicaAction {
    pub(crate) async fn execute(&self, ctx: &StepContext<'_>) -> Result<(), SvcError> {
        match self {
            Self::Transition {
                kind,
                operation,
                replicas,
                grouped,
            } => transition(ctx, *kind, *operation, replicas, *grouped).await,
            Self::RollbackCreate { replicas } => rollback_create(ctx, replicas).await,
            Self::WaitForSynchronization { replicas } => wait_for_sync(ctx, replicas).await,
            Self::PromoteMirrors { mirrors } => promote_mirrors(ctx, mirrors).await,
            Self::CreateSnapshotSession { session } => session::create(ctx, session).await,
            Self::LinkTargets { session, targets } => {
                session::link_targets(ctx, session, targets).await
            }
            Self::RelinkTargets { session, targets } => {
                session::relink_targets(ctx, session, targets).await
            }
            Self::UnlinkTargets {
                session,
                targets,
                delete_targets,
            } => session::unlink_targets(ctx, session, targets, *delete_targets).await,
            Self::RestoreSession { session } => session::restore(ctx, session).await,
            Self::DeleteSnapshotSession { session } => session::delete(ctx, session).await,
            Self::RestoreFromTarget { target } => session::restore_from_target(ctx, target).await,
            Self::TerminateRestoreSessions { volume } => {
                session::terminate_restore_sessions(ctx, volume).await
            }
            Self::CreateTemporarySession { target } => {
                session::create_temporary(ctx, target).await
            }
            Self::LinkSourceToTemporarySession {
                session_step,
                volume,
            } => session::link_source(ctx, session_step, volume).await,
            Self::WaitForTemporaryLink {
                session_step,
                volume,
            } => session::wait_for_link(ctx, session_step, volume).await,
            Self::UnlinkSourceFromTemporarySession {
                session_step,
                volume,
            } => session::unlink_source(ctx, session_step, volume).await,
            Self::DeleteTemporarySession { session_step } => {
                session::delete_temporary(ctx, session_step).await
            }
        }
    }
}

/// Name of the device operation, used in logs and errors.
pub(super) fn operation_name(kind: ReplicaKind, operation: ReplicaOperation) -> String {
    format!("{operation}:{kind}")
}

/// The driver call of a batch operation, `None` if the transition only changes the record.
fn dispatch<'a>(
    driver: &'a dyn DeviceDriver,
    system: &'a StorageSystemId,
    kind: ReplicaKind,
    operation: ReplicaOperation,
    replicas: &'a [ReplicaSpec],
    grouped: bool,
) -> Result<Option<BoxFuture<'a, DriverResult>>, SvcError> {
    use ReplicaKind as Kind;
    use ReplicaOperation as Op;
    let call = match (kind, operation) {
        (_, Op::Synchronized) | (Kind::Mirror, Op::Activate) => return Ok(None),
        (Kind::Mirror, Op::Create) => driver.create_mirrors(system, replicas, grouped),
        (Kind::Mirror, Op::Fracture) => driver.fracture_mirrors(system, replicas, grouped),
        (Kind::Mirror, Op::Resume) => driver.resume_mirrors(system, replicas, grouped),
        (Kind::Mirror, Op::Detach) => driver.detach_mirrors(system, replicas, grouped),
        (Kind::Mirror, Op::Delete) => driver.delete_mirrors(system, replicas, grouped),
        (Kind::FullCopy, Op::Create) => driver.create_full_copies(system, replicas, grouped),
        (Kind::FullCopy, Op::Activate) => driver.activate_full_copies(system, replicas, grouped),
        (Kind::FullCopy, Op::Fracture) => driver.fracture_full_copies(system, replicas, grouped),
        (Kind::FullCopy, Op::Resync) => driver.resync_full_copies(system, replicas, grouped),
        (Kind::FullCopy, Op::Restore) => {
            driver.restore_from_full_copies(system, replicas, grouped)
        }
        (Kind::FullCopy, Op::Detach) => driver.detach_full_copies(system, replicas, grouped),
        (Kind::FullCopy, Op::Delete) => driver.delete_full_copies(system, replicas, grouped),
        (Kind::Snapshot, Op::Create) => driver.create_snapshots(system, replicas, grouped),
        (Kind::Snapshot, Op::Activate) => driver.activate_snapshots(system, replicas, grouped),
        (Kind::Snapshot, Op::Restore) => driver.restore_snapshots(system, replicas, grouped),
        (Kind::Snapshot, Op::Resync) => driver.resync_snapshots(system, replicas, grouped),
        (Kind::Snapshot, Op::Delete) => driver.delete_snapshots(system, replicas, grouped),
        _ => {
            return Err(SvcError::Internal {
                details: format!("'{operation}' is not a batch operation of a {kind}"),
            })
        }
    };
    Ok(Some(call))
}

/// Retire the replica: soft delete its record and drop the references to it.
pub(super) async fn retire(
    repository: &dyn Repository,
    replica: &mut ReplicaSpec,
) -> Result<(), SvcError> {
    replica.inactive = true;
    repository.put_replica(replica).await?;
    release_references(repository, replica).await
}

/// Drop the references held by the source volumes, and by the session of a linked target.
pub(super) async fn release_references(
    repository: &dyn Repository,
    replica: &ReplicaSpec,
) -> Result<(), SvcError> {
    let volumes = match &replica.source {
        ReplicaSource::Volume(id) => match repository.get_volume(id).await {
            Ok(volume) => vec![volume],
            Err(error) if error.is_stale_reference() => vec![],
            Err(error) => return Err(error),
        },
        ReplicaSource::ReplicationGroup(name) => {
            repository
                .volumes_in_replication_group(&replica.system, name)
                .await?
        }
    };
    for mut volume in volumes {
        if volume.replica_refs_mut(replica.kind()).remove(&replica.uuid) {
            repository.put_volume(&volume).await?;
        }
    }
    if let Some(session) = &replica.session {
        match repository.get_replica(session).await {
            Ok(mut session) => {
                if session.linked_targets.remove(&replica.uuid) {
                    session::settle_link_state(&mut session);
                    repository.put_replica(&session).await?;
                }
            }
            Err(error) if error.is_stale_reference() => {}
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

/// Retire the replicas which were never provisioned on the array.
pub(super) async fn abandon(
    repository: &dyn Repository,
    replicas: &mut [ReplicaSpec],
) -> Result<(), SvcError> {
    for replica in replicas.iter_mut().filter(|r| r.is_pending()) {
        tracing::debug!(replica.id=%replica.uuid, "Abandoning pending replica");
        retire(repository, replica).await?;
    }
    Ok(())
}

async fn transition(
    ctx: &StepContext<'_>,
    kind: ReplicaKind,
    operation: ReplicaOperation,
    ids: &[ReplicaId],
    grouped: bool,
) -> Result<(), SvcError> {
    let repository = ctx.repository();
    let mut replicas = match operation {
        ReplicaOperation::Delete => repository.active_replicas(ids).await?,
        _ => repository.get_replicas(ids).await?,
    };
    if let Some(replica) = replicas.iter().find(|r| r.kind() != kind) {
        return Err(SvcError::InvalidArguments {
            details: format!("Replica '{}' is a {}, not a {kind}", replica.uuid, replica.kind()),
        });
    }
    // no device call unless every replica allows the transition
    let states = replicas
        .iter()
        .map(|replica| guard(replica, operation))
        .collect::<Result<Vec<_>, _>>()?;

    if operation == ReplicaOperation::Create {
        return create(ctx, kind, replicas, grouped).await;
    }
    if operation != ReplicaOperation::Delete {
        if let Some(pending) = replicas.iter().find(|r| r.is_pending()) {
            return Err(SvcError::NotProvisioned {
                kind: kind.into(),
                id: pending.uuid.to_string(),
            });
        }
    }

    let provisioned = replicas
        .iter()
        .filter(|r| !r.is_pending())
        .cloned()
        .collect::<Vec<_>>();
    if !provisioned.is_empty() {
        let device = ctx.device().await?;
        let name = operation_name(kind, operation);
        let call = dispatch(
            device.driver(),
            ctx.system(),
            kind,
            operation,
            &provisioned,
            grouped,
        )?;
        if let Some(call) = call {
            let result = device.run(&name, call).await;
            match result {
                Err(error) if operation == ReplicaOperation::Delete && error.is_stale_reference() => {
                    tracing::warn!(error=%error.full_string(), "Replicas are already gone");
                }
                result => {
                    result?;
                }
            }
        }
    }

    for (replica, state) in replicas.iter_mut().zip(states) {
        replica.state = state;
        match operation {
            ReplicaOperation::Delete => {
                retire(repository, replica).await?;
                ctx.completer()
                    .entity_ready(&ResourceId::from(&replica.uuid))
                    .await?;
            }
            _ => repository.put_replica(replica).await?,
        }
    }
    tracing::info!(
        replicas = %ids.iter().join(","),
        %kind,
        %operation,
        "Replica transition completed"
    );
    Ok(())
}

async fn create(
    ctx: &StepContext<'_>,
    kind: ReplicaKind,
    mut replicas: Vec<ReplicaSpec>,
    grouped: bool,
) -> Result<(), SvcError> {
    let repository = ctx.repository();
    let device = ctx.device().await?;
    let name = operation_name(kind, ReplicaOperation::Create);
    let requested = replicas.clone();
    let result = match dispatch(
        device.driver(),
        ctx.system(),
        kind,
        ReplicaOperation::Create,
        &requested,
        grouped,
    )? {
        Some(call) => device.run(&name, call).await,
        None => Ok(Default::default()),
    };
    let ids = match result {
        Ok(ids) => ids,
        Err(error) => {
            abandon(repository, &mut replicas).await?;
            return Err(error);
        }
    };

    let mut missing = None;
    let mut created = vec![];
    for replica in &mut replicas {
        match ids.get(replica.uuid.as_str()) {
            Some(native_id) => {
                replica.native_id = Some(native_id.clone());
                replica.state = created_state(replica.state);
                repository.put_replica(replica).await?;
                created.push(replica.uuid.clone());
            }
            None => {
                missing.get_or_insert_with(|| replica.uuid.clone());
                retire(repository, replica).await?;
            }
        }
    }
    let Some(id) = missing else {
        return Ok(());
    };
    // the step fails without its compensation, so the provisioned part of the batch goes now
    if let Err(error) = rollback_create(ctx, &created).await {
        tracing::error!(
            error=%error.full_string(),
            "Failed to delete the replicas created along with a replica missing its native id"
        );
    }
    Err(SvcError::MissingNativeId {
        operation: name,
        system: ctx.system().clone(),
        kind: kind.into(),
        id: id.to_string(),
    })
}

/// The state after creation; mirrors start synchronizing as soon as they exist.
fn created_state(state: ReplicaState) -> ReplicaState {
    let created = next_state(state, ReplicaOperation::Create).unwrap_or(state);
    match created {
        ReplicaState::Mirror(_) => next_state(created, ReplicaOperation::Activate).unwrap_or(created),
        _ => created,
    }
}

async fn rollback_create(ctx: &StepContext<'_>, ids: &[ReplicaId]) -> Result<(), SvcError> {
    let repository = ctx.repository();
    let mut replicas = repository.active_replicas(ids).await?;
    abandon(repository, &mut replicas).await?;

    let provisioned = replicas
        .into_iter()
        .filter(|r| !r.inactive && !r.is_pending())
        .collect::<Vec<_>>();
    if provisioned.is_empty() {
        return Ok(());
    }
    let device = ctx.device().await?;
    // batches of the same kind, linked targets batched per session
    let mut batches = IndexMap::<(ReplicaKind, Option<ReplicaId>), Vec<ReplicaSpec>>::new();
    for replica in provisioned {
        batches
            .entry((replica.kind(), replica.session.clone()))
            .or_default()
            .push(replica);
    }
    let mut groups = vec![];
    for ((kind, session), batch) in batches {
        let name = operation_name(kind, ReplicaOperation::Delete);
        let result = match (&session, kind) {
            (Some(session), _) => session::unlink_and_delete(ctx, &device, session, &batch).await,
            (None, ReplicaKind::SnapshotSession) => {
                let mut result = Ok(Default::default());
                for session in &batch {
                    let native = session.native_id.clone().unwrap_or_default();
                    result = device
                        .run(&name, device.driver().delete_session(ctx.system(), &native))
                        .await;
                    if result.is_err() {
                        break;
                    }
                }
                result
            }
            (None, _) => {
                match dispatch(
                    device.driver(),
                    ctx.system(),
                    kind,
                    ReplicaOperation::Delete,
                    &batch,
                    false,
                )? {
                    Some(call) => device.run(&name, call).await,
                    None => Ok(Default::default()),
                }
            }
        };
        match result {
            Ok(_) => {}
            Err(error) if error.is_stale_reference() => {
                tracing::warn!(error=%error.full_string(), "Replicas are already gone");
            }
            Err(error) => return Err(error),
        }
        for mut replica in batch {
            if let Some(group) = &replica.replication_group {
                if !groups.contains(group) {
                    groups.push(group.clone());
                }
            }
            retire(repository, &mut replica).await?;
        }
    }

    // a group created along with its replicas goes along with them
    for group in groups {
        let remaining = repository
            .replicas_in_replication_group(ctx.system(), &group)
            .await?;
        if !remaining.is_empty() {
            continue;
        }
        let result = device
            .run(
                "delete:replicationGroup",
                device.driver().delete_replication_group(ctx.system(), &group),
            )
            .await;
        match result {
            Err(error) if !error.is_stale_reference() => return Err(error),
            _ => tracing::info!(group, "Deleted the emptied replication group"),
        }
    }
    Ok(())
}

async fn wait_for_sync(ctx: &StepContext<'_>, ids: &[ReplicaId]) -> Result<(), SvcError> {
    let repository = ctx.repository();
    let device = ctx.device().await?;
    for mut replica in repository.get_replicas(ids).await? {
        let state = guard(&replica, ReplicaOperation::Synchronized)?;
        let name = operation_name(replica.kind(), ReplicaOperation::Synchronized);
        device
            .wait_until(&name, || {
                device.driver().replica_synchronized(ctx.system(), &replica)
            })
            .await?;
        replica.state = state;
        repository.put_replica(&replica).await?;
    }
    Ok(())
}

async fn promote_mirrors(ctx: &StepContext<'_>, ids: &[ReplicaId]) -> Result<(), SvcError> {
    let repository = ctx.repository();
    for mut mirror in repository.active_replicas(ids).await? {
        let Some(source) = mirror.source_volume().cloned() else {
            continue;
        };
        let source = repository.get_volume(&source).await?;
        let native_id = mirror.native_id.clone().ok_or_else(|| SvcError::NotProvisioned {
            kind: ResourceKind::Mirror,
            id: mirror.uuid.to_string(),
        })?;
        let mut volume = VolumeSpec::new(
            mirror.label.clone(),
            mirror.system.clone(),
            mirror.pool.clone().unwrap_or_else(|| source.pool.clone()),
            source.size,
        );
        volume.thin = source.thin;
        volume.native_id = Some(native_id);
        repository.put_volume(&volume).await?;
        tracing::info!(mirror.id=%mirror.uuid, volume.id=%volume.uuid, "Promoted mirror to a volume");

        retire(repository, &mut mirror).await?;
        ctx.completer()
            .entity_ready(&ResourceId::from(&mirror.uuid))
            .await?;
    }
    Ok(())
}
