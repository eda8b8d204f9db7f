use super::{
    actions::{abandon, operation_name, retire},
    state::{guard, ReplicaOperation},
};
use crate::{
    controller::{
        driver::{LinkTarget, NativeIds, SessionRequest},
        records::RepositoryExt,
        workflow::{Device, StepContext, StepId},
    },
    errors::SvcError,
};
use stor_port::{
    transport_api::{ErrorChain, ResourceKind},
    types::v0::{
        store::{
            replica::{ReplicaSource, ReplicaSpec, ReplicaState, SessionState, SnapshotState},
            volume::VolumeSpec,
            ResourceId,
        },
        transport::{CopyMode, ReplicaId, ReplicaKind, VolumeId},
    },
};

fn native_id(replica: &ReplicaSpec) -> Result<String, SvcError> {
    replica
        .native_id
        .clone()
        .ok_or_else(|| SvcError::NotProvisioned {
            kind: replica.kind().into(),
            id: replica.uuid.to_string(),
        })
}

fn volume_native_id(volume: &VolumeSpec) -> Result<String, SvcError> {
    volume
        .native_id
        .clone()
        .ok_or_else(|| SvcError::NotProvisioned {
            kind: ResourceKind::Volume,
            id: volume.uuid.to_string(),
        })
}

fn link_target(replica: &ReplicaSpec) -> LinkTarget {
    LinkTarget {
        uuid: replica.uuid.to_string(),
        label: replica.label.clone(),
        native_id: replica.native_id.clone(),
    }
}

fn volume_link(volume: &VolumeSpec) -> LinkTarget {
    LinkTarget {
        uuid: volume.uuid.to_string(),
        label: volume.label.clone(),
        native_id: volume.native_id.clone(),
    }
}

async fn get_session(ctx: &StepContext<'_>, id: &ReplicaId) -> Result<ReplicaSpec, SvcError> {
    let session = ctx.repository().get_replica(id).await?;
    match session.kind() {
        ReplicaKind::SnapshotSession => Ok(session),
        kind => Err(SvcError::InvalidArguments {
            details: format!("Replica '{id}' is a {kind}, not a snapshot session"),
        }),
    }
}

/// Remove the target from the linked targets of its current session.
async fn detach_from_session(ctx: &StepContext<'_>, target: &ReplicaSpec) -> Result<(), SvcError> {
    let Some(session) = &target.session else {
        return Ok(());
    };
    let repository = ctx.repository();
    match repository.get_replica(session).await {
        Ok(mut session) => {
            if session.linked_targets.remove(&target.uuid) {
                settle_link_state(&mut session);
                repository.put_replica(&session).await?;
            }
            Ok(())
        }
        Err(error) if error.is_stale_reference() => Ok(()),
        Err(error) => Err(error),
    }
}

/// A session is linked for as long as it has linked targets.
pub(super) fn settle_link_state(session: &mut ReplicaSpec) {
    if let ReplicaState::SnapshotSession(state) = &mut session.state {
        *state = match (session.linked_targets.is_empty(), *state) {
            (true, SessionState::Linked) => SessionState::Created,
            (false, SessionState::Created) => SessionState::Linked,
            (_, state) => state,
        };
    }
}

pub(super) async fn create(ctx: &StepContext<'_>, id: &ReplicaId) -> Result<(), SvcError> {
    let repository = ctx.repository();
    let mut session = get_session(ctx, id).await?;
    let state = guard(&session, ReplicaOperation::Create)?;

    let (source, group) = match &session.source {
        ReplicaSource::Volume(volume) => {
            let volume = repository.get_volume(volume).await?;
            (vec![volume_native_id(&volume)?], None)
        }
        ReplicaSource::ReplicationGroup(name) => {
            let members = repository
                .volumes_in_replication_group(ctx.system(), name)
                .await?;
            let source = members
                .iter()
                .map(volume_native_id)
                .collect::<Result<Vec<_>, _>>()?;
            (source, Some(name.clone()))
        }
    };
    let request = SessionRequest {
        uuid: session.uuid.to_string(),
        label: session.label.clone(),
        source,
        group,
    };

    let device = ctx.device().await?;
    let name = operation_name(ReplicaKind::SnapshotSession, ReplicaOperation::Create);
    let result = device
        .run(
            &name,
            device.driver().create_snapshot_session(ctx.system(), &request),
        )
        .await;
    let ids = match result {
        Ok(ids) => ids,
        Err(error) => {
            abandon(repository, std::slice::from_mut(&mut session)).await?;
            return Err(error);
        }
    };
    match ids.get(&request.uuid) {
        Some(native_id) => {
            session.native_id = Some(native_id.clone());
            session.state = state;
            repository.put_replica(&session).await?;
            Ok(())
        }
        None => {
            retire(repository, &mut session).await?;
            Err(SvcError::MissingNativeId {
                operation: name,
                system: ctx.system().clone(),
                kind: ResourceKind::SnapshotSession,
                id: id.to_string(),
            })
        }
    }
}

pub(super) async fn link_targets(
    ctx: &StepContext<'_>,
    session: &ReplicaId,
    targets: &[ReplicaId],
) -> Result<(), SvcError> {
    let repository = ctx.repository();
    let mut session = get_session(ctx, session).await?;
    let session_state = guard(&session, ReplicaOperation::Link)?;
    let session_native = native_id(&session)?;
    let mut targets = repository.get_replicas(targets).await?;
    let states = targets
        .iter()
        .map(|target| guard(target, ReplicaOperation::Link))
        .collect::<Result<Vec<_>, _>>()?;
    let mode = targets
        .first()
        .and_then(|target| target.copy_mode)
        .unwrap_or(CopyMode::NoCopy);
    let links = targets.iter().map(link_target).collect::<Vec<_>>();

    let device = ctx.device().await?;
    let name = operation_name(ReplicaKind::SnapshotSession, ReplicaOperation::Link);
    let result = device
        .run(
            &name,
            device
                .driver()
                .link_targets(ctx.system(), &session_native, &links, mode),
        )
        .await;
    let ids = match result {
        Ok(ids) => ids,
        Err(error) => {
            abandon(repository, &mut targets).await?;
            return Err(error);
        }
    };

    let mut missing = None;
    for (target, state) in targets.iter_mut().zip(states) {
        if let Some(native_id) = ids.get(target.uuid.as_str()) {
            target.native_id = Some(native_id.clone());
        }
        if target.is_pending() {
            missing.get_or_insert_with(|| target.uuid.clone());
            retire(repository, target).await?;
            continue;
        }
        target.state = state;
        target.session = Some(session.uuid.clone());
        target.copy_mode = Some(mode);
        repository.put_replica(target).await?;
        session.linked_targets.insert(target.uuid.clone());
    }
    session.state = session_state;
    settle_link_state(&mut session);
    repository.put_replica(&session).await?;

    match missing {
        Some(id) => Err(SvcError::MissingNativeId {
            operation: name,
            system: ctx.system().clone(),
            kind: ResourceKind::Snapshot,
            id: id.to_string(),
        }),
        None => Ok(()),
    }
}

pub(super) async fn relink_targets(
    ctx: &StepContext<'_>,
    session: &ReplicaId,
    targets: &[ReplicaId],
) -> Result<(), SvcError> {
    let repository = ctx.repository();
    let mut session = get_session(ctx, session).await?;
    let session_native = native_id(&session)?;
    let mut targets = repository.get_replicas(targets).await?;
    let states = targets
        .iter()
        .map(|target| guard(target, ReplicaOperation::Relink))
        .collect::<Result<Vec<_>, _>>()?;
    let links = targets.iter().map(link_target).collect::<Vec<_>>();

    let device = ctx.device().await?;
    let name = operation_name(ReplicaKind::SnapshotSession, ReplicaOperation::Relink);
    let result = device
        .run(
            &name,
            device
                .driver()
                .relink_targets(ctx.system(), &session_native, &links),
        )
        .await;
    result?;

    for (target, state) in targets.iter_mut().zip(states) {
        if target.session.as_ref() != Some(&session.uuid) {
            detach_from_session(ctx, target).await?;
            target.session = Some(session.uuid.clone());
        }
        target.state = state;
        repository.put_replica(target).await?;
        session.linked_targets.insert(target.uuid.clone());
    }
    settle_link_state(&mut session);
    repository.put_replica(&session).await?;
    Ok(())
}

pub(super) async fn unlink_targets(
    ctx: &StepContext<'_>,
    session: &ReplicaId,
    targets: &[ReplicaId],
    delete_targets: bool,
) -> Result<(), SvcError> {
    let repository = ctx.repository();
    let session = get_session(ctx, session).await?;
    let mut targets = repository.active_replicas(targets).await?;
    abandon(repository, &mut targets).await?;
    let mut targets = targets
        .into_iter()
        .filter(|target| !target.inactive)
        .collect::<Vec<_>>();
    let states = targets
        .iter()
        .map(|target| guard(target, ReplicaOperation::Unlink))
        .collect::<Result<Vec<_>, _>>()?;
    if targets.is_empty() {
        return Ok(());
    }

    let device = ctx.device().await?;
    let name = operation_name(ReplicaKind::SnapshotSession, ReplicaOperation::Unlink);
    let links = targets.iter().map(link_target).collect::<Vec<_>>();
    let result = device
        .run(
            &name,
            device.driver().unlink_targets(
                ctx.system(),
                &native_id(&session)?,
                &links,
                delete_targets,
            ),
        )
        .await;
    match result {
        Err(error) if !error.is_stale_reference() => return Err(error),
        _ => {}
    }

    for (target, state) in targets.iter_mut().zip(states) {
        target.state = state;
        match delete_targets {
            true => {
                retire(repository, target).await?;
                ctx.completer()
                    .entity_ready(&ResourceId::from(&target.uuid))
                    .await?;
            }
            false => {
                // the target stays as a standalone snapshot
                detach_from_session(ctx, target).await?;
                target.session = None;
                repository.put_replica(target).await?;
            }
        }
    }
    Ok(())
}

/// Unlink and delete provisioned linked targets while rolling back their creation.
pub(super) async fn unlink_and_delete(
    ctx: &StepContext<'_>,
    device: &Device,
    session: &ReplicaId,
    targets: &[ReplicaSpec],
) -> Result<NativeIds, SvcError> {
    let session = match ctx.repository().get_replica(session).await {
        Ok(session) => session,
        Err(error) if error.is_stale_reference() => return Ok(NativeIds::new()),
        Err(error) => return Err(error),
    };
    let Some(session_native) = session.native_id.as_ref() else {
        return Ok(NativeIds::new());
    };
    let links = targets.iter().map(link_target).collect::<Vec<_>>();
    let name = operation_name(ReplicaKind::SnapshotSession, ReplicaOperation::Unlink);
    device
        .run(
            &name,
            device
                .driver()
                .unlink_targets(ctx.system(), session_native, &links, true),
        )
        .await
}

pub(super) async fn restore(ctx: &StepContext<'_>, session: &ReplicaId) -> Result<(), SvcError> {
    let session = get_session(ctx, session).await?;
    guard(&session, ReplicaOperation::Restore)?;
    let native = native_id(&session)?;
    let device = ctx.device().await?;
    let name = operation_name(ReplicaKind::SnapshotSession, ReplicaOperation::Restore);
    let result = device
        .run(&name, device.driver().restore_session(ctx.system(), &native))
        .await;
    result.map(|_| ())
}

pub(super) async fn delete(ctx: &StepContext<'_>, session: &ReplicaId) -> Result<(), SvcError> {
    let repository = ctx.repository();
    let mut session = match repository.get_replica(session).await {
        Ok(session) if session.inactive => return Ok(()),
        Ok(session) => session,
        Err(error) if error.is_stale_reference() => return Ok(()),
        Err(error) => return Err(error),
    };
    guard(&session, ReplicaOperation::Delete)?;
    if let Some(native) = session.native_id.clone() {
        let device = ctx.device().await?;
        let name = operation_name(ReplicaKind::SnapshotSession, ReplicaOperation::Delete);
        let result = device
            .run(&name, device.driver().delete_session(ctx.system(), &native))
            .await;
        match result {
            Err(error) if error.is_stale_reference() => {
                tracing::warn!(error=%error.full_string(), "Session is already gone");
            }
            result => {
                result?;
            }
        }
    }
    retire(repository, &mut session).await?;
    ctx.completer()
        .entity_ready(&ResourceId::from(&session.uuid))
        .await
}

/// The linked target of a session and the volume its session was taken from.
async fn target_and_source(
    ctx: &StepContext<'_>,
    target: &ReplicaId,
) -> Result<(ReplicaSpec, VolumeSpec), SvcError> {
    let repository = ctx.repository();
    let target = repository.get_replica(target).await?;
    let source = target.source_volume().cloned().ok_or_else(|| SvcError::InvalidArguments {
        details: format!("Replica '{}' is not the copy of a volume", target.uuid),
    })?;
    let source = repository.get_volume(&source).await?;
    Ok((target, source))
}

pub(super) async fn restore_from_target(
    ctx: &StepContext<'_>,
    target: &ReplicaId,
) -> Result<(), SvcError> {
    let (target, _) = target_and_source(ctx, target).await?;
    if target.state != ReplicaState::Snapshot(SnapshotState::Linked) {
        return Err(SvcError::InvalidReplicaState {
            kind: ResourceKind::Snapshot,
            id: target.uuid.to_string(),
            state: target.state.to_string(),
            operation: ReplicaOperation::Restore.to_string(),
        });
    }
    native_id(&target)?;
    let device = ctx.device().await?;
    let name = operation_name(ReplicaKind::Snapshot, ReplicaOperation::Restore);
    let result = device
        .run(
            &name,
            device
                .driver()
                .restore_snapshots(ctx.system(), std::slice::from_ref(&target), false),
        )
        .await;
    result.map(|_| ())
}

pub(super) async fn terminate_restore_sessions(
    ctx: &StepContext<'_>,
    volume: &VolumeId,
) -> Result<(), SvcError> {
    let volume = ctx.repository().get_volume(volume).await?;
    let device = ctx.device().await?;
    let result = device
        .run(
            "terminate:restoreSessions",
            device
                .driver()
                .terminate_restore_sessions(ctx.system(), &volume),
        )
        .await;
    result.map(|_| ())
}

pub(super) async fn create_temporary(
    ctx: &StepContext<'_>,
    target: &ReplicaId,
) -> Result<(), SvcError> {
    let (target, _) = target_and_source(ctx, target).await?;
    let request = SessionRequest {
        uuid: ctx.step_id().to_string(),
        label: format!("restore-{}", target.label),
        source: vec![native_id(&target)?],
        group: None,
    };
    let device = ctx.device().await?;
    let name = "create:temporarySession";
    let result = device
        .run(
            name,
            device.driver().create_snapshot_session(ctx.system(), &request),
        )
        .await;
    let ids = result?;
    let native = ids
        .get(&request.uuid)
        .cloned()
        .ok_or_else(|| SvcError::MissingNativeId {
            operation: name.to_string(),
            system: ctx.system().clone(),
            kind: ResourceKind::SnapshotSession,
            id: request.uuid.clone(),
        })?;
    tracing::info!(session=%native, "Created temporary restore session");
    ctx.set_data(native).await
}

pub(super) async fn link_source(
    ctx: &StepContext<'_>,
    session_step: &StepId,
    volume: &VolumeId,
) -> Result<(), SvcError> {
    let session: String = ctx.data(session_step)?;
    let volume = ctx.repository().get_volume(volume).await?;
    volume_native_id(&volume)?;
    let device = ctx.device().await?;
    let result = device
        .run(
            "link:temporarySession",
            device.driver().link_targets(
                ctx.system(),
                &session,
                &[volume_link(&volume)],
                CopyMode::Copy,
            ),
        )
        .await;
    result.map(|_| ())
}

pub(super) async fn wait_for_link(
    ctx: &StepContext<'_>,
    session_step: &StepId,
    volume: &VolumeId,
) -> Result<(), SvcError> {
    let session: String = ctx.data(session_step)?;
    let volume = ctx.repository().get_volume(volume).await?;
    let link = volume_link(&volume);
    let device = ctx.device().await?;
    device
        .wait_until("synchronize:temporarySession", || {
            device
                .driver()
                .link_synchronized(ctx.system(), &session, &link)
        })
        .await
}

pub(super) async fn unlink_source(
    ctx: &StepContext<'_>,
    session_step: &StepId,
    volume: &VolumeId,
) -> Result<(), SvcError> {
    let session: String = ctx.data(session_step)?;
    let volume = ctx.repository().get_volume(volume).await?;
    let device = ctx.device().await?;
    let result = device
        .run(
            "unlink:temporarySession",
            device
                .driver()
                .unlink_targets(ctx.system(), &session, &[volume_link(&volume)], false),
        )
        .await;
    match result {
        Err(error) if !error.is_stale_reference() => Err(error),
        _ => Ok(()),
    }
}

pub(super) async fn delete_temporary(
    ctx: &StepContext<'_>,
    session_step: &StepId,
) -> Result<(), SvcError> {
    let session: String = ctx.data(session_step)?;
    let device = ctx.device().await?;
    let result = device
        .run(
            "delete:temporarySession",
            device.driver().delete_session(ctx.system(), &session),
        )
        .await;
    match result {
        Err(error) if !error.is_stale_reference() => Err(error),
        _ => Ok(()),
    }
}
