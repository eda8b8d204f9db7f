use super::actions::ReplicaAction;
use crate::{
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
        replica::{ReplicaSource, ReplicaSpec, ReplicaState, SnapshotState},
        volume::VolumeSpec,
    },
    transport::{CopyMode, ReplicaId, ReplicaKind, StorageSystemId, VolumeId},
};

/// Scope locks of the replication group a session was taken from.
fn session_locks(session: &ReplicaSpec) -> Vec<String> {
    match &session.source {
        ReplicaSource::ReplicationGroup(group) => {
            vec![LockScope::ReplicationGroup.key(group, &session.system)]
        }
        ReplicaSource::Volume(_) => vec![],
    }
}

impl StepBuilder {
    async fn check_sessions_supported(&self, system: &StorageSystemId) -> Result<(), SvcError> {
        match self.capabilities(system).await?.snapshot_sessions {
            true => Ok(()),
            false => Err(SvcError::InvalidArguments {
                details: format!("Storage system '{system}' does not support snapshot sessions"),
            }),
        }
    }

    /// Load an active snapshot session.
    pub(crate) async fn get_session(&self, session: &ReplicaId) -> Result<ReplicaSpec, SvcError> {
        let session = self.repository().get_replica(session).await?;
        match (session.kind(), session.inactive) {
            (ReplicaKind::SnapshotSession, false) => Ok(session),
            (ReplicaKind::SnapshotSession, true) => Err(SvcError::NotFound {
                kind: session.kind().into(),
                id: session.uuid.to_string(),
            }),
            (kind, _) => Err(SvcError::InvalidArguments {
                details: format!("Replica '{}' is a {kind}, not a snapshot session", session.uuid),
            }),
        }
    }

    /// The volumes a session was taken from.
    pub(crate) async fn session_sources(
        &self,
        session: &ReplicaSpec,
    ) -> Result<Vec<VolumeSpec>, SvcError> {
        match &session.source {
            ReplicaSource::Volume(volume) => Ok(vec![self.repository().get_volume(volume).await?]),
            ReplicaSource::ReplicationGroup(group) => Ok(self
                .repository()
                .volumes_in_replication_group(&session.system, group)
                .await?),
        }
    }

    /// Record a pending session and reference it from its source volumes.
    pub(crate) async fn prepare_session(
        &self,
        mut session: ReplicaSpec,
        sources: &mut [VolumeSpec],
    ) -> Result<ReplicaSpec, SvcError> {
        let repository = self.repository();
        session.linked_targets.clear();
        repository.put_replica(&session).await?;
        for volume in sources {
            volume.sessions.insert(session.uuid.clone());
            repository.put_volume(volume).await?;
        }
        Ok(session)
    }

    /// Append the creation of a prepared session.
    pub(crate) fn append_create_session(
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        session: &ReplicaSpec,
        label: &str,
        tolerate: Option<&str>,
    ) -> WaitFor {
        let step = WorkflowStep::new(
            label,
            format!("Create snapshot session '{}'", session.label),
            &session.system,
            ReplicaAction::CreateSnapshotSession {
                session: session.uuid.clone(),
            }
            .into(),
        )
        .wait_for(wait_for)
        .rollback(
            ReplicaAction::RollbackCreate {
                replicas: vec![session.uuid.clone()],
            }
            .into(),
        )
        .locks(session_locks(session));
        workflow.create_step(super::steps::with_policy(step, tolerate))
    }

    /// Create a snapshot session of each volume. Volumes in a replication group share a
    /// single session of the whole group.
    pub async fn create_snapshot_sessions(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        volumes: &[VolumeId],
        label: &str,
    ) -> Result<Option<WaitFor>, SvcError> {
        let mut sessions = IndexMap::<(StorageSystemId, Option<String>), Vec<VolumeSpec>>::new();
        for volume in self.repository().get_volumes(volumes).await? {
            if volume.inactive {
                return Err(SvcError::InvalidArguments {
                    details: format!("Volume '{}' has been deleted", volume.uuid),
                });
            }
            sessions
                .entry((volume.system.clone(), volume.replication_group.clone()))
                .or_default()
                .push(volume);
        }

        for (system, _) in sessions.keys() {
            self.check_sessions_supported(system).await?;
        }

        let mut created = false;
        for ((system, group), volumes) in sessions {
            let sessions = match group {
                Some(group) => {
                    let mut members = self
                        .repository()
                        .volumes_in_replication_group(&system, &group)
                        .await?;
                    let session = ReplicaSpec::new_group_session(label, &system, &group)
                        .with_set_name(Some(label.to_string()));
                    vec![self.prepare_session(session, &mut members).await?]
                }
                None => {
                    let mut sessions = Vec::with_capacity(volumes.len());
                    for mut volume in volumes {
                        let session = ReplicaSpec::new(ReplicaKind::SnapshotSession, label, &volume)
                            .with_set_name(Some(label.to_string()));
                        let session = self
                            .prepare_session(session, std::slice::from_mut(&mut volume))
                            .await?;
                        sessions.push(session);
                    }
                    sessions
                }
            };
            for session in &sessions {
                Self::append_create_session(workflow, wait_for.clone(), session, "CreateSessions", None);
                created = true;
            }
        }
        Ok(Self::frontier(created, "CreateSessions", wait_for))
    }

    /// Record new pending targets to be linked to the session, referenced by their sources.
    pub(crate) async fn prepare_targets(
        &self,
        session: &ReplicaSpec,
        sources: Vec<VolumeSpec>,
        label: &str,
        group: Option<String>,
        mode: CopyMode,
    ) -> Result<Vec<ReplicaSpec>, SvcError> {
        let repository = self.repository();
        let many = sources.len() > 1;
        let mut targets = Vec::with_capacity(sources.len());
        for (index, mut volume) in sources.into_iter().enumerate() {
            let name = match many {
                true => format!("{label}-{}", index + 1),
                false => label.to_string(),
            };
            let mut target = ReplicaSpec::new(ReplicaKind::Snapshot, name, &volume)
                .with_session(&session.uuid, mode)
                .with_set_name(Some(label.to_string()));
            target.replication_group = group.clone();
            repository.put_replica(&target).await?;
            volume.snapshots.insert(target.uuid.clone());
            repository.put_volume(&volume).await?;
            targets.push(target);
        }
        Ok(targets)
    }

    /// Append linking the pending targets to a session.
    pub(crate) fn append_link_targets(
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        session: &ReplicaSpec,
        targets: &[ReplicaSpec],
        label: &str,
        tolerate: Option<&str>,
    ) -> WaitFor {
        let ids = targets.iter().map(|t| t.uuid.clone()).collect::<Vec<_>>();
        let step = WorkflowStep::new(
            label,
            format!(
                "Link {} target(s) to snapshot session '{}'",
                ids.len(),
                session.label
            ),
            &session.system,
            ReplicaAction::LinkTargets {
                session: session.uuid.clone(),
                targets: ids.clone(),
            }
            .into(),
        )
        .wait_for(wait_for)
        .rollback(ReplicaAction::RollbackCreate { replicas: ids }.into())
        .locks(session_locks(session));
        workflow.create_step(super::steps::with_policy(step, tolerate))
    }

    /// Link `count` new snapshot targets of each source volume to the session.
    /// Targets of a group session are placed into a linked target group per link round.
    pub async fn link_targets(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        session: &ReplicaId,
        count: u32,
        label: &str,
        mode: CopyMode,
    ) -> Result<Option<WaitFor>, SvcError> {
        if count == 0 {
            return Err(SvcError::InvalidArguments {
                details: "At least one target must be linked".to_string(),
            });
        }
        let session = self.get_session(session).await?;
        let is_group = matches!(session.source, ReplicaSource::ReplicationGroup(_));
        let mut created = false;
        for round in 1 ..= count {
            let name = match count {
                1 => label.to_string(),
                _ => format!("{label}-{round}"),
            };
            let sources = self.session_sources(&session).await?;
            let group = is_group.then(|| name.clone());
            let targets = self
                .prepare_targets(&session, sources, &name, group, mode)
                .await?;
            if targets.is_empty() {
                continue;
            }
            Self::append_link_targets(workflow, wait_for.clone(), &session, &targets, "LinkTargets", None);
            created = true;
        }
        Ok(Self::frontier(created, "LinkTargets", wait_for))
    }

    async fn session_targets(
        &self,
        session: &ReplicaSpec,
        targets: &[ReplicaId],
    ) -> Result<Vec<ReplicaSpec>, SvcError> {
        let targets = self
            .active_replicas_of(ReplicaKind::Snapshot, targets)
            .await?;
        if let Some(target) = targets.iter().find(|t| t.system != session.system) {
            return Err(SvcError::InvalidArguments {
                details: format!(
                    "Target '{}' is not on the storage system of session '{}'",
                    target.uuid, session.uuid
                ),
            });
        }
        Ok(targets)
    }

    /// Move existing targets onto the session.
    pub async fn relink_targets(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        session: &ReplicaId,
        targets: &[ReplicaId],
    ) -> Result<Option<WaitFor>, SvcError> {
        let session = self.get_session(session).await?;
        let targets = self.session_targets(&session, targets).await?;
        if targets.is_empty() {
            return Ok(wait_for);
        }
        let wait_for = workflow.create_step(
            WorkflowStep::new(
                "RelinkTargets",
                format!("Relink {} target(s) to session '{}'", targets.len(), session.label),
                &session.system,
                ReplicaAction::RelinkTargets {
                    session: session.uuid.clone(),
                    targets: targets.iter().map(|t| t.uuid.clone()).collect(),
                }
                .into(),
            )
            .wait_for(wait_for)
            .locks(session_locks(&session)),
        );
        Ok(Some(wait_for))
    }

    /// Unlink the targets from the session, optionally deleting them; deleted targets leave
    /// their linked target group first.
    pub async fn unlink_targets(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        session: &ReplicaId,
        targets: &[ReplicaId],
        delete_targets: bool,
    ) -> Result<Option<WaitFor>, SvcError> {
        let session = self.get_session(session).await?;
        let targets = self.session_targets(&session, targets).await?;
        self.append_unlink_targets(workflow, wait_for, &session, targets, delete_targets)
            .await
    }

    pub(crate) async fn append_unlink_targets(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        session: &ReplicaSpec,
        targets: Vec<ReplicaSpec>,
        delete_targets: bool,
    ) -> Result<Option<WaitFor>, SvcError> {
        if targets.is_empty() {
            return Ok(wait_for);
        }
        let wait_for = match delete_targets {
            true => {
                self.append_leave_replica_groups(workflow, wait_for, targets.clone(), "UnlinkTargets")
                    .await?
            }
            false => wait_for,
        };
        let wait_for = workflow.create_step(
            WorkflowStep::new(
                "UnlinkTargets",
                format!("Unlink {} target(s) from session '{}'", targets.len(), session.label),
                &session.system,
                ReplicaAction::UnlinkTargets {
                    session: session.uuid.clone(),
                    targets: targets.iter().map(|t| t.uuid.clone()).collect(),
                    delete_targets,
                }
                .into(),
            )
            .wait_for(wait_for)
            .locks(session_locks(session)),
        );
        Ok(Some(wait_for))
    }

    /// Restore the source volumes from the session.
    pub async fn restore_snapshot_session(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        session: &ReplicaId,
    ) -> Result<Option<WaitFor>, SvcError> {
        let session = self.get_session(session).await?;
        let wait_for = workflow.create_step(
            WorkflowStep::new(
                "RestoreSession",
                format!("Restore from snapshot session '{}'", session.label),
                &session.system,
                ReplicaAction::RestoreSession {
                    session: session.uuid.clone(),
                }
                .into(),
            )
            .wait_for(wait_for)
            .locks(session_locks(&session)),
        );
        Ok(Some(wait_for))
    }

    /// Delete the session, unlinking and deleting its remaining targets first.
    pub async fn delete_snapshot_session(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        session: &ReplicaId,
    ) -> Result<Option<WaitFor>, SvcError> {
        let session = self.get_session(session).await?;
        self.append_delete_session(workflow, wait_for, &session).await
    }

    pub(crate) async fn append_delete_session(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        session: &ReplicaSpec,
    ) -> Result<Option<WaitFor>, SvcError> {
        let linked = session.linked_targets.iter().cloned().collect::<Vec<_>>();
        let targets = self.repository().active_replicas(&linked).await?;
        let wait_for = self
            .append_unlink_targets(workflow, wait_for, session, targets, true)
            .await?;
        let wait_for = workflow.create_step(
            WorkflowStep::new(
                "DeleteSession",
                format!("Delete snapshot session '{}'", session.label),
                &session.system,
                ReplicaAction::DeleteSnapshotSession {
                    session: session.uuid.clone(),
                }
                .into(),
            )
            .wait_for(wait_for)
            .locks(session_locks(session)),
        );
        Ok(Some(wait_for))
    }

    /// Restore the source volume of a linked target from the target's data.
    /// Technologies which cannot restore from a linked target directly go through a
    /// temporary session taken on the target, linked back to the source volume in copy mode.
    pub async fn restore_from_linked_target(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        target: &ReplicaId,
    ) -> Result<Option<WaitFor>, SvcError> {
        let target = self.repository().get_replica(target).await?;
        if target.inactive || !target.is_linked_target() {
            return Err(SvcError::InvalidArguments {
                details: format!("Replica '{}' is not an active linked target", target.uuid),
            });
        }
        if target.state != ReplicaState::Snapshot(SnapshotState::Linked) {
            return Err(SvcError::InvalidReplicaState {
                kind: target.kind().into(),
                id: target.uuid.to_string(),
                state: target.state.to_string(),
                operation: super::ReplicaOperation::Restore.to_string(),
            });
        }
        let system = target.system.clone();
        if self
            .capabilities(&system)
            .await?
            .direct_linked_target_restore
        {
            let step = workflow.create_step(
                WorkflowStep::new(
                    "RestoreFromTarget",
                    format!("Restore from linked target '{}'", target.label),
                    &system,
                    ReplicaAction::RestoreFromTarget {
                        target: target.uuid.clone(),
                    }
                    .into(),
                )
                .wait_for(wait_for),
            );
            return Ok(Some(step));
        }

        let volume = target
            .source_volume()
            .cloned()
            .ok_or_else(|| SvcError::InvalidArguments {
                details: format!("Replica '{}' is not the copy of a volume", target.uuid),
            })?;
        let label = "RestoreFromTarget";

        let terminate = workflow.create_step(
            WorkflowStep::new(
                label,
                format!("Terminate the restore sessions of volume '{volume}'"),
                &system,
                ReplicaAction::TerminateRestoreSessions {
                    volume: volume.clone(),
                }
                .into(),
            )
            .wait_for(wait_for),
        );

        let create = WorkflowStep::new(
            label,
            format!("Create a temporary session of linked target '{}'", target.label),
            &system,
            ReplicaAction::CreateTemporarySession {
                target: target.uuid.clone(),
            }
            .into(),
        )
        .wait_for(Some(terminate));
        let session_step = create.id().clone();
        let create = workflow.create_step(create.rollback(
            ReplicaAction::DeleteTemporarySession {
                session_step: session_step.clone(),
            }
            .into(),
        ));

        let link = workflow.create_step(
            WorkflowStep::new(
                label,
                format!("Link volume '{volume}' to the temporary session"),
                &system,
                ReplicaAction::LinkSourceToTemporarySession {
                    session_step: session_step.clone(),
                    volume: volume.clone(),
                }
                .into(),
            )
            .wait_for(Some(create))
            .rollback(
                ReplicaAction::UnlinkSourceFromTemporarySession {
                    session_step: session_step.clone(),
                    volume: volume.clone(),
                }
                .into(),
            ),
        );

        let synchronized = workflow.create_step(
            WorkflowStep::new(
                label,
                format!("Wait for volume '{volume}' to copy the temporary session"),
                &system,
                ReplicaAction::WaitForTemporaryLink {
                    session_step: session_step.clone(),
                    volume: volume.clone(),
                }
                .into(),
            )
            .wait_for(Some(link)),
        );

        let unlink = workflow.create_step(
            WorkflowStep::new(
                label,
                format!("Unlink volume '{volume}' from the temporary session"),
                &system,
                ReplicaAction::UnlinkSourceFromTemporarySession {
                    session_step: session_step.clone(),
                    volume,
                }
                .into(),
            )
            .wait_for(Some(synchronized)),
        );

        let delete = workflow.create_step(
            WorkflowStep::new(
                label,
                "Delete the temporary session",
                &system,
                ReplicaAction::DeleteTemporarySession { session_step }.into(),
            )
            .wait_for(Some(unlink)),
        );
        Ok(Some(delete))
    }
}
