use super::steps::{with_policy, ReplicaBatch};
use crate::{
    consistency_group::GroupAction,
    controller::{
        records::RepositoryExt,
        workflow::{StepBuilder, WaitFor, Workflow, WorkflowStep},
    },
    errors::SvcError,
};
use indexmap::IndexMap;
use stor_port::types::v0::{
    store::{
        consistency_group::ConsistencyGroupSpec,
        replica::{FullCopyState, ReplicaSource, ReplicaSpec, ReplicaState},
        volume::VolumeSpec,
    },
    transport::{CopyMode, ReplicaId, ReplicaKind, StorageSystemId, VolumeId},
};

const PROPAGATE: &str = "PropagateReplicas";

/// The group replicas carried by the surviving members of a consistency group on one system,
/// one template per replication group or session set.
#[derive(Debug, Default)]
struct Templates {
    sessions: IndexMap<String, ReplicaSpec>,
    replicas: IndexMap<(ReplicaKind, String), ReplicaSpec>,
}

impl StepBuilder {
    async fn templates(&self, members: &[VolumeSpec]) -> Result<Templates, SvcError> {
        let mut templates = Templates::default();
        for member in members {
            let refs = member.all_replica_refs().cloned().collect::<Vec<_>>();
            for replica in self.repository().active_replicas(&refs).await? {
                if replica.kind() == ReplicaKind::SnapshotSession {
                    let key = replica
                        .set_name
                        .clone()
                        .unwrap_or_else(|| replica.label.clone());
                    templates.sessions.entry(key).or_insert(replica);
                } else if replica.is_linked_target() {
                    // propagated along with their session
                } else if let Some(group) = replica.replication_group.clone() {
                    templates
                        .replicas
                        .entry((replica.kind(), group))
                        .or_insert(replica);
                }
            }
        }
        Ok(templates)
    }

    /// Propagate the group replicas of the consistency group's surviving members to the
    /// volumes being added to it, so that every member carries the same replica set.
    /// A failure only affects the replicas of the failing group.
    pub(crate) async fn propagate_added_members(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        group: &ConsistencyGroupSpec,
        added: &[VolumeSpec],
    ) -> Result<Option<WaitFor>, SvcError> {
        let members = self
            .repository()
            .volumes_in_consistency_group(&group.uuid)
            .await?;
        let mut per_system = IndexMap::<StorageSystemId, Vec<VolumeId>>::new();
        for volume in added {
            per_system
                .entry(volume.system.clone())
                .or_default()
                .push(volume.uuid.clone());
        }

        let mut created = false;
        for (system, volumes) in per_system {
            let survivors = members
                .iter()
                .filter(|m| m.system == system && !volumes.contains(&m.uuid))
                .cloned()
                .collect::<Vec<_>>();
            let templates = self.templates(&survivors).await?;
            if templates.sessions.is_empty() && templates.replicas.is_empty() {
                continue;
            }
            tracing::info!(
                consistency_group.id=%group.uuid,
                storage.system=%system,
                sessions=templates.sessions.len(),
                replica_groups=templates.replicas.len(),
                "Propagating group replicas to new members"
            );

            let sessions_supported = self.capabilities(&system).await?.snapshot_sessions;
            for (key, template) in &templates.sessions {
                if !sessions_supported {
                    let warning = format!(
                        "Snapshot session '{key}' of consistency group '{}' was not propagated: storage system '{system}' does not support snapshot sessions",
                        group.label
                    );
                    tracing::warn!(%warning);
                    workflow.add_warning(warning);
                    continue;
                }
                for volume in &volumes {
                    self.propagate_session(workflow, wait_for.clone(), key, template, volume)
                        .await?;
                    created = true;
                }
            }

            let activate_snapshots = self.capabilities(&system).await?.snapshot_activation;
            for ((kind, name), template) in &templates.replicas {
                let tolerate = format!("propagate/{kind}/{name}");
                let existing = self
                    .repository()
                    .replicas_in_replication_group(&system, name)
                    .await?
                    .len();
                let base = template.set_name.clone().unwrap_or_else(|| name.clone());
                let mut replicas = Vec::with_capacity(volumes.len());
                for (index, volume) in volumes.iter().enumerate() {
                    let mut volume = self.repository().get_volume(volume).await?;
                    let mut replica =
                        ReplicaSpec::new(*kind, format!("{base}-{}", existing + index + 1), &volume)
                            .with_set_name(template.set_name.clone());
                    replica.replication_group = Some(name.clone());
                    replica.copy_mode = template.copy_mode;
                    self.repository().put_replica(&replica).await?;
                    volume.replica_refs_mut(*kind).insert(replica.uuid.clone());
                    self.repository().put_volume(&volume).await?;
                    replicas.push(replica);
                }
                let activate = match kind {
                    ReplicaKind::FullCopy => {
                        template.state != ReplicaState::FullCopy(FullCopyState::Created)
                    }
                    ReplicaKind::Snapshot => activate_snapshots,
                    _ => false,
                };
                let batch = ReplicaBatch {
                    system: system.clone(),
                    group: Some(name.clone()),
                    replicas,
                };
                self.append_create_replicas(
                    workflow,
                    wait_for.clone(),
                    *kind,
                    vec![batch],
                    PROPAGATE,
                    activate,
                    Some(&tolerate),
                )
                .await?;
                created = true;
            }
        }
        Ok(Self::frontier(created, PROPAGATE, wait_for))
    }

    /// Create a session of the added volume matching the template session, and link a new
    /// target for each of the template's linked target groups.
    async fn propagate_session(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        key: &str,
        template: &ReplicaSpec,
        volume: &VolumeId,
    ) -> Result<(), SvcError> {
        let tolerate = format!("propagate/{}/{key}", ReplicaKind::SnapshotSession);
        let mut source = self.repository().get_volume(volume).await?;
        let session = ReplicaSpec::new(ReplicaKind::SnapshotSession, template.label.clone(), &source)
            .with_set_name(Some(key.to_string()));
        let session = self
            .prepare_session(session, std::slice::from_mut(&mut source))
            .await?;
        let created =
            Self::append_create_session(workflow, wait_for, &session, PROPAGATE, Some(&tolerate));

        let linked = template.linked_targets.iter().cloned().collect::<Vec<_>>();
        let targets = self.repository().active_replicas(&linked).await?;
        for batch in ReplicaBatch::segregate(targets) {
            let Some(first) = batch.replicas.first() else {
                continue;
            };
            let mode = first.copy_mode.unwrap_or(CopyMode::NoCopy);
            let name = first.set_name.clone().unwrap_or_else(|| first.label.clone());
            let source = self.repository().get_volume(volume).await?;
            let targets = self
                .prepare_targets(&session, vec![source], &name, batch.group.clone(), mode)
                .await?;
            let linked = Self::append_link_targets(
                workflow,
                Some(created.clone()),
                &session,
                &targets,
                PROPAGATE,
                Some(&tolerate),
            );
            if let Some(group) = &batch.group {
                let members = ReplicaBatch {
                    system: batch.system.clone(),
                    group: batch.group.clone(),
                    replicas: targets,
                };
                let step = WorkflowStep::new(
                    PROPAGATE,
                    format!("Add the linked targets to target group '{group}'"),
                    &members.system,
                    GroupAction::AddToReplicationGroup {
                        group: None,
                        name: group.clone(),
                        members: members.members(),
                    }
                    .into(),
                )
                .wait_for(Some(linked))
                .rollback(
                    GroupAction::RemoveFromReplicationGroup {
                        group: None,
                        name: group.clone(),
                        members: members.members(),
                    }
                    .into(),
                )
                .locks(members.locks());
                workflow.create_step(with_policy(step, Some(&tolerate)));
            }
        }
        Ok(())
    }

    /// Remove the replicas of volumes leaving a consistency group from their replica groups,
    /// deleting the groups left empty. The replicas survive as standalone replicas.
    pub(crate) async fn propagate_removed_members(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        removed: &[VolumeSpec],
    ) -> Result<Option<WaitFor>, SvcError> {
        let mut replicas = vec![];
        for volume in removed {
            let refs = volume.all_replica_refs().cloned().collect::<Vec<_>>();
            replicas.extend(
                self.repository()
                    .active_replicas(&refs)
                    .await?
                    .into_iter()
                    .filter(|r| r.replication_group.is_some()),
            );
        }
        self.append_leave_replica_groups(workflow, wait_for, replicas, "RemoveReplicaGroupMembers")
            .await
    }

    /// Dismantle the replicas of volumes about to be deleted.
    /// Sessions unlink and delete their targets and are deleted, except group sessions of
    /// which some source volume survives: those only lose the targets of the deleted volumes.
    /// Snapshots and mirrors are deleted, while full copies are detached and survive.
    pub(crate) async fn dismantle_replicas(
        &self,
        workflow: &mut Workflow,
        wait_for: Option<WaitFor>,
        volumes: &[VolumeSpec],
    ) -> Result<Option<WaitFor>, SvcError> {
        let deleting = volumes.iter().map(|v| v.uuid.clone()).collect::<Vec<_>>();
        let mut by_kind = IndexMap::<ReplicaKind, Vec<ReplicaSpec>>::new();
        let mut seen = Vec::<ReplicaId>::new();
        for volume in volumes {
            let refs = volume.all_replica_refs().cloned().collect::<Vec<_>>();
            for replica in self.repository().active_replicas(&refs).await? {
                if seen.contains(&replica.uuid) {
                    continue;
                }
                seen.push(replica.uuid.clone());
                by_kind.entry(replica.kind()).or_default().push(replica);
            }
        }

        let mut wait_for = wait_for;
        let mut unlinked = Vec::<ReplicaId>::new();
        for session in by_kind.shift_remove(&ReplicaKind::SnapshotSession).unwrap_or_default() {
            let sources = self.session_sources(&session).await?;
            let survives = match session.source {
                ReplicaSource::ReplicationGroup(_) => {
                    sources.iter().any(|s| !deleting.contains(&s.uuid))
                }
                ReplicaSource::Volume(_) => false,
            };
            let linked = session.linked_targets.iter().cloned().collect::<Vec<_>>();
            let targets = self.repository().active_replicas(&linked).await?;
            unlinked.extend(targets.iter().map(|t| t.uuid.clone()));
            if survives {
                let targets = targets
                    .into_iter()
                    .filter(|t| t.source_volume().map_or(false, |v| deleting.contains(v)))
                    .collect();
                wait_for = self
                    .append_unlink_targets(workflow, wait_for, &session, targets, true)
                    .await?;
            } else {
                wait_for = self
                    .append_delete_session(workflow, wait_for, &session)
                    .await?;
            }
        }

        let snapshots = by_kind
            .shift_remove(&ReplicaKind::Snapshot)
            .unwrap_or_default()
            .into_iter()
            .filter(|s| !unlinked.contains(&s.uuid) && !s.is_linked_target())
            .collect::<Vec<_>>();
        wait_for = self
            .append_delete_replicas(workflow, wait_for, ReplicaKind::Snapshot, snapshots)
            .await?;

        let mirrors = by_kind.shift_remove(&ReplicaKind::Mirror).unwrap_or_default();
        if !mirrors.is_empty() {
            let ids = mirrors.iter().map(|m| m.uuid.clone()).collect::<Vec<_>>();
            wait_for = self.detach_mirrors(workflow, wait_for, &ids, false).await?;
        }

        let clones = by_kind.shift_remove(&ReplicaKind::FullCopy).unwrap_or_default();
        if !clones.is_empty() {
            let ids = clones.iter().map(|c| c.uuid.clone()).collect::<Vec<_>>();
            wait_for = self.detach_full_copies(workflow, wait_for, &ids).await?;
        }
        Ok(wait_for)
    }
}
