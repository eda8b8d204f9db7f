use super::{
    definitions::{ObjectKey, StorableObject, StorableObjectType},
    volume::VolumeSpec,
};
use crate::types::v0::transport::{
    ConsistencyGroupId, CopyMode, PoolId, ReplicaId, ReplicaKind, StorageSystemId, VolumeId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum_macros::Display;

/// Synchronization state of a mirror.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Display)]
pub enum MirrorState {
    Unknown,
    Created,
    Synchronizing,
    Synchronized,
    Fractured,
    Resynchronizing,
    Detached,
}

/// Synchronization state of a full copy.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Display)]
pub enum FullCopyState {
    Unknown,
    /// Created but not activated.
    Created,
    Synchronizing,
    Synchronized,
    Fractured,
    Restored,
    Resynchronized,
    Detached,
}

/// State of a snapshot, including targets linked to a session.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Display)]
pub enum SnapshotState {
    Unknown,
    Created,
    Activated,
    Linked,
    Unlinked,
    Restored,
    Resynchronized,
}

/// State of a snapshot session.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Display)]
pub enum SessionState {
    Unknown,
    Created,
    /// At least one target is linked.
    Linked,
}

/// Kind specific state of a replica.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq)]
#[serde(tag = "kind", content = "state")]
pub enum ReplicaState {
    Mirror(MirrorState),
    FullCopy(FullCopyState),
    Snapshot(SnapshotState),
    SnapshotSession(SessionState),
}

impl ReplicaState {
    /// Initial state of a replica of the given kind.
    pub fn initial(kind: ReplicaKind) -> Self {
        match kind {
            ReplicaKind::Mirror => Self::Mirror(MirrorState::Unknown),
            ReplicaKind::FullCopy => Self::FullCopy(FullCopyState::Unknown),
            ReplicaKind::Snapshot => Self::Snapshot(SnapshotState::Unknown),
            ReplicaKind::SnapshotSession => Self::SnapshotSession(SessionState::Unknown),
        }
    }
    /// The replica kind this state belongs to.
    pub fn kind(&self) -> ReplicaKind {
        match self {
            Self::Mirror(_) => ReplicaKind::Mirror,
            Self::FullCopy(_) => ReplicaKind::FullCopy,
            Self::Snapshot(_) => ReplicaKind::Snapshot,
            Self::SnapshotSession(_) => ReplicaKind::SnapshotSession,
        }
    }
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mirror(state) => write!(f, "{state}"),
            Self::FullCopy(state) => write!(f, "{state}"),
            Self::Snapshot(state) => write!(f, "{state}"),
            Self::SnapshotSession(state) => write!(f, "{state}"),
        }
    }
}

/// What a replica is a copy of.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub enum ReplicaSource {
    /// A single volume.
    Volume(VolumeId),
    /// An array replication group, only valid for snapshot sessions.
    ReplicationGroup(String),
}

/// A mirror, full copy, snapshot or snapshot session, as stored in the repository.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSpec {
    /// Replica Id.
    pub uuid: ReplicaId,
    /// Human readable label, also used as the array element name.
    pub label: String,
    /// Source of the replica.
    pub source: ReplicaSource,
    /// Owning storage system.
    pub system: StorageSystemId,
    /// Pool in which the replica is provisioned, if any.
    pub pool: Option<PoolId>,
    /// Consistency group of the source, if any.
    pub consistency_group: Option<ConsistencyGroupId>,
    /// Membership of an array replication group.
    pub replication_group: Option<String>,
    /// Kind specific state.
    pub state: ReplicaState,
    /// Native array identifier, absent until the array object is provisioned.
    pub native_id: Option<String>,
    /// Soft-deleted.
    pub inactive: bool,
    /// Copy mode of a target linked to a session.
    pub copy_mode: Option<CopyMode>,
    /// Session a snapshot target is linked to.
    pub session: Option<ReplicaId>,
    /// Targets linked to a snapshot session.
    #[serde(default)]
    pub linked_targets: BTreeSet<ReplicaId>,
    /// Clone set or session name shared by replicas created together.
    pub set_name: Option<String>,
}

impl ReplicaSpec {
    /// Create a new pending replica of the given volume.
    pub fn new(kind: ReplicaKind, label: impl Into<String>, source: &VolumeSpec) -> Self {
        Self {
            uuid: ReplicaId::new(),
            label: label.into(),
            source: ReplicaSource::Volume(source.uuid.clone()),
            system: source.system.clone(),
            pool: Some(source.pool.clone()),
            consistency_group: source.consistency_group.clone(),
            replication_group: None,
            state: ReplicaState::initial(kind),
            native_id: None,
            inactive: false,
            copy_mode: None,
            session: None,
            linked_targets: Default::default(),
            set_name: None,
        }
    }
    /// Create a new pending snapshot session of an array replication group.
    pub fn new_group_session(
        label: impl Into<String>,
        system: &StorageSystemId,
        group: &str,
    ) -> Self {
        Self {
            uuid: ReplicaId::new(),
            label: label.into(),
            source: ReplicaSource::ReplicationGroup(group.to_string()),
            system: system.clone(),
            pool: None,
            consistency_group: None,
            replication_group: None,
            state: ReplicaState::initial(ReplicaKind::SnapshotSession),
            native_id: None,
            inactive: false,
            copy_mode: None,
            session: None,
            linked_targets: Default::default(),
            set_name: None,
        }
    }
    /// A snapshot target to be linked to the given session.
    pub fn with_session(mut self, session: &ReplicaId, mode: CopyMode) -> Self {
        self.session = Some(session.clone());
        self.copy_mode = Some(mode);
        self
    }
    /// With the given clone set or session name.
    pub fn with_set_name(mut self, name: Option<String>) -> Self {
        self.set_name = name;
        self
    }
    /// The kind of the replica.
    pub fn kind(&self) -> ReplicaKind {
        self.state.kind()
    }
    /// A replica whose array object has not been provisioned yet.
    pub fn is_pending(&self) -> bool {
        self.native_id.is_none()
    }
    /// The source volume, if the source is a single volume.
    pub fn source_volume(&self) -> Option<&VolumeId> {
        match &self.source {
            ReplicaSource::Volume(id) => Some(id),
            ReplicaSource::ReplicationGroup(_) => None,
        }
    }
    /// A snapshot linked to a snapshot session.
    pub fn is_linked_target(&self) -> bool {
        self.session.is_some()
    }
}

/// Key used by the store to uniquely identify a ReplicaSpec structure.
pub struct ReplicaSpecKey(ReplicaId);

impl From<&ReplicaId> for ReplicaSpecKey {
    fn from(id: &ReplicaId) -> Self {
        Self(id.clone())
    }
}

impl ObjectKey for ReplicaSpecKey {
    fn key_type(&self) -> StorableObjectType {
        StorableObjectType::ReplicaSpec
    }
    fn key_uuid(&self) -> String {
        self.0.to_string()
    }
}

impl StorableObject for ReplicaSpec {
    type Key = ReplicaSpecKey;

    fn key(&self) -> Self::Key {
        ReplicaSpecKey(self.uuid.clone())
    }
}
