use super::definitions::{ObjectKey, StorableObject, StorableObjectType};
use crate::types::v0::transport::{
    ConsistencyGroupId, PoolId, ReplicaId, ReplicaKind, StorageSystemId, VolumeId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A provisioned block device, as stored in the repository.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Volume Id.
    pub uuid: VolumeId,
    /// Human readable label, also used as the array element name.
    pub label: String,
    /// Owning storage system.
    pub system: StorageSystemId,
    /// Owning pool on the storage system.
    pub pool: PoolId,
    /// Size of the volume in bytes.
    pub size: u64,
    /// Thinly provisioned.
    pub thin: bool,
    /// Number of physical members composing a meta volume, zero for a regular volume.
    pub meta_member_count: u32,
    /// Meta members which have been provisioned on the array.
    #[serde(default)]
    pub meta_members: BTreeSet<u32>,
    /// Membership of a logical consistency group.
    pub consistency_group: Option<ConsistencyGroupId>,
    /// Membership of an array replication group.
    pub replication_group: Option<String>,
    /// Mirrors of this volume.
    #[serde(default)]
    pub mirrors: BTreeSet<ReplicaId>,
    /// Full copies of this volume.
    #[serde(default)]
    pub full_copies: BTreeSet<ReplicaId>,
    /// Snapshots of this volume, including linked session targets.
    #[serde(default)]
    pub snapshots: BTreeSet<ReplicaId>,
    /// Snapshot sessions of this volume.
    #[serde(default)]
    pub sessions: BTreeSet<ReplicaId>,
    /// Native array identifier, absent until the array object is provisioned.
    pub native_id: Option<String>,
    /// Soft-deleted.
    pub inactive: bool,
}

impl VolumeSpec {
    /// Create a new pending volume record.
    pub fn new(
        label: impl Into<String>,
        system: impl Into<StorageSystemId>,
        pool: impl Into<PoolId>,
        size: u64,
    ) -> Self {
        Self {
            uuid: VolumeId::new(),
            label: label.into(),
            system: system.into(),
            pool: pool.into(),
            size,
            thin: true,
            meta_member_count: 0,
            meta_members: Default::default(),
            consistency_group: None,
            replication_group: None,
            mirrors: Default::default(),
            full_copies: Default::default(),
            snapshots: Default::default(),
            sessions: Default::default(),
            native_id: None,
            inactive: false,
        }
    }
    /// With the given consistency group membership.
    pub fn with_consistency_group(mut self, group: &ConsistencyGroupId) -> Self {
        self.consistency_group = Some(group.clone());
        self
    }
    /// Composed from the given number of meta members.
    pub fn with_meta_members(mut self, count: u32) -> Self {
        self.meta_member_count = count;
        self
    }
    /// Thick provisioning.
    pub fn thick(mut self) -> Self {
        self.thin = false;
        self
    }
    /// Check if the volume is composed of meta members.
    pub fn is_meta(&self) -> bool {
        self.meta_member_count > 1
    }
    /// Check if the array object has been provisioned.
    pub fn is_provisioned(&self) -> bool {
        self.native_id.is_some()
    }
    /// Replica references of the given kind.
    pub fn replica_refs(&self, kind: ReplicaKind) -> &BTreeSet<ReplicaId> {
        match kind {
            ReplicaKind::Mirror => &self.mirrors,
            ReplicaKind::FullCopy => &self.full_copies,
            ReplicaKind::Snapshot => &self.snapshots,
            ReplicaKind::SnapshotSession => &self.sessions,
        }
    }
    /// Mutable replica references of the given kind.
    pub fn replica_refs_mut(&mut self, kind: ReplicaKind) -> &mut BTreeSet<ReplicaId> {
        match kind {
            ReplicaKind::Mirror => &mut self.mirrors,
            ReplicaKind::FullCopy => &mut self.full_copies,
            ReplicaKind::Snapshot => &mut self.snapshots,
            ReplicaKind::SnapshotSession => &mut self.sessions,
        }
    }
    /// Every replica reference, sessions first so linked targets come after their session.
    pub fn all_replica_refs(&self) -> impl Iterator<Item = &ReplicaId> {
        self.sessions
            .iter()
            .chain(self.snapshots.iter())
            .chain(self.mirrors.iter())
            .chain(self.full_copies.iter())
    }
}

/// Key used by the store to uniquely identify a VolumeSpec structure.
pub struct VolumeSpecKey(VolumeId);

impl From<&VolumeId> for VolumeSpecKey {
    fn from(id: &VolumeId) -> Self {
        Self(id.clone())
    }
}

impl ObjectKey for VolumeSpecKey {
    fn key_type(&self) -> StorableObjectType {
        StorableObjectType::VolumeSpec
    }
    fn key_uuid(&self) -> String {
        self.0.to_string()
    }
}

impl StorableObject for VolumeSpec {
    type Key = VolumeSpecKey;

    fn key(&self) -> Self::Key {
        VolumeSpecKey(self.uuid.clone())
    }
}
