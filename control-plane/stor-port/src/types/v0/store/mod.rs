use crate::types::v0::transport::{
    ConsistencyGroupId, OperationId, ReplicaId, StorageSystemId, VolumeId,
};
use serde::{Deserialize, Serialize};

pub mod consistency_group;
pub mod definitions;
pub mod memory;
pub mod operation;
pub mod replica;
pub mod system;
pub mod volume;
pub mod workflow;

pub use definitions::{ObjectKey, Repository, StorableObject, StorableObjectType, StoreError};

/// Identifies any domain entity whose operation status can be tracked.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ResourceId {
    StorageSystem(StorageSystemId),
    Volume(VolumeId),
    ConsistencyGroup(ConsistencyGroupId),
    Replica(ReplicaId),
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StorageSystem(id) => write!(f, "system/{id}"),
            Self::Volume(id) => write!(f, "volume/{id}"),
            Self::ConsistencyGroup(id) => write!(f, "cg/{id}"),
            Self::Replica(id) => write!(f, "replica/{id}"),
        }
    }
}

impl From<&VolumeId> for ResourceId {
    fn from(id: &VolumeId) -> Self {
        Self::Volume(id.clone())
    }
}
impl From<&ReplicaId> for ResourceId {
    fn from(id: &ReplicaId) -> Self {
        Self::Replica(id.clone())
    }
}
impl From<&ConsistencyGroupId> for ResourceId {
    fn from(id: &ConsistencyGroupId) -> Self {
        Self::ConsistencyGroup(id.clone())
    }
}

/// Operation id's are unique only within the resource they were issued against.
pub(crate) fn operation_key(resource: &ResourceId, operation: &OperationId) -> String {
    format!("{resource}/{operation}")
}
