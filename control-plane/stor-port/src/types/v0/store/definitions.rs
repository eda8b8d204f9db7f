use super::{
    consistency_group::ConsistencyGroupSpec, operation::Operation, replica::ReplicaSpec,
    system::StorageSystem, volume::VolumeSpec, workflow::WorkflowMarkers, ResourceId,
};
use crate::types::v0::transport::{
    ConsistencyGroupId, OperationId, ReplicaId, StorageSystemId, VolumeId, WorkflowId,
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use snafu::Snafu;
use strum_macros::{AsRefStr, Display};

/// Definition of errors that can be returned from the repository.
#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub), context(suffix(false)))]
pub enum StoreError {
    /// Failed to find an entry with the given key.
    #[snafu(display("Entry with key {} not found.", key))]
    MissingEntry { key: String },
    /// Failed to deserialise value.
    #[snafu(display("Failed to deserialise value {}. Error {}", value, reason))]
    DeserialiseValue { value: String, reason: String },
    /// Failed to serialise value.
    #[snafu(display("Failed to serialise value. Error {}", reason))]
    SerialiseValue { reason: String },
    /// The backing store is not reachable.
    #[snafu(display("Store is not available: {}", reason))]
    NotReady { reason: String },
}

impl StoreError {
    /// Whether the error is a missing entry.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::MissingEntry { .. })
    }
}

/// Types of objects which are stored in the repository.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Display, AsRefStr)]
pub enum StorableObjectType {
    StorageSystem,
    VolumeSpec,
    ConsistencyGroupSpec,
    ReplicaSpec,
    Operation,
    WorkflowMarkers,
}

/// Implemented by Keys of Storable Objects.
pub trait ObjectKey: Sync + Send {
    fn key(&self) -> String {
        format!("{}/{}", self.key_type().as_ref(), self.key_uuid())
    }
    fn key_type(&self) -> StorableObjectType;
    fn key_uuid(&self) -> String;
}

/// Implemented by objects which get stored in the repository.
pub trait StorableObject: Serialize + Sync + Send + DeserializeOwned {
    type Key: ObjectKey;

    fn key(&self) -> Self::Key;
}

/// Prefix under which every object of the given type is stored.
pub fn key_prefix(key_type: StorableObjectType) -> String {
    format!("{}/", key_type.as_ref())
}

/// Read and write access to the domain records.
/// Queries only return active (not soft-deleted) records unless stated otherwise.
#[async_trait]
pub trait Repository: Send + Sync + std::fmt::Debug {
    /// Get a storage system by id.
    async fn storage_system(&self, id: &StorageSystemId) -> Result<StorageSystem, StoreError>;
    /// Insert or update a storage system.
    async fn put_storage_system(&self, system: &StorageSystem) -> Result<(), StoreError>;

    /// Get a volume by id, active or not.
    async fn volume(&self, id: &VolumeId) -> Result<VolumeSpec, StoreError>;
    /// Insert or update a volume.
    async fn put_volume(&self, volume: &VolumeSpec) -> Result<(), StoreError>;
    /// Active volumes which are members of the consistency group.
    async fn volumes_in_consistency_group(
        &self,
        id: &ConsistencyGroupId,
    ) -> Result<Vec<VolumeSpec>, StoreError>;
    /// Active volumes which are members of the array replication group.
    async fn volumes_in_replication_group(
        &self,
        system: &StorageSystemId,
        group: &str,
    ) -> Result<Vec<VolumeSpec>, StoreError>;

    /// Get a consistency group by id.
    async fn consistency_group(
        &self,
        id: &ConsistencyGroupId,
    ) -> Result<ConsistencyGroupSpec, StoreError>;
    /// Insert or update a consistency group.
    async fn put_consistency_group(&self, group: &ConsistencyGroupSpec) -> Result<(), StoreError>;

    /// Get a replica of any kind by id, active or not.
    async fn replica(&self, id: &ReplicaId) -> Result<ReplicaSpec, StoreError>;
    /// Insert or update a replica.
    async fn put_replica(&self, replica: &ReplicaSpec) -> Result<(), StoreError>;
    /// Active replicas of every kind whose source is the given volume.
    async fn replicas_of_volume(&self, id: &VolumeId) -> Result<Vec<ReplicaSpec>, StoreError>;
    /// Active replicas which are members of the array replication group.
    async fn replicas_in_replication_group(
        &self,
        system: &StorageSystemId,
        group: &str,
    ) -> Result<Vec<ReplicaSpec>, StoreError>;

    /// Atomically set the operation status record of a resource.
    async fn update_operation(
        &self,
        resource: &ResourceId,
        operation: &Operation,
    ) -> Result<(), StoreError>;
    /// Get the operation status record of a resource.
    async fn operation(
        &self,
        resource: &ResourceId,
        id: &OperationId,
    ) -> Result<Operation, StoreError>;

    /// Get the execution markers of a workflow, empty if it never ran.
    async fn workflow_markers(&self, id: &WorkflowId) -> Result<WorkflowMarkers, StoreError>;
    /// Atomically add a marker to the workflow's execution markers.
    async fn add_workflow_marker(&self, id: &WorkflowId, marker: &str) -> Result<(), StoreError>;
    /// Atomically record step data along with the workflow's execution markers.
    async fn put_workflow_data(
        &self,
        id: &WorkflowId,
        marker: &str,
        data: &Value,
    ) -> Result<(), StoreError>;
}
