use crate::errors::SvcError;
use async_trait::async_trait;
use stor_port::{
    transport_api::ResourceKind,
    types::v0::{
        store::{
            consistency_group::ConsistencyGroupSpec, replica::ReplicaSpec, system::StorageSystem,
            volume::VolumeSpec, Repository,
        },
        transport::{ConsistencyGroupId, ReplicaId, StorageSystemId, VolumeId},
    },
};

/// Typed lookups over the repository, reporting missing records as `SvcError::NotFound`.
#[async_trait]
pub trait RepositoryExt {
    /// Get the storage system.
    async fn get_storage_system(&self, id: &StorageSystemId) -> Result<StorageSystem, SvcError>;
    /// Get the volume.
    async fn get_volume(&self, id: &VolumeId) -> Result<VolumeSpec, SvcError>;
    /// Get all volumes, in the given order.
    async fn get_volumes(&self, ids: &[VolumeId]) -> Result<Vec<VolumeSpec>, SvcError>;
    /// Get the consistency group.
    async fn get_consistency_group(
        &self,
        id: &ConsistencyGroupId,
    ) -> Result<ConsistencyGroupSpec, SvcError>;
    /// Get the replica.
    async fn get_replica(&self, id: &ReplicaId) -> Result<ReplicaSpec, SvcError>;
    /// Get all replicas, in the given order.
    async fn get_replicas(&self, ids: &[ReplicaId]) -> Result<Vec<ReplicaSpec>, SvcError>;
    /// Get the active replicas among the given references, skipping stale ones.
    async fn active_replicas(&self, ids: &[ReplicaId]) -> Result<Vec<ReplicaSpec>, SvcError>;
}

#[async_trait]
impl<T> RepositoryExt for T
where
    T: Repository + ?Sized,
{
    async fn get_storage_system(&self, id: &StorageSystemId) -> Result<StorageSystem, SvcError> {
        self.storage_system(id)
            .await
            .map_err(|error| SvcError::from_store(ResourceKind::StorageSystem, id, error))
    }
    async fn get_volume(&self, id: &VolumeId) -> Result<VolumeSpec, SvcError> {
        self.volume(id)
            .await
            .map_err(|error| SvcError::from_store(ResourceKind::Volume, id, error))
    }
    async fn get_volumes(&self, ids: &[VolumeId]) -> Result<Vec<VolumeSpec>, SvcError> {
        let mut volumes = Vec::with_capacity(ids.len());
        for id in ids {
            volumes.push(self.get_volume(id).await?);
        }
        Ok(volumes)
    }
    async fn get_consistency_group(
        &self,
        id: &ConsistencyGroupId,
    ) -> Result<ConsistencyGroupSpec, SvcError> {
        self.consistency_group(id)
            .await
            .map_err(|error| SvcError::from_store(ResourceKind::ConsistencyGroup, id, error))
    }
    async fn get_replica(&self, id: &ReplicaId) -> Result<ReplicaSpec, SvcError> {
        match self.replica(id).await {
            Ok(replica) => Ok(replica),
            Err(error) => Err(SvcError::from_store(ResourceKind::Unknown, id, error)),
        }
    }
    async fn get_replicas(&self, ids: &[ReplicaId]) -> Result<Vec<ReplicaSpec>, SvcError> {
        let mut replicas = Vec::with_capacity(ids.len());
        for id in ids {
            replicas.push(self.get_replica(id).await?);
        }
        Ok(replicas)
    }
    async fn active_replicas(&self, ids: &[ReplicaId]) -> Result<Vec<ReplicaSpec>, SvcError> {
        let mut replicas = Vec::new();
        for id in ids {
            match self.get_replica(id).await {
                Ok(replica) if !replica.inactive => replicas.push(replica),
                Ok(_) => {}
                Err(error) if error.is_stale_reference() => {
                    tracing::warn!(replica.id=%id, "Skipping stale replica reference");
                }
                Err(error) => return Err(error),
            }
        }
        Ok(replicas)
    }
}
