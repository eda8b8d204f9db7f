use super::{
    consistency_group::ConsistencyGroupSpec,
    definitions::{key_prefix, ObjectKey, Repository, StorableObject, StorableObjectType, StoreError},
    operation::{Operation, OperationKey},
    replica::ReplicaSpec,
    system::StorageSystem,
    volume::VolumeSpec,
    workflow::{WorkflowMarkers, WorkflowMarkersKey},
    ResourceId,
};
use crate::types::v0::transport::{
    ConsistencyGroupId, OperationId, ReplicaId, StorageSystemId, VolumeId, WorkflowId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};

/// In-memory repository which keeps every object serialised under its store key.
/// Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl MemoryStore {
    /// Create a new empty `Self`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts the given `O` object into the store.
    pub fn put_obj<O: StorableObject>(&self, object: &O) -> Result<(), StoreError> {
        let value = serde_json::to_value(object).map_err(|error| StoreError::SerialiseValue {
            reason: error.to_string(),
        })?;
        self.objects.lock().insert(object.key().key(), value);
        Ok(())
    }

    /// Gets the object `O` through its `O::Key`.
    pub fn get_obj<O: StorableObject>(&self, key: &O::Key) -> Result<O, StoreError> {
        let key = key.key();
        let value = self
            .objects
            .lock()
            .get(&key)
            .cloned()
            .ok_or(StoreError::MissingEntry { key })?;
        Self::deserialise(value)
    }

    /// Get every stored object of the given type.
    fn get_objs<O: StorableObject>(&self, key_type: StorableObjectType) -> Result<Vec<O>, StoreError> {
        let prefix = key_prefix(key_type);
        let values = self
            .objects
            .lock()
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, value)| value.clone())
            .collect::<Vec<_>>();
        values.into_iter().map(Self::deserialise).collect()
    }

    fn deserialise<O: StorableObject>(value: Value) -> Result<O, StoreError> {
        serde_json::from_value(value.clone()).map_err(|error| StoreError::DeserialiseValue {
            value: value.to_string(),
            reason: error.to_string(),
        })
    }

    /// Update the workflow markers under the store lock.
    fn update_markers(
        &self,
        id: &WorkflowId,
        update: impl FnOnce(&mut WorkflowMarkers),
    ) -> Result<(), StoreError> {
        let key = WorkflowMarkersKey::from(id).key();
        let mut objects = self.objects.lock();
        let mut markers = match objects.get(&key) {
            Some(value) => Self::deserialise::<WorkflowMarkers>(value.clone())?,
            None => WorkflowMarkers::new(id),
        };
        update(&mut markers);
        let value = serde_json::to_value(&markers).map_err(|error| StoreError::SerialiseValue {
            reason: error.to_string(),
        })?;
        objects.insert(key, value);
        Ok(())
    }

    /// Number of stored objects of the given type.
    pub fn count(&self, key_type: StorableObjectType) -> usize {
        let prefix = key_prefix(key_type);
        self.objects
            .lock()
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .count()
    }
}

#[async_trait]
impl Repository for MemoryStore {
    async fn storage_system(&self, id: &StorageSystemId) -> Result<StorageSystem, StoreError> {
        self.get_obj::<StorageSystem>(&id.into())
    }
    async fn put_storage_system(&self, system: &StorageSystem) -> Result<(), StoreError> {
        self.put_obj(system)
    }

    async fn volume(&self, id: &VolumeId) -> Result<VolumeSpec, StoreError> {
        self.get_obj::<VolumeSpec>(&id.into())
    }
    async fn put_volume(&self, volume: &VolumeSpec) -> Result<(), StoreError> {
        self.put_obj(volume)
    }
    async fn volumes_in_consistency_group(
        &self,
        id: &ConsistencyGroupId,
    ) -> Result<Vec<VolumeSpec>, StoreError> {
        let volumes = self.get_objs::<VolumeSpec>(StorableObjectType::VolumeSpec)?;
        Ok(volumes
            .into_iter()
            .filter(|v| !v.inactive && v.consistency_group.as_ref() == Some(id))
            .collect())
    }
    async fn volumes_in_replication_group(
        &self,
        system: &StorageSystemId,
        group: &str,
    ) -> Result<Vec<VolumeSpec>, StoreError> {
        let volumes = self.get_objs::<VolumeSpec>(StorableObjectType::VolumeSpec)?;
        Ok(volumes
            .into_iter()
            .filter(|v| {
                !v.inactive && &v.system == system && v.replication_group.as_deref() == Some(group)
            })
            .collect())
    }

    async fn consistency_group(
        &self,
        id: &ConsistencyGroupId,
    ) -> Result<ConsistencyGroupSpec, StoreError> {
        self.get_obj::<ConsistencyGroupSpec>(&id.into())
    }
    async fn put_consistency_group(&self, group: &ConsistencyGroupSpec) -> Result<(), StoreError> {
        self.put_obj(group)
    }

    async fn replica(&self, id: &ReplicaId) -> Result<ReplicaSpec, StoreError> {
        self.get_obj::<ReplicaSpec>(&id.into())
    }
    async fn put_replica(&self, replica: &ReplicaSpec) -> Result<(), StoreError> {
        self.put_obj(replica)
    }
    async fn replicas_of_volume(&self, id: &VolumeId) -> Result<Vec<ReplicaSpec>, StoreError> {
        let replicas = self.get_objs::<ReplicaSpec>(StorableObjectType::ReplicaSpec)?;
        Ok(replicas
            .into_iter()
            .filter(|r| !r.inactive && r.source_volume() == Some(id))
            .collect())
    }
    async fn replicas_in_replication_group(
        &self,
        system: &StorageSystemId,
        group: &str,
    ) -> Result<Vec<ReplicaSpec>, StoreError> {
        let replicas = self.get_objs::<ReplicaSpec>(StorableObjectType::ReplicaSpec)?;
        Ok(replicas
            .into_iter()
            .filter(|r| {
                !r.inactive && &r.system == system && r.replication_group.as_deref() == Some(group)
            })
            .collect())
    }

    async fn update_operation(
        &self,
        resource: &ResourceId,
        operation: &Operation,
    ) -> Result<(), StoreError> {
        tracing::trace!(%resource, operation.id=%operation.id, status=%operation.status, "Updating operation");
        self.put_obj(operation)
    }
    async fn operation(
        &self,
        resource: &ResourceId,
        id: &OperationId,
    ) -> Result<Operation, StoreError> {
        self.get_obj::<Operation>(&OperationKey::new(resource, id))
    }

    async fn workflow_markers(&self, id: &WorkflowId) -> Result<WorkflowMarkers, StoreError> {
        match self.get_obj::<WorkflowMarkers>(&id.into()) {
            Err(error) if error.is_missing() => Ok(WorkflowMarkers::new(id)),
            result => result,
        }
    }
    async fn add_workflow_marker(&self, id: &WorkflowId, marker: &str) -> Result<(), StoreError> {
        self.update_markers(id, |markers| {
            markers.markers.insert(marker.to_string());
        })
    }
    async fn put_workflow_data(
        &self,
        id: &WorkflowId,
        marker: &str,
        data: &Value,
    ) -> Result<(), StoreError> {
        self.update_markers(id, |markers| {
            markers.data.insert(marker.to_string(), data.clone());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::v0::transport::{ReplicaKind, Technology};

    #[tokio::test]
    async fn volumes_and_replicas() {
        let store = MemoryStore::new();
        store
            .put_storage_system(&StorageSystem::new("sys-1", Technology::Vmax3))
            .await
            .unwrap();
        let group = ConsistencyGroupSpec::new("cg-1");
        let mut v1 = VolumeSpec::new("v1", "sys-1", "pool-1", 10).with_consistency_group(&group.uuid);
        let v2 = VolumeSpec::new("v2", "sys-1", "pool-1", 10).with_consistency_group(&group.uuid);
        let mut clone = ReplicaSpec::new(ReplicaKind::FullCopy, "c1", &v1);
        clone.replication_group = Some("RG1".into());
        v1.full_copies.insert(clone.uuid.clone());
        store.put_volume(&v1).await.unwrap();
        store.put_volume(&v2).await.unwrap();
        store.put_replica(&clone).await.unwrap();

        let members = store.volumes_in_consistency_group(&group.uuid).await.unwrap();
        assert_eq!(members.len(), 2);
        let in_group = store
            .replicas_in_replication_group(&"sys-1".into(), "RG1")
            .await
            .unwrap();
        assert_eq!(in_group, vec![clone.clone()]);
        assert_eq!(store.replicas_of_volume(&v1.uuid).await.unwrap().len(), 1);

        let mut inactive = v2.clone();
        inactive.inactive = true;
        store.put_volume(&inactive).await.unwrap();
        let members = store.volumes_in_consistency_group(&group.uuid).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(store.count(StorableObjectType::VolumeSpec), 2);
    }

    #[tokio::test]
    async fn missing_entries() {
        let store = MemoryStore::new();
        let error = store.volume(&VolumeId::new()).await.unwrap_err();
        assert!(error.is_missing());

        let workflow = WorkflowId::new();
        assert!(store.workflow_markers(&workflow).await.unwrap().markers.is_empty());
        store.add_workflow_marker(&workflow, "0:create").await.unwrap();
        store.add_workflow_marker(&workflow, "1:add").await.unwrap();
        let markers = store.workflow_markers(&workflow).await.unwrap();
        assert!(markers.contains("0:create"));
        assert_eq!(markers.markers.len(), 2);

        store
            .put_workflow_data(&workflow, "1:add:data", &Value::from("session-1"))
            .await
            .unwrap();
        let markers = store.workflow_markers(&workflow).await.unwrap();
        assert_eq!(markers.data("1:add:data"), Some(&Value::from("session-1")));
        assert_eq!(markers.markers.len(), 2);
    }
}
