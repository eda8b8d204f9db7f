use super::definitions::{ObjectKey, StorableObject, StorableObjectType};
use crate::types::v0::transport::{StorageSystemId, Technology};
use serde::{Deserialize, Serialize};

/// A managed storage array.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StorageSystem {
    /// Identity of the array.
    pub id: StorageSystemId,
    /// Technology of the array, which selects its device driver.
    pub technology: Technology,
    /// Human readable label.
    pub label: String,
    /// Management endpoint, opaque to the orchestration core.
    pub endpoint: Option<String>,
}

impl StorageSystem {
    /// Create a new `Self` without a management endpoint.
    pub fn new(id: impl Into<StorageSystemId>, technology: Technology) -> Self {
        let id = id.into();
        Self {
            label: id.to_string(),
            id,
            technology,
            endpoint: None,
        }
    }
}

/// Key used by the store to uniquely identify a StorageSystem structure.
pub struct StorageSystemKey(StorageSystemId);

impl From<&StorageSystemId> for StorageSystemKey {
    fn from(id: &StorageSystemId) -> Self {
        Self(id.clone())
    }
}

impl ObjectKey for StorageSystemKey {
    fn key_type(&self) -> StorableObjectType {
        StorableObjectType::StorageSystem
    }
    fn key_uuid(&self) -> String {
        self.0.to_string()
    }
}

impl StorableObject for StorageSystem {
    type Key = StorageSystemKey;

    fn key(&self) -> Self::Key {
        StorageSystemKey(self.id.clone())
    }
}
