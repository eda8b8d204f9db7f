use super::{
    definitions::{ObjectKey, StorableObject, StorableObjectType},
    operation_key, ResourceId,
};
use crate::types::v0::transport::OperationId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

/// User visible status of an operation on a resource.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Display)]
pub enum OperationStatus {
    /// Accepted and not yet terminal.
    Pending,
    /// Completed successfully.
    Ready,
    /// Completed, but some group replica could not be propagated.
    Warning,
    /// Failed.
    Error,
}

impl OperationStatus {
    /// Check if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// The operations which are tracked on the resources they affect.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Display, AsRefStr)]
pub enum OperationType {
    CreateVolumes,
    DeleteVolumes,
    ExpandVolumes,
    CreateMirrors,
    FractureMirrors,
    ResumeMirrors,
    DetachMirrors,
    DeleteMirrors,
    CreateSnapshots,
    DeleteSnapshots,
    RestoreSnapshot,
    ResyncSnapshots,
    CreateFullCopies,
    ActivateFullCopies,
    FractureFullCopies,
    ResyncFullCopies,
    DetachFullCopies,
    RestoreFromFullCopies,
    DeleteFullCopies,
    CreateSnapshotSessions,
    LinkTargets,
    RelinkTargets,
    UnlinkTargets,
    RestoreSnapshotSession,
    DeleteSnapshotSession,
    RestoreFromLinkedTarget,
    UpdateConsistencyGroup,
}

/// Operation status record of a resource.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Operation Id.
    pub id: OperationId,
    /// Resource the operation affected.
    pub resource: ResourceId,
    /// Type of the operation.
    pub kind: OperationType,
    /// Current status.
    pub status: OperationStatus,
    /// Human readable outcome, the error chain for failures.
    pub message: Option<String>,
    /// Time of the last update.
    pub updated: DateTime<Utc>,
}

impl Operation {
    /// Create a new operation record with the given status.
    pub fn new(
        id: &OperationId,
        resource: &ResourceId,
        kind: OperationType,
        status: OperationStatus,
        message: Option<String>,
    ) -> Self {
        Self {
            id: id.clone(),
            resource: resource.clone(),
            kind,
            status,
            message,
            updated: Utc::now(),
        }
    }
}

/// Key used by the store to uniquely identify an Operation structure.
pub struct OperationKey(String);

impl OperationKey {
    /// Key of the operation `id` issued against the `resource`.
    pub fn new(resource: &ResourceId, id: &OperationId) -> Self {
        Self(operation_key(resource, id))
    }
}

impl ObjectKey for OperationKey {
    fn key_type(&self) -> StorableObjectType {
        StorableObjectType::Operation
    }
    fn key_uuid(&self) -> String {
        self.0.clone()
    }
}

impl StorableObject for Operation {
    type Key = OperationKey;

    fn key(&self) -> Self::Key {
        OperationKey::new(&self.resource, &self.id)
    }
}
