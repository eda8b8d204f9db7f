use super::definitions::{ObjectKey, StorableObject, StorableObjectType};
use crate::types::v0::transport::WorkflowId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Markers of the steps of a workflow which have already been executed or rolled back, along
/// with the data the executed steps learned for their successors.
/// Survives restarts so that a resumed workflow does not re-issue device commands.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkflowMarkers {
    /// Workflow Id.
    pub id: WorkflowId,
    /// The recorded markers.
    #[serde(default)]
    pub markers: BTreeSet<String>,
    /// Step data, by step marker.
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
}

impl WorkflowMarkers {
    /// Empty markers of the given workflow.
    pub fn new(id: &WorkflowId) -> Self {
        Self {
            id: id.clone(),
            markers: Default::default(),
            data: Default::default(),
        }
    }
    /// Check if the marker has been recorded.
    pub fn contains(&self, marker: &str) -> bool {
        self.markers.contains(marker)
    }
    /// Get the step data recorded under the marker.
    pub fn data(&self, marker: &str) -> Option<&Value> {
        self.data.get(marker)
    }
}

/// Key used by the store to uniquely identify a WorkflowMarkers structure.
pub struct WorkflowMarkersKey(WorkflowId);

impl From<&WorkflowId> for WorkflowMarkersKey {
    fn from(id: &WorkflowId) -> Self {
        Self(id.clone())
    }
}

impl ObjectKey for WorkflowMarkersKey {
    fn key_type(&self) -> StorableObjectType {
        StorableObjectType::WorkflowMarkers
    }
    fn key_uuid(&self) -> String {
        self.0.to_string()
    }
}

impl StorableObject for WorkflowMarkers {
    type Key = WorkflowMarkersKey;

    fn key(&self) -> Self::Key {
        WorkflowMarkersKey(self.id.clone())
    }
}
