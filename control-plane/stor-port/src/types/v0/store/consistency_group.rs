use super::definitions::{ObjectKey, StorableObject, StorableObjectType};
use crate::types::v0::transport::{ConsistencyGroupId, StorageSystemId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strum_macros::{Display, EnumString};

/// Replication technologies which may be requested for a consistency group.
#[derive(
    Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum ConsistencyGroupType {
    /// Array local replicas (snapshots, clones, mirrors).
    Local,
    /// Remote replication between arrays.
    Remote,
}

/// A logical grouping of volumes across one or more storage systems.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyGroupSpec {
    /// Consistency group Id.
    pub uuid: ConsistencyGroupId,
    /// Human readable label, the default name of its array replication groups.
    pub label: String,
    /// Array replication groups provisioned for this group on each storage system.
    #[serde(default)]
    pub system_groups: BTreeMap<StorageSystemId, BTreeSet<String>>,
    /// Requested replication technologies.
    #[serde(default)]
    pub requested_types: BTreeSet<ConsistencyGroupType>,
    /// Soft-deleted.
    pub inactive: bool,
}

impl ConsistencyGroupSpec {
    /// Create a new consistency group, not yet created on any storage system.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            uuid: ConsistencyGroupId::new(),
            label: label.into(),
            system_groups: Default::default(),
            requested_types: BTreeSet::from([ConsistencyGroupType::Local]),
            inactive: false,
        }
    }
    /// Check if the replication group `name` has been provisioned on the system.
    pub fn created_on(&self, system: &StorageSystemId, name: &str) -> bool {
        self.system_groups
            .get(system)
            .map(|groups| groups.contains(name))
            .unwrap_or(false)
    }
    /// Check if any replication group has been provisioned on the system.
    pub fn created_on_system(&self, system: &StorageSystemId) -> bool {
        self.system_groups
            .get(system)
            .map(|groups| !groups.is_empty())
            .unwrap_or(false)
    }
    /// The replication group used for volumes of this group on the given system.
    /// This is the first provisioned group, or the group label when none exists yet.
    pub fn group_name_on(&self, system: &StorageSystemId) -> String {
        self.system_groups
            .get(system)
            .and_then(|groups| groups.iter().next().cloned())
            .unwrap_or_else(|| self.label.clone())
    }
    /// Record the replication group as provisioned on the system.
    pub fn add_system_group(&mut self, system: &StorageSystemId, name: &str) {
        self.system_groups
            .entry(system.clone())
            .or_default()
            .insert(name.to_string());
    }
    /// Record the replication group as removed from the system.
    pub fn remove_system_group(&mut self, system: &StorageSystemId, name: &str) {
        if let Some(groups) = self.system_groups.get_mut(system) {
            groups.remove(name);
            if groups.is_empty() {
                self.system_groups.remove(system);
            }
        }
    }
}

/// Key used by the store to uniquely identify a ConsistencyGroupSpec structure.
pub struct ConsistencyGroupSpecKey(ConsistencyGroupId);

impl From<&ConsistencyGroupId> for ConsistencyGroupSpecKey {
    fn from(id: &ConsistencyGroupId) -> Self {
        Self(id.clone())
    }
}

impl ObjectKey for ConsistencyGroupSpecKey {
    fn key_type(&self) -> StorableObjectType {
        StorableObjectType::ConsistencyGroupSpec
    }
    fn key_uuid(&self) -> String {
        self.0.to_string()
    }
}

impl StorableObject for ConsistencyGroupSpec {
    type Key = ConsistencyGroupSpecKey;

    fn key(&self) -> Self::Key {
        ConsistencyGroupSpecKey(self.uuid.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_predicate() {
        let system = StorageSystemId::from("sys-1");
        let mut group = ConsistencyGroupSpec::new("cg-1");
        assert!(!group.created_on_system(&system));
        assert_eq!(group.group_name_on(&system), "cg-1");

        group.add_system_group(&system, "RG1");
        assert!(group.created_on(&system, "RG1"));
        assert!(!group.created_on(&system, "RG2"));
        assert_eq!(group.group_name_on(&system), "RG1");

        group.remove_system_group(&system, "RG1");
        assert!(!group.created_on_system(&system));
        assert!(group.system_groups.is_empty());
    }
}
