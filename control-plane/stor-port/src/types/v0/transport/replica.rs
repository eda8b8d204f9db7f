use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// The kind of a replica.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    Display,
    EnumString,
    AsRefStr,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum ReplicaKind {
    /// Continuously synchronized secondary copy.
    Mirror,
    /// Complete point-in-time copy (clone).
    FullCopy,
    /// Space efficient point-in-time copy.
    Snapshot,
    /// Point-in-time marker which linked targets materialize.
    SnapshotSession,
}

impl From<ReplicaKind> for crate::transport_api::ResourceKind {
    fn from(kind: ReplicaKind) -> Self {
        match kind {
            ReplicaKind::Mirror => Self::Mirror,
            ReplicaKind::FullCopy => Self::FullCopy,
            ReplicaKind::Snapshot => Self::Snapshot,
            ReplicaKind::SnapshotSession => Self::SnapshotSession,
        }
    }
}

/// Copy mode of a target linked to a snapshot session.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CopyMode {
    /// Target data is fully copied from the session.
    Copy,
    /// Target only references the session's point-in-time data.
    NoCopy,
}
