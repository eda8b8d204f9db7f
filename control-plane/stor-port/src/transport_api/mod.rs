use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

/// Report error chain.
pub trait ErrorChain {
    /// Full error chain as a string separated by ':'.
    fn full_string(&self) -> String;
    /// Get the full error chain starting from the parent.
    fn parent_full_string(&self) -> String;
}

impl<T> ErrorChain for T
where
    T: std::error::Error,
{
    /// loops through the error chain and formats into a single string
    /// containing all the lower level errors.
    fn full_string(&self) -> String {
        let mut msg = format!("{self}");
        let mut opt_source = self.source();
        while let Some(source) = opt_source {
            msg = format!("{msg}: {source}");
            opt_source = source.source();
        }
        msg
    }

    fn parent_full_string(&self) -> String {
        match self.source() {
            Some(parent) => parent.full_string(),
            None => String::new(),
        }
    }
}

/// All the different variants of Resources.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, AsRefStr, Display, Eq, PartialEq, Hash)]
pub enum ResourceKind {
    /// Unknown or unspecified resource.
    Unknown,
    /// Managed storage array.
    StorageSystem,
    /// Storage pool of an array.
    Pool,
    /// Block volume.
    Volume,
    /// Logical consistency group.
    ConsistencyGroup,
    /// Array-side replication group.
    ReplicationGroup,
    /// Continuously synchronized mirror.
    Mirror,
    /// Full copy (clone) of a volume.
    FullCopy,
    /// Point-in-time snapshot.
    Snapshot,
    /// Snapshot session.
    SnapshotSession,
    /// Operation status record.
    Operation,
    /// Workflow execution markers.
    Workflow,
}
