mod registry;

pub use registry::DriverRegistry;

use async_trait::async_trait;
use snafu::Snafu;
use std::collections::HashMap;
use stor_port::types::v0::{
    store::{consistency_group::ConsistencyGroupSpec, replica::ReplicaSpec, volume::VolumeSpec},
    transport::{CopyMode, PoolId, StorageSystemId},
};

/// Native array identifiers of the objects a driver call provisioned, keyed by the uuid of the
/// domain record they belong to (volume, meta member or replica).
pub type NativeIds = HashMap<String, String>;

/// Result of a device driver call.
pub type DriverResult = Result<DriverOutcome, DriverError>;

/// Errors reported by a device driver.
#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub), context(suffix(false)))]
#[allow(missing_docs)]
pub enum DriverError {
    #[snafu(display("The array rejected '{}': {}", operation, reason))]
    Rejected { operation: String, reason: String },
    #[snafu(display("Operation '{}' is not supported by this technology", operation))]
    Unsupported { operation: String },
    #[snafu(display("Array object '{}' does not exist", id))]
    ObjectNotFound { id: String },
    #[snafu(display("The array is unavailable: {}", reason))]
    Unavailable { reason: String },
    #[snafu(display("Array job '{}' failed: {}", job, reason))]
    JobFailed { job: String, reason: String },
}

/// Handle of a long running array job.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct JobHandle(pub String);

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a device driver call: either terminal or a job which must be polled.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DriverOutcome {
    Completed(NativeIds),
    Pending(JobHandle),
}

impl DriverOutcome {
    /// Completed without provisioning anything.
    pub fn done() -> Self {
        Self::Completed(NativeIds::new())
    }
}

/// Status of a polled array job.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum JobStatus {
    Running,
    Completed(NativeIds),
    Failed { reason: String },
}

/// Optional abilities of a storage technology which change how steps are assembled.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct DriverCapabilities {
    /// All members of a meta volume can be created in a single call.
    pub batched_meta_members: bool,
    /// Snapshots must be activated after creation.
    pub snapshot_activation: bool,
    /// Snapshot sessions and linked targets are supported.
    pub snapshot_sessions: bool,
    /// A source volume can be restored directly from a linked target.
    pub direct_linked_target_restore: bool,
    /// Full copies must be fractured before restoring from them.
    pub fracture_before_clone_restore: bool,
    /// Full copies must be resynchronized after restoring from them.
    pub resync_after_clone_restore: bool,
}

/// Provisioning parameters of a volume batch.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct VolumeCapabilities {
    pub thin: bool,
    pub meta_member_count: u32,
    pub meta_member_size: u64,
}

impl From<&VolumeSpec> for VolumeCapabilities {
    fn from(volume: &VolumeSpec) -> Self {
        let members = volume.meta_member_count.max(1);
        Self {
            thin: volume.thin,
            meta_member_count: volume.meta_member_count,
            meta_member_size: volume.size / members as u64,
        }
    }
}

/// A snapshot session to be created on the array.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SessionRequest {
    pub uuid: String,
    pub label: String,
    /// Native ids of the source volumes.
    pub source: Vec<String>,
    /// Replication group the session is created on, if any.
    pub group: Option<String>,
}

/// A target linked to, or to be linked to, a snapshot session.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LinkTarget {
    pub uuid: String,
    pub label: String,
    /// Native id of an existing target, `None` when the array creates one.
    pub native_id: Option<String>,
}

fn unsupported<T>(operation: &str) -> Result<T, DriverError> {
    Err(DriverError::Unsupported {
        operation: operation.to_string(),
    })
}

/// Device level primitives of a storage technology.
/// Every call either completes, fails, or hands back a job for the caller to poll.
/// Operations a technology does not implement fail as unsupported.
#[async_trait]
#[allow(unused_variables)]
pub trait DeviceDriver: Send + Sync + std::fmt::Debug {
    /// Optional abilities of this technology.
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::default()
    }

    /// Poll a job previously handed back as `DriverOutcome::Pending`.
    async fn poll_job(&self, system: &StorageSystemId, job: &JobHandle) -> Result<JobStatus, DriverError> {
        unsupported("poll_job")
    }

    async fn create_volumes(
        &self,
        system: &StorageSystemId,
        pool: &PoolId,
        volumes: &[VolumeSpec],
        capabilities: &VolumeCapabilities,
    ) -> DriverResult {
        unsupported("create_volumes")
    }
    /// Create the given meta members of a volume, the native ids are keyed "{volume}/{member}".
    async fn create_meta_members(
        &self,
        system: &StorageSystemId,
        volume: &VolumeSpec,
        members: &[u32],
    ) -> DriverResult {
        unsupported("create_meta_members")
    }
    async fn delete_meta_members(
        &self,
        system: &StorageSystemId,
        volume: &VolumeSpec,
        members: &[u32],
    ) -> DriverResult {
        unsupported("delete_meta_members")
    }
    async fn delete_volumes(&self, system: &StorageSystemId, volumes: &[VolumeSpec]) -> DriverResult {
        unsupported("delete_volumes")
    }
    async fn expand_volume(
        &self,
        system: &StorageSystemId,
        volume: &VolumeSpec,
        size: u64,
    ) -> DriverResult {
        unsupported("expand_volume")
    }

    async fn create_mirrors(
        &self,
        system: &StorageSystemId,
        mirrors: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        unsupported("create_mirrors")
    }
    async fn fracture_mirrors(
        &self,
        system: &StorageSystemId,
        mirrors: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        unsupported("fracture_mirrors")
    }
    async fn resume_mirrors(
        &self,
        system: &StorageSystemId,
        mirrors: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        unsupported("resume_mirrors")
    }
    async fn detach_mirrors(
        &self,
        system: &StorageSystemId,
        mirrors: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        unsupported("detach_mirrors")
    }
    async fn delete_mirrors(
        &self,
        system: &StorageSystemId,
        mirrors: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        unsupported("delete_mirrors")
    }

    async fn create_snapshots(
        &self,
        system: &StorageSystemId,
        snapshots: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        unsupported("create_snapshots")
    }
    async fn activate_snapshots(
        &self,
        system: &StorageSystemId,
        snapshots: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        unsupported("activate_snapshots")
    }
    async fn delete_snapshots(
        &self,
        system: &StorageSystemId,
        snapshots: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        unsupported("delete_snapshots")
    }
    async fn restore_snapshots(
        &self,
        system: &StorageSystemId,
        snapshots: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        unsupported("restore_snapshots")
    }
    async fn resync_snapshots(
        &self,
        system: &StorageSystemId,
        snapshots: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        unsupported("resync_snapshots")
    }

    async fn create_full_copies(
        &self,
        system: &StorageSystemId,
        clones: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        unsupported("create_full_copies")
    }
    async fn activate_full_copies(
        &self,
        system: &StorageSystemId,
        clones: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        unsupported("activate_full_copies")
    }
    async fn fracture_full_copies(
        &self,
        system: &StorageSystemId,
        clones: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        unsupported("fracture_full_copies")
    }
    async fn resync_full_copies(
        &self,
        system: &StorageSystemId,
        clones: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        unsupported("resync_full_copies")
    }
    async fn restore_from_full_copies(
        &self,
        system: &StorageSystemId,
        clones: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        unsupported("restore_from_full_copies")
    }
    async fn detach_full_copies(
        &self,
        system: &StorageSystemId,
        clones: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        unsupported("detach_full_copies")
    }
    async fn delete_full_copies(
        &self,
        system: &StorageSystemId,
        clones: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        unsupported("delete_full_copies")
    }

    async fn create_snapshot_session(
        &self,
        system: &StorageSystemId,
        session: &SessionRequest,
    ) -> DriverResult {
        unsupported("create_snapshot_session")
    }
    /// Link the targets to the session, native ids of created targets are keyed by target uuid.
    async fn link_targets(
        &self,
        system: &StorageSystemId,
        session: &str,
        targets: &[LinkTarget],
        mode: CopyMode,
    ) -> DriverResult {
        unsupported("link_targets")
    }
    async fn relink_targets(
        &self,
        system: &StorageSystemId,
        session: &str,
        targets: &[LinkTarget],
    ) -> DriverResult {
        unsupported("relink_targets")
    }
    async fn unlink_targets(
        &self,
        system: &StorageSystemId,
        session: &str,
        targets: &[LinkTarget],
        delete_targets: bool,
    ) -> DriverResult {
        unsupported("unlink_targets")
    }
    async fn restore_session(&self, system: &StorageSystemId, session: &str) -> DriverResult {
        unsupported("restore_session")
    }
    async fn delete_session(&self, system: &StorageSystemId, session: &str) -> DriverResult {
        unsupported("delete_session")
    }
    /// Terminate any restore sessions left behind on the volume.
    async fn terminate_restore_sessions(
        &self,
        system: &StorageSystemId,
        volume: &VolumeSpec,
    ) -> DriverResult {
        unsupported("terminate_restore_sessions")
    }
    /// Check if the linked target finished copying from its session.
    async fn link_synchronized(
        &self,
        system: &StorageSystemId,
        session: &str,
        target: &LinkTarget,
    ) -> Result<bool, DriverError> {
        unsupported("link_synchronized")
    }
    /// Check if the replica finished synchronizing with its source.
    async fn replica_synchronized(
        &self,
        system: &StorageSystemId,
        replica: &ReplicaSpec,
    ) -> Result<bool, DriverError> {
        unsupported("replica_synchronized")
    }

    async fn create_consistency_group(
        &self,
        system: &StorageSystemId,
        group: &ConsistencyGroupSpec,
        name: &str,
    ) -> DriverResult {
        unsupported("create_consistency_group")
    }
    async fn delete_consistency_group(
        &self,
        system: &StorageSystemId,
        group: &ConsistencyGroupSpec,
        name: &str,
    ) -> DriverResult {
        unsupported("delete_consistency_group")
    }
    /// Add the array objects, by native id, to the replication group.
    async fn add_to_replication_group(
        &self,
        system: &StorageSystemId,
        group: &str,
        members: &[String],
    ) -> DriverResult {
        unsupported("add_to_replication_group")
    }
    async fn remove_from_replication_group(
        &self,
        system: &StorageSystemId,
        group: &str,
        members: &[String],
    ) -> DriverResult {
        unsupported("remove_from_replication_group")
    }
    async fn delete_replication_group(&self, system: &StorageSystemId, group: &str) -> DriverResult {
        unsupported("delete_replication_group")
    }
}
