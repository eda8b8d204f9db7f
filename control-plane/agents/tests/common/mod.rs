#![allow(dead_code)]

use agents::{
    config::OrchestratorConfig,
    controller::{
        driver::{
            DeviceDriver, DriverCapabilities, DriverError, DriverOutcome, DriverRegistry,
            DriverResult, JobHandle, JobStatus, LinkTarget, NativeIds, SessionRequest,
            VolumeCapabilities,
        },
        workflow::Workflow,
    },
    Orchestrator,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use stor_port::types::v0::{
    store::{
        consistency_group::ConsistencyGroupSpec,
        memory::MemoryStore,
        operation::OperationStatus,
        replica::{ReplicaSpec, ReplicaState},
        system::StorageSystem,
        volume::VolumeSpec,
        Repository, ResourceId,
    },
    transport::{
        ConsistencyGroupId, CopyMode, OperationId, PoolId, ReplicaId, StorageSystemId,
        Technology, VolumeId,
    },
};
use utils::tracing_telemetry::{FmtLayer, TracingTelemetry};

pub const SYSTEM: &str = "vmax-1";
pub const POOL: &str = "pool-1";

/// Install the test subscriber, once.
pub fn init_tracing() {
    TracingTelemetry::builder()
        .with_writer(FmtLayer::Test)
        .with_default_filter("info,agents=debug")
        .init("agents-tests");
}

/// Timeouts suited to tests.
pub fn config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_lock_timeout(Duration::from_secs(5))
        .with_device_deadline(Duration::from_secs(5))
        .with_poll_period(Duration::from_millis(10))
}

/// A device driver call, as recorded by the `FakeDriver`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DriverCall {
    pub operation: String,
    pub system: StorageSystemId,
    /// Uuids or native ids of the objects the call applies to.
    pub objects: Vec<String>,
    pub grouped: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<DriverCall>,
    timeline: Vec<String>,
    failures: HashMap<String, (DriverError, Option<usize>)>,
    jobs: HashMap<String, NativeIds>,
    in_flight: usize,
    max_in_flight: usize,
    next_id: u64,
    omitted: usize,
}

/// A recording device driver provisioning fake native ids.
/// Failures can be injected per operation, calls can be delayed and answered with jobs.
#[derive(Debug, Clone, Default)]
pub struct FakeDriver {
    state: Arc<Mutex<FakeState>>,
    capabilities: DriverCapabilities,
    delay: Option<Duration>,
    pending_jobs: bool,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_capabilities(mut self, capabilities: DriverCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
    pub fn with_pending_jobs(mut self) -> Self {
        self.pending_jobs = true;
        self
    }
    /// Fail every call of the operation.
    pub fn fail(&self, operation: &str) {
        self.fail_with(operation, rejected(operation), None);
    }
    /// Fail the next `times` calls of the operation.
    pub fn fail_times(&self, operation: &str, times: usize) {
        self.fail_with(operation, rejected(operation), Some(times));
    }
    pub fn fail_with(&self, operation: &str, error: DriverError, times: Option<usize>) {
        self.state
            .lock()
            .failures
            .insert(operation.to_string(), (error, times));
    }
    /// Leave the last `count` objects of the next provisioning call without a native id.
    pub fn omit_native_ids(&self, count: usize) {
        self.state.lock().omitted = count;
    }
    pub fn heal(&self, operation: &str) {
        self.state.lock().failures.remove(operation);
    }
    /// Forget the calls recorded so far.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.calls.clear();
        state.timeline.clear();
        state.max_in_flight = 0;
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }
    /// The recorded operations, in call order.
    pub fn operations(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.operation).collect()
    }
    pub fn calls_of(&self, operation: &str) -> Vec<DriverCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.operation == operation)
            .collect()
    }
    pub fn count(&self, operation: &str) -> usize {
        self.calls_of(operation).len()
    }
    /// Count the calls of operations starting with the prefix.
    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.operation.starts_with(prefix))
            .count()
    }
    /// "begin {operation}" and "end {operation}" events, in order.
    pub fn timeline(&self) -> Vec<String> {
        self.state.lock().timeline.clone()
    }
    /// The highest number of calls which were in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    async fn call(
        &self,
        operation: &str,
        system: &StorageSystemId,
        objects: Vec<String>,
        grouped: bool,
        mut provisioned: Vec<String>,
    ) -> DriverResult {
        {
            let mut state = self.state.lock();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.timeline.push(format!("begin {operation}"));
            state.calls.push(DriverCall {
                operation: operation.to_string(),
                system: system.clone(),
                objects,
                grouped,
            });
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.in_flight -= 1;
        state.timeline.push(format!("end {operation}"));

        if let Some((error, times)) = state.failures.get_mut(operation) {
            let error = error.clone();
            match times {
                Some(0) => {}
                Some(times) => {
                    *times -= 1;
                    return Err(error);
                }
                None => return Err(error),
            }
        }

        let mut ids = NativeIds::new();
        if !provisioned.is_empty() {
            let omitted = std::mem::take(&mut state.omitted);
            provisioned.truncate(provisioned.len().saturating_sub(omitted));
        }
        for uuid in provisioned {
            state.next_id += 1;
            ids.insert(uuid, format!("native-{}", state.next_id));
        }
        if self.pending_jobs {
            state.next_id += 1;
            let job = format!("job-{}", state.next_id);
            state.jobs.insert(job.clone(), ids);
            return Ok(DriverOutcome::Pending(JobHandle(job)));
        }
        Ok(DriverOutcome::Completed(ids))
    }

    async fn replicas(
        &self,
        operation: &str,
        system: &StorageSystemId,
        replicas: &[ReplicaSpec],
        grouped: bool,
        create: bool,
    ) -> DriverResult {
        let uuids = replicas
            .iter()
            .map(|r| r.uuid.to_string())
            .collect::<Vec<_>>();
        let provisioned = match create {
            true => uuids.clone(),
            false => vec![],
        };
        self.call(operation, system, uuids, grouped, provisioned)
            .await
    }
}

fn rejected(operation: &str) -> DriverError {
    DriverError::Rejected {
        operation: operation.to_string(),
        reason: "injected failure".to_string(),
    }
}

fn links(targets: &[LinkTarget]) -> Vec<String> {
    targets.iter().map(|t| t.uuid.clone()).collect()
}

#[async_trait]
impl DeviceDriver for FakeDriver {
    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }
    async fn poll_job(
        &self,
        _system: &StorageSystemId,
        job: &JobHandle,
    ) -> Result<JobStatus, DriverError> {
        match self.state.lock().jobs.remove(&job.0) {
            Some(ids) => Ok(JobStatus::Completed(ids)),
            None => Ok(JobStatus::Failed {
                reason: format!("unknown job {job}"),
            }),
        }
    }

    async fn create_volumes(
        &self,
        system: &StorageSystemId,
        _pool: &PoolId,
        volumes: &[VolumeSpec],
        capabilities: &VolumeCapabilities,
    ) -> DriverResult {
        let uuids = volumes
            .iter()
            .map(|v| v.uuid.to_string())
            .collect::<Vec<_>>();
        let grouped = capabilities.meta_member_count > 1;
        self.call("create_volumes", system, uuids.clone(), grouped, uuids)
            .await
    }
    async fn create_meta_members(
        &self,
        system: &StorageSystemId,
        volume: &VolumeSpec,
        members: &[u32],
    ) -> DriverResult {
        let keys = members
            .iter()
            .map(|m| format!("{}/{m}", volume.uuid))
            .collect::<Vec<_>>();
        self.call("create_meta_members", system, keys.clone(), false, keys)
            .await
    }
    async fn delete_meta_members(
        &self,
        system: &StorageSystemId,
        volume: &VolumeSpec,
        members: &[u32],
    ) -> DriverResult {
        let keys = members
            .iter()
            .map(|m| format!("{}/{m}", volume.uuid))
            .collect();
        self.call("delete_meta_members", system, keys, false, vec![])
            .await
    }
    async fn delete_volumes(&self, system: &StorageSystemId, volumes: &[VolumeSpec]) -> DriverResult {
        let uuids = volumes.iter().map(|v| v.uuid.to_string()).collect();
        self.call("delete_volumes", system, uuids, false, vec![])
            .await
    }
    async fn expand_volume(
        &self,
        system: &StorageSystemId,
        volume: &VolumeSpec,
        _size: u64,
    ) -> DriverResult {
        self.call("expand_volume", system, vec![volume.uuid.to_string()], false, vec![])
            .await
    }

    async fn create_mirrors(
        &self,
        system: &StorageSystemId,
        mirrors: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        self.replicas("create_mirrors", system, mirrors, grouped, true)
            .await
    }
    async fn fracture_mirrors(
        &self,
        system: &StorageSystemId,
        mirrors: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        self.replicas("fracture_mirrors", system, mirrors, grouped, false)
            .await
    }
    async fn resume_mirrors(
        &self,
        system: &StorageSystemId,
        mirrors: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        self.replicas("resume_mirrors", system, mirrors, grouped, false)
            .await
    }
    async fn detach_mirrors(
        &self,
        system: &StorageSystemId,
        mirrors: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        self.replicas("detach_mirrors", system, mirrors, grouped, false)
            .await
    }
    async fn delete_mirrors(
        &self,
        system: &StorageSystemId,
        mirrors: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        self.replicas("delete_mirrors", system, mirrors, grouped, false)
            .await
    }

    async fn create_snapshots(
        &self,
        system: &StorageSystemId,
        snapshots: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        self.replicas("create_snapshots", system, snapshots, grouped, true)
            .await
    }
    async fn activate_snapshots(
        &self,
        system: &StorageSystemId,
        snapshots: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        self.replicas("activate_snapshots", system, snapshots, grouped, false)
            .await
    }
    async fn delete_snapshots(
        &self,
        system: &StorageSystemId,
        snapshots: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        self.replicas("delete_snapshots", system, snapshots, grouped, false)
            .await
    }
    async fn restore_snapshots(
        &self,
        system: &StorageSystemId,
        snapshots: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        self.replicas("restore_snapshots", system, snapshots, grouped, false)
            .await
    }
    async fn resync_snapshots(
        &self,
        system: &StorageSystemId,
        snapshots: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        self.replicas("resync_snapshots", system, snapshots, grouped, false)
            .await
    }

    async fn create_full_copies(
        &self,
        system: &StorageSystemId,
        clones: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        self.replicas("create_full_copies", system, clones, grouped, true)
            .await
    }
    async fn activate_full_copies(
        &self,
        system: &StorageSystemId,
        clones: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        self.replicas("activate_full_copies", system, clones, grouped, false)
            .await
    }
    async fn fracture_full_copies(
        &self,
        system: &StorageSystemId,
        clones: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        self.replicas("fracture_full_copies", system, clones, grouped, false)
            .await
    }
    async fn resync_full_copies(
        &self,
        system: &StorageSystemId,
        clones: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        self.replicas("resync_full_copies", system, clones, grouped, false)
            .await
    }
    async fn restore_from_full_copies(
        &self,
        system: &StorageSystemId,
        clones: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        self.replicas("restore_from_full_copies", system, clones, grouped, false)
            .await
    }
    async fn detach_full_copies(
        &self,
        system: &StorageSystemId,
        clones: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        self.replicas("detach_full_copies", system, clones, grouped, false)
            .await
    }
    async fn delete_full_copies(
        &self,
        system: &StorageSystemId,
        clones: &[ReplicaSpec],
        grouped: bool,
    ) -> DriverResult {
        self.replicas("delete_full_copies", system, clones, grouped, false)
            .await
    }

    async fn create_snapshot_session(
        &self,
        system: &StorageSystemId,
        session: &SessionRequest,
    ) -> DriverResult {
        self.call(
            "create_snapshot_session",
            system,
            session.source.clone(),
            session.group.is_some(),
            vec![session.uuid.clone()],
        )
        .await
    }
    async fn link_targets(
        &self,
        system: &StorageSystemId,
        _session: &str,
        targets: &[LinkTarget],
        _mode: CopyMode,
    ) -> DriverResult {
        let created = targets
            .iter()
            .filter(|t| t.native_id.is_none())
            .map(|t| t.uuid.clone())
            .collect();
        self.call("link_targets", system, links(targets), false, created)
            .await
    }
    async fn relink_targets(
        &self,
        system: &StorageSystemId,
        _session: &str,
        targets: &[LinkTarget],
    ) -> DriverResult {
        self.call("relink_targets", system, links(targets), false, vec![])
            .await
    }
    async fn unlink_targets(
        &self,
        system: &StorageSystemId,
        _session: &str,
        targets: &[LinkTarget],
        _delete_targets: bool,
    ) -> DriverResult {
        self.call("unlink_targets", system, links(targets), false, vec![])
            .await
    }
    async fn restore_session(&self, system: &StorageSystemId, session: &str) -> DriverResult {
        self.call("restore_session", system, vec![session.to_string()], false, vec![])
            .await
    }
    async fn delete_session(&self, system: &StorageSystemId, session: &str) -> DriverResult {
        self.call("delete_session", system, vec![session.to_string()], false, vec![])
            .await
    }
    async fn terminate_restore_sessions(
        &self,
        system: &StorageSystemId,
        volume: &VolumeSpec,
    ) -> DriverResult {
        self.call(
            "terminate_restore_sessions",
            system,
            vec![volume.uuid.to_string()],
            false,
            vec![],
        )
        .await
    }
    async fn link_synchronized(
        &self,
        system: &StorageSystemId,
        session: &str,
        target: &LinkTarget,
    ) -> Result<bool, DriverError> {
        self.call(
            "link_synchronized",
            system,
            vec![session.to_string(), target.uuid.clone()],
            false,
            vec![],
        )
        .await
        .map(|_| true)
    }
    async fn replica_synchronized(
        &self,
        _system: &StorageSystemId,
        _replica: &ReplicaSpec,
    ) -> Result<bool, DriverError> {
        Ok(true)
    }

    async fn create_consistency_group(
        &self,
        system: &StorageSystemId,
        _group: &ConsistencyGroupSpec,
        name: &str,
    ) -> DriverResult {
        self.call("create_consistency_group", system, vec![name.to_string()], true, vec![])
            .await
    }
    async fn delete_consistency_group(
        &self,
        system: &StorageSystemId,
        _group: &ConsistencyGroupSpec,
        name: &str,
    ) -> DriverResult {
        self.call("delete_consistency_group", system, vec![name.to_string()], true, vec![])
            .await
    }
    async fn add_to_replication_group(
        &self,
        system: &StorageSystemId,
        group: &str,
        members: &[String],
    ) -> DriverResult {
        let mut objects = vec![group.to_string()];
        objects.extend(members.iter().cloned());
        self.call("add_to_replication_group", system, objects, true, vec![])
            .await
    }
    async fn remove_from_replication_group(
        &self,
        system: &StorageSystemId,
        group: &str,
        members: &[String],
    ) -> DriverResult {
        let mut objects = vec![group.to_string()];
        objects.extend(members.iter().cloned());
        self.call("remove_from_replication_group", system, objects, true, vec![])
            .await
    }
    async fn delete_replication_group(&self, system: &StorageSystemId, group: &str) -> DriverResult {
        self.call("delete_replication_group", system, vec![group.to_string()], true, vec![])
            .await
    }
}

/// A store seeded with a storage system served by a `FakeDriver`.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub repository: Arc<dyn Repository>,
    pub driver: FakeDriver,
    pub orchestrator: Orchestrator,
}

impl Fixture {
    pub async fn new(driver: FakeDriver) -> Self {
        Self::with_config(driver, config()).await
    }
    pub async fn with_config(driver: FakeDriver, config: OrchestratorConfig) -> Self {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let repository: Arc<dyn Repository> = store.clone();
        repository
            .put_storage_system(&StorageSystem::new(SYSTEM, Technology::Vmax3))
            .await
            .unwrap();
        let drivers = DriverRegistry::new().with_driver(Technology::Vmax3, Arc::new(driver.clone()));
        let orchestrator = Orchestrator::new(config, repository.clone(), drivers);
        Self {
            store,
            repository,
            driver,
            orchestrator,
        }
    }

    /// Seed another storage system served by the same driver.
    pub async fn system(&self, id: &str) {
        self.repository
            .put_storage_system(&StorageSystem::new(id, Technology::Vmax3))
            .await
            .unwrap();
    }

    /// Seed a provisioned volume.
    pub async fn volume(&self, label: &str) -> VolumeSpec {
        self.volume_on(label, SYSTEM).await
    }
    /// Seed a provisioned volume on the storage system.
    pub async fn volume_on(&self, label: &str, system: &str) -> VolumeSpec {
        let mut volume = VolumeSpec::new(label, system, POOL, 1024 * 1024);
        volume.native_id = Some(format!("dev-{label}"));
        self.repository.put_volume(&volume).await.unwrap();
        volume
    }

    /// Seed a consistency group created on the system, with the volumes as members of its
    /// replication group.
    pub async fn group(&self, label: &str, volumes: &[VolumeSpec]) -> ConsistencyGroupSpec {
        let mut group = ConsistencyGroupSpec::new(label);
        group.add_system_group(&SYSTEM.into(), label);
        self.repository.put_consistency_group(&group).await.unwrap();
        for volume in volumes {
            let mut volume = self.get_volume(&volume.uuid).await;
            volume.consistency_group = Some(group.uuid.clone());
            volume.replication_group = Some(label.to_string());
            self.repository.put_volume(&volume).await.unwrap();
        }
        group
    }

    /// Seed a provisioned replica of the volume, in the given state.
    pub async fn replica(&self, volume: &VolumeSpec, state: ReplicaState) -> ReplicaSpec {
        let kind = state.kind();
        let mut replica = ReplicaSpec::new(kind, format!("{kind}-{}", volume.label), volume);
        replica.native_id = Some(format!("dev-{}", replica.uuid));
        replica.state = state;
        self.put_replica(&replica).await;
        replica
    }
    /// Store the replica, referenced by its source volume.
    pub async fn put_replica(&self, replica: &ReplicaSpec) {
        self.repository.put_replica(replica).await.unwrap();
        if let Some(source) = replica.source_volume() {
            let mut volume = self.get_volume(source).await;
            volume.replica_refs_mut(replica.kind()).insert(replica.uuid.clone());
            self.repository.put_volume(&volume).await.unwrap();
        }
    }

    pub async fn get_volume(&self, id: &VolumeId) -> VolumeSpec {
        self.repository.volume(id).await.unwrap()
    }
    pub async fn get_group(&self, id: &ConsistencyGroupId) -> ConsistencyGroupSpec {
        self.repository.consistency_group(id).await.unwrap()
    }
    pub async fn get_replica(&self, id: &ReplicaId) -> ReplicaSpec {
        self.repository.replica(id).await.unwrap()
    }
    /// The active replicas of the volume.
    pub async fn replicas_of(&self, volume: &VolumeId) -> Vec<ReplicaSpec> {
        self.repository.replicas_of_volume(volume).await.unwrap()
    }
    /// The status the operation recorded on the resource.
    pub async fn status(
        &self,
        resource: impl Into<ResourceId>,
        operation: &OperationId,
    ) -> OperationStatus {
        self.repository
            .operation(&resource.into(), operation)
            .await
            .unwrap()
            .status
    }
    /// The active replicas of the replication group.
    pub async fn group_replicas(&self, group: &str) -> Vec<ReplicaSpec> {
        self.repository
            .replicas_in_replication_group(&SYSTEM.into(), group)
            .await
            .unwrap()
    }
}

/// Capabilities of a technology supporting sessions, linked targets and batched meta volumes.
pub fn session_capabilities() -> DriverCapabilities {
    DriverCapabilities {
        batched_meta_members: true,
        snapshot_activation: true,
        snapshot_sessions: true,
        direct_linked_target_restore: false,
        fracture_before_clone_restore: true,
        resync_after_clone_restore: true,
    }
}

/// Check if the step at `index` waits for the step at `predecessor`, directly or not.
pub fn awaits(workflow: &Workflow, index: usize, predecessor: usize) -> bool {
    let mut pending = workflow.steps()[index].depends_on().to_vec();
    while let Some(next) = pending.pop() {
        if next == predecessor {
            return true;
        }
        pending.extend_from_slice(workflow.steps()[next].depends_on());
    }
    false
}
