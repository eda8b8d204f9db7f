mod common;

use agents::{
    consistency_group::GroupAction,
    controller::{
        completer::{CompletionState, TaskCompleter},
        workflow::{StepAction, StepState, WaitFor, Workflow, WorkflowStep},
    },
    errors::ErrorCategory,
    replica::{ReplicaAction, ReplicaOperation},
};
use common::*;
use std::time::Duration;
use stor_port::types::v0::{
    store::{
        consistency_group::ConsistencyGroupSpec,
        operation::{OperationStatus, OperationType},
        replica::{FullCopyState, MirrorState, ReplicaSpec, ReplicaState},
        volume::VolumeSpec,
        Repository, ResourceId,
    },
    transport::{OperationId, ReplicaKind, StorageSystemId},
};

fn completer(fixture: &Fixture, kind: OperationType, targets: Vec<ResourceId>) -> TaskCompleter {
    TaskCompleter::new(fixture.repository.clone(), &OperationId::new(), kind, targets)
}

fn transition(kind: ReplicaKind, operation: ReplicaOperation, replica: &ReplicaSpec) -> StepAction {
    ReplicaAction::Transition {
        kind,
        operation,
        replicas: vec![replica.uuid.clone()],
        grouped: false,
    }
    .into()
}

/// Position of the event in the timeline.
fn at(timeline: &[String], event: &str) -> usize {
    timeline
        .iter()
        .position(|e| e == event)
        .unwrap_or_else(|| panic!("'{event}' not found in {timeline:?}"))
}

#[tokio::test]
async fn steps_wait_for_their_whole_group() {
    let fixture = Fixture::new(FakeDriver::new().with_delay(Duration::from_millis(30))).await;
    let system = StorageSystemId::from(SYSTEM);
    let volume_1 = fixture.volume("vol-1").await;
    let volume_2 = fixture.volume("vol-2").await;
    let mirror_1 = fixture
        .replica(&volume_1, ReplicaState::Mirror(MirrorState::Synchronizing))
        .await;
    let mirror_2 = fixture
        .replica(&volume_2, ReplicaState::Mirror(MirrorState::Synchronizing))
        .await;

    let mut workflow = Workflow::new("fracture-then-detach");
    for mirror in [&mirror_1, &mirror_2] {
        workflow.create_step(WorkflowStep::new(
            "fracture",
            "Fracture mirror",
            &system,
            transition(ReplicaKind::Mirror, ReplicaOperation::Fracture, mirror),
        ));
    }
    workflow.create_step(
        WorkflowStep::new(
            "detach",
            "Detach mirror",
            &system,
            transition(ReplicaKind::Mirror, ReplicaOperation::Detach, &mirror_1),
        )
        .wait_for(Some(WaitFor::group("fracture"))),
    );

    let completer = completer(&fixture, OperationType::DetachMirrors, vec![]);
    let outcome = fixture
        .orchestrator
        .executor()
        .execute(&workflow, &completer)
        .await;
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(outcome.state, CompletionState::Succeeded);

    let timeline = fixture.driver.timeline();
    // independent steps run concurrently
    assert_eq!(fixture.driver.max_in_flight(), 2);
    let detach = at(&timeline, "begin detach_mirrors");
    let last_fracture = timeline
        .iter()
        .rposition(|e| e == "end fracture_mirrors")
        .unwrap();
    assert!(last_fracture < detach, "{timeline:?}");
    assert_eq!(
        fixture.get_replica(&mirror_1.uuid).await.state,
        ReplicaState::Mirror(MirrorState::Detached)
    );
}

#[tokio::test]
async fn activation_follows_creation() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    let volume = fixture.volume("vol-1").await;

    let outcome = fixture
        .orchestrator
        .create_full_copies(&[volume.uuid.clone()], "clone", true)
        .await
        .unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.error);

    let timeline = fixture.driver.timeline();
    assert!(
        at(&timeline, "end create_full_copies") < at(&timeline, "begin activate_full_copies")
    );
    let clones = fixture.replicas_of(&volume.uuid).await;
    assert_eq!(clones.len(), 1);
    assert!(clones[0].native_id.is_some());
}

#[tokio::test]
async fn rollback_compensates_in_reverse_order() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    let group = ConsistencyGroupSpec::new("cg-1");
    fixture.repository.put_consistency_group(&group).await.unwrap();
    fixture.driver.fail("add_to_replication_group");

    let specs = (1 ..= 2)
        .map(|i| {
            VolumeSpec::new(format!("vol-{i}"), SYSTEM, POOL, 1024)
                .with_consistency_group(&group.uuid)
        })
        .collect::<Vec<_>>();
    let ids = specs.iter().map(|v| v.uuid.clone()).collect::<Vec<_>>();
    let outcome = fixture.orchestrator.create_volumes(specs).await.unwrap();

    assert_eq!(outcome.state, CompletionState::Failed);
    assert_eq!(
        outcome.error.as_ref().map(|e| e.category()),
        Some(ErrorCategory::DeviceRejected)
    );
    assert_eq!(
        fixture.driver.operations(),
        vec![
            "create_consistency_group",
            "create_volumes",
            "add_to_replication_group",
            "delete_volumes",
            "delete_consistency_group",
        ]
    );
    let states = outcome.steps.iter().map(|(_, s)| *s).collect::<Vec<_>>();
    assert_eq!(
        states,
        vec![StepState::Compensated, StepState::Compensated, StepState::Failed]
    );

    assert!(!fixture.get_group(&group.uuid).await.created_on_system(&SYSTEM.into()));
    for id in &ids {
        assert!(fixture.get_volume(id).await.inactive);
        assert_eq!(
            fixture.status(id, &outcome.operation).await,
            OperationStatus::Error
        );
    }
}

#[tokio::test]
async fn rollback_of_pending_replicas_skips_the_device() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    let system = StorageSystemId::from(SYSTEM);
    let volume = fixture.volume("vol-1").await;
    let provisioned = fixture
        .replica(&volume, ReplicaState::Mirror(MirrorState::Synchronizing))
        .await;
    let mut pending = fixture
        .replica(&volume, ReplicaState::Mirror(MirrorState::Created))
        .await;
    pending.native_id = None;
    fixture.put_replica(&pending).await;
    let fractured = fixture
        .replica(&volume, ReplicaState::Mirror(MirrorState::Fractured))
        .await;

    let mut workflow = Workflow::new("create-then-fail");
    let created = workflow.create_step(
        WorkflowStep::new("create", "Created mirrors", &system, StepAction::Null).rollback(
            ReplicaAction::RollbackCreate {
                replicas: vec![pending.uuid.clone(), provisioned.uuid.clone()],
            }
            .into(),
        ),
    );
    workflow.create_step(
        WorkflowStep::new(
            "fracture",
            "Fracture a fractured mirror",
            &system,
            transition(ReplicaKind::Mirror, ReplicaOperation::Fracture, &fractured),
        )
        .wait_for(Some(created)),
    );

    let completer = completer(&fixture, OperationType::CreateMirrors, vec![]);
    let outcome = fixture
        .orchestrator
        .executor()
        .execute(&workflow, &completer)
        .await;
    assert_eq!(outcome.state, CompletionState::Failed);

    let deletes = fixture.driver.calls_of("delete_mirrors");
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].objects, vec![provisioned.uuid.to_string()]);
    assert_eq!(fixture.driver.count("fracture_mirrors"), 0);

    assert!(fixture.get_replica(&pending.uuid).await.inactive);
    assert!(fixture.get_replica(&provisioned.uuid).await.inactive);
    let volume = fixture.get_volume(&volume.uuid).await;
    assert!(!volume.mirrors.contains(&pending.uuid));
    assert!(volume.mirrors.contains(&fractured.uuid));
}

#[tokio::test]
async fn rolled_back_leave_keeps_a_deleted_group_deleted() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    let system = StorageSystemId::from(SYSTEM);
    let volume = fixture.volume("vol-1").await;
    let mut clone = fixture
        .replica(&volume, ReplicaState::FullCopy(FullCopyState::Synchronized))
        .await;
    clone.replication_group = Some("RG1".to_string());
    fixture.put_replica(&clone).await;
    let fractured = fixture
        .replica(&volume, ReplicaState::Mirror(MirrorState::Fractured))
        .await;

    let members = vec![ResourceId::from(&clone.uuid)];
    let mut workflow = Workflow::new("leave-then-fail");
    let left = workflow.create_step(
        WorkflowStep::new(
            "leave",
            "Leave RG1",
            &system,
            GroupAction::LeaveReplicationGroup {
                name: "RG1".to_string(),
                members: members.clone(),
            }
            .into(),
        )
        .rollback(
            GroupAction::RejoinReplicationGroup {
                name: "RG1".to_string(),
                members,
            }
            .into(),
        ),
    );
    workflow.create_step(
        WorkflowStep::new(
            "fracture",
            "Fracture a fractured mirror",
            &system,
            transition(ReplicaKind::Mirror, ReplicaOperation::Fracture, &fractured),
        )
        .wait_for(Some(left)),
    );

    let completer = completer(&fixture, OperationType::UpdateConsistencyGroup, vec![]);
    let outcome = fixture
        .orchestrator
        .executor()
        .execute(&workflow, &completer)
        .await;
    assert_eq!(outcome.state, CompletionState::Failed);
    // the group went with its last member, so nothing rejoins it
    assert_eq!(
        fixture.driver.operations(),
        vec!["remove_from_replication_group", "delete_replication_group"]
    );
    assert!(fixture.group_replicas("RG1").await.is_empty());
    let clone = fixture.get_replica(&clone.uuid).await;
    assert!(!clone.inactive);
    assert_eq!(clone.replication_group, None);
}

#[tokio::test]
async fn concurrency_is_capped_per_system() {
    let config = config().with_system_concurrency(1);
    let fixture =
        Fixture::with_config(FakeDriver::new().with_delay(Duration::from_millis(20)), config).await;
    // different pools cannot share a creation step
    let specs = (1 ..= 3)
        .map(|i| VolumeSpec::new(format!("vol-{i}"), SYSTEM, format!("pool-{i}"), 1024))
        .collect::<Vec<_>>();

    let outcome = fixture.orchestrator.create_volumes(specs).await.unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(fixture.driver.count("create_volumes"), 3);
    assert_eq!(fixture.driver.max_in_flight(), 1);
}

#[tokio::test]
async fn pending_jobs_are_polled() {
    let fixture = Fixture::new(FakeDriver::new().with_pending_jobs()).await;
    let spec = VolumeSpec::new("vol-1", SYSTEM, POOL, 1024);
    let id = spec.uuid.clone();

    let outcome = fixture.orchestrator.create_volumes(vec![spec]).await.unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    let volume = fixture.get_volume(&id).await;
    assert!(volume.is_provisioned());
    assert!(!volume.inactive);
}

#[tokio::test]
async fn device_calls_are_bounded_by_the_deadline() {
    let config = config().with_device_deadline(Duration::from_millis(50));
    let fixture =
        Fixture::with_config(FakeDriver::new().with_delay(Duration::from_millis(500)), config).await;
    let spec = VolumeSpec::new("vol-1", SYSTEM, POOL, 1024);
    let id = spec.uuid.clone();

    let outcome = fixture.orchestrator.create_volumes(vec![spec]).await.unwrap();
    assert_eq!(outcome.state, CompletionState::Failed);
    assert_eq!(
        outcome.error.as_ref().map(|e| e.category()),
        Some(ErrorCategory::Fatal)
    );
    assert!(fixture.get_volume(&id).await.inactive);
}

#[tokio::test]
async fn executed_steps_are_not_repeated() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    let spec = VolumeSpec::new("vol-1", SYSTEM, POOL, 1024);
    let targets = vec![ResourceId::from(&spec.uuid)];

    let mut workflow = Workflow::new("create");
    fixture
        .orchestrator
        .builder()
        .create_volumes(&mut workflow, None, vec![spec])
        .await
        .unwrap();

    for _ in 0 .. 2 {
        let completer = completer(&fixture, OperationType::CreateVolumes, targets.clone());
        let outcome = fixture
            .orchestrator
            .executor()
            .execute(&workflow, &completer)
            .await;
        assert!(outcome.succeeded(), "{:?}", outcome.error);
    }
    assert_eq!(fixture.driver.count("create_volumes"), 1);
}
