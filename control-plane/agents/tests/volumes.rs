mod common;

use agents::{
    controller::{
        completer::CompletionState,
        workflow::{StepAction, Workflow, WorkflowStep},
    },
    errors::{ErrorCategory, SvcError},
    volume::VolumeAction,
};
use common::*;
use stor_port::types::v0::{
    store::{
        operation::OperationStatus,
        replica::{FullCopyState, MirrorState, ReplicaState, SnapshotState},
        volume::VolumeSpec,
    },
    transport::{ConsistencyGroupId, VolumeId},
};

fn specs(count: usize) -> Vec<VolumeSpec> {
    (1 ..= count)
        .map(|i| VolumeSpec::new(format!("vol-{i}"), SYSTEM, POOL, 1024 * 1024))
        .collect()
}

fn ids(specs: &[VolumeSpec]) -> Vec<VolumeId> {
    specs.iter().map(|v| v.uuid.clone()).collect()
}

#[tokio::test]
async fn identical_volumes_are_created_together() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    let specs = specs(3);
    let ids = ids(&specs);

    let mut workflow = Workflow::new("create");
    fixture
        .orchestrator
        .builder()
        .create_volumes(&mut workflow, None, specs.clone())
        .await
        .unwrap();
    assert_eq!(workflow.len(), 1);
    assert_eq!(
        workflow.steps()[0].compensation(),
        Some(&StepAction::Volume(VolumeAction::RollbackCreateVolumes {
            volumes: ids.clone()
        }))
    );

    let outcome = fixture.orchestrator.create_volumes(specs).await.unwrap();
    assert_eq!(outcome.state, CompletionState::Succeeded);
    let calls = fixture.driver.calls_of("create_volumes");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].objects.len(), 3);
    for id in &ids {
        let volume = fixture.get_volume(id).await;
        assert!(volume.is_provisioned());
        assert_eq!(fixture.status(id, &outcome.operation).await, OperationStatus::Ready);
    }
}

#[tokio::test]
async fn failed_creation_leaves_no_active_volume() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    fixture.driver.fail("create_volumes");
    let specs = specs(3);
    let ids = ids(&specs);

    let outcome = fixture.orchestrator.create_volumes(specs).await.unwrap();
    assert_eq!(outcome.state, CompletionState::Failed);
    assert_eq!(
        outcome.error.as_ref().map(|e| e.category()),
        Some(ErrorCategory::DeviceRejected)
    );
    // nothing was provisioned, so nothing is deleted
    assert_eq!(fixture.driver.operations(), vec!["create_volumes"]);
    for id in &ids {
        assert!(fixture.get_volume(id).await.inactive);
        assert_eq!(fixture.status(id, &outcome.operation).await, OperationStatus::Error);
    }
}

#[tokio::test]
async fn meta_volumes_with_batched_members() {
    let fixture = Fixture::new(FakeDriver::new().with_capabilities(session_capabilities())).await;
    let spec = VolumeSpec::new("meta", SYSTEM, POOL, 1024 * 1024).with_meta_members(3);
    let id = spec.uuid.clone();

    let outcome = fixture.orchestrator.create_volumes(vec![spec]).await.unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(fixture.driver.operations(), vec!["create_volumes"]);
    assert!(fixture.driver.calls_of("create_volumes")[0].grouped);
    let volume = fixture.get_volume(&id).await;
    assert_eq!(volume.meta_members, [1, 2, 3].into());
}

#[tokio::test]
async fn meta_members_are_created_one_by_one() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    let spec = VolumeSpec::new("meta", SYSTEM, POOL, 1024 * 1024).with_meta_members(3);
    let id = spec.uuid.clone();

    let outcome = fixture.orchestrator.create_volumes(vec![spec]).await.unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(
        fixture.driver.operations(),
        vec!["create_volumes", "create_meta_members", "create_meta_members"]
    );
    let members = fixture.driver.calls_of("create_meta_members");
    assert_eq!(members[0].objects, vec![format!("{id}/2")]);
    assert_eq!(members[1].objects, vec![format!("{id}/3")]);
    assert_eq!(fixture.get_volume(&id).await.meta_members, [1, 2, 3].into());
}

#[tokio::test]
async fn failed_meta_member_unwinds_the_volume() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    fixture.driver.fail_times("create_meta_members", 1);
    let spec = VolumeSpec::new("meta", SYSTEM, POOL, 1024 * 1024).with_meta_members(2);
    let id = spec.uuid.clone();

    let outcome = fixture.orchestrator.create_volumes(vec![spec]).await.unwrap();
    assert_eq!(outcome.state, CompletionState::Failed);
    assert_eq!(
        fixture.driver.operations(),
        vec!["create_volumes", "create_meta_members", "delete_volumes"]
    );
    assert!(fixture.get_volume(&id).await.inactive);
}

#[tokio::test]
async fn missing_group_is_a_warning() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    let spec = VolumeSpec::new("vol-1", SYSTEM, POOL, 1024)
        .with_consistency_group(&ConsistencyGroupId::new());
    let id = spec.uuid.clone();

    let outcome = fixture.orchestrator.create_volumes(vec![spec]).await.unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(outcome.state, CompletionState::PartiallySucceeded);
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(fixture.driver.operations(), vec!["create_volumes"]);

    let volume = fixture.get_volume(&id).await;
    assert!(volume.is_provisioned());
    assert_eq!(volume.consistency_group, None);
    assert_eq!(fixture.status(&id, &outcome.operation).await, OperationStatus::Warning);
}

#[tokio::test]
async fn group_members_join_an_existing_group() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    let member = fixture.volume("vol-1").await;
    let group = fixture.group("cg-1", &[member]).await;
    let spec = VolumeSpec::new("vol-2", SYSTEM, POOL, 1024).with_consistency_group(&group.uuid);
    let id = spec.uuid.clone();

    let outcome = fixture.orchestrator.create_volumes(vec![spec]).await.unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    // the replication group already exists on the array
    assert_eq!(
        fixture.driver.operations(),
        vec!["create_volumes", "add_to_replication_group"]
    );
    let volume = fixture.get_volume(&id).await;
    assert_eq!(volume.consistency_group, Some(group.uuid.clone()));
    assert_eq!(volume.replication_group.as_deref(), Some("cg-1"));
}

#[tokio::test]
async fn invalid_volumes_are_rejected_before_execution() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    let empty = VolumeSpec::new("empty", SYSTEM, POOL, 0);
    let error = fixture
        .orchestrator
        .create_volumes(vec![empty])
        .await
        .unwrap_err();
    assert!(matches!(error, SvcError::InvalidArguments { .. }));

    let unknown = VolumeSpec::new("vol-1", "unknown", POOL, 1024);
    let error = fixture
        .orchestrator
        .create_volumes(vec![unknown])
        .await
        .unwrap_err();
    assert_eq!(error.category(), ErrorCategory::NotFound);
    assert!(fixture.driver.operations().is_empty());
}

#[tokio::test]
async fn deleted_volumes_dismantle_their_replicas() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    let volume = fixture.volume("vol-1").await;
    let snapshot = fixture
        .replica(&volume, ReplicaState::Snapshot(SnapshotState::Activated))
        .await;
    let mirror = fixture
        .replica(&volume, ReplicaState::Mirror(MirrorState::Synchronizing))
        .await;
    let clone = fixture
        .replica(&volume, ReplicaState::FullCopy(FullCopyState::Synchronized))
        .await;

    let outcome = fixture
        .orchestrator
        .delete_volumes(&[volume.uuid.clone()])
        .await
        .unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(
        fixture.driver.operations(),
        vec![
            "delete_snapshots",
            "fracture_mirrors",
            "detach_mirrors",
            "delete_mirrors",
            "detach_full_copies",
            "delete_volumes",
        ]
    );

    assert!(fixture.get_replica(&snapshot.uuid).await.inactive);
    assert!(fixture.get_replica(&mirror.uuid).await.inactive);
    // full copies survive as independent copies
    let clone = fixture.get_replica(&clone.uuid).await;
    assert!(!clone.inactive);
    assert_eq!(clone.state, ReplicaState::FullCopy(FullCopyState::Detached));

    assert!(fixture.get_volume(&volume.uuid).await.inactive);
    assert_eq!(
        fixture.status(&volume.uuid, &outcome.operation).await,
        OperationStatus::Ready
    );
}

#[tokio::test]
async fn every_deleted_volume_completes() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    let volume_1 = fixture.volume("vol-1").await;
    let volume_2 = fixture.volume("vol-2").await;
    let ids = vec![volume_1.uuid.clone(), volume_2.uuid.clone()];

    let outcome = fixture.orchestrator.delete_volumes(&ids).await.unwrap();
    assert_eq!(outcome.state, CompletionState::Succeeded);
    assert_eq!(fixture.driver.count("delete_volumes"), 1);
    for id in &ids {
        assert_eq!(fixture.status(id, &outcome.operation).await, OperationStatus::Ready);
    }

    let volume_3 = fixture.volume("vol-3").await;
    fixture.driver.fail("delete_volumes");
    let outcome = fixture
        .orchestrator
        .delete_volumes(&[volume_3.uuid.clone()])
        .await
        .unwrap();
    assert_eq!(outcome.state, CompletionState::Failed);
    assert_eq!(
        fixture.status(&volume_3.uuid, &outcome.operation).await,
        OperationStatus::Error
    );
    assert!(!fixture.get_volume(&volume_3.uuid).await.inactive);
}

#[tokio::test]
async fn volumes_only_grow() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    let volume = fixture.volume("vol-1").await;

    let error = fixture
        .orchestrator
        .expand_volumes(&[volume.uuid.clone()], volume.size)
        .await
        .unwrap_err();
    assert!(matches!(error, SvcError::InvalidArguments { .. }));
    assert!(fixture.driver.operations().is_empty());

    let outcome = fixture
        .orchestrator
        .expand_volumes(&[volume.uuid.clone()], volume.size * 2)
        .await
        .unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(fixture.driver.operations(), vec!["expand_volume"]);
    assert_eq!(fixture.get_volume(&volume.uuid).await.size, volume.size * 2);
}

#[tokio::test]
async fn an_empty_batch_keeps_the_predecessor() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    let mut workflow = Workflow::new("create");
    let before = workflow.create_step(WorkflowStep::new(
        "Before",
        "before",
        &SYSTEM.into(),
        StepAction::Null,
    ));

    let frontier = fixture
        .orchestrator
        .builder()
        .create_volumes(&mut workflow, Some(before.clone()), vec![])
        .await
        .unwrap();
    assert_eq!(frontier, Some(before));
    assert_eq!(workflow.len(), 1);
}

#[tokio::test]
async fn partially_provisioned_batches_are_deleted() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    fixture.driver.omit_native_ids(1);
    let specs = specs(3);
    let ids = ids(&specs);

    let outcome = fixture.orchestrator.create_volumes(specs).await.unwrap();
    assert_eq!(outcome.state, CompletionState::Failed);
    assert!(
        matches!(outcome.error, Some(SvcError::MissingNativeId { .. })),
        "{:?}",
        outcome.error
    );
    assert_eq!(
        fixture.driver.operations(),
        vec!["create_volumes", "delete_volumes"]
    );
    assert_eq!(
        fixture.driver.calls_of("delete_volumes")[0].objects,
        vec![ids[0].to_string(), ids[1].to_string()]
    );
    for id in &ids {
        assert!(fixture.get_volume(id).await.inactive);
    }
}

#[tokio::test]
async fn rejected_batches_record_nothing() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    let valid = VolumeSpec::new("vol-1", SYSTEM, POOL, 1024);
    let empty = VolumeSpec::new("empty", SYSTEM, POOL, 0);

    let error = fixture
        .orchestrator
        .create_volumes(vec![valid.clone(), empty])
        .await
        .unwrap_err();
    assert!(matches!(error, SvcError::InvalidArguments { .. }));
    assert!(fixture.repository.volume(&valid.uuid).await.is_err());
    assert!(fixture.driver.operations().is_empty());
}

#[tokio::test]
async fn new_members_on_several_systems_are_all_awaited() {
    let fixture = Fixture::new(FakeDriver::new()).await;
    fixture.system("vmax-2").await;
    let group = fixture.group("cg-1", &[]).await;
    let specs = vec![
        VolumeSpec::new("vol-1", SYSTEM, POOL, 1024).with_consistency_group(&group.uuid),
        VolumeSpec::new("vol-2", "vmax-2", POOL, 1024).with_consistency_group(&group.uuid),
    ];

    let mut workflow = Workflow::new("create");
    let frontier = fixture
        .orchestrator
        .builder()
        .create_volumes(&mut workflow, None, specs)
        .await
        .unwrap();
    let next = workflow.len();
    workflow.create_step(
        WorkflowStep::new("Next", "next", &SYSTEM.into(), StepAction::Null).wait_for(frontier),
    );
    let joins = (0 .. next)
        .filter(|index| workflow.steps()[*index].group() == "AddToConsistencyGroup")
        .collect::<Vec<_>>();
    assert_eq!(joins.len(), 2);
    for join in joins {
        assert!(awaits(&workflow, next, join), "step {join} is not awaited");
    }
}
