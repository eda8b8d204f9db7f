use crate::{controller::workflow::StepId, errors::SvcError};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;
use stor_port::{
    transport_api::ErrorChain,
    types::v0::{
        store::{
            operation::{Operation, OperationStatus, OperationType},
            Repository, ResourceId,
        },
        transport::OperationId,
    },
};
use strum_macros::Display;

/// Completion state of a tracked operation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Display)]
pub enum CompletionState {
    Pending,
    Executing,
    Succeeded,
    /// Succeeded, but some group replica could not be propagated.
    PartiallySucceeded,
    Failed,
}

impl CompletionState {
    /// Check if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::PartiallySucceeded | Self::Failed
        )
    }
}

/// Outcome recorded for a tracked entity.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum EntityOutcome {
    Pending,
    Ready,
    Failed(String),
}

/// Outcome recorded for a workflow step.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StepOutcome {
    Executing,
    Succeeded,
    Failed(String),
}

#[derive(Debug)]
struct CompleterNode {
    operation: OperationId,
    kind: OperationType,
    /// Index of the parent node, the root has none.
    parent: Option<usize>,
    children: Vec<usize>,
    targets: IndexMap<ResourceId, EntityOutcome>,
    state: CompletionState,
}

/// Arena of completer nodes, owned top-down: parents refer to children by index
/// and children only refer back to their parent's index.
#[derive(Debug, Default)]
struct CompleterTree {
    nodes: Vec<CompleterNode>,
    steps: IndexMap<StepId, StepOutcome>,
    rolling_back: bool,
    warnings: Vec<String>,
}

impl CompleterTree {
    /// Indexes of the node and all of its descendants.
    fn subtree(&self, node: usize) -> Vec<usize> {
        let mut scope = vec![node];
        let mut next = 0;
        while next < scope.len() {
            scope.extend(self.nodes[scope[next]].children.iter().copied());
            next += 1;
        }
        scope
    }
    fn first_failure(&self, scope: &[usize]) -> Option<String> {
        scope.iter().find_map(|index| {
            self.nodes[*index]
                .targets
                .values()
                .find_map(|outcome| match outcome {
                    EntityOutcome::Failed(cause) => Some(cause.clone()),
                    _ => None,
                })
        })
    }
}

/// Tracks the outcome of one logical operation across its entities and workflow steps,
/// and persists the terminal status of every entity through the repository.
/// Clones refer to the same completer.
#[derive(Clone)]
pub struct TaskCompleter {
    tree: Arc<Mutex<CompleterTree>>,
    node: usize,
    repository: Arc<dyn Repository>,
}

impl std::fmt::Debug for TaskCompleter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tree = self.tree.lock();
        let node = &tree.nodes[self.node];
        f.debug_struct("TaskCompleter")
            .field("operation", &node.operation)
            .field("kind", &node.kind)
            .field("state", &node.state)
            .field("targets", &node.targets)
            .finish()
    }
}

impl TaskCompleter {
    /// Create a new root completer tracking the given entities.
    pub fn new(
        repository: Arc<dyn Repository>,
        operation: &OperationId,
        kind: OperationType,
        targets: impl IntoIterator<Item = ResourceId>,
    ) -> Self {
        let node = CompleterNode {
            operation: operation.clone(),
            kind,
            parent: None,
            children: vec![],
            targets: targets
                .into_iter()
                .map(|target| (target, EntityOutcome::Pending))
                .collect(),
            state: CompletionState::Pending,
        };
        Self {
            tree: Arc::new(Mutex::new(CompleterTree {
                nodes: vec![node],
                ..Default::default()
            })),
            node: 0,
            repository,
        }
    }

    /// Create a child completer, for example one per consistency group of a multi group
    /// operation. The parent aggregates the entities of all of its children.
    pub fn child(
        &self,
        kind: OperationType,
        targets: impl IntoIterator<Item = ResourceId>,
    ) -> TaskCompleter {
        let mut tree = self.tree.lock();
        let index = tree.nodes.len();
        let operation = tree.nodes[self.node].operation.clone();
        tree.nodes.push(CompleterNode {
            operation,
            kind,
            parent: Some(self.node),
            children: vec![],
            targets: targets
                .into_iter()
                .map(|target| (target, EntityOutcome::Pending))
                .collect(),
            state: CompletionState::Pending,
        });
        tree.nodes[self.node].children.push(index);
        Self {
            tree: self.tree.clone(),
            node: index,
            repository: self.repository.clone(),
        }
    }

    /// The operation id.
    pub fn operation(&self) -> OperationId {
        self.tree.lock().nodes[self.node].operation.clone()
    }
    /// The current completion state.
    pub fn state(&self) -> CompletionState {
        self.tree.lock().nodes[self.node].state
    }
    /// The parent completer's operation kind, if this is a child.
    pub fn parent_kind(&self) -> Option<OperationType> {
        let tree = self.tree.lock();
        tree.nodes[self.node]
            .parent
            .map(|parent| tree.nodes[parent].kind)
    }
    /// The outcome recorded for the entity, within this completer or its children.
    pub fn entity_outcome(&self, resource: &ResourceId) -> Option<EntityOutcome> {
        let tree = self.tree.lock();
        tree.subtree(self.node)
            .into_iter()
            .find_map(|index| tree.nodes[index].targets.get(resource).cloned())
    }
    /// The outcome recorded for the step.
    pub fn step_outcome(&self, step: &StepId) -> Option<StepOutcome> {
        self.tree.lock().steps.get(step).cloned()
    }
    /// Warnings recorded so far.
    pub fn warnings(&self) -> Vec<String> {
        self.tree.lock().warnings.clone()
    }

    /// Mark the completer as rolling back; terminal writes are suppressed until cleared
    /// since compensating actions may drive the same completer.
    pub fn set_rolling_back(&self, rolling_back: bool) {
        self.tree.lock().rolling_back = rolling_back;
    }
    /// Check if the completer is rolling back.
    pub fn rolling_back(&self) -> bool {
        self.tree.lock().rolling_back
    }

    /// The operation has been accepted and is now executing.
    /// Persists a pending status on every tracked entity.
    pub async fn executing(&self) -> Result<(), SvcError> {
        let writes = {
            let mut tree = self.tree.lock();
            if tree.nodes[self.node].state != CompletionState::Pending {
                return Ok(());
            }
            let mut writes = vec![];
            for index in tree.subtree(self.node) {
                let node = &mut tree.nodes[index];
                node.state = CompletionState::Executing;
                for (resource, outcome) in &node.targets {
                    if outcome == &EntityOutcome::Pending {
                        writes.push(Operation::new(
                            &node.operation,
                            resource,
                            node.kind,
                            OperationStatus::Pending,
                            None,
                        ));
                    }
                }
            }
            writes
        };
        self.persist(writes).await
    }

    /// A step started executing.
    pub fn step_executing(&self, step: &StepId) {
        tracing::debug!(step.id = %step, "Step executing");
        self.tree
            .lock()
            .steps
            .insert(step.clone(), StepOutcome::Executing);
    }
    /// A step succeeded.
    pub fn step_succeeded(&self, step: &StepId) {
        tracing::debug!(step.id = %step, "Step succeeded");
        self.tree
            .lock()
            .steps
            .insert(step.clone(), StepOutcome::Succeeded);
    }
    /// A step failed with the given cause.
    pub fn step_failed(&self, step: &StepId, cause: &SvcError) {
        let cause = cause.full_string();
        tracing::error!(step.id = %step, error = %cause, "Step failed");
        self.tree
            .lock()
            .steps
            .insert(step.clone(), StepOutcome::Failed(cause));
    }

    /// Record a partial group failure; the operation completes with a warning status.
    pub fn add_warning(&self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!(%warning, "Operation completes with a warning");
        self.tree.lock().warnings.push(warning);
    }

    /// The given entity completed independently.
    pub async fn entity_ready(&self, resource: &ResourceId) -> Result<(), SvcError> {
        self.complete_entity(resource, None).await
    }
    /// The given entity failed independently.
    pub async fn entity_error(
        &self,
        resource: &ResourceId,
        cause: &SvcError,
    ) -> Result<(), SvcError> {
        self.complete_entity(resource, Some(cause.full_string()))
            .await
    }

    async fn complete_entity(
        &self,
        resource: &ResourceId,
        failure: Option<String>,
    ) -> Result<(), SvcError> {
        let write = {
            let mut tree = self.tree.lock();
            let scope = tree.subtree(self.node);
            let mut write = None;
            for index in scope {
                let node = &mut tree.nodes[index];
                if let Some(outcome) = node.targets.get_mut(resource) {
                    if outcome != &EntityOutcome::Pending {
                        break;
                    }
                    let status = match &failure {
                        Some(cause) => {
                            *outcome = EntityOutcome::Failed(cause.clone());
                            OperationStatus::Error
                        }
                        None => {
                            *outcome = EntityOutcome::Ready;
                            OperationStatus::Ready
                        }
                    };
                    write = Some(Operation::new(
                        &node.operation,
                        resource,
                        node.kind,
                        status,
                        failure.clone(),
                    ));
                    break;
                }
            }
            write
        };
        self.persist(write.into_iter().collect()).await
    }

    /// The operation succeeded: every entity which has not completed independently is
    /// marked ready. If any entity already failed, the operation fails instead.
    pub async fn ready(&self) -> Result<(), SvcError> {
        self.complete(None).await
    }
    /// The operation failed: every entity which has not completed independently is
    /// marked failed with the given cause.
    pub async fn error(&self, cause: &SvcError) -> Result<(), SvcError> {
        self.complete(Some(cause.full_string())).await
    }

    async fn complete(&self, failure: Option<String>) -> Result<(), SvcError> {
        let writes = {
            let mut tree = self.tree.lock();
            if tree.rolling_back {
                tracing::debug!("Rolling back, terminal status is deferred");
                return Ok(());
            }
            if tree.nodes[self.node].state.is_terminal() {
                tracing::debug!(state=%tree.nodes[self.node].state, "Already completed");
                return Ok(());
            }
            let scope = tree.subtree(self.node);
            let failure = failure.or_else(|| tree.first_failure(&scope));
            let (status, state, message) = match failure {
                Some(cause) => (OperationStatus::Error, CompletionState::Failed, Some(cause)),
                None if tree.warnings.is_empty() => {
                    (OperationStatus::Ready, CompletionState::Succeeded, None)
                }
                None => (
                    OperationStatus::Warning,
                    CompletionState::PartiallySucceeded,
                    Some(tree.warnings.join("; ")),
                ),
            };

            let mut writes = vec![];
            for index in scope {
                let node = &mut tree.nodes[index];
                if !node.state.is_terminal() {
                    node.state = state;
                }
                for (resource, outcome) in node.targets.iter_mut() {
                    if outcome != &EntityOutcome::Pending {
                        continue;
                    }
                    *outcome = match &message {
                        Some(cause) if status == OperationStatus::Error => {
                            EntityOutcome::Failed(cause.clone())
                        }
                        _ => EntityOutcome::Ready,
                    };
                    writes.push(Operation::new(
                        &node.operation,
                        resource,
                        node.kind,
                        status,
                        message.clone(),
                    ));
                }
            }
            tracing::info!(
                operation.id = %tree.nodes[self.node].operation,
                operation.kind = %tree.nodes[self.node].kind,
                %state,
                "Operation completed"
            );
            writes
        };
        self.persist(writes).await
    }

    async fn persist(&self, writes: Vec<Operation>) -> Result<(), SvcError> {
        for operation in writes {
            self.repository
                .update_operation(&operation.resource, &operation)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stor_port::types::v0::{
        store::memory::MemoryStore,
        transport::{ConsistencyGroupId, VolumeId},
    };

    fn volumes(count: usize) -> Vec<ResourceId> {
        (0 .. count)
            .map(|_| ResourceId::Volume(VolumeId::new()))
            .collect()
    }

    async fn status(store: &MemoryStore, op: &OperationId, resource: &ResourceId) -> Operation {
        store.operation(resource, op).await.unwrap()
    }

    #[tokio::test]
    async fn ready_when_all_entities_succeed() {
        let store = MemoryStore::new();
        let op = OperationId::new();
        let targets = volumes(3);
        let completer = TaskCompleter::new(
            Arc::new(store.clone()),
            &op,
            OperationType::CreateVolumes,
            targets.clone(),
        );
        completer.executing().await.unwrap();
        assert_eq!(completer.state(), CompletionState::Executing);
        assert_eq!(
            status(&store, &op, &targets[0]).await.status,
            OperationStatus::Pending
        );

        completer.entity_ready(&targets[0]).await.unwrap();
        completer.ready().await.unwrap();
        assert_eq!(completer.state(), CompletionState::Succeeded);
        for target in &targets {
            assert_eq!(
                status(&store, &op, target).await.status,
                OperationStatus::Ready
            );
            assert_eq!(completer.entity_outcome(target), Some(EntityOutcome::Ready));
        }
    }

    #[tokio::test]
    async fn any_entity_failure_fails_the_aggregate() {
        let store = MemoryStore::new();
        let op = OperationId::new();
        let targets = volumes(3);
        let completer = TaskCompleter::new(
            Arc::new(store.clone()),
            &op,
            OperationType::CreateVolumes,
            targets.clone(),
        );
        let cause = SvcError::Internal {
            details: "array offline".into(),
        };
        completer.entity_ready(&targets[0]).await.unwrap();
        completer.entity_error(&targets[1], &cause).await.unwrap();
        completer.ready().await.unwrap();

        assert_eq!(completer.state(), CompletionState::Failed);
        assert_eq!(completer.entity_outcome(&targets[0]), Some(EntityOutcome::Ready));
        let failed = status(&store, &op, &targets[2]).await;
        assert_eq!(failed.status, OperationStatus::Error);
        assert_eq!(
            failed.message.as_deref(),
            Some("Internal error: array offline")
        );
        // completed independently, so not overwritten
        assert_eq!(
            status(&store, &op, &targets[0]).await.status,
            OperationStatus::Ready
        );
    }

    #[tokio::test]
    async fn terminal_writes_happen_once() {
        let store = MemoryStore::new();
        let op = OperationId::new();
        let targets = volumes(1);
        let completer = TaskCompleter::new(
            Arc::new(store.clone()),
            &op,
            OperationType::DeleteVolumes,
            targets.clone(),
        );
        completer.set_rolling_back(true);
        completer.ready().await.unwrap();
        assert_eq!(completer.state(), CompletionState::Pending);
        assert!(store.operation(&targets[0], &op).await.is_err());

        completer.set_rolling_back(false);
        let cause = SvcError::Internal {
            details: "failed".into(),
        };
        completer.error(&cause).await.unwrap();
        completer.ready().await.unwrap();
        assert_eq!(completer.state(), CompletionState::Failed);
        assert_eq!(
            status(&store, &op, &targets[0]).await.status,
            OperationStatus::Error
        );
    }

    #[tokio::test]
    async fn children_aggregate_into_the_parent() {
        let store = MemoryStore::new();
        let op = OperationId::new();
        let root = TaskCompleter::new(
            Arc::new(store.clone()),
            &op,
            OperationType::UpdateConsistencyGroup,
            vec![],
        );
        let first = ResourceId::ConsistencyGroup(ConsistencyGroupId::new());
        let second = ResourceId::ConsistencyGroup(ConsistencyGroupId::new());
        let child_a = root.child(OperationType::UpdateConsistencyGroup, vec![first.clone()]);
        let child_b = root.child(OperationType::UpdateConsistencyGroup, vec![second.clone()]);
        assert_eq!(
            child_a.parent_kind(),
            Some(OperationType::UpdateConsistencyGroup)
        );

        child_a.ready().await.unwrap();
        assert_eq!(child_a.state(), CompletionState::Succeeded);
        assert_eq!(root.state(), CompletionState::Pending);

        child_b
            .entity_error(
                &second,
                &SvcError::Internal {
                    details: "boom".into(),
                },
            )
            .await
            .unwrap();
        root.ready().await.unwrap();
        assert_eq!(root.state(), CompletionState::Failed);
        assert_eq!(child_a.state(), CompletionState::Succeeded);
        assert_eq!(child_b.state(), CompletionState::Failed);
        assert_eq!(root.entity_outcome(&first), Some(EntityOutcome::Ready));
    }

    #[tokio::test]
    async fn warnings_give_partial_success() {
        let store = MemoryStore::new();
        let op = OperationId::new();
        let targets = volumes(1);
        let completer = TaskCompleter::new(
            Arc::new(store.clone()),
            &op,
            OperationType::CreateVolumes,
            targets.clone(),
        );
        completer.add_warning("clone of group RG1 failed");
        completer.ready().await.unwrap();
        assert_eq!(completer.state(), CompletionState::PartiallySucceeded);
        let record = status(&store, &op, &targets[0]).await;
        assert_eq!(record.status, OperationStatus::Warning);
        assert_eq!(record.message.as_deref(), Some("clone of group RG1 failed"));
    }
}
