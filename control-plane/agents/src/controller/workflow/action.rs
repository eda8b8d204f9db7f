use super::StepContext;
use crate::{
    consistency_group::GroupAction, errors::SvcError, replica::ReplicaAction, volume::VolumeAction,
};
use serde::{Deserialize, Serialize};

/// The serialisable command a step runs on execution or on rollback.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    Volume(VolumeAction),
    Replica(ReplicaAction),
    Group(GroupAction),
    /// Does nothing; as a compensation it lets the rollback carry on with the
    /// preceding steps.
    Null,
}

impl StepAction {
    /// Run the action.
    pub async fn execute(&self, ctx: &StepContext<'_>) -> Result<(), SvcError> {
        match self {
            Self::Volume(action) => action.execute(ctx).await,
            Self::Replica(action) => action.execute(ctx).await,
            Self::Group(action) => action.execute(ctx).await,
            Self::Null => Ok(()),
        }
    }
    /// Check if this is the no-op action.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<VolumeAction> for StepAction {
    fn from(action: VolumeAction) -> Self {
        Self::Volume(action)
    }
}
impl From<ReplicaAction> for StepAction {
    fn from(action: ReplicaAction) -> Self {
        Self::Replica(action)
    }
}
impl From<GroupAction> for StepAction {
    fn from(action: GroupAction) -> Self {
        Self::Group(action)
    }
}
