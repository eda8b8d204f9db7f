use crate::errors::SvcError;
use serde::{Deserialize, Serialize};
use stor_port::types::v0::store::replica::{
    FullCopyState, MirrorState, ReplicaSpec, ReplicaState, SessionState, SnapshotState,
};
use strum_macros::{AsRefStr, Display};

/// The lifecycle operations of a replica.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ReplicaOperation {
    Create,
    Activate,
    Synchronized,
    Fracture,
    Resume,
    Detach,
    Restore,
    Resync,
    Link,
    Relink,
    Unlink,
    Delete,
}

/// The state a replica in `state` reaches through `operation`, if the transition is valid.
pub fn next_state(state: ReplicaState, operation: ReplicaOperation) -> Option<ReplicaState> {
    use ReplicaOperation as Op;
    match state {
        ReplicaState::Mirror(state) => {
            use MirrorState::*;
            let next = match (operation, state) {
                (Op::Create, Unknown) => Created,
                (Op::Activate, Created) => Synchronizing,
                (Op::Synchronized, Synchronizing | Resynchronizing | Synchronized) => Synchronized,
                (Op::Fracture, Created | Synchronizing | Synchronized) => Fractured,
                (Op::Resume, Fractured) => Resynchronizing,
                (Op::Detach, Fractured | Synchronized) => Detached,
                (Op::Delete, Unknown | Created | Fractured | Detached) => state,
                _ => return None,
            };
            Some(ReplicaState::Mirror(next))
        }
        ReplicaState::FullCopy(state) => {
            use FullCopyState::*;
            let next = match (operation, state) {
                (Op::Create, Unknown) => Created,
                (Op::Activate, Created) => Synchronizing,
                (Op::Synchronized, Synchronizing | Synchronized) => Synchronized,
                (Op::Fracture, Synchronizing | Synchronized | Restored | Resynchronized) => {
                    Fractured
                }
                (Op::Restore, Fractured | Synchronized | Resynchronized) => Restored,
                (Op::Resync, Fractured | Restored) => Resynchronized,
                (Op::Detach, state) if !matches!(state, Unknown | Detached) => Detached,
                (Op::Delete, Unknown | Created | Fractured | Detached) => state,
                _ => return None,
            };
            Some(ReplicaState::FullCopy(next))
        }
        ReplicaState::Snapshot(state) => {
            use SnapshotState::*;
            let next = match (operation, state) {
                (Op::Create, Unknown) => Created,
                (Op::Activate, Created) => Activated,
                (Op::Link, Unknown | Created | Unlinked) => Linked,
                (Op::Relink, Linked) => Linked,
                (Op::Unlink, Linked) => Unlinked,
                (Op::Restore, Created | Activated | Restored | Resynchronized) => Restored,
                (Op::Resync, Created | Activated | Restored | Resynchronized) => Resynchronized,
                (Op::Delete, state) if state != Linked => state,
                _ => return None,
            };
            Some(ReplicaState::Snapshot(next))
        }
        ReplicaState::SnapshotSession(state) => {
            use SessionState::*;
            let next = match (operation, state) {
                (Op::Create, Unknown) => Created,
                (Op::Link, Created | Linked) => Linked,
                // the remaining targets decide whether the session stays linked
                (Op::Unlink, Linked) => Linked,
                (Op::Restore, Created | Linked) => state,
                (Op::Delete, Unknown | Created) => state,
                _ => return None,
            };
            Some(ReplicaState::SnapshotSession(next))
        }
    }
}

/// Check the transition of the replica, failing with `SvcError::InvalidReplicaState`.
pub fn guard(replica: &ReplicaSpec, operation: ReplicaOperation) -> Result<ReplicaState, SvcError> {
    next_state(replica.state, operation).ok_or_else(|| SvcError::InvalidReplicaState {
        kind: replica.kind().into(),
        id: replica.uuid.to_string(),
        state: replica.state.to_string(),
        operation: operation.to_string(),
    })
}
