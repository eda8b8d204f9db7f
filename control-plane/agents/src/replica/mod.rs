//! Lifecycle of mirrors, full copies, snapshots and snapshot sessions, and the propagation of
//! group replicas across the members of a consistency group.

mod actions;
mod propagation;
mod session;
mod session_steps;
mod state;
mod steps;

pub use actions::ReplicaAction;
pub use state::{guard, next_state, ReplicaOperation};
pub use steps::ReplicaBatch;
