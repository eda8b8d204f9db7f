//! Consistency groups: their array replication groups and membership updates.

mod actions;
mod steps;

pub use actions::GroupAction;
pub(crate) use steps::{by_system, JOINED};
