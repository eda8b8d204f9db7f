//! Volume provisioning, deletion and expansion.

mod actions;
mod steps;

pub use actions::VolumeAction;
