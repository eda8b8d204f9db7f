//! Orchestration core of a SAN block storage controller.
//!
//! Operations on volumes, consistency groups and their replicas are assembled into step
//! graphs by the [`controller::workflow::StepBuilder`] and run by the
//! [`controller::workflow::WorkflowExecutor`] against the device driver of each storage
//! system's technology, with compensation of the succeeded steps on failure.

mod common;

/// Agent level errors.
pub use common::errors;

/// Tunables of the orchestration core.
pub mod config;
/// Locks, completion tracking, device drivers and workflows.
pub mod controller;
/// Consistency groups and their membership.
pub mod consistency_group;
/// Facade running each supported operation as a workflow.
pub mod orchestrator;
/// Mirrors, full copies, snapshots and snapshot sessions.
pub mod replica;
/// Volume provisioning.
pub mod volume;

pub use orchestrator::Orchestrator;
