/// Task completion bookkeeping.
pub mod completer;
/// Device driver capability and registry.
pub mod driver;
/// Scope keyed locks serializing operations on shared array groups.
pub mod lock;
/// Repository helpers mapping missing records onto typed errors.
pub mod records;
/// Step graphs and their executor.
pub mod workflow;
