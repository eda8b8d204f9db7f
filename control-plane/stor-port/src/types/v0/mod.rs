/// Persisted domain records and the repository capability.
pub mod store;
/// Identifiers and plain enums shared by every record.
pub mod transport;
