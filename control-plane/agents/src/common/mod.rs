/// Orchestration level errors.
pub mod errors;
