/// Various common constants used by the orchestration core.

/// Maximum time a workflow step waits to acquire all of its scope locks.
pub const LOCK_TIMEOUT: &str = "30s";

/// Lease time of a scope lock after which a lock whose holder never released it
/// may be taken over by another step.
pub const LOCK_TTL: &str = "5m";

/// Default number of workflow steps allowed to run concurrently against the
/// command endpoint of a single storage system.
pub const SYSTEM_CONCURRENCY: usize = 4;

/// Execution deadline of a single device driver call, including the polling of
/// any asynchronous job it started.
pub const DEVICE_DEADLINE: &str = "10m";

/// The period at which pending device jobs are polled for completion.
pub const JOB_POLL_PERIOD: &str = "2s";

/// The period at which replica synchronization progress is polled.
pub const SYNC_POLL_PERIOD: &str = "5s";

/// Default tracing filter directive used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info";
