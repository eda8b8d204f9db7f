use clap::Parser;
use std::time::Duration;

/// Tunables of the workflow executor, lock manager and device dispatch.
#[derive(Debug, Clone, Parser)]
#[clap(name = "orchestrator", about = "Block storage orchestration core", version)]
pub struct OrchestratorConfig {
    /// Maximum time a workflow step waits to acquire all of its scope locks.
    #[clap(long, env = "ORCHESTRATOR_LOCK_TIMEOUT", default_value = utils::LOCK_TIMEOUT)]
    pub lock_timeout: humantime::Duration,

    /// Lease time of a scope lock, after which it may be taken over.
    #[clap(long, env = "ORCHESTRATOR_LOCK_TTL", default_value = utils::LOCK_TTL)]
    pub lock_ttl: humantime::Duration,

    /// Number of steps allowed to run concurrently against a single storage system.
    #[clap(long, default_value_t = utils::SYSTEM_CONCURRENCY)]
    pub system_concurrency: usize,

    /// Execution deadline of a device driver call, including job polling.
    #[clap(long, env = "ORCHESTRATOR_DEVICE_DEADLINE", default_value = utils::DEVICE_DEADLINE)]
    pub device_deadline: humantime::Duration,

    /// The period at which pending device jobs are polled.
    #[clap(long, default_value = utils::JOB_POLL_PERIOD)]
    pub job_poll_period: humantime::Duration,

    /// The period at which replica synchronization progress is polled.
    #[clap(long, default_value = utils::SYNC_POLL_PERIOD)]
    pub sync_poll_period: humantime::Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::parse_from(std::iter::empty::<String>())
    }
}

impl OrchestratorConfig {
    /// Get the lock acquisition timeout.
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout.into()
    }
    /// Get the lock lease time.
    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl.into()
    }
    /// Get the per storage system concurrency limit, never less than 1.
    pub fn system_concurrency(&self) -> usize {
        self.system_concurrency.max(1)
    }
    /// Get the device call deadline.
    pub fn device_deadline(&self) -> Duration {
        self.device_deadline.into()
    }
    /// Get the job poll period.
    pub fn job_poll_period(&self) -> Duration {
        self.job_poll_period.into()
    }
    /// Get the synchronization poll period.
    pub fn sync_poll_period(&self) -> Duration {
        self.sync_poll_period.into()
    }

    /// With the given lock acquisition timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout.into();
        self
    }
    /// With the given lock lease time.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl.into();
        self
    }
    /// With the given per storage system concurrency limit.
    pub fn with_system_concurrency(mut self, limit: usize) -> Self {
        self.system_concurrency = limit;
        self
    }
    /// With the given device call deadline.
    pub fn with_device_deadline(mut self, deadline: Duration) -> Self {
        self.device_deadline = deadline.into();
        self
    }
    /// With the given job and synchronization poll period.
    pub fn with_poll_period(mut self, period: Duration) -> Self {
        self.job_poll_period = period.into();
        self.sync_poll_period = period.into();
        self
    }
}
