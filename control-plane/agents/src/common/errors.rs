use crate::controller::driver::DriverError;
use snafu::Snafu;
use std::time::Duration;
use stor_port::{
    transport_api::ResourceKind,
    types::v0::{
        store::StoreError,
        transport::{StorageSystemId, Technology},
    },
};
use strum_macros::{AsRefStr, Display};

/// Common error type for the orchestration core.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub), context(suffix(false)))]
#[allow(missing_docs)]
pub enum SvcError {
    #[snafu(display("Timed out after '{:?}' acquiring the locks '{}'", timeout, keys.join(",")))]
    ResourceBusy { keys: Vec<String>, timeout: Duration },
    #[snafu(display("{} '{}' not found", kind.to_string(), id))]
    NotFound { kind: ResourceKind, id: String },
    #[snafu(display("Entry with key '{}' not found in the store", key))]
    StoreMissingEntry { key: String },
    #[snafu(display("No device driver is registered for technology '{}'", technology))]
    DriverNotFound { technology: Technology },
    #[snafu(display(
        "Device operation '{}' failed on storage system '{}'",
        operation,
        system
    ))]
    Device {
        operation: String,
        system: StorageSystemId,
        source: DriverError,
    },
    #[snafu(display(
        "Device operation '{}' on storage system '{}' exceeded its deadline of '{:?}'",
        operation,
        system,
        deadline
    ))]
    DeviceTimeout {
        operation: String,
        system: StorageSystemId,
        deadline: Duration,
    },
    #[snafu(display(
        "Device operation '{}' on storage system '{}' returned no native id for {} '{}'",
        operation,
        system,
        kind.to_string(),
        id
    ))]
    MissingNativeId {
        operation: String,
        system: StorageSystemId,
        kind: ResourceKind,
        id: String,
    },
    #[snafu(display(
        "{} '{}' in state '{}' does not allow operation '{}'",
        kind.to_string(),
        id,
        state,
        operation
    ))]
    InvalidReplicaState {
        kind: ResourceKind,
        id: String,
        state: String,
        operation: String,
    },
    #[snafu(display("{} '{}' has not been provisioned on the array", kind.to_string(), id))]
    NotProvisioned { kind: ResourceKind, id: String },
    #[snafu(display("Replicas of group '{}' could not be propagated: {}", group, details))]
    PartialGroupFailure { group: String, details: String },
    #[snafu(display("Storage Error"))]
    Store { source: StoreError },
    #[snafu(display("Invalid arguments: {}", details))]
    InvalidArguments { details: String },
    #[snafu(display("Internal error: {}", details))]
    Internal { details: String },
}

/// The error categories exposed to the callers of the orchestration core.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Display, AsRefStr)]
pub enum ErrorCategory {
    /// Lock acquisition timed out, the caller may retry.
    ResourceBusy,
    /// The array refused the operation, or it is invalid in the current state.
    DeviceRejected,
    /// A referenced entity does not exist.
    NotFound,
    /// Group replicas failed while the primary operation succeeded.
    PartialGroupFailure,
    /// Anything else.
    Fatal,
}

impl SvcError {
    /// Get the category of the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ResourceBusy { .. } => ErrorCategory::ResourceBusy,
            Self::NotFound { .. } | Self::StoreMissingEntry { .. } | Self::DriverNotFound { .. } => {
                ErrorCategory::NotFound
            }
            Self::Device { source, .. } => match source {
                DriverError::Rejected { .. } | DriverError::Unsupported { .. } => {
                    ErrorCategory::DeviceRejected
                }
                DriverError::ObjectNotFound { .. } => ErrorCategory::NotFound,
                DriverError::Unavailable { .. } | DriverError::JobFailed { .. } => {
                    ErrorCategory::Fatal
                }
            },
            Self::InvalidReplicaState { .. } | Self::NotProvisioned { .. } => {
                ErrorCategory::DeviceRejected
            }
            Self::PartialGroupFailure { .. } => ErrorCategory::PartialGroupFailure,
            Self::DeviceTimeout { .. }
            | Self::MissingNativeId { .. }
            | Self::Store { .. }
            | Self::InvalidArguments { .. }
            | Self::Internal { .. } => ErrorCategory::Fatal,
        }
    }

    /// A reference to an entity which was deleted or never existed.
    /// Compensations treat these as a successful no-op.
    pub fn is_stale_reference(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::StoreMissingEntry { .. }
                | Self::Device {
                    source: DriverError::ObjectNotFound { .. },
                    ..
                }
        )
    }

    /// Map a missing store entry onto a `NotFound` of the given resource.
    pub fn from_store(kind: ResourceKind, id: &impl ToString, source: StoreError) -> Self {
        match source {
            StoreError::MissingEntry { .. } => Self::NotFound {
                kind,
                id: id.to_string(),
            },
            source => Self::Store { source },
        }
    }
}

impl From<StoreError> for SvcError {
    fn from(source: StoreError) -> Self {
        match source {
            StoreError::MissingEntry { key } => SvcError::StoreMissingEntry { key },
            _ => SvcError::Store { source },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stor_port::transport_api::ErrorChain;

    #[test]
    fn categories() {
        let busy = SvcError::ResourceBusy {
            keys: vec!["a".into(), "b".into()],
            timeout: Duration::from_secs(1),
        };
        assert_eq!(busy.category(), ErrorCategory::ResourceBusy);
        assert_eq!(busy.to_string(), "Timed out after '1s' acquiring the locks 'a,b'");

        let rejected = SvcError::Device {
            operation: "create_volumes".into(),
            system: "sys-1".into(),
            source: DriverError::Rejected {
                operation: "create_volumes".into(),
                reason: "pool is full".into(),
            },
        };
        assert_eq!(rejected.category(), ErrorCategory::DeviceRejected);
        assert!(rejected.full_string().ends_with("pool is full"));
        assert!(!rejected.is_stale_reference());

        let gone = SvcError::Device {
            operation: "delete_volumes".into(),
            system: "sys-1".into(),
            source: DriverError::ObjectNotFound { id: "0x1".into() },
        };
        assert!(gone.is_stale_reference());

        let missing = SvcError::from(StoreError::MissingEntry { key: "k".into() });
        assert!(missing.is_stale_reference());
        assert!(!SvcError::DriverNotFound {
            technology: Technology::Hds
        }
        .is_stale_reference());
    }
}
