use super::{DeviceDriver, DriverCapabilities};
use crate::errors::SvcError;
use std::{collections::HashMap, sync::Arc};
use stor_port::types::v0::transport::Technology;

/// Static table of the device drivers, one per storage technology.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<Technology, Arc<dyn DeviceDriver>>,
}

impl DriverRegistry {
    /// Create a new empty `Self`.
    pub fn new() -> Self {
        Self::default()
    }
    /// Add the driver for the technology.
    #[must_use]
    pub fn with_driver(mut self, technology: Technology, driver: Arc<dyn DeviceDriver>) -> Self {
        self.register(technology, driver);
        self
    }
    /// Register the driver for the technology, replacing any previous one.
    pub fn register(&mut self, technology: Technology, driver: Arc<dyn DeviceDriver>) {
        tracing::debug!(%technology, "Registering device driver");
        self.drivers.insert(technology, driver);
    }
    /// Get the driver of the technology.
    pub fn driver(&self, technology: Technology) -> Result<Arc<dyn DeviceDriver>, SvcError> {
        self.drivers
            .get(&technology)
            .cloned()
            .ok_or(SvcError::DriverNotFound { technology })
    }
    /// Get the capabilities of the technology.
    pub fn capabilities(&self, technology: Technology) -> Result<DriverCapabilities, SvcError> {
        self.driver(technology).map(|driver| driver.capabilities())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::driver::DriverError;
    use stor_port::types::v0::transport::StorageSystemId;

    #[derive(Debug)]
    struct Bare;
    impl DeviceDriver for Bare {}

    #[tokio::test]
    async fn lookup() {
        let registry = DriverRegistry::new().with_driver(Technology::Vmax3, Arc::new(Bare));
        let driver = registry.driver(Technology::Vmax3).unwrap();
        assert_eq!(driver.capabilities(), DriverCapabilities::default());
        let error = driver
            .delete_replication_group(&StorageSystemId::from("sys-1"), "RG1")
            .await
            .unwrap_err();
        assert!(matches!(error, DriverError::Unsupported { .. }));

        let error = registry.driver(Technology::Vnx).unwrap_err();
        assert!(matches!(
            error,
            SvcError::DriverNotFound {
                technology: Technology::Vnx
            }
        ));
    }
}
