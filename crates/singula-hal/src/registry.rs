//! [`DriveRegistry`] – vendor name → drive factory.
//!
//! The controller never names a concrete drive type.  It asks the registry to
//! build one for the configured vendor and gets an `Arc<dyn AxisDrive>` back.
//! Vendors are registered once at start-up; registering a name twice replaces
//! the earlier factory.

use std::collections::HashMap;
use std::sync::Arc;

use singula_types::SingulaError;

use crate::drive::{AxisDrive, DriveContext};
use crate::sim::{SIM_VENDOR, SimDrive, SimProtocol};

/// Builds one drive from its context.
pub type DriveFactory =
    Arc<dyn Fn(DriveContext) -> Result<Arc<dyn AxisDrive>, SingulaError> + Send + Sync>;

/// Central drive factory registry.
#[derive(Default, Clone)]
pub struct DriveRegistry {
    factories: HashMap<String, DriveFactory>,
}

impl DriveRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every vendor shipped in this crate (currently `"sim"`).
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            SIM_VENDOR,
            Arc::new(|ctx| {
                let drive = SimDrive::new(SimProtocol, ctx)?;
                Ok(Arc::new(drive) as Arc<dyn AxisDrive>)
            }),
        );
        registry
    }

    pub fn register(&mut self, vendor: impl Into<String>, factory: DriveFactory) {
        self.factories.insert(vendor.into(), factory);
    }

    pub fn contains(&self, vendor: &str) -> bool {
        self.factories.contains_key(vendor)
    }

    /// Sorted list of registered vendor names.
    pub fn vendors(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build a drive for `vendor`.
    ///
    /// # Errors
    ///
    /// - [`SingulaError::UnknownVendor`] when nothing is registered under
    ///   `vendor`.
    /// - Whatever the factory returns, typically
    ///   [`SingulaError::InvalidOptions`].
    pub fn create(&self, vendor: &str, ctx: DriveContext) -> Result<Arc<dyn AxisDrive>, SingulaError> {
        let factory = self
            .factories
            .get(vendor)
            .ok_or_else(|| SingulaError::UnknownVendor(vendor.to_string()))?;
        factory(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::AxisPort;
    use crate::sim::SimAxisPort;
    use singula_types::{AxisId, DriverOptions, DriverStatus};

    fn ctx(options: DriverOptions) -> DriveContext {
        DriveContext {
            axis: AxisId(2),
            node_id: 3,
            reversed: false,
            port: SimAxisPort::new(AxisId(2), 3) as Arc<dyn AxisPort>,
            options,
        }
    }

    #[test]
    fn builtin_registry_builds_sim_drive() {
        let registry = DriveRegistry::with_builtin();
        let drive = registry.create("sim", ctx(DriverOptions::default())).unwrap();
        assert_eq!(drive.axis_id(), AxisId(2));
        assert_eq!(drive.node_id(), 3);
        assert_eq!(drive.vendor(), "sim");
        assert_eq!(drive.status(), DriverStatus::Disconnected);
    }

    #[test]
    fn unknown_vendor_is_reported_by_name() {
        let registry = DriveRegistry::with_builtin();
        let err = registry
            .create("acme", ctx(DriverOptions::default()))
            .err()
            .unwrap();
        assert_eq!(err, SingulaError::UnknownVendor("acme".into()));
    }

    #[test]
    fn factory_errors_propagate() {
        let registry = DriveRegistry::with_builtin();
        let bad = DriverOptions {
            gear_ratio: f64::NAN,
            ..DriverOptions::default()
        };
        assert!(matches!(
            registry.create("sim", ctx(bad)),
            Err(SingulaError::InvalidOptions(_))
        ));
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let mut registry = DriveRegistry::new();
        registry.register("x", Arc::new(|_| Err(SingulaError::Bus("first".into()))));
        registry.register("x", Arc::new(|_| Err(SingulaError::Bus("second".into()))));
        assert_eq!(registry.vendors(), vec!["x"]);
        let err = registry.create("x", ctx(DriverOptions::default())).err().unwrap();
        assert_eq!(err, SingulaError::Bus("second".into()));
    }
}
