//! Driver lookup by name.

use std::sync::Arc;

use super::driver::SecurityDriver;
use super::{apparmor, nop, selinux};

/// Resolves driver names to drivers.
pub trait DriverRegistry: Send + Sync {
    /// Find a usable driver.
    ///
    /// With `name` unset, returns the host default: the first driver whose
    /// probe succeeds for `virt_driver`. A named driver is only returned if
    /// its probe succeeds.
    fn lookup(&self, name: Option<&str>, virt_driver: &str) -> Option<Arc<dyn SecurityDriver>> {
        let found = self.drivers().into_iter().find(|driver| {
            if name.is_some_and(|name| name != driver.name()) {
                return false;
            }

            let enabled = driver.probe(virt_driver);
            if !enabled {
                tracing::debug!(driver = driver.name(), virt_driver, "Security driver is disabled");
            }
            enabled
        });

        if let Some(driver) = &found {
            tracing::debug!(driver = driver.name(), "Selected security driver");
        }

        found
    }

    /// All registered drivers, in probe order.
    fn drivers(&self) -> Vec<Arc<dyn SecurityDriver>>;
}

/// Registry of the drivers shipped with this crate.
///
/// Probe order is selinux, apparmor, then the always-available `none`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinRegistry;

impl BuiltinRegistry {
    /// Create the registry.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl DriverRegistry for BuiltinRegistry {
    fn drivers(&self) -> Vec<Arc<dyn SecurityDriver>> {
        vec![selinux::driver(), apparmor::driver(), nop::driver()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_always_found() {
        let driver = BuiltinRegistry::new().lookup(Some("none"), "qemu").unwrap();
        assert_eq!(driver.name(), "none");
    }

    #[test]
    fn default_lookup_always_succeeds() {
        assert!(BuiltinRegistry::new().lookup(None, "qemu").is_some());
    }

    #[test]
    fn unknown_name_not_found() {
        assert!(BuiltinRegistry::new().lookup(Some("smack"), "qemu").is_none());
    }

    #[test]
    fn dac_is_not_looked_up_by_name() {
        assert!(BuiltinRegistry::new().lookup(Some("dac"), "qemu").is_none());
    }
}
