//! Host security configuration.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use seclabel_common::{SeclabelError, SeclabelResult};

use crate::security::{DriverRegistry, NOP_DRIVER_NAME, SecurityManager, SecurityManagerFlags};

/// Security settings of a virtualization host.
///
/// ```toml
/// virt_driver = "qemu"
/// security_driver = ["selinux"]
/// security_default_confined = true
/// security_require_confined = false
/// user = 107
/// group = 107
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityDriverConfig {
    /// Virtualization driver the managers serve.
    pub virt_driver: String,
    /// Drivers to stack, primary first. Empty selects the host default.
    pub security_driver: Vec<String>,
    /// Confine domains that do not ask for a label type.
    pub security_default_confined: bool,
    /// Refuse unconfined domains.
    pub security_require_confined: bool,
    /// Allow disk image format probing.
    pub allow_disk_format_probing: bool,
    /// Change ownership of domain resources.
    pub dynamic_ownership: bool,
    /// User domain processes run as.
    pub user: u32,
    /// Group domain processes run as.
    pub group: u32,
}

impl Default for SecurityDriverConfig {
    fn default() -> Self {
        Self {
            virt_driver: "qemu".to_string(),
            security_driver: Vec::new(),
            security_default_confined: true,
            security_require_confined: false,
            allow_disk_format_probing: false,
            dynamic_ownership: true,
            user: 0,
            group: 0,
        }
    }
}

impl SecurityDriverConfig {
    /// Load a configuration file.
    pub fn from_file(path: &Path) -> SeclabelResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a TOML configuration.
    pub fn from_toml(content: &str) -> SeclabelResult<Self> {
        toml::from_str(content).map_err(|e| SeclabelError::Config {
            message: e.to_string(),
        })
    }

    /// Set the virtualization driver.
    #[must_use]
    pub fn with_virt_driver(mut self, virt_driver: impl Into<String>) -> Self {
        self.virt_driver = virt_driver.into();
        self
    }

    /// Append a driver to the stack.
    #[must_use]
    pub fn with_security_driver(mut self, name: impl Into<String>) -> Self {
        self.security_driver.push(name.into());
        self
    }

    /// Set default confinement.
    #[must_use]
    pub const fn with_default_confined(mut self, on: bool) -> Self {
        self.security_default_confined = on;
        self
    }

    /// Set required confinement.
    #[must_use]
    pub const fn with_require_confined(mut self, on: bool) -> Self {
        self.security_require_confined = on;
        self
    }

    /// Set dynamic ownership.
    #[must_use]
    pub const fn with_dynamic_ownership(mut self, on: bool) -> Self {
        self.dynamic_ownership = on;
        self
    }

    /// Set the owner of domain processes.
    #[must_use]
    pub const fn with_owner(mut self, user: u32, group: u32) -> Self {
        self.user = user;
        self.group = group;
        self
    }

    /// Policy flags for new managers.
    #[must_use]
    pub const fn flags(&self) -> SecurityManagerFlags {
        SecurityManagerFlags {
            allow_disk_format_probing: self.allow_disk_format_probing,
            default_confined: self.security_default_confined,
            require_confined: self.security_require_confined,
        }
    }

    fn validate(&self) -> SeclabelResult<()> {
        let mut seen = HashSet::new();

        for name in &self.security_driver {
            if !seen.insert(name.as_str()) {
                return Err(SeclabelError::Config {
                    message: format!("Security driver '{name}' is listed more than once"),
                });
            }
        }

        if self.security_driver.len() > 1 && seen.contains(NOP_DRIVER_NAME) {
            return Err(SeclabelError::Config {
                message: "Security driver \"none\" cannot be combined with other drivers"
                    .to_string(),
            });
        }

        Ok(())
    }

    /// Assemble the host's security manager.
    ///
    /// The result is always a stack: the first listed driver (or the
    /// registry default) is the primary, further listed drivers follow in
    /// order, and a `dac` manager for `user`/`group` is nested last.
    ///
    /// # Errors
    ///
    /// Returns [`SeclabelError::Config`] for duplicate drivers or `none`
    /// listed with others, and whatever creating a nested manager reports.
    pub fn build_manager(&self, registry: &dyn DriverRegistry) -> SeclabelResult<Arc<SecurityManager>> {
        self.validate()?;

        let flags = self.flags();
        let mut names = self.security_driver.iter().map(String::as_str);

        let primary = SecurityManager::new(registry, names.next(), &self.virt_driver, flags)?;
        let stack = SecurityManager::new_stack(primary)?;

        for name in names {
            let nested = SecurityManager::new(registry, Some(name), &self.virt_driver, flags)?;
            stack.stack_add_nested(nested)?;
        }

        let dac = SecurityManager::new_dac(
            &self.virt_driver,
            self.user,
            self.group,
            stack.flags(),
            self.dynamic_ownership,
        )?;
        stack.stack_add_nested(dac)?;

        tracing::info!(
            drivers = ?stack
                .get_nested()?
                .iter()
                .map(|m| m.driver_name())
                .collect::<Vec<_>>(),
            "Security manager ready"
        );

        Ok(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::BuiltinRegistry;

    #[test]
    fn default_config() {
        let config = SecurityDriverConfig::default();
        assert_eq!(config.virt_driver, "qemu");
        assert!(config.security_driver.is_empty());
        assert!(config.security_default_confined);
        assert!(!config.security_require_confined);
        assert!(config.dynamic_ownership);
    }

    #[test]
    fn parse_partial_toml() {
        let config = SecurityDriverConfig::from_toml(
            r#"
            security_driver = ["none"]
            user = 107
            group = 107
            "#,
        )
        .unwrap();

        assert_eq!(config.security_driver, vec!["none".to_string()]);
        assert_eq!((config.user, config.group), (107, 107));
        assert_eq!(config.virt_driver, "qemu");
    }

    #[test]
    fn parse_error_is_config_error() {
        let err = SecurityDriverConfig::from_toml("security_driver = 3").unwrap_err();
        assert!(matches!(err, SeclabelError::Config { .. }));
    }

    #[test]
    fn from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seclabel.toml");
        std::fs::write(&path, "virt_driver = \"lxc\"\n").unwrap();

        let config = SecurityDriverConfig::from_file(&path).unwrap();
        assert_eq!(config.virt_driver, "lxc");
    }

    #[test]
    fn builder_pattern() {
        let config = SecurityDriverConfig::default()
            .with_virt_driver("lxc")
            .with_security_driver("selinux")
            .with_require_confined(true)
            .with_owner(107, 108);

        assert_eq!(config.virt_driver, "lxc");
        assert_eq!(config.security_driver, vec!["selinux".to_string()]);
        assert!(config.flags().require_confined);
        assert_eq!((config.user, config.group), (107, 108));
    }

    #[test]
    fn none_stacks_with_dac() {
        let mgr = SecurityDriverConfig::default()
            .with_security_driver("none")
            .build_manager(&BuiltinRegistry::new())
            .unwrap();

        let names: Vec<_> = mgr
            .get_nested()
            .unwrap()
            .iter()
            .map(|m| m.driver_name())
            .collect();
        assert_eq!(names, ["none", "dac"]);
        assert_eq!(mgr.driver_name(), "stack");
        assert!(!mgr.default_confined());
    }

    #[test]
    fn duplicate_driver_rejected() {
        let err = SecurityDriverConfig::default()
            .with_security_driver("none")
            .with_security_driver("none")
            .build_manager(&BuiltinRegistry::new())
            .unwrap_err();
        assert!(matches!(err, SeclabelError::Config { .. }));
    }

    #[test]
    fn none_with_others_rejected() {
        let err = SecurityDriverConfig::default()
            .with_security_driver("selinux")
            .with_security_driver("none")
            .build_manager(&BuiltinRegistry::new())
            .unwrap_err();
        assert!(matches!(err, SeclabelError::Config { .. }));
    }
}
