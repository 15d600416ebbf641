//! Security manager: one driver plus the policy it is run with.

use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use seclabel_common::{SeclabelError, SeclabelResult};

use super::driver::{DriverState, SecurityDriver};
use super::registry::DriverRegistry;
use super::{dac, nop, stack};
use crate::domain::{DomainDef, HostdevDef, SecurityLabel, StorageSource};

/// Policy flags a manager is created with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityManagerFlags {
    /// Allow drivers to probe disk image formats.
    pub allow_disk_format_probing: bool,
    /// Domains without an explicit label are confined.
    pub default_confined: bool,
    /// Unconfined domains are refused.
    pub require_confined: bool,
}

impl SecurityManagerFlags {
    /// Confine domains by default.
    #[must_use]
    pub const fn with_default_confined(mut self, on: bool) -> Self {
        self.default_confined = on;
        self
    }

    /// Refuse unconfined domains.
    #[must_use]
    pub const fn with_require_confined(mut self, on: bool) -> Self {
        self.require_confined = on;
        self
    }

    /// Allow disk format probing.
    #[must_use]
    pub const fn with_disk_format_probing(mut self, on: bool) -> Self {
        self.allow_disk_format_probing = on;
        self
    }
}

/// A security driver bound to a policy and its private state.
///
/// Managers are handed around as `Arc<SecurityManager>` so a stack can
/// share its nested managers with callers. Dropping the last handle runs
/// the driver's close hook.
#[derive(Debug)]
pub struct SecurityManager {
    driver: Arc<dyn SecurityDriver>,
    virt_driver: String,
    flags: SecurityManagerFlags,
    state: Mutex<DriverState>,
}

impl SecurityManager {
    /// Build a manager around `driver` and run its open hook.
    ///
    /// # Errors
    ///
    /// Returns [`SeclabelError::OpenFailed`] if the driver refuses to open;
    /// the half-built manager is closed before returning.
    pub fn new_from_driver(
        driver: Arc<dyn SecurityDriver>,
        virt_driver: &str,
        flags: SecurityManagerFlags,
    ) -> SeclabelResult<Arc<Self>> {
        tracing::debug!(
            driver = driver.name(),
            virt_driver,
            ?flags,
            "Creating security manager"
        );

        let mgr = Arc::new(Self {
            state: Mutex::new(driver.private_data()),
            driver,
            virt_driver: virt_driver.to_string(),
            flags,
        });

        if let Err(e) = mgr.driver.open(&mgr) {
            return Err(SeclabelError::OpenFailed {
                driver: mgr.driver.name().to_string(),
                source: Box::new(e),
            });
        }

        Ok(mgr)
    }

    /// Build a stack whose first nested manager is `primary`.
    ///
    /// The stack copies the primary's virt driver and policy flags.
    pub fn new_stack(primary: Arc<Self>) -> SeclabelResult<Arc<Self>> {
        let mgr = Self::new_from_driver(stack::driver(), &primary.virt_driver, primary.flags)?;
        mgr.stack_add_nested(primary)?;
        Ok(mgr)
    }

    /// Build a discretionary ownership manager.
    pub fn new_dac(
        virt_driver: &str,
        user: u32,
        group: u32,
        flags: SecurityManagerFlags,
        dynamic_ownership: bool,
    ) -> SeclabelResult<Arc<Self>> {
        let mgr = Self::new_from_driver(dac::driver(), virt_driver, flags)?;
        dac::set_user_group(&mgr, user, group)?;
        dac::set_dynamic_ownership(&mgr, dynamic_ownership)?;
        Ok(mgr)
    }

    /// Build a manager for the driver `name` found in `registry`.
    ///
    /// With no name the registry picks the host default. When that is the
    /// `none` driver, confinement cannot be required and default
    /// confinement is switched off.
    ///
    /// # Errors
    ///
    /// Returns [`SeclabelError::ConfigUnsupported`] if the driver is unknown
    /// or confinement is required without a confining driver.
    pub fn new(
        registry: &dyn DriverRegistry,
        name: Option<&str>,
        virt_driver: &str,
        mut flags: SecurityManagerFlags,
    ) -> SeclabelResult<Arc<Self>> {
        let driver = registry.lookup(name, virt_driver).ok_or_else(|| {
            SeclabelError::config_unsupported(match name {
                Some(name) => format!("Security driver {name} not found"),
                None => "No security driver available on this host".to_string(),
            })
        })?;

        if driver.name() == nop::NOP_DRIVER_NAME {
            if flags.require_confined {
                return Err(SeclabelError::config_unsupported(
                    "Security driver \"none\" cannot create confined guests",
                ));
            }

            if flags.default_confined {
                if name.is_some() {
                    tracing::warn!(
                        "Configured security driver \"none\" disables default policy to create confined guests"
                    );
                } else {
                    tracing::debug!(
                        "Auto-probed security driver is \"none\"; confined guests will not be created"
                    );
                }
                flags.default_confined = false;
            }
        }

        Self::new_from_driver(driver, virt_driver, flags)
    }

    /// Append `nested` to this stack.
    ///
    /// # Errors
    ///
    /// Fails without mutation if this manager is not a stack, or if
    /// `nested` is the stack itself.
    pub fn stack_add_nested(&self, nested: Arc<Self>) -> SeclabelResult<()> {
        if std::ptr::eq(self, nested.as_ref()) {
            return Err(SeclabelError::config_unsupported(
                "Cannot nest a security stack into itself",
            ));
        }

        match &mut *self.state.lock() {
            DriverState::Stack(stack) => {
                tracing::debug!(nested = nested.driver_name(), "Adding nested security manager");
                stack.push(nested);
                Ok(())
            }
            _ => Err(SeclabelError::config_unsupported(format!(
                "Security driver '{}' is not a stack",
                self.driver_name()
            ))),
        }
    }

    /// The managers a caller has to satisfy, in application order.
    ///
    /// A stack yields its nested managers; any other manager yields itself.
    pub fn get_nested(self: &Arc<Self>) -> SeclabelResult<Vec<Arc<Self>>> {
        match &*self.state.lock() {
            DriverState::Stack(stack) => Ok(stack.managers().to_vec()),
            _ => Ok(vec![Arc::clone(self)]),
        }
    }

    /// Name of the bound driver.
    #[must_use]
    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    /// The bound driver.
    #[must_use]
    pub fn driver(&self) -> &Arc<dyn SecurityDriver> {
        &self.driver
    }

    /// Owning virtualization driver.
    #[must_use]
    pub fn virt_driver(&self) -> &str {
        &self.virt_driver
    }

    /// Policy flags.
    #[must_use]
    pub const fn flags(&self) -> SecurityManagerFlags {
        self.flags
    }

    /// Whether drivers may probe disk image formats.
    #[must_use]
    pub const fn allow_disk_format_probing(&self) -> bool {
        self.flags.allow_disk_format_probing
    }

    /// Whether domains are confined unless they say otherwise.
    #[must_use]
    pub const fn default_confined(&self) -> bool {
        self.flags.default_confined
    }

    /// Whether unconfined domains are refused.
    #[must_use]
    pub const fn require_confined(&self) -> bool {
        self.flags.require_confined
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock()
    }

    /// Run the driver's pre-fork hook.
    ///
    /// On success the caller must call [`SecurityManager::post_fork`] once
    /// in the parent and once in the child. On error it must not fork.
    pub fn pre_fork(&self) -> SeclabelResult<()> {
        self.driver.pre_fork(self)
    }

    /// Run the driver's post-fork hook.
    pub fn post_fork(&self) {
        self.driver.post_fork(self);
    }

    /// Domain of interpretation of the driver.
    pub fn get_doi(&self) -> SeclabelResult<String> {
        self.driver.get_doi(self)
    }

    /// Security model of the driver.
    pub fn get_model(&self) -> SeclabelResult<String> {
        self.driver.get_model(self)
    }

    /// Fill in this driver's label entry of `def`.
    ///
    /// This is the raw driver call; [`SecurityManager::generate_labels`]
    /// decides which entries exist and when to call it.
    pub fn generate_label(&self, def: &mut DomainDef) -> SeclabelResult<()> {
        self.driver.generate_label(self, def)
    }

    /// Reserve the label of a running domain process.
    pub fn reserve_label(&self, def: &DomainDef, pid: u32) -> SeclabelResult<()> {
        self.driver.reserve_label(self, def, pid)
    }

    /// Release the domain's label.
    pub fn release_label(&self, def: &mut DomainDef) -> SeclabelResult<()> {
        self.driver.release_label(self, def)
    }

    /// Verify the domain's label entry for this driver.
    ///
    /// A domain with no entry for this driver, or whose entry has no
    /// model, is not subject to the driver and verifies trivially.
    pub fn verify(&self, def: &DomainDef) -> SeclabelResult<()> {
        match def.find_seclabel(self.driver_name()) {
            Some(seclabel) if seclabel.model.is_some() => self.driver.verify(self, def),
            _ => Ok(()),
        }
    }

    /// Label of a running process.
    pub fn get_process_label(&self, def: &DomainDef, pid: u32) -> SeclabelResult<SecurityLabel> {
        self.driver.get_process_label(self, def, pid)
    }

    /// Apply the domain's label to the current process.
    pub fn set_process_label(&self, def: &DomainDef) -> SeclabelResult<()> {
        self.driver.set_process_label(self, def)
    }

    /// Label a disk image.
    pub fn set_image_label(&self, def: &DomainDef, src: &StorageSource) -> SeclabelResult<()> {
        self.driver.set_image_label(self, def, src)
    }

    /// Restore a disk image's label.
    pub fn restore_image_label(&self, def: &DomainDef, src: &StorageSource) -> SeclabelResult<()> {
        self.driver.restore_image_label(self, def, src)
    }

    /// Label sockets created from now on.
    pub fn set_socket_label(&self, def: &DomainDef) -> SeclabelResult<()> {
        self.driver.set_socket_label(self, def)
    }

    /// Stop labelling new sockets.
    pub fn clear_socket_label(&self, def: &DomainDef) -> SeclabelResult<()> {
        self.driver.clear_socket_label(self, def)
    }

    /// Label the daemon socket.
    pub fn set_daemon_socket_label(&self, def: &DomainDef) -> SeclabelResult<()> {
        self.driver.set_daemon_socket_label(self, def)
    }

    /// Label a host device.
    pub fn set_hostdev_label(
        &self,
        def: &DomainDef,
        dev: &HostdevDef,
        vroot: Option<&Path>,
    ) -> SeclabelResult<()> {
        self.driver.set_hostdev_label(self, def, dev, vroot)
    }

    /// Restore a host device's label.
    pub fn restore_hostdev_label(
        &self,
        def: &DomainDef,
        dev: &HostdevDef,
        vroot: Option<&Path>,
    ) -> SeclabelResult<()> {
        self.driver.restore_hostdev_label(self, def, dev, vroot)
    }

    /// Label a saved-state file.
    pub fn set_saved_state_label(&self, def: &DomainDef, path: &Path) -> SeclabelResult<()> {
        self.driver.set_saved_state_label(self, def, path)
    }

    /// Restore a saved-state file's label.
    pub fn restore_saved_state_label(&self, def: &DomainDef, path: &Path) -> SeclabelResult<()> {
        self.driver.restore_saved_state_label(self, def, path)
    }

    /// Label an open image file descriptor.
    pub fn set_image_fd_label(&self, def: &DomainDef, fd: BorrowedFd<'_>) -> SeclabelResult<()> {
        self.driver.set_image_fd_label(self, def, fd)
    }

    /// Label an open tap device descriptor.
    pub fn set_tap_fd_label(&self, def: &DomainDef, fd: BorrowedFd<'_>) -> SeclabelResult<()> {
        self.driver.set_tap_fd_label(self, def, fd)
    }

    /// Mount options carrying the domain's label, if the driver has any.
    pub fn get_mount_options(&self, def: &DomainDef) -> SeclabelResult<Option<String>> {
        self.driver.get_mount_options(self, def)
    }

    /// Label every resource of the domain.
    ///
    /// Disks marked `norelabel` are skipped. Stops at the first failure.
    pub fn set_all_label(&self, def: &DomainDef, saved_state: Option<&Path>) -> SeclabelResult<()> {
        tracing::debug!(domain = %def.name, driver = self.driver_name(), "Labelling domain resources");

        for disk in def.disks.iter().filter(|d| !d.norelabel) {
            self.set_image_label(def, disk)?;
        }

        for dev in &def.hostdevs {
            self.set_hostdev_label(def, dev, None)?;
        }

        if let Some(path) = saved_state {
            self.set_saved_state_label(def, path)?;
        }

        Ok(())
    }

    /// Restore the labels of every resource of the domain.
    ///
    /// Keeps going after a failure and returns the first one.
    pub fn restore_all_label(&self, def: &DomainDef) -> SeclabelResult<()> {
        tracing::debug!(domain = %def.name, driver = self.driver_name(), "Restoring domain resource labels");

        let mut first_err = None;

        let disks = def
            .disks
            .iter()
            .filter(|d| !d.norelabel)
            .map(|disk| (disk.path.clone(), self.restore_image_label(def, disk)));
        let devs = def
            .hostdevs
            .iter()
            .map(|dev| (dev.path.clone(), self.restore_hostdev_label(def, dev, None)));

        for (path, result) in disks.chain(devs) {
            if let Err(e) = result {
                tracing::warn!(path = %path.display(), error = %e, "Failed to restore label");
                first_err.get_or_insert(e);
            }
        }

        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for SecurityManager {
    fn drop(&mut self) {
        self.driver.close(self);
    }
}
