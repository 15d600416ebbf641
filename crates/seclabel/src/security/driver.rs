//! Security driver capability interface.
//!
//! A [`SecurityDriver`] describes one labelling technology. It is shared
//! read-only between every [`SecurityManager`] bound to it; per-manager
//! state lives in the manager as a [`DriverState`] created by
//! [`SecurityDriver::private_data`].
//!
//! Every capability has a default body that reports
//! [`SeclabelError::NotSupported`], so a driver only overrides what it
//! actually implements.

use std::fmt;
use std::os::fd::BorrowedFd;
use std::path::Path;

use seclabel_common::{SeclabelError, SeclabelResult};

use super::SecurityManager;
use super::apparmor::AppArmorState;
use super::dac::DacState;
use super::selinux::SelinuxState;
use super::stack::StackState;
use crate::domain::{DomainDef, HostdevDef, SecurityLabel, StorageSource};

/// Per-manager private state, selected by the driver.
#[derive(Debug, Default)]
pub enum DriverState {
    /// Driver keeps no state.
    #[default]
    None,
    /// Discretionary ownership settings.
    Dac(DacState),
    /// SELinux MCS bookkeeping.
    Selinux(SelinuxState),
    /// AppArmor profile rules.
    AppArmor(AppArmorState),
    /// Nested managers of a stack.
    Stack(StackState),
}

fn unsupported<T>(driver: &str, operation: &str) -> SeclabelResult<T> {
    Err(SeclabelError::not_supported(driver, operation))
}

/// A pluggable labelling backend.
#[allow(unused_variables)]
pub trait SecurityDriver: Send + Sync + fmt::Debug {
    /// Unique driver name, also the model name of its label entries.
    fn name(&self) -> &'static str;

    /// Whether the driver can be used on this host for `virt_driver`.
    fn probe(&self, virt_driver: &str) -> bool {
        true
    }

    /// Fresh private state for a new manager.
    fn private_data(&self) -> DriverState {
        DriverState::None
    }

    /// Initialize a newly built manager.
    fn open(&self, mgr: &SecurityManager) -> SeclabelResult<()> {
        Ok(())
    }

    /// Tear down a manager that is being destroyed.
    fn close(&self, mgr: &SecurityManager) {}

    /// Called before the caller forks. An error vetoes the fork.
    fn pre_fork(&self, mgr: &SecurityManager) -> SeclabelResult<()> {
        Ok(())
    }

    /// Called once in the parent and once in the child after a fork.
    fn post_fork(&self, mgr: &SecurityManager) {}

    /// Security model name.
    fn get_model(&self, mgr: &SecurityManager) -> SeclabelResult<String> {
        unsupported(self.name(), "get_model")
    }

    /// Domain of interpretation.
    fn get_doi(&self, mgr: &SecurityManager) -> SeclabelResult<String> {
        unsupported(self.name(), "get_doi")
    }

    /// Fill in this driver's label entry of `def`.
    fn generate_label(&self, mgr: &SecurityManager, def: &mut DomainDef) -> SeclabelResult<()> {
        unsupported(self.name(), "generate_label")
    }

    /// Mark the label of an already running domain process as in use.
    fn reserve_label(&self, mgr: &SecurityManager, def: &DomainDef, pid: u32) -> SeclabelResult<()> {
        unsupported(self.name(), "reserve_label")
    }

    /// Release a label previously generated or reserved.
    fn release_label(&self, mgr: &SecurityManager, def: &mut DomainDef) -> SeclabelResult<()> {
        unsupported(self.name(), "release_label")
    }

    /// Check that this driver's label entry of `def` is usable.
    fn verify(&self, mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<()> {
        unsupported(self.name(), "verify")
    }

    /// Read the label of a running process.
    fn get_process_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        pid: u32,
    ) -> SeclabelResult<SecurityLabel> {
        unsupported(self.name(), "get_process_label")
    }

    /// Apply the domain's label to the current process.
    fn set_process_label(&self, mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<()> {
        unsupported(self.name(), "set_process_label")
    }

    /// Label a disk image.
    fn set_image_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        src: &StorageSource,
    ) -> SeclabelResult<()> {
        unsupported(self.name(), "set_image_label")
    }

    /// Restore a disk image's label.
    fn restore_image_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        src: &StorageSource,
    ) -> SeclabelResult<()> {
        unsupported(self.name(), "restore_image_label")
    }

    /// Label sockets created by the current thread.
    fn set_socket_label(&self, mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<()> {
        unsupported(self.name(), "set_socket_label")
    }

    /// Undo [`SecurityDriver::set_socket_label`].
    fn clear_socket_label(&self, mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<()> {
        unsupported(self.name(), "clear_socket_label")
    }

    /// Label the socket the domain uses to reach the daemon.
    fn set_daemon_socket_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
    ) -> SeclabelResult<()> {
        unsupported(self.name(), "set_daemon_socket_label")
    }

    /// Label a host device node.
    fn set_hostdev_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        dev: &HostdevDef,
        vroot: Option<&Path>,
    ) -> SeclabelResult<()> {
        unsupported(self.name(), "set_hostdev_label")
    }

    /// Restore a host device node's label.
    fn restore_hostdev_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        dev: &HostdevDef,
        vroot: Option<&Path>,
    ) -> SeclabelResult<()> {
        unsupported(self.name(), "restore_hostdev_label")
    }

    /// Label a saved-state file.
    fn set_saved_state_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        path: &Path,
    ) -> SeclabelResult<()> {
        unsupported(self.name(), "set_saved_state_label")
    }

    /// Restore a saved-state file's label.
    fn restore_saved_state_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        path: &Path,
    ) -> SeclabelResult<()> {
        unsupported(self.name(), "restore_saved_state_label")
    }

    /// Label an open disk image.
    fn set_image_fd_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        fd: BorrowedFd<'_>,
    ) -> SeclabelResult<()> {
        unsupported(self.name(), "set_image_fd_label")
    }

    /// Label an open tap device.
    fn set_tap_fd_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        fd: BorrowedFd<'_>,
    ) -> SeclabelResult<()> {
        unsupported(self.name(), "set_tap_fd_label")
    }

    /// Mount options that give a filesystem the domain's label.
    fn get_mount_options(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
    ) -> SeclabelResult<Option<String>> {
        unsupported(self.name(), "get_mount_options")
    }
}
