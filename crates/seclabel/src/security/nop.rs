//! The `none` driver: accepts every operation and labels nothing.

use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;

use seclabel_common::SeclabelResult;

use super::SecurityManager;
use super::driver::SecurityDriver;
use crate::domain::{DomainDef, HostdevDef, SecurityLabel, StorageSource};

/// Reserved name of the driver used when no confinement is available.
pub const NOP_DRIVER_NAME: &str = "none";

static NOP: Lazy<Arc<dyn SecurityDriver>> = Lazy::new(|| Arc::new(NopDriver));

/// The shared `none` driver.
#[must_use]
pub fn driver() -> Arc<dyn SecurityDriver> {
    Arc::clone(&NOP)
}

/// Driver that performs no labelling.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopDriver;

impl SecurityDriver for NopDriver {
    fn name(&self) -> &'static str {
        NOP_DRIVER_NAME
    }

    fn get_model(&self, _mgr: &SecurityManager) -> SeclabelResult<String> {
        Ok(NOP_DRIVER_NAME.to_string())
    }

    fn get_doi(&self, _mgr: &SecurityManager) -> SeclabelResult<String> {
        Ok("0".to_string())
    }

    fn generate_label(&self, _mgr: &SecurityManager, _def: &mut DomainDef) -> SeclabelResult<()> {
        Ok(())
    }

    fn reserve_label(&self, _mgr: &SecurityManager, _def: &DomainDef, _pid: u32) -> SeclabelResult<()> {
        Ok(())
    }

    fn release_label(&self, _mgr: &SecurityManager, _def: &mut DomainDef) -> SeclabelResult<()> {
        Ok(())
    }

    fn verify(&self, _mgr: &SecurityManager, _def: &DomainDef) -> SeclabelResult<()> {
        Ok(())
    }

    fn get_process_label(
        &self,
        _mgr: &SecurityManager,
        _def: &DomainDef,
        _pid: u32,
    ) -> SeclabelResult<SecurityLabel> {
        Ok(SecurityLabel {
            model: NOP_DRIVER_NAME.to_string(),
            label: String::new(),
            enforcing: false,
        })
    }

    fn set_process_label(&self, _mgr: &SecurityManager, _def: &DomainDef) -> SeclabelResult<()> {
        Ok(())
    }

    fn set_image_label(
        &self,
        _mgr: &SecurityManager,
        _def: &DomainDef,
        _src: &StorageSource,
    ) -> SeclabelResult<()> {
        Ok(())
    }

    fn restore_image_label(
        &self,
        _mgr: &SecurityManager,
        _def: &DomainDef,
        _src: &StorageSource,
    ) -> SeclabelResult<()> {
        Ok(())
    }

    fn set_socket_label(&self, _mgr: &SecurityManager, _def: &DomainDef) -> SeclabelResult<()> {
        Ok(())
    }

    fn clear_socket_label(&self, _mgr: &SecurityManager, _def: &DomainDef) -> SeclabelResult<()> {
        Ok(())
    }

    fn set_daemon_socket_label(
        &self,
        _mgr: &SecurityManager,
        _def: &DomainDef,
    ) -> SeclabelResult<()> {
        Ok(())
    }

    fn set_hostdev_label(
        &self,
        _mgr: &SecurityManager,
        _def: &DomainDef,
        _dev: &HostdevDef,
        _vroot: Option<&Path>,
    ) -> SeclabelResult<()> {
        Ok(())
    }

    fn restore_hostdev_label(
        &self,
        _mgr: &SecurityManager,
        _def: &DomainDef,
        _dev: &HostdevDef,
        _vroot: Option<&Path>,
    ) -> SeclabelResult<()> {
        Ok(())
    }

    fn set_saved_state_label(
        &self,
        _mgr: &SecurityManager,
        _def: &DomainDef,
        _path: &Path,
    ) -> SeclabelResult<()> {
        Ok(())
    }

    fn restore_saved_state_label(
        &self,
        _mgr: &SecurityManager,
        _def: &DomainDef,
        _path: &Path,
    ) -> SeclabelResult<()> {
        Ok(())
    }

    fn set_image_fd_label(
        &self,
        _mgr: &SecurityManager,
        _def: &DomainDef,
        _fd: BorrowedFd<'_>,
    ) -> SeclabelResult<()> {
        Ok(())
    }

    fn set_tap_fd_label(
        &self,
        _mgr: &SecurityManager,
        _def: &DomainDef,
        _fd: BorrowedFd<'_>,
    ) -> SeclabelResult<()> {
        Ok(())
    }

    fn get_mount_options(
        &self,
        _mgr: &SecurityManager,
        _def: &DomainDef,
    ) -> SeclabelResult<Option<String>> {
        Ok(None)
    }
}
