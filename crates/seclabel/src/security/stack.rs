//! The `stack` driver: applies several managers to the same domain.
//!
//! Model, DOI, process label and mount options come from the primary
//! (first) manager. Every other operation runs on each nested manager in
//! order; failures do not stop the remaining managers and the first one
//! is returned.

use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;

use seclabel_common::{SeclabelError, SeclabelResult};

use super::SecurityManager;
use super::driver::{DriverState, SecurityDriver};
use crate::domain::{DomainDef, HostdevDef, SecurityLabel, StorageSource};

/// Name of the stack driver.
pub const STACK_DRIVER_NAME: &str = "stack";

static STACK: Lazy<Arc<dyn SecurityDriver>> = Lazy::new(|| Arc::new(StackDriver));

/// The shared stack driver.
#[must_use]
pub fn driver() -> Arc<dyn SecurityDriver> {
    Arc::clone(&STACK)
}

/// Nested managers of a stack, in application order.
#[derive(Debug, Default)]
pub struct StackState {
    managers: Vec<Arc<SecurityManager>>,
}

impl StackState {
    /// Append a manager.
    pub fn push(&mut self, mgr: Arc<SecurityManager>) {
        self.managers.push(mgr);
    }

    /// Nested managers.
    #[must_use]
    pub fn managers(&self) -> &[Arc<SecurityManager>] {
        &self.managers
    }
}

fn nested(mgr: &SecurityManager) -> SeclabelResult<Vec<Arc<SecurityManager>>> {
    match &*mgr.state() {
        DriverState::Stack(stack) => Ok(stack.managers.clone()),
        _ => Err(SeclabelError::Internal {
            message: "stack driver bound to a manager without stack state".to_string(),
        }),
    }
}

fn primary(mgr: &SecurityManager) -> SeclabelResult<Arc<SecurityManager>> {
    nested(mgr)?
        .into_iter()
        .next()
        .ok_or_else(|| SeclabelError::Internal {
            message: "security stack has no primary driver".to_string(),
        })
}

fn for_each(
    mgr: &SecurityManager,
    operation: &str,
    mut f: impl FnMut(&SecurityManager) -> SeclabelResult<()>,
) -> SeclabelResult<()> {
    let mut first_err = None;

    for item in nested(mgr)? {
        if let Err(e) = f(&item) {
            tracing::warn!(
                driver = item.driver_name(),
                operation,
                error = %e,
                "Nested security driver failed"
            );
            first_err.get_or_insert(e);
        }
    }

    first_err.map_or(Ok(()), Err)
}

/// Driver whose private state is a list of nested managers.
#[derive(Debug, Default, Clone, Copy)]
pub struct StackDriver;

impl SecurityDriver for StackDriver {
    fn name(&self) -> &'static str {
        STACK_DRIVER_NAME
    }

    fn private_data(&self) -> DriverState {
        DriverState::Stack(StackState::default())
    }

    fn close(&self, mgr: &SecurityManager) {
        let managers = match &mut *mgr.state() {
            DriverState::Stack(stack) => std::mem::take(&mut stack.managers),
            _ => Vec::new(),
        };
        drop(managers);
    }

    fn pre_fork(&self, mgr: &SecurityManager) -> SeclabelResult<()> {
        let items = nested(mgr)?;

        for (i, item) in items.iter().enumerate() {
            if let Err(e) = item.pre_fork() {
                for done in items[..i].iter().rev() {
                    done.post_fork();
                }
                return Err(e);
            }
        }

        Ok(())
    }

    fn post_fork(&self, mgr: &SecurityManager) {
        match nested(mgr) {
            Ok(items) => items.iter().rev().for_each(|item| item.post_fork()),
            Err(e) => tracing::warn!(error = %e, "Cannot run post-fork hooks"),
        }
    }

    fn get_model(&self, mgr: &SecurityManager) -> SeclabelResult<String> {
        primary(mgr)?.get_model()
    }

    fn get_doi(&self, mgr: &SecurityManager) -> SeclabelResult<String> {
        primary(mgr)?.get_doi()
    }

    fn generate_label(&self, mgr: &SecurityManager, def: &mut DomainDef) -> SeclabelResult<()> {
        for_each(mgr, "generate_label", |item| item.generate_label(def))
    }

    fn reserve_label(&self, mgr: &SecurityManager, def: &DomainDef, pid: u32) -> SeclabelResult<()> {
        for_each(mgr, "reserve_label", |item| item.reserve_label(def, pid))
    }

    fn release_label(&self, mgr: &SecurityManager, def: &mut DomainDef) -> SeclabelResult<()> {
        for_each(mgr, "release_label", |item| item.release_label(def))
    }

    fn verify(&self, mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<()> {
        for_each(mgr, "verify", |item| item.verify(def))
    }

    fn get_process_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        pid: u32,
    ) -> SeclabelResult<SecurityLabel> {
        primary(mgr)?.get_process_label(def, pid)
    }

    fn set_process_label(&self, mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<()> {
        for_each(mgr, "set_process_label", |item| item.set_process_label(def))
    }

    fn set_image_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        src: &StorageSource,
    ) -> SeclabelResult<()> {
        for_each(mgr, "set_image_label", |item| item.set_image_label(def, src))
    }

    fn restore_image_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        src: &StorageSource,
    ) -> SeclabelResult<()> {
        for_each(mgr, "restore_image_label", |item| {
            item.restore_image_label(def, src)
        })
    }

    fn set_socket_label(&self, mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<()> {
        for_each(mgr, "set_socket_label", |item| item.set_socket_label(def))
    }

    fn clear_socket_label(&self, mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<()> {
        for_each(mgr, "clear_socket_label", |item| item.clear_socket_label(def))
    }

    fn set_daemon_socket_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
    ) -> SeclabelResult<()> {
        for_each(mgr, "set_daemon_socket_label", |item| {
            item.set_daemon_socket_label(def)
        })
    }

    fn set_hostdev_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        dev: &HostdevDef,
        vroot: Option<&Path>,
    ) -> SeclabelResult<()> {
        for_each(mgr, "set_hostdev_label", |item| {
            item.set_hostdev_label(def, dev, vroot)
        })
    }

    fn restore_hostdev_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        dev: &HostdevDef,
        vroot: Option<&Path>,
    ) -> SeclabelResult<()> {
        for_each(mgr, "restore_hostdev_label", |item| {
            item.restore_hostdev_label(def, dev, vroot)
        })
    }

    fn set_saved_state_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        path: &Path,
    ) -> SeclabelResult<()> {
        for_each(mgr, "set_saved_state_label", |item| {
            item.set_saved_state_label(def, path)
        })
    }

    fn restore_saved_state_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        path: &Path,
    ) -> SeclabelResult<()> {
        for_each(mgr, "restore_saved_state_label", |item| {
            item.restore_saved_state_label(def, path)
        })
    }

    fn set_image_fd_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        fd: BorrowedFd<'_>,
    ) -> SeclabelResult<()> {
        for_each(mgr, "set_image_fd_label", |item| {
            item.set_image_fd_label(def, fd)
        })
    }

    fn set_tap_fd_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        fd: BorrowedFd<'_>,
    ) -> SeclabelResult<()> {
        for_each(mgr, "set_tap_fd_label", |item| item.set_tap_fd_label(def, fd))
    }

    fn get_mount_options(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
    ) -> SeclabelResult<Option<String>> {
        primary(mgr)?.get_mount_options(def)
    }
}
