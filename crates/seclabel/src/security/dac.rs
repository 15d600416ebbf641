//! Discretionary access control driver.
//!
//! Labels are file ownerships written as `+uid:+gid`. With dynamic
//! ownership enabled, domain resources are chowned to the domain's owner
//! when labelled and handed back to root when restored.

use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;

use seclabel_common::{SeclabelError, SeclabelResult};

use super::SecurityManager;
use super::driver::{DriverState, SecurityDriver};
use crate::domain::{DomainDef, HostdevDef, LabelType, SecurityLabel, StorageSource};

/// Name of the DAC driver.
pub const DAC_DRIVER_NAME: &str = "dac";

static DAC: Lazy<Arc<dyn SecurityDriver>> = Lazy::new(|| Arc::new(DacDriver));

/// The shared DAC driver.
#[must_use]
pub fn driver() -> Arc<dyn SecurityDriver> {
    Arc::clone(&DAC)
}

/// Ownership settings of a DAC manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DacState {
    /// Owner of domain resources.
    pub user: u32,
    /// Group of domain resources.
    pub group: u32,
    /// Chown resources when labelling them.
    pub dynamic_ownership: bool,
}

fn settings(mgr: &SecurityManager) -> SeclabelResult<DacState> {
    match &*mgr.state() {
        DriverState::Dac(state) => Ok(*state),
        _ => Err(SeclabelError::Internal {
            message: format!("manager '{}' is not a DAC manager", mgr.driver_name()),
        }),
    }
}

fn update(mgr: &SecurityManager, f: impl FnOnce(&mut DacState)) -> SeclabelResult<()> {
    match &mut *mgr.state() {
        DriverState::Dac(state) => {
            f(state);
            Ok(())
        }
        _ => Err(SeclabelError::Internal {
            message: format!("manager '{}' is not a DAC manager", mgr.driver_name()),
        }),
    }
}

/// Set the owner of domain resources.
pub fn set_user_group(mgr: &SecurityManager, user: u32, group: u32) -> SeclabelResult<()> {
    update(mgr, |state| {
        state.user = user;
        state.group = group;
    })
}

/// Enable or disable chowning of domain resources.
pub fn set_dynamic_ownership(mgr: &SecurityManager, dynamic: bool) -> SeclabelResult<()> {
    update(mgr, |state| state.dynamic_ownership = dynamic)
}

/// Parse a `uid:gid` label; either id may carry a leading `+`.
pub fn parse_ownership(label: &str) -> SeclabelResult<(u32, u32)> {
    let invalid = || SeclabelError::InvalidLabel {
        model: DAC_DRIVER_NAME.to_string(),
        label: label.to_string(),
    };

    let (user, group) = label.split_once(':').ok_or_else(invalid)?;
    let user = user.strip_prefix('+').unwrap_or(user).parse().map_err(|_| invalid())?;
    let group = group.strip_prefix('+').unwrap_or(group).parse().map_err(|_| invalid())?;

    Ok((user, group))
}

/// Format an ownership label.
#[must_use]
pub fn format_ownership(user: u32, group: u32) -> String {
    format!("+{user}:+{group}")
}

/// Ownership the domain's processes run with.
fn process_owner(mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<(u32, u32)> {
    let state = settings(mgr)?;
    match def
        .find_seclabel(DAC_DRIVER_NAME)
        .and_then(|l| l.label.as_deref())
    {
        Some(label) => parse_ownership(label),
        None => Ok((state.user, state.group)),
    }
}

/// Ownership to give domain resources, or `None` to leave them alone.
fn image_owner(mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<Option<(u32, u32)>> {
    let state = settings(mgr)?;
    if !state.dynamic_ownership {
        return Ok(None);
    }

    match def.find_seclabel(DAC_DRIVER_NAME) {
        Some(seclabel) if !seclabel.relabel() => Ok(None),
        Some(seclabel) => match seclabel.imagelabel.as_deref().or(seclabel.label.as_deref()) {
            Some(label) => parse_ownership(label).map(Some),
            None => Ok(Some((state.user, state.group))),
        },
        None => Ok(Some((state.user, state.group))),
    }
}

/// Whether restoring should hand resources back to root.
fn should_restore(mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<bool> {
    let state = settings(mgr)?;
    let norelabel = def
        .find_seclabel(DAC_DRIVER_NAME)
        .is_some_and(|l| !l.relabel());
    Ok(state.dynamic_ownership && !norelabel)
}

fn map_chown_error(path: &Path, e: io::Error) -> SeclabelError {
    if e.kind() == io::ErrorKind::PermissionDenied {
        SeclabelError::PermissionDenied {
            operation: format!("chown {}", path.display()),
        }
    } else {
        SeclabelError::Io(e)
    }
}

fn chown_path(path: &Path, (user, group): (u32, u32)) -> SeclabelResult<()> {
    tracing::debug!(path = %path.display(), user, group, "Setting DAC ownership");
    std::os::unix::fs::chown(path, Some(user), Some(group)).map_err(|e| map_chown_error(path, e))
}

fn chown_fd(fd: BorrowedFd<'_>, (user, group): (u32, u32)) -> SeclabelResult<()> {
    tracing::debug!(user, group, "Setting DAC ownership on descriptor");
    std::os::unix::fs::fchown(fd, Some(user), Some(group)).map_err(SeclabelError::Io)
}

#[allow(unsafe_code)]
fn switch_ids(user: u32, group: u32) -> SeclabelResult<()> {
    // Safety: setgid/setuid take plain integers and touch no memory.
    unsafe {
        if libc::setgid(group) != 0 {
            return Err(io::Error::last_os_error().into());
        }
        if libc::setuid(user) != 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Driver that labels through file ownership.
#[derive(Debug, Default, Clone, Copy)]
pub struct DacDriver;

impl SecurityDriver for DacDriver {
    fn name(&self) -> &'static str {
        DAC_DRIVER_NAME
    }

    fn private_data(&self) -> DriverState {
        DriverState::Dac(DacState::default())
    }

    fn get_model(&self, _mgr: &SecurityManager) -> SeclabelResult<String> {
        Ok(DAC_DRIVER_NAME.to_string())
    }

    fn get_doi(&self, _mgr: &SecurityManager) -> SeclabelResult<String> {
        Ok("0".to_string())
    }

    fn generate_label(&self, mgr: &SecurityManager, def: &mut DomainDef) -> SeclabelResult<()> {
        let state = settings(mgr)?;
        let Some(seclabel) = def.find_seclabel_mut(DAC_DRIVER_NAME) else {
            return Ok(());
        };

        match seclabel.label_type {
            LabelType::Static => {
                let label = seclabel.label.as_deref().ok_or_else(|| {
                    SeclabelError::config_unsupported("Missing label for static DAC security label")
                })?;
                parse_ownership(label)?;
            }
            LabelType::Dynamic => {
                seclabel.label = Some(format_ownership(state.user, state.group));
            }
            LabelType::None => return Ok(()),
            LabelType::Default => {
                return Err(SeclabelError::driver(
                    DAC_DRIVER_NAME,
                    "label type must be resolved before generation",
                ));
            }
        }

        if seclabel.imagelabel.is_none() {
            seclabel.imagelabel.clone_from(&seclabel.label);
        }

        Ok(())
    }

    fn reserve_label(&self, _mgr: &SecurityManager, _def: &DomainDef, _pid: u32) -> SeclabelResult<()> {
        Ok(())
    }

    fn release_label(&self, _mgr: &SecurityManager, _def: &mut DomainDef) -> SeclabelResult<()> {
        Ok(())
    }

    fn verify(&self, _mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<()> {
        match def.find_seclabel(DAC_DRIVER_NAME) {
            Some(seclabel) if seclabel.label_type == LabelType::Static => {
                let label = seclabel.label.as_deref().unwrap_or_default();
                parse_ownership(label).map(|_| ())
            }
            _ => Ok(()),
        }
    }

    fn get_process_label(
        &self,
        _mgr: &SecurityManager,
        _def: &DomainDef,
        pid: u32,
    ) -> SeclabelResult<SecurityLabel> {
        let meta = std::fs::metadata(format!("/proc/{pid}"))?;
        Ok(SecurityLabel {
            model: DAC_DRIVER_NAME.to_string(),
            label: format_ownership(meta.uid(), meta.gid()),
            enforcing: false,
        })
    }

    fn set_process_label(&self, mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<()> {
        let (user, group) = process_owner(mgr, def)?;
        tracing::info!(domain = %def.name, user, group, "Switching process ownership");
        switch_ids(user, group)
    }

    fn set_image_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        src: &StorageSource,
    ) -> SeclabelResult<()> {
        if src.norelabel {
            return Ok(());
        }
        match image_owner(mgr, def)? {
            Some(owner) => chown_path(&src.path, owner),
            None => Ok(()),
        }
    }

    fn restore_image_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        src: &StorageSource,
    ) -> SeclabelResult<()> {
        // Read-only images may be shared with other domains.
        if src.readonly || src.norelabel || !should_restore(mgr, def)? {
            return Ok(());
        }
        chown_path(&src.path, (0, 0))
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
        mgr: &SecurityManager,
        def: &DomainDef,
        dev: &HostdevDef,
        vroot: Option<&Path>,
    ) -> SeclabelResult<()> {
        match image_owner(mgr, def)? {
            Some(owner) => chown_path(&dev.path_in(vroot), owner),
            None => Ok(()),
        }
    }

    fn restore_hostdev_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        dev: &HostdevDef,
        vroot: Option<&Path>,
    ) -> SeclabelResult<()> {
        if !should_restore(mgr, def)? {
            return Ok(());
        }
        chown_path(&dev.path_in(vroot), (0, 0))
    }

    fn set_saved_state_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        path: &Path,
    ) -> SeclabelResult<()> {
        match image_owner(mgr, def)? {
            Some(owner) => chown_path(path, owner),
            None => Ok(()),
        }
    }

    fn restore_saved_state_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        path: &Path,
    ) -> SeclabelResult<()> {
        if !should_restore(mgr, def)? {
            return Ok(());
        }
        chown_path(path, (0, 0))
    }

    fn set_image_fd_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        fd: BorrowedFd<'_>,
    ) -> SeclabelResult<()> {
        match image_owner(mgr, def)? {
            Some(owner) => chown_fd(fd, owner),
            None => Ok(()),
        }
    }

    fn set_tap_fd_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        fd: BorrowedFd<'_>,
    ) -> SeclabelResult<()> {
        match image_owner(mgr, def)? {
            Some(owner) => chown_fd(fd, owner),
            None => Ok(()),
        }
    }

    fn get_mount_options(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
    ) -> SeclabelResult<Option<String>> {
        let (user, group) = process_owner(mgr, def)?;
        Ok(Some(format!("uid={user},gid={group}")))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::fd::AsFd;

    use seclabel_common::DomainName;

    use super::*;
    use crate::domain::SecurityLabelDef;
    use crate::security::SecurityManagerFlags;

    fn current_ids() -> (u32, u32) {
        (
            rustix::process::getuid().as_raw(),
            rustix::process::getgid().as_raw(),
        )
    }

    fn manager(dynamic: bool) -> Arc<SecurityManager> {
        let (user, group) = current_ids();
        SecurityManager::new_dac("qemu", user, group, SecurityManagerFlags::default(), dynamic)
            .unwrap()
    }

    fn guest(label: SecurityLabelDef) -> DomainDef {
        let mut def = DomainDef::new(DomainName::new("guest1").unwrap());
        def.push_seclabel(label);
        def
    }

    #[test]
    fn ownership_labels() {
        assert_eq!(parse_ownership("+107:+36").unwrap(), (107, 36));
        assert_eq!(parse_ownership("0:0").unwrap(), (0, 0));
        assert_eq!(format_ownership(107, 36), "+107:+36");
        assert!(parse_ownership("qemu:kvm").is_err());
        assert!(parse_ownership("107").is_err());
    }

    #[test]
    fn setters_update_private_state() {
        let mgr = SecurityManager::new_dac("qemu", 107, 36, SecurityManagerFlags::default(), true)
            .unwrap();
        assert_eq!(
            settings(&mgr).unwrap(),
            DacState {
                user: 107,
                group: 36,
                dynamic_ownership: true
            }
        );

        set_dynamic_ownership(&mgr, false).unwrap();
        assert!(!settings(&mgr).unwrap().dynamic_ownership);
    }

    #[test]
    fn dynamic_label_uses_configured_owner() {
        let mgr = SecurityManager::new_dac("qemu", 107, 36, SecurityManagerFlags::default(), true)
            .unwrap();
        let mut def = guest(SecurityLabelDef::new(DAC_DRIVER_NAME, LabelType::Dynamic));

        mgr.generate_label(&mut def).unwrap();

        let seclabel = def.find_seclabel(DAC_DRIVER_NAME).unwrap();
        assert_eq!(seclabel.label.as_deref(), Some("+107:+36"));
        assert_eq!(seclabel.imagelabel.as_deref(), Some("+107:+36"));
    }

    #[test]
    fn static_label_must_parse() {
        let mgr = manager(true);
        let mut def = guest(
            SecurityLabelDef::new(DAC_DRIVER_NAME, LabelType::Static).with_label("qemu:qemu"),
        );
        assert!(matches!(
            mgr.generate_label(&mut def),
            Err(SeclabelError::InvalidLabel { .. })
        ));
        assert!(mgr.verify(&def).is_err());
    }

    #[test]
    fn image_label_chowns_to_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        fs::write(&path, b"").unwrap();

        let mgr = manager(true);
        let mut def = guest(SecurityLabelDef::new(DAC_DRIVER_NAME, LabelType::Dynamic));
        mgr.generate_label(&mut def).unwrap();

        mgr.set_image_label(&def, &StorageSource::new(&path)).unwrap();

        let meta = fs::metadata(&path).unwrap();
        assert_eq!((meta.uid(), meta.gid()), current_ids());
    }

    #[test]
    fn fd_label_chowns_descriptor() {
        let file = tempfile::tempfile().unwrap();
        let mgr = manager(true);
        let def = guest(SecurityLabelDef::new(DAC_DRIVER_NAME, LabelType::Dynamic));

        mgr.set_image_fd_label(&def, file.as_fd()).unwrap();
    }

    #[test]
    fn no_dynamic_ownership_skips_missing_files() {
        let mgr = manager(false);
        let def = guest(SecurityLabelDef::new(DAC_DRIVER_NAME, LabelType::Dynamic));
        let missing = StorageSource::new("/nonexistent/seclabel/disk.img");

        mgr.set_image_label(&def, &missing).unwrap();
        mgr.restore_image_label(&def, &missing).unwrap();
    }

    #[test]
    fn norelabel_entry_skips_files() {
        let mgr = manager(true);
        let mut seclabel = SecurityLabelDef::new(DAC_DRIVER_NAME, LabelType::None);
        seclabel.norelabel = true;
        let def = guest(seclabel);

        mgr.set_image_label(&def, &StorageSource::new("/nonexistent/disk.img"))
            .unwrap();
    }

    #[test]
    fn restore_skips_readonly_images() {
        let mgr = manager(true);
        let def = guest(SecurityLabelDef::new(DAC_DRIVER_NAME, LabelType::Dynamic));
        let mut src = StorageSource::new("/nonexistent/base.iso");
        src.readonly = true;

        mgr.restore_image_label(&def, &src).unwrap();
    }

    #[test]
    fn process_label_of_self() {
        let mgr = manager(true);
        let def = guest(SecurityLabelDef::new(DAC_DRIVER_NAME, LabelType::Dynamic));
        let (user, group) = current_ids();

        let label = mgr.get_process_label(&def, std::process::id()).unwrap();
        assert_eq!(label.model, "dac");
        assert_eq!(label.label, format_ownership(user, group));
    }

    #[test]
    fn mount_options_follow_label() {
        let mgr = manager(true);
        let def = guest(SecurityLabelDef::new(DAC_DRIVER_NAME, LabelType::Static).with_label("+5:+6"));
        assert_eq!(
            mgr.get_mount_options(&def).unwrap().as_deref(),
            Some("uid=5,gid=6")
        );
    }
}
