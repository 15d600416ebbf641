//! SELinux label management.
//!
//! Dynamic labels isolate domains from each other with a unique MCS
//! category pair. The pairs in use are tracked per manager so two
//! domains never share one.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;

use seclabel_common::{SeclabelError, SeclabelResult};

use super::SecurityManager;
use super::driver::{DriverState, SecurityDriver};
use crate::domain::{DomainDef, HostdevDef, LabelType, SecurityLabel, SecurityLabelDef, StorageSource};

/// Name of the SELinux driver.
pub const SELINUX_DRIVER_NAME: &str = "selinux";

/// Number of MCS categories handed out to domains.
const MCS_CATEGORIES: u16 = 1024;

static SELINUX: Lazy<Arc<dyn SecurityDriver>> = Lazy::new(|| Arc::new(SelinuxDriver));

/// The shared SELinux driver.
#[must_use]
pub fn driver() -> Arc<dyn SecurityDriver> {
    Arc::clone(&SELINUX)
}

/// SELinux security context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SELinuxContext {
    /// User component.
    pub user: String,
    /// Role component.
    pub role: String,
    /// Type component.
    pub type_: String,
    /// Level component (optional).
    pub level: Option<String>,
}

impl SELinuxContext {
    /// Create a new SELinux context.
    pub fn new(user: &str, role: &str, type_: &str, level: Option<&str>) -> Self {
        Self {
            user: user.to_string(),
            role: role.to_string(),
            type_: type_.to_string(),
            level: level.map(String::from),
        }
    }

    /// Parse a context string.
    pub fn parse(context: &str) -> SeclabelResult<Self> {
        let mut parts = context.splitn(4, ':');

        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(user), Some(role), Some(type_), level)
                if !user.is_empty() && !role.is_empty() && !type_.is_empty() =>
            {
                Ok(Self::new(user, role, type_, level))
            }
            _ => Err(SeclabelError::InvalidLabel {
                model: SELINUX_DRIVER_NAME.to_string(),
                label: context.to_string(),
            }),
        }
    }

    /// Same context with another level.
    #[must_use]
    pub fn with_level(mut self, level: Option<&str>) -> Self {
        self.level = level.map(String::from);
        self
    }

    /// Default context for domain processes.
    pub fn domain_default() -> Self {
        Self::new("system_u", "system_r", "svirt_t", Some("s0"))
    }

    /// Default context for writable domain images.
    pub fn image_default() -> Self {
        Self::new("system_u", "object_r", "svirt_image_t", Some("s0"))
    }

    /// Context for images shared read-only between domains.
    pub fn readonly_image() -> Self {
        Self::new("system_u", "object_r", "virt_content_t", Some("s0"))
    }

    /// Context images are given back when a domain stops.
    pub fn image_restore() -> Self {
        Self::new("system_u", "object_r", "virt_image_t", Some("s0"))
    }

    /// Context device nodes are given back when a domain stops.
    pub fn device_restore() -> Self {
        Self::new("system_u", "object_r", "device_t", Some("s0"))
    }

    /// Check if SELinux is enabled.
    #[cfg(target_os = "linux")]
    pub fn is_enabled() -> bool {
        Path::new("/sys/fs/selinux").exists()
    }

    #[cfg(not(target_os = "linux"))]
    pub fn is_enabled() -> bool {
        false
    }

    /// Get current SELinux enforcement mode.
    #[cfg(target_os = "linux")]
    pub fn enforcement_mode() -> Option<String> {
        fs::read_to_string("/sys/fs/selinux/enforce").ok().map(|s| {
            if s.trim() == "1" {
                "enforcing".to_string()
            } else {
                "permissive".to_string()
            }
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn enforcement_mode() -> Option<String> {
        None
    }

    /// Apply the context to the next program the current process executes.
    #[cfg(target_os = "linux")]
    pub fn apply(&self) -> SeclabelResult<()> {
        write_proc_attr("exec", &self.to_string())?;
        tracing::info!(context = %self, "SELinux context applied");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn apply(&self) -> SeclabelResult<()> {
        Err(SeclabelError::Unsupported {
            feature: "SELinux".to_string(),
        })
    }

    /// Set file context.
    #[cfg(target_os = "linux")]
    pub fn set_file_context(path: &Path, context: &str) -> SeclabelResult<()> {
        use std::process::Command;

        if !Self::is_enabled() {
            return Ok(());
        }

        tracing::debug!(path = %path.display(), context, "Setting SELinux file context");

        let output = Command::new("chcon")
            .arg(context)
            .arg(path)
            .output()
            .map_err(|e| SeclabelError::driver(SELINUX_DRIVER_NAME, format!("Failed to run chcon: {e}")))?;

        if !output.status.success() {
            return Err(SeclabelError::driver(
                SELINUX_DRIVER_NAME,
                format!("chcon failed: {}", String::from_utf8_lossy(&output.stderr)),
            ));
        }

        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn set_file_context(_path: &Path, _context: &str) -> SeclabelResult<()> {
        Err(SeclabelError::Unsupported {
            feature: "SELinux".to_string(),
        })
    }

    /// Set the context of an open file.
    #[cfg(target_os = "linux")]
    pub fn set_fd_context(fd: BorrowedFd<'_>, context: &str) -> SeclabelResult<()> {
        if !Self::is_enabled() {
            return Ok(());
        }

        rustix::fs::fsetxattr(
            fd,
            "security.selinux",
            context.as_bytes(),
            rustix::fs::XattrFlags::empty(),
        )
        .map_err(|e| SeclabelError::Io(e.into()))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn set_fd_context(_fd: BorrowedFd<'_>, _context: &str) -> SeclabelResult<()> {
        Err(SeclabelError::Unsupported {
            feature: "SELinux".to_string(),
        })
    }
}

impl fmt::Display for SELinuxContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.level {
            Some(level) => write!(f, "{}:{}:{}:{}", self.user, self.role, self.type_, level),
            None => write!(f, "{}:{}:{}", self.user, self.role, self.type_),
        }
    }
}

/// Write one of the current process's `/proc/self/attr` entries.
#[cfg(target_os = "linux")]
fn write_proc_attr(attr: &str, value: &str) -> SeclabelResult<()> {
    if !SELinuxContext::is_enabled() {
        tracing::warn!(attr, "SELinux not enabled, skipping context apply");
        return Ok(());
    }

    fs::write(format!("/proc/self/attr/{attr}"), value).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            SeclabelError::PermissionDenied {
                operation: format!("set SELinux {attr} context"),
            }
        } else {
            SeclabelError::driver(
                SELINUX_DRIVER_NAME,
                format!("Failed to set SELinux {attr} context: {e}"),
            )
        }
    })
}

#[cfg(not(target_os = "linux"))]
fn write_proc_attr(_attr: &str, _value: &str) -> SeclabelResult<()> {
    Err(SeclabelError::Unsupported {
        feature: "SELinux".to_string(),
    })
}

/// MCS levels held by the domains of one manager.
#[derive(Debug, Default)]
pub struct SelinuxState {
    mcs: BTreeSet<String>,
}

impl SelinuxState {
    /// Levels currently in use.
    pub fn levels(&self) -> impl Iterator<Item = &str> {
        self.mcs.iter().map(String::as_str)
    }
}

fn with_state<T>(
    mgr: &SecurityManager,
    f: impl FnOnce(&mut SelinuxState) -> SeclabelResult<T>,
) -> SeclabelResult<T> {
    match &mut *mgr.state() {
        DriverState::Selinux(state) => f(state),
        _ => Err(SeclabelError::Internal {
            message: format!("manager '{}' is not an SELinux manager", mgr.driver_name()),
        }),
    }
}

/// Reserve the first free category pair and return its level.
fn reserve_next_level(mgr: &SecurityManager) -> SeclabelResult<String> {
    with_state(mgr, |state| {
        for hi in 1..MCS_CATEGORIES {
            for lo in 0..hi {
                let level = format!("s0:c{lo},c{hi}");
                if state.mcs.insert(level.clone()) {
                    return Ok(level);
                }
            }
        }
        Err(SeclabelError::driver(
            SELINUX_DRIVER_NAME,
            "no free MCS category pair left",
        ))
    })
}

fn reserve_level(mgr: &SecurityManager, level: &str) -> SeclabelResult<()> {
    with_state(mgr, |state| {
        if state.mcs.insert(level.to_string()) {
            Ok(())
        } else {
            Err(SeclabelError::driver(
                SELINUX_DRIVER_NAME,
                format!("MCS level {level} is already reserved"),
            ))
        }
    })
}

fn release_level(mgr: &SecurityManager, level: &str) -> SeclabelResult<()> {
    with_state(mgr, |state| {
        state.mcs.remove(level);
        Ok(())
    })
}

/// Mark the MCS level held by an already labelled domain as in use.
///
/// Lets a fresh manager avoid levels handed out by an earlier process.
pub fn reserve_domain_level(mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<()> {
    let Some(label) = seclabel_of(def)
        .filter(|l| l.label_type == LabelType::Dynamic)
        .and_then(|l| l.label.as_deref())
    else {
        return Ok(());
    };

    match SELinuxContext::parse(label)?.level {
        Some(level) => reserve_level(mgr, &level),
        None => Ok(()),
    }
}

fn seclabel_of(def: &DomainDef) -> Option<&SecurityLabelDef> {
    def.find_seclabel(SELINUX_DRIVER_NAME)
}

/// Image label to apply, or `None` to leave the resource alone.
fn relabel_target(def: &DomainDef) -> Option<&str> {
    seclabel_of(def)
        .filter(|l| l.relabel())
        .and_then(|l| l.imagelabel.as_deref())
}

fn read_process_context(pid: u32) -> SeclabelResult<String> {
    let raw = fs::read_to_string(format!("/proc/{pid}/attr/current"))?;
    Ok(raw.trim_end_matches(['\0', '\n']).to_string())
}

/// Driver that labels through SELinux contexts.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelinuxDriver;

impl SecurityDriver for SelinuxDriver {
    fn name(&self) -> &'static str {
        SELINUX_DRIVER_NAME
    }

    fn probe(&self, _virt_driver: &str) -> bool {
        SELinuxContext::is_enabled()
    }

    fn private_data(&self) -> DriverState {
        DriverState::Selinux(SelinuxState::default())
    }

    fn get_model(&self, _mgr: &SecurityManager) -> SeclabelResult<String> {
        Ok(SELINUX_DRIVER_NAME.to_string())
    }

    fn get_doi(&self, _mgr: &SecurityManager) -> SeclabelResult<String> {
        Ok("0".to_string())
    }

    fn generate_label(&self, mgr: &SecurityManager, def: &mut DomainDef) -> SeclabelResult<()> {
        let Some(seclabel) = def.find_seclabel_mut(SELINUX_DRIVER_NAME) else {
            return Ok(());
        };

        match seclabel.label_type {
            LabelType::Static => {
                let label = seclabel.label.as_deref().ok_or_else(|| {
                    SeclabelError::config_unsupported("Missing label for static SELinux security label")
                })?;
                let context = SELinuxContext::parse(label)?;
                if seclabel.imagelabel.is_none() {
                    let image = SELinuxContext::image_default().with_level(context.level.as_deref());
                    seclabel.imagelabel = Some(image.to_string());
                }
            }
            LabelType::Dynamic => {
                if seclabel.label.is_some() {
                    return Err(SeclabelError::driver(
                        SELINUX_DRIVER_NAME,
                        "security label already defined for domain",
                    ));
                }

                let base = match seclabel.baselabel.as_deref() {
                    Some(base) => SELinuxContext::parse(base)?,
                    None => SELinuxContext::domain_default(),
                };
                let level = reserve_next_level(mgr)?;

                seclabel.label = Some(base.with_level(Some(&level)).to_string());
                seclabel.imagelabel = Some(
                    SELinuxContext::image_default()
                        .with_level(Some(&level))
                        .to_string(),
                );
            }
            LabelType::None => return Ok(()),
            LabelType::Default => {
                return Err(SeclabelError::driver(
                    SELINUX_DRIVER_NAME,
                    "label type must be resolved before generation",
                ));
            }
        }

        Ok(())
    }

    fn reserve_label(&self, mgr: &SecurityManager, def: &DomainDef, pid: u32) -> SeclabelResult<()> {
        if seclabel_of(def).is_none_or(|l| l.label_type != LabelType::Dynamic) {
            return Ok(());
        }

        let context = SELinuxContext::parse(&read_process_context(pid)?)?;
        match context.level.as_deref() {
            Some(level) => reserve_level(mgr, level),
            None => Ok(()),
        }
    }

    fn release_label(&self, mgr: &SecurityManager, def: &mut DomainDef) -> SeclabelResult<()> {
        let Some(seclabel) = def.find_seclabel_mut(SELINUX_DRIVER_NAME) else {
            return Ok(());
        };
        if seclabel.label_type != LabelType::Dynamic {
            return Ok(());
        }

        if let Some(label) = seclabel.label.take() {
            if let Some(level) = SELinuxContext::parse(&label)?.level {
                release_level(mgr, &level)?;
            }
        }
        seclabel.imagelabel = None;

        Ok(())
    }

    fn verify(&self, _mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<()> {
        let Some(seclabel) = seclabel_of(def) else {
            return Ok(());
        };

        if seclabel.label_type == LabelType::Static && seclabel.label.is_none() {
            return Err(SeclabelError::config_unsupported(
                "Missing label for static SELinux security label",
            ));
        }

        for label in [&seclabel.label, &seclabel.imagelabel, &seclabel.baselabel]
            .into_iter()
            .flatten()
        {
            SELinuxContext::parse(label)?;
        }

        Ok(())
    }

    fn get_process_label(
        &self,
        _mgr: &SecurityManager,
        _def: &DomainDef,
        pid: u32,
    ) -> SeclabelResult<SecurityLabel> {
        Ok(SecurityLabel {
            model: SELINUX_DRIVER_NAME.to_string(),
            label: read_process_context(pid)?,
            enforcing: SELinuxContext::enforcement_mode().as_deref() == Some("enforcing"),
        })
    }

    fn set_process_label(&self, _mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<()> {
        match seclabel_of(def) {
            Some(seclabel) if seclabel.label_type != LabelType::None => {
                let label = seclabel.label.as_deref().ok_or_else(|| {
                    SeclabelError::driver(SELINUX_DRIVER_NAME, "domain has no generated label")
                })?;
                SELinuxContext::parse(label)?.apply()
            }
            _ => Ok(()),
        }
    }

    fn set_image_label(
        &self,
        _mgr: &SecurityManager,
        def: &DomainDef,
        src: &StorageSource,
    ) -> SeclabelResult<()> {
        if src.norelabel {
            return Ok(());
        }
        let Some(imagelabel) = relabel_target(def) else {
            return Ok(());
        };

        if src.readonly {
            SELinuxContext::set_file_context(&src.path, &SELinuxContext::readonly_image().to_string())
        } else {
            SELinuxContext::set_file_context(&src.path, imagelabel)
        }
    }

    fn restore_image_label(
        &self,
        _mgr: &SecurityManager,
        def: &DomainDef,
        src: &StorageSource,
    ) -> SeclabelResult<()> {
        if src.readonly || src.norelabel || relabel_target(def).is_none() {
            return Ok(());
        }
        SELinuxContext::set_file_context(&src.path, &SELinuxContext::image_restore().to_string())
    }

    fn set_socket_label(&self, _mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<()> {
        match seclabel_of(def).filter(|l| l.label_type != LabelType::None) {
            Some(seclabel) => match seclabel.label.as_deref() {
                Some(label) => write_proc_attr("sockcreate", label),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn clear_socket_label(&self, _mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<()> {
        match seclabel_of(def).filter(|l| l.label_type != LabelType::None) {
            Some(_) => write_proc_attr("sockcreate", ""),
            None => Ok(()),
        }
    }

    fn set_daemon_socket_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
    ) -> SeclabelResult<()> {
        self.set_socket_label(mgr, def)
    }

    fn set_hostdev_label(
        &self,
        _mgr: &SecurityManager,
        def: &DomainDef,
        dev: &HostdevDef,
        vroot: Option<&Path>,
    ) -> SeclabelResult<()> {
        match relabel_target(def) {
            Some(imagelabel) => SELinuxContext::set_file_context(&dev.path_in(vroot), imagelabel),
            None => Ok(()),
        }
    }

    fn restore_hostdev_label(
        &self,
        _mgr: &SecurityManager,
        def: &DomainDef,
        dev: &HostdevDef,
        vroot: Option<&Path>,
    ) -> SeclabelResult<()> {
        if relabel_target(def).is_none() {
            return Ok(());
        }
        SELinuxContext::set_file_context(
            &dev.path_in(vroot),
            &SELinuxContext::device_restore().to_string(),
        )
    }

    fn set_saved_state_label(
        &self,
        _mgr: &SecurityManager,
        def: &DomainDef,
        path: &Path,
    ) -> SeclabelResult<()> {
        match relabel_target(def) {
            Some(imagelabel) => SELinuxContext::set_file_context(path, imagelabel),
            None => Ok(()),
        }
    }

    fn restore_saved_state_label(
        &self,
        _mgr: &SecurityManager,
        def: &DomainDef,
        path: &Path,
    ) -> SeclabelResult<()> {
        if relabel_target(def).is_none() {
            return Ok(());
        }
        SELinuxContext::set_file_context(path, &SELinuxContext::image_restore().to_string())
    }

    fn set_image_fd_label(
        &self,
        _mgr: &SecurityManager,
        def: &DomainDef,
        fd: BorrowedFd<'_>,
    ) -> SeclabelResult<()> {
        match relabel_target(def) {
            Some(imagelabel) => SELinuxContext::set_fd_context(fd, imagelabel),
            None => Ok(()),
        }
    }

    fn set_tap_fd_label(
        &self,
        _mgr: &SecurityManager,
        def: &DomainDef,
        fd: BorrowedFd<'_>,
    ) -> SeclabelResult<()> {
        match seclabel_of(def).filter(|l| l.label_type != LabelType::None) {
            Some(seclabel) => match seclabel.label.as_deref() {
                Some(label) => SELinuxContext::set_fd_context(fd, label),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn get_mount_options(
        &self,
        _mgr: &SecurityManager,
        def: &DomainDef,
    ) -> SeclabelResult<Option<String>> {
        Ok(seclabel_of(def)
            .filter(|l| l.label_type != LabelType::None)
            .and_then(|l| l.imagelabel.as_deref())
            .map(|imagelabel| format!("context=\"{imagelabel}\"")))
    }
}
