//! AppArmor profile management.
//!
//! Dynamic labels are per-domain profiles named after the domain UUID.
//! Labelling a resource grants the domain's profile access to its path;
//! the profile is rendered and loaded when the process label is set.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use uuid::Uuid;

use seclabel_common::{SeclabelError, SeclabelPaths, SeclabelResult};

use super::SecurityManager;
use super::driver::{DriverState, SecurityDriver};
use crate::domain::{DomainDef, HostdevDef, LabelType, SecurityLabel, SecurityLabelDef, StorageSource};

/// Name of the AppArmor driver.
pub const APPARMOR_DRIVER_NAME: &str = "apparmor";

/// Prefix of generated profile names.
pub const PROFILE_PREFIX: &str = "seclabel-";

static APPARMOR: Lazy<Arc<dyn SecurityDriver>> = Lazy::new(|| Arc::new(AppArmorDriver));

/// The shared AppArmor driver.
#[must_use]
pub fn driver() -> Arc<dyn SecurityDriver> {
    Arc::clone(&APPARMOR)
}

/// AppArmor profile for domains.
#[derive(Debug, Clone)]
pub struct AppArmorProfile {
    /// Profile name.
    pub name: String,
    /// Profile content (if custom).
    pub content: Option<String>,
}

impl AppArmorProfile {
    /// Create a new AppArmor profile reference.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            content: None,
        }
    }

    /// Create a custom profile with content.
    pub fn custom(name: &str, content: &str) -> Self {
        Self {
            name: name.to_string(),
            content: Some(content.to_string()),
        }
    }

    /// Unconfined profile (no restrictions).
    pub fn unconfined() -> Self {
        Self::new("unconfined")
    }

    /// Check if AppArmor is enabled on the system.
    #[cfg(target_os = "linux")]
    pub fn is_enabled() -> bool {
        Path::new("/sys/module/apparmor").exists()
            && Path::new("/sys/kernel/security/apparmor").exists()
    }

    #[cfg(not(target_os = "linux"))]
    pub fn is_enabled() -> bool {
        false
    }

    /// Write a custom profile into `dir` and load it.
    #[cfg(target_os = "linux")]
    pub fn load(&self, dir: &Path) -> SeclabelResult<()> {
        if !Self::is_enabled() {
            tracing::warn!("AppArmor not enabled, skipping profile load");
            return Ok(());
        }

        if let Some(content) = &self.content {
            fs::create_dir_all(dir)?;
            let path = dir.join(&self.name);
            fs::write(&path, content)?;

            let output = std::process::Command::new("apparmor_parser")
                .arg("-r")
                .arg("-W")
                .arg(&path)
                .output()
                .map_err(|e| {
                    SeclabelError::driver(
                        APPARMOR_DRIVER_NAME,
                        format!("Failed to run apparmor_parser: {e}"),
                    )
                })?;

            if !output.status.success() {
                return Err(SeclabelError::driver(
                    APPARMOR_DRIVER_NAME,
                    format!(
                        "Failed to load AppArmor profile: {}",
                        String::from_utf8_lossy(&output.stderr)
                    ),
                ));
            }

            tracing::info!(name = %self.name, "AppArmor profile loaded");
        }

        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn load(&self, _dir: &Path) -> SeclabelResult<()> {
        Err(SeclabelError::Unsupported {
            feature: "AppArmor".to_string(),
        })
    }

    /// Switch the next program the current process executes to this profile.
    #[cfg(target_os = "linux")]
    pub fn apply(&self) -> SeclabelResult<()> {
        if !Self::is_enabled() {
            tracing::warn!("AppArmor not enabled, skipping profile apply");
            return Ok(());
        }

        if self.name == "unconfined" {
            tracing::debug!("Skipping unconfined AppArmor profile");
            return Ok(());
        }

        let exec_path = if Path::new("/proc/self/attr/apparmor/exec").exists() {
            "/proc/self/attr/apparmor/exec"
        } else {
            "/proc/self/attr/exec"
        };

        fs::write(exec_path, format!("exec {}", self.name)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                SeclabelError::PermissionDenied {
                    operation: "apply AppArmor profile".to_string(),
                }
            } else {
                SeclabelError::driver(
                    APPARMOR_DRIVER_NAME,
                    format!("Failed to apply AppArmor profile: {e}"),
                )
            }
        })?;

        tracing::info!(name = %self.name, "AppArmor profile applied");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn apply(&self) -> SeclabelResult<()> {
        Err(SeclabelError::Unsupported {
            feature: "AppArmor".to_string(),
        })
    }
}

/// Access a profile rule grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read only.
    Read,
    /// Read, write and lock.
    ReadWrite,
}

impl Access {
    const fn as_rule(self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::ReadWrite => "rwk",
        }
    }
}

/// File rules of every domain profile managed by one manager.
#[derive(Debug)]
pub struct AppArmorState {
    profile_dir: PathBuf,
    rules: HashMap<Uuid, BTreeMap<PathBuf, Access>>,
}

impl Default for AppArmorState {
    fn default() -> Self {
        Self {
            profile_dir: SeclabelPaths::new().apparmor_profiles(),
            rules: HashMap::new(),
        }
    }
}

fn with_state<T>(
    mgr: &SecurityManager,
    f: impl FnOnce(&mut AppArmorState) -> SeclabelResult<T>,
) -> SeclabelResult<T> {
    match &mut *mgr.state() {
        DriverState::AppArmor(state) => f(state),
        _ => Err(SeclabelError::Internal {
            message: format!("manager '{}' is not an AppArmor manager", mgr.driver_name()),
        }),
    }
}

/// Render the profile of a dynamically labelled domain.
pub fn render_profile(mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<String> {
    let name = seclabel_of(def)
        .and_then(|l| l.label.as_deref())
        .ok_or_else(|| SeclabelError::driver(APPARMOR_DRIVER_NAME, "domain has no profile name"))?;

    with_state(mgr, |state| {
        let mut profile = String::new();
        let _ = writeln!(profile, "#include <tunables/global>");
        let _ = writeln!(profile, "profile {name} flags=(attach_disconnected) {{");
        let _ = writeln!(profile, "  #include <abstractions/base>");
        if let Some(rules) = state.rules.get(&def.uuid) {
            for (path, access) in rules {
                let _ = writeln!(profile, "  \"{}\" {},", path.display(), access.as_rule());
            }
        }
        let _ = writeln!(profile, "}}");
        Ok(profile)
    })
}

fn seclabel_of(def: &DomainDef) -> Option<&SecurityLabelDef> {
    def.find_seclabel(APPARMOR_DRIVER_NAME)
}

fn grant(mgr: &SecurityManager, def: &DomainDef, path: PathBuf, access: Access) -> SeclabelResult<()> {
    if !seclabel_of(def).is_some_and(SecurityLabelDef::relabel) {
        return Ok(());
    }
    tracing::debug!(domain = %def.name, path = %path.display(), ?access, "Granting AppArmor access");
    with_state(mgr, |state| {
        state.rules.entry(def.uuid).or_default().insert(path, access);
        Ok(())
    })
}

fn revoke(mgr: &SecurityManager, def: &DomainDef, path: &Path) -> SeclabelResult<()> {
    with_state(mgr, |state| {
        if let Some(rules) = state.rules.get_mut(&def.uuid) {
            rules.remove(path);
        }
        Ok(())
    })
}

fn fd_path(fd: BorrowedFd<'_>) -> SeclabelResult<PathBuf> {
    Ok(fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd()))?)
}

fn valid_profile_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(|c| c.is_whitespace() || c == '"')
}

/// Driver that confines domains with AppArmor profiles.
#[derive(Debug, Default, Clone, Copy)]
pub struct AppArmorDriver;

impl SecurityDriver for AppArmorDriver {
    fn name(&self) -> &'static str {
        APPARMOR_DRIVER_NAME
    }

    fn probe(&self, _virt_driver: &str) -> bool {
        AppArmorProfile::is_enabled()
    }

    fn private_data(&self) -> DriverState {
        DriverState::AppArmor(AppArmorState::default())
    }

    fn get_model(&self, _mgr: &SecurityManager) -> SeclabelResult<String> {
        Ok(APPARMOR_DRIVER_NAME.to_string())
    }

    fn get_doi(&self, _mgr: &SecurityManager) -> SeclabelResult<String> {
        Ok("0".to_string())
    }

    fn generate_label(&self, _mgr: &SecurityManager, def: &mut DomainDef) -> SeclabelResult<()> {
        let uuid = def.uuid;
        let Some(seclabel) = def.find_seclabel_mut(APPARMOR_DRIVER_NAME) else {
            return Ok(());
        };

        if seclabel.baselabel.is_some() {
            return Err(SeclabelError::config_unsupported(
                "Cannot set a base label with AppArmor",
            ));
        }

        match seclabel.label_type {
            LabelType::Static => {
                let label = seclabel.label.as_deref().unwrap_or_default();
                if !valid_profile_name(label) {
                    return Err(SeclabelError::InvalidLabel {
                        model: APPARMOR_DRIVER_NAME.to_string(),
                        label: label.to_string(),
                    });
                }
            }
            LabelType::Dynamic => {
                if seclabel.label.is_some() {
                    return Err(SeclabelError::driver(
                        APPARMOR_DRIVER_NAME,
                        "security label already defined for domain",
                    ));
                }
                seclabel.label = Some(format!("{PROFILE_PREFIX}{uuid}"));
            }
            LabelType::None => return Ok(()),
            LabelType::Default => {
                return Err(SeclabelError::driver(
                    APPARMOR_DRIVER_NAME,
                    "label type must be resolved before generation",
                ));
            }
        }

        seclabel.imagelabel.clone_from(&seclabel.label);
        Ok(())
    }

    fn reserve_label(&self, _mgr: &SecurityManager, _def: &DomainDef, _pid: u32) -> SeclabelResult<()> {
        Ok(())
    }

    fn release_label(&self, mgr: &SecurityManager, def: &mut DomainDef) -> SeclabelResult<()> {
        let uuid = def.uuid;
        with_state(mgr, |state| {
            state.rules.remove(&uuid);
            Ok(())
        })?;

        if let Some(seclabel) = def.find_seclabel_mut(APPARMOR_DRIVER_NAME) {
            if seclabel.label_type == LabelType::Dynamic {
                seclabel.label = None;
                seclabel.imagelabel = None;
            }
        }
        Ok(())
    }

    fn verify(&self, _mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<()> {
        match seclabel_of(def) {
            Some(seclabel) if seclabel.label_type == LabelType::Static => {
                let label = seclabel.label.as_deref().unwrap_or_default();
                if valid_profile_name(label) {
                    Ok(())
                } else {
                    Err(SeclabelError::InvalidLabel {
                        model: APPARMOR_DRIVER_NAME.to_string(),
                        label: label.to_string(),
                    })
                }
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
        let raw = fs::read_to_string(format!("/proc/{pid}/attr/current"))?;
        let raw = raw.trim_end_matches(['\0', '\n']);
        let (label, mode) = raw.split_once(" (").unwrap_or((raw, ""));

        Ok(SecurityLabel {
            model: APPARMOR_DRIVER_NAME.to_string(),
            label: label.to_string(),
            enforcing: mode.starts_with("enforce"),
        })
    }

    fn set_process_label(&self, mgr: &SecurityManager, def: &DomainDef) -> SeclabelResult<()> {
        let Some(seclabel) = seclabel_of(def) else {
            return Ok(());
        };
        let name = match (seclabel.label_type, seclabel.label.as_deref()) {
            (LabelType::None, _) => return Ok(()),
            (_, Some(name)) => name,
            (_, None) => {
                return Err(SeclabelError::driver(
                    APPARMOR_DRIVER_NAME,
                    "domain has no profile name",
                ));
            }
        };

        let profile = if seclabel.label_type == LabelType::Dynamic {
            let dir = with_state(mgr, |state| Ok(state.profile_dir.clone()))?;
            let profile = AppArmorProfile::custom(name, &render_profile(mgr, def)?);
            profile.load(&dir)?;
            profile
        } else {
            AppArmorProfile::new(name)
        };

        profile.apply()
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
        let access = if src.readonly {
            Access::Read
        } else {
            Access::ReadWrite
        };
        grant(mgr, def, src.path.clone(), access)
    }

    fn restore_image_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        src: &StorageSource,
    ) -> SeclabelResult<()> {
        revoke(mgr, def, &src.path)
    }

    // Sockets inherit the confinement of the process profile.
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
        grant(mgr, def, dev.path_in(vroot), Access::ReadWrite)
    }

    fn restore_hostdev_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        dev: &HostdevDef,
        vroot: Option<&Path>,
    ) -> SeclabelResult<()> {
        revoke(mgr, def, &dev.path_in(vroot))
    }

    fn set_saved_state_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        path: &Path,
    ) -> SeclabelResult<()> {
        grant(mgr, def, path.to_path_buf(), Access::ReadWrite)
    }

    fn restore_saved_state_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        path: &Path,
    ) -> SeclabelResult<()> {
        revoke(mgr, def, path)
    }

    fn set_image_fd_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        fd: BorrowedFd<'_>,
    ) -> SeclabelResult<()> {
        grant(mgr, def, fd_path(fd)?, Access::ReadWrite)
    }

    fn set_tap_fd_label(
        &self,
        mgr: &SecurityManager,
        def: &DomainDef,
        fd: BorrowedFd<'_>,
    ) -> SeclabelResult<()> {
        grant(mgr, def, fd_path(fd)?, Access::ReadWrite)
    }

    fn get_mount_options(
        &self,
        _mgr: &SecurityManager,
        _def: &DomainDef,
    ) -> SeclabelResult<Option<String>> {
        Ok(None)
    }
}
