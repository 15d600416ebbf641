//! Standard filesystem paths for seclabel.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default configuration root.
pub static SECLABEL_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("SECLABEL_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/seclabel"))
});

/// Default runtime directory.
pub static SECLABEL_RUNTIME_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("SECLABEL_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/seclabel"))
});

/// Standard paths used by the security label engine.
#[derive(Debug, Clone)]
pub struct SeclabelPaths {
    /// Configuration directory (default: /etc/seclabel).
    pub root: PathBuf,
    /// Runtime directory (default: /run/seclabel).
    pub runtime: PathBuf,
}

impl SeclabelPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runtime = root.join("run");
        Self { root, runtime }
    }

    /// Paths for an unprivileged user, rooted in the user's config directory.
    #[must_use]
    pub fn for_user() -> Self {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        Self::with_root(base.join("seclabel"))
    }

    /// Main configuration file.
    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.root.join("seclabel.toml")
    }

    /// Directory holding domain definitions.
    #[must_use]
    pub fn domains(&self) -> PathBuf {
        self.root.join("domains")
    }

    /// Definition file of a single domain.
    #[must_use]
    pub fn domain(&self, name: &str) -> PathBuf {
        self.domains().join(format!("{name}.json"))
    }

    /// Directory where generated AppArmor profiles are written.
    #[must_use]
    pub fn apparmor_profiles(&self) -> PathBuf {
        self.runtime.join("apparmor")
    }
}

impl Default for SeclabelPaths {
    fn default() -> Self {
        Self {
            root: SECLABEL_ROOT.clone(),
            runtime: SECLABEL_RUNTIME_DIR.clone(),
        }
    }
}
