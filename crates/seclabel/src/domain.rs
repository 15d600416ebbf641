//! Domain definition: the label-related parts of a virtual machine.
//!
//! A [`DomainDef`] carries zero or more [`SecurityLabelDef`] entries, at
//! most one per security driver model, plus the resources (disk images,
//! host devices) that drivers relabel when the domain starts.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use seclabel_common::{DomainName, SeclabelError, SeclabelResult};

/// How a driver should label a domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelType {
    /// Resolve from the manager's confinement policy.
    #[default]
    Default,
    /// The driver picks a unique label.
    Dynamic,
    /// The caller supplied the label.
    Static,
    /// No confinement.
    None,
}

impl fmt::Display for LabelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Dynamic => write!(f, "dynamic"),
            Self::Static => write!(f, "static"),
            Self::None => write!(f, "none"),
        }
    }
}

/// A per-domain, per-driver label entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityLabelDef {
    /// Driver model this entry belongs to; `None` means unspecified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Label type.
    #[serde(rename = "type", default)]
    pub label_type: LabelType,
    /// Process label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Label applied to disk images and other files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imagelabel: Option<String>,
    /// Base label a dynamic label is derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baselabel: Option<String>,
    /// Entry was synthesized by label generation rather than supplied.
    #[serde(default)]
    pub implicit: bool,
    /// Resources must not be relabelled.
    #[serde(default)]
    pub norelabel: bool,
}

impl SecurityLabelDef {
    /// Create an entry for `model` with the given type.
    #[must_use]
    pub fn new(model: impl Into<String>, label_type: LabelType) -> Self {
        Self {
            model: Some(model.into()),
            label_type,
            ..Self::default()
        }
    }

    /// Create an implicit `Default` entry for `model`.
    #[must_use]
    pub fn implicit(model: impl Into<String>) -> Self {
        Self {
            implicit: true,
            ..Self::new(model, LabelType::Default)
        }
    }

    /// Set the process label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the base label.
    #[must_use]
    pub fn with_baselabel(mut self, label: impl Into<String>) -> Self {
        self.baselabel = Some(label.into());
        self
    }

    /// Whether resources labelled under this entry should be touched.
    #[must_use]
    pub fn relabel(&self) -> bool {
        !self.norelabel && self.label_type != LabelType::None
    }
}

/// A disk image backing a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSource {
    /// Path of the image on the host.
    pub path: PathBuf,
    /// Image format (raw, qcow2, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Image is attached read-only.
    #[serde(default)]
    pub readonly: bool,
    /// Skip relabelling this image.
    #[serde(default)]
    pub norelabel: bool,
}

impl StorageSource {
    /// Create a writable image source.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: None,
            readonly: false,
            norelabel: false,
        }
    }
}

/// A host device node passed through to a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostdevDef {
    /// Device node path on the host.
    pub path: PathBuf,
}

impl HostdevDef {
    /// Path of the device as seen under `vroot`, if given.
    #[must_use]
    pub fn path_in(&self, vroot: Option<&Path>) -> PathBuf {
        match vroot {
            Some(root) => root.join(self.path.strip_prefix("/").unwrap_or(&self.path)),
            None => self.path.clone(),
        }
    }
}

/// The label of a running process, as reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityLabel {
    /// Driver model that produced the label.
    pub model: String,
    /// The label itself.
    pub label: String,
    /// Whether the label is enforced.
    pub enforcing: bool,
}

/// The label-related portion of a virtual machine definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDef {
    /// Domain name.
    pub name: DomainName,
    /// Domain UUID.
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
    /// Security label entries, at most one per model.
    #[serde(default, rename = "seclabel")]
    pub seclabels: Vec<SecurityLabelDef>,
    /// Disk images.
    #[serde(default)]
    pub disks: Vec<StorageSource>,
    /// Host devices.
    #[serde(default)]
    pub hostdevs: Vec<HostdevDef>,
}

impl DomainDef {
    /// Create an empty definition.
    #[must_use]
    pub fn new(name: DomainName) -> Self {
        Self {
            name,
            uuid: Uuid::new_v4(),
            seclabels: Vec::new(),
            disks: Vec::new(),
            hostdevs: Vec::new(),
        }
    }

    /// Find the label entry for `model`.
    #[must_use]
    pub fn find_seclabel(&self, model: &str) -> Option<&SecurityLabelDef> {
        self.seclabels
            .iter()
            .find(|l| l.model.as_deref() == Some(model))
    }

    /// Find the label entry for `model`, mutably.
    pub fn find_seclabel_mut(&mut self, model: &str) -> Option<&mut SecurityLabelDef> {
        self.seclabels
            .iter_mut()
            .find(|l| l.model.as_deref() == Some(model))
    }

    /// Append a label entry.
    pub fn push_seclabel(&mut self, seclabel: SecurityLabelDef) {
        self.seclabels.push(seclabel);
    }

    /// Remove and return the last label entry.
    pub fn pop_seclabel(&mut self) -> Option<SecurityLabelDef> {
        self.seclabels.pop()
    }

    /// Number of label entries.
    #[must_use]
    pub fn seclabel_count(&self) -> usize {
        self.seclabels.len()
    }

    /// Parse from any supported format (auto-detected by extension).
    pub fn from_file(path: &Path) -> SeclabelResult<Self> {
        let content = fs::read_to_string(path)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

        match ext.to_lowercase().as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => Self::from_json(&content),
        }
    }

    /// Parse from JSON.
    pub fn from_json(content: &str) -> SeclabelResult<Self> {
        serde_json::from_str(content).map_err(|e| SeclabelError::Config {
            message: format!("Failed to parse domain JSON: {e}"),
        })
    }

    /// Parse from YAML.
    pub fn from_yaml(content: &str) -> SeclabelResult<Self> {
        serde_yaml::from_str(content).map_err(|e| SeclabelError::Config {
            message: format!("Failed to parse domain YAML: {e}"),
        })
    }

    /// Parse from TOML.
    pub fn from_toml(content: &str) -> SeclabelResult<Self> {
        toml::from_str(content).map_err(|e| SeclabelError::Config {
            message: format!("Failed to parse domain TOML: {e}"),
        })
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> SeclabelResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
