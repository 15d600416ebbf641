//! # Seclabel
//!
//! Security label policy engine for virtual machine domains.
//!
//! ## Features
//!
//! - **Pluggable drivers**: SELinux, AppArmor, DAC ownership and a no-op driver
//! - **Stacking**: one domain confined by several drivers at once
//! - **Label generation**: per-driver label entries with host confinement policy
//! - **Resource labelling**: disk images, host devices, sockets, saved state
//!
//! ## Usage
//!
//! ```no_run
//! use seclabel::config::SecurityDriverConfig;
//! use seclabel::domain::DomainDef;
//! use seclabel::security::BuiltinRegistry;
//!
//! # fn example() -> seclabel_common::SeclabelResult<()> {
//! // Assemble the host manager
//! let mgr = SecurityDriverConfig::default().build_manager(&BuiltinRegistry::new())?;
//!
//! // Label a domain
//! let mut def = DomainDef::from_file("guest1.json".as_ref())?;
//! mgr.generate_labels(&mut def)?;
//! mgr.set_all_label(&def, None)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod domain;
pub mod process;
pub mod security;

pub use config::SecurityDriverConfig;
pub use domain::DomainDef;
pub use security::{SecurityDriver, SecurityManager};
