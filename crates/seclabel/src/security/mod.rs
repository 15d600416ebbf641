//! Security label management for virtual machine domains.
//!
//! A [`SecurityManager`] binds one [`SecurityDriver`] to a policy. The
//! `stack` driver nests several managers so that one domain is confined by
//! all of them:
//! - `selinux` for MCS-separated SELinux contexts
//! - `apparmor` for per-domain AppArmor profiles
//! - `dac` for file ownership
//! - `none` when the host has no confinement

pub mod apparmor;
pub mod dac;
mod driver;
mod generate;
mod manager;
pub mod nop;
mod registry;
pub mod selinux;
pub mod stack;

pub use apparmor::{APPARMOR_DRIVER_NAME, AppArmorProfile};
pub use dac::DAC_DRIVER_NAME;
pub use driver::{DriverState, SecurityDriver};
pub use manager::{SecurityManager, SecurityManagerFlags};
pub use nop::NOP_DRIVER_NAME;
pub use registry::{BuiltinRegistry, DriverRegistry};
pub use selinux::{SELINUX_DRIVER_NAME, SELinuxContext};
pub use stack::STACK_DRIVER_NAME;
