//! # seclabel-common
//!
//! Shared utilities and types for the seclabel security label engine.
//!
//! This crate provides common functionality used across all seclabel crates:
//! - Domain name validation
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{SeclabelError, SeclabelResult};
pub use id::DomainName;
pub use paths::SeclabelPaths;
