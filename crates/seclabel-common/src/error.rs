//! Common error types for the seclabel engine.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`SeclabelError`].
pub type SeclabelResult<T> = Result<T, SeclabelError>;

/// Errors raised by security managers, drivers and their collaborators.
#[derive(Error, Diagnostic, Debug)]
pub enum SeclabelError {
    /// A driver's open hook failed while constructing a manager.
    #[error("Failed to open security driver '{driver}'")]
    #[diagnostic(code(seclabel::driver::open_failed))]
    OpenFailed {
        /// The driver that failed to initialize.
        driver: String,
        /// Why the driver refused to open.
        #[source]
        source: Box<SeclabelError>,
    },

    /// The driver does not implement the requested capability.
    #[error("Operation '{operation}' is not supported by security driver '{driver}'")]
    #[diagnostic(code(seclabel::driver::not_supported))]
    NotSupported {
        /// The driver that lacks the capability.
        driver: String,
        /// The missing operation.
        operation: String,
    },

    /// The requested policy cannot be honoured on this host.
    #[error("Unsupported configuration: {message}")]
    #[diagnostic(
        code(seclabel::config_unsupported),
        help("Check the configured security drivers and the domain's <seclabel> entries")
    )]
    ConfigUnsupported {
        /// The error message.
        message: String,
    },

    /// Configuration or definition could not be parsed.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(seclabel::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// A driver rejected a label value.
    #[error("Invalid {model} security label: {label}")]
    #[diagnostic(code(seclabel::label::invalid))]
    InvalidLabel {
        /// Model of the driver that rejected the label.
        model: String,
        /// The offending label.
        label: String,
    },

    /// Driver specific failure.
    #[error("Security driver '{driver}' failed: {message}")]
    #[diagnostic(code(seclabel::driver::failed))]
    Driver {
        /// The failing driver.
        driver: String,
        /// The error message.
        message: String,
    },

    /// Invalid domain name format.
    #[error("Invalid domain name: {name}")]
    #[diagnostic(
        code(seclabel::domain::invalid_name),
        help("Domain names must be alphanumeric with '.', '-' and '_', 1-64 characters")
    )]
    InvalidDomainName {
        /// The invalid name.
        name: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(seclabel::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(seclabel::serialization))]
    Serialization(String),

    /// Permission denied.
    #[error("Permission denied: {operation}")]
    #[diagnostic(
        code(seclabel::permission_denied),
        help("Try running with elevated privileges (sudo)")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(seclabel::unsupported), help("This feature requires Linux"))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(seclabel::internal),
        help("This is a bug, please report it at https://github.com/fishmindlabs360/seclabel/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl SeclabelError {
    /// Shorthand for [`SeclabelError::NotSupported`].
    pub fn not_supported(driver: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::NotSupported {
            driver: driver.into(),
            operation: operation.into(),
        }
    }

    /// Shorthand for [`SeclabelError::ConfigUnsupported`].
    pub fn config_unsupported(message: impl Into<String>) -> Self {
        Self::ConfigUnsupported {
            message: message.into(),
        }
    }

    /// Shorthand for [`SeclabelError::Driver`].
    pub fn driver(driver: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Driver {
            driver: driver.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for SeclabelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
