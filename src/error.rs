//! Error handling module for the PXE auto-deploy driver
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Every fallible operation in the library returns [`ProvisionError`].

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for deploy operations
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// A required instance parameter is absent (raised before any side effect)
    #[error(
        "Cannot validate driver deploy. Some parameters were missing in node's instance_info. Missing are: {missing}"
    )]
    MissingParameterValue { missing: String },

    /// Template missing, malformed, or referencing an undefined field
    #[error("Template error: {0}")]
    Template(String),

    /// Filesystem failure tied to a specific path
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// IO errors without path context (sockets, channels)
    #[error("IO error: {0}")]
    IoBare(#[from] std::io::Error),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A hardware address could not be parsed
    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    /// Malformed progress report from the installer
    #[error("Invalid progress report: {0}")]
    InvalidReport(String),

    /// Progress report failed authentication
    #[error("Progress report rejected: bad or missing token")]
    Unauthorized,

    /// Node lock misuse or contention
    #[error("Lock error: {0}")]
    Lock(String),

    /// Power collaborator failure
    #[error("Power action failed: {0}")]
    Power(String),

    /// Boot-device collaborator failure
    #[error("Setting boot device failed: {0}")]
    BootDevice(String),

    /// Event collaborator failure
    #[error("Firing provision event failed: {0}")]
    Event(String),

    /// Bounded reachability probe gave up
    #[error("{address} still unreachable after {attempts} attempt(s)")]
    ProbeExhausted { address: String, attempts: u32 },

    /// Reachability probe was cancelled by the caller
    #[error("Reachability wait for {address} was cancelled")]
    ProbeCancelled { address: String },

    /// Deployment state machine transition errors
    #[error("Deployment transition error: {0}")]
    Transition(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for deploy operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

// Convenient error constructors
impl ProvisionError {
    /// Attach a path to an IO error
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a missing-parameter error naming the first absent key
    pub fn missing(key: impl Into<String>) -> Self {
        Self::MissingParameterValue {
            missing: key.into(),
        }
    }

    /// Create a template error
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid report error
    pub fn invalid_report(msg: impl Into<String>) -> Self {
        Self::InvalidReport(msg.into())
    }

    /// Create a lock error
    pub fn lock(msg: impl Into<String>) -> Self {
        Self::Lock(msg.into())
    }

    /// True for errors raised by validation before any side effect
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::MissingParameterValue { .. })
    }
}

impl From<minijinja::Error> for ProvisionError {
    fn from(err: minijinja::Error) -> Self {
        Self::Template(err.to_string())
    }
}
