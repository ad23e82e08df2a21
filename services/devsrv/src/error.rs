//! Error handling for the device gateway service
//!
//! One closed sum per layer: [`TransportError`] classifies wire failures at
//! the point they are observed, and this service-level enum carries
//! everything the registry and HTTP surface need to translate failures into
//! responses. Classification never inspects message text.

use thiserror::Error;

use crate::core::transport::TransportError;

/// Device gateway service error type
#[derive(Error, Debug, Clone)]
pub enum DevSrvError {
    /// Repository has no definition for the id
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Definition exists but is disabled
    #[error("Device is disabled: {0}")]
    DeviceDisabled(String),

    /// Definition fails the addressing invariants
    #[error("Invalid device definition: {0}")]
    InvalidDefinition(String),

    /// Malformed id or request payload
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Wire-level failure, already classified
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Normal termination of an in-flight operation; never user-visible as
    /// a failure
    #[error("Operation cancelled")]
    Cancelled,

    /// Repository backend failure
    #[error("Repository error: {0}")]
    Repository(String),

    /// Active poller cap reached
    #[error("Too many active pollers (limit {0})")]
    PollerLimit(usize),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Fault not attributable to the device
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the service
pub type Result<T> = std::result::Result<T, DevSrvError>;

impl DevSrvError {
    /// Transport kind carried by this error, if any
    pub fn transport_kind(&self) -> Option<&TransportError> {
        match self {
            DevSrvError::Transport(kind) => Some(kind),
            _ => None,
        }
    }
}
