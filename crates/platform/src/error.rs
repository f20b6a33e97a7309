//! Error types for espx

use std::fmt;

/// Unified error type for module-level espx operations
#[derive(Debug)]
pub enum EspxError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error
    Protocol(String),

    /// Security error (authentication, replay, integrity)
    Security(String),

    /// Resource exhaustion (buffers, in-flight jobs)
    Resource(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for EspxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EspxError::Io(e) => write!(f, "IO error: {}", e),
            EspxError::Config(msg) => write!(f, "Configuration error: {}", msg),
            EspxError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            EspxError::Security(msg) => write!(f, "Security error: {}", msg),
            EspxError::Resource(msg) => write!(f, "Resource exhausted: {}", msg),
            EspxError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for EspxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EspxError::Io(e) => Some(e),
            EspxError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EspxError {
    fn from(err: std::io::Error) -> Self {
        EspxError::Io(err)
    }
}

/// Result type for espx module operations
pub type EspxResult<T> = Result<T, EspxError>;
