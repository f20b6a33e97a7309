//! Error types for ESP transform operations
//!
//! This module defines a unified error type for the ESP input and output
//! pipelines, session initialisation and the transform registry.

use espx_platform::EspxError;
use std::fmt;

/// Result type for ESP operations
pub type Result<T> = std::result::Result<T, Error>;

/// ESP transform errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Security Association cannot be initialised with its parameters
    Config(String),

    /// No transform registered for the requested kind
    NoXform(String),

    /// Header offset or packet length violates 4-byte alignment
    Misaligned {
        /// Offset of the ESP header in the packet
        offset: usize,
        /// Total packet length
        len: usize,
    },

    /// Ciphertext length is zero or not a multiple of the cipher block size
    BadPayloadLength {
        /// Payload length computed from the packet
        len: usize,
        /// Cipher block size
        block_size: usize,
    },

    /// Buffer too short for operation
    BufferTooShort {
        /// Required length
        required: usize,
        /// Available length
        available: usize,
    },

    /// Packet would exceed the address family maximum after encapsulation
    MessageTooLarge {
        /// Projected packet size
        size: usize,
        /// Address family maximum
        max: usize,
    },

    /// SPI in the packet does not belong to the SA
    InvalidSpi(u32),

    /// Replay attack detected (duplicate or outside the window)
    ReplayDetected(u64),

    /// Output sequence number space exhausted on this SA
    SequenceOverflow(u32),

    /// Integrity check value mismatch
    AuthenticationFailed(String),

    /// Cryptographic operation failed
    CryptoError(String),

    /// Could not acquire a crypto job slot or buffer
    NoBufferSpace(String),

    /// Pad length or padding content is malformed
    InvalidPadding {
        /// Pad length read from the trailer
        pad_len: usize,
        /// Decrypted bytes available for padding and payload
        available: usize,
    },

    /// SA is not in a usable state
    InvalidState(String),

    /// ESP processing is administratively disabled
    Disabled,

    /// Internal error (should not happen)
    Internal(String),
}

impl Error {
    /// Whether the error must be treated as a security event
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            Error::ReplayDetected(_) | Error::AuthenticationFailed(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "SA configuration error: {}", msg),
            Error::NoXform(kind) => write!(f, "No transform registered for {}", kind),
            Error::Misaligned { offset, len } => {
                write!(
                    f,
                    "Misaligned packet: header offset {}, length {}",
                    offset, len
                )
            }
            Error::BadPayloadLength { len, block_size } => {
                write!(
                    f,
                    "Payload length {} is not a positive multiple of block size {}",
                    len, block_size
                )
            }
            Error::BufferTooShort {
                required,
                available,
            } => {
                write!(
                    f,
                    "Buffer too short: need {} bytes, have {}",
                    required, available
                )
            }
            Error::MessageTooLarge { size, max } => {
                write!(f, "Packet too large: {} bytes exceeds {}", size, max)
            }
            Error::InvalidSpi(spi) => write!(f, "Invalid SPI: 0x{:08x}", spi),
            Error::ReplayDetected(seq) => {
                write!(f, "Replay attack detected (sequence: {})", seq)
            }
            Error::SequenceOverflow(spi) => {
                write!(f, "Sequence number overflow on SA 0x{:08x}", spi)
            }
            Error::AuthenticationFailed(msg) => {
                write!(f, "Authentication failed: {}", msg)
            }
            Error::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            Error::NoBufferSpace(msg) => write!(f, "No buffer space: {}", msg),
            Error::InvalidPadding { pad_len, available } => {
                write!(
                    f,
                    "Invalid padding: pad length {} with {} bytes available",
                    pad_len, available
                )
            }
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::Disabled => write!(f, "ESP processing is disabled"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for EspxError {
    fn from(err: Error) -> Self {
        match err {
            Error::Config(_) | Error::NoXform(_) => EspxError::Config(err.to_string()),
            Error::ReplayDetected(_) | Error::AuthenticationFailed(_) => {
                EspxError::Security(err.to_string())
            }
            Error::NoBufferSpace(_) => EspxError::Resource(err.to_string()),
            _ => EspxError::Protocol(err.to_string()),
        }
    }
}
