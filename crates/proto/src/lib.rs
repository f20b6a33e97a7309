//! Protocol implementations for the espx IPsec data plane.
//!
//! This crate provides the ESP (Encapsulating Security Payload) packet
//! transform together with the pieces it is built from:
//!
//! - **ESP** - RFC 4303 encapsulation and decapsulation, old and new header formats
//! - **Anti-replay** - RFC 6479 ring-buffer window with ESN inference
//! - **Crypto engine** - asynchronous job contract plus a tokio/RustCrypto backend
//! - **Transform registry** - typed mapping from transform kind to implementation
//!
//! # Features
//!
//! - `ipsec` (default) - the ESP transform
//!
//! # Example
//!
//! ```rust
//! use espx_proto::ipsec::layout::calculate_padding;
//!
//! // 13 payload bytes + 2 trailer bytes padded to a 16-byte block
//! assert_eq!(calculate_padding(13, 16), 1);
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted RustCrypto crates
//! - Constant-time comparison for integrity check values
//! - Secure memory handling with `zeroize`
//! - Fuzz target for trailer parsing
//!
//! # References
//!
//! - [RFC 4301](https://datatracker.ietf.org/doc/html/rfc4301) - Security Architecture for IP
//! - [RFC 4303](https://datatracker.ietf.org/doc/html/rfc4303) - IP Encapsulating Security Payload

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ipsec")]
pub mod ipsec;
