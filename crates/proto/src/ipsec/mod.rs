//! IPsec ESP packet transform
//!
//! This module implements the data-plane half of IPsec: the ESP transform
//! that encrypts and authenticates outbound packets and decrypts, verifies
//! and replay-checks inbound ones on behalf of an established Security
//! Association. Key exchange, SA management and policy lookup live
//! elsewhere; this module is handed an SA and a packet.
//!
//! # Architecture
//!
//! ```text
//! Outer IP pipeline
//!   │  XformRequest (SA, packet, skip, protoff, domain)
//!   ▼
//! XformRegistry ──► EspXform
//!                     ├── layout   header / IV / padding / ICV sizes
//!                     ├── replay   two-phase anti-replay window
//!                     ├── nonce    salt | explicit IV | block counter
//!                     └── job      CryptoJob descriptor
//!                           │ dispatch (never blocks)
//!                           ▼
//!                     CryptoEngine (SoftwareEngine on the tokio blocking pool)
//!                           │ PendingJob resolves
//!                           ▼
//!                     completion ──► XformSink (deliver / output_done / dropped)
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use espx_proto::ipsec::{
//!     AddressFamily, DomainTag, EncAlgorithm, EspConfig, EspXform, InputDisposition, Packet,
//!     SecAssoc, SoftwareEngine, XformKind, XformRegistry, XformRequest,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let esp = EspXform::new(Arc::new(SoftwareEngine::default()), EspConfig::default());
//!     let registry = XformRegistry::builder().with_xform(esp.clone()).build()?;
//!
//!     // AES-128-GCM: 16-byte key followed by the 4-byte salt
//!     let mut sa = SecAssoc::builder(0x1000)
//!         .with_cipher(EncAlgorithm::AesGcm16, vec![0x42; 20])
//!         .build()?;
//!     registry.init_sa(XformKind::Esp, &mut sa)?;
//!     let sa = Arc::new(sa);
//!
//!     // 20-byte IPv4 header, protocol byte at offset 9
//!     let mut ip = vec![0u8; 20];
//!     ip[9] = 17;
//!     ip.extend_from_slice(b"payload!");
//!
//!     let pending = esp.begin_output(XformRequest {
//!         sa: sa.clone(),
//!         packet: Packet::from_slice(AddressFamily::Inet, &ip),
//!         skip: 20,
//!         protoff: 9,
//!         domain: DomainTag(0),
//!     })?;
//!     let wire = esp.finish_output(pending).await?;
//!
//!     let pending = esp.begin_input(XformRequest {
//!         sa,
//!         packet: wire.packet,
//!         skip: 20,
//!         protoff: 9,
//!         domain: DomainTag(0),
//!     })?;
//!     if let InputDisposition::Deliver(plain) = esp.finish_input(pending).await? {
//!         assert_eq!(&plain.packet.as_slice()[20..], b"payload!");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # References
//!
//! - [RFC 4303](https://datatracker.ietf.org/doc/html/rfc4303) - ESP Protocol
//! - [RFC 3686](https://datatracker.ietf.org/doc/html/rfc3686) - AES-CTR in ESP
//! - [RFC 4106](https://datatracker.ietf.org/doc/html/rfc4106) - AES-GCM in ESP
//! - [RFC 6479](https://datatracker.ietf.org/doc/html/rfc6479) - Anti-replay without bit shifting
//! - [RFC 7634](https://datatracker.ietf.org/doc/html/rfc7634) - ChaCha20-Poly1305 in ESP
//!
//! # Security
//!
//! - No unsafe code
//! - Constant-time ICV comparison
//! - Key material held in zeroizing buffers

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod esp;
pub mod layout;
pub mod logging;
pub mod metrics;
pub mod nonce;
pub mod packet;
pub mod replay;
pub mod sa;
pub mod xform;

// Re-export commonly used types
pub use config::{EngineConfig, EspConfig};
pub use crypto::{AuthAlgorithm, CryptoEngine, EncAlgorithm, SoftwareEngine};
pub use error::{Error, Result};
pub use esp::{EspXform, InputDisposition, PendingInput, PendingOutput};
pub use layout::esp_hdrsiz;
pub use metrics::{EspMetrics, EspMetricsSnapshot};
pub use packet::{AddressFamily, Packet};
pub use replay::ReplayWindow;
pub use sa::{PadPolicy, SaFlags, SaState, SecAssoc};
pub use xform::{
    DecryptedPacket, DomainTag, EncryptedPacket, Xform, XformKind, XformRegistry, XformRequest,
    XformSink,
};
