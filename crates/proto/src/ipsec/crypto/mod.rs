//! ESP cryptographic layer
//!
//! This module provides:
//! - Algorithm descriptors (block sizes, IV, digest and key lengths)
//! - The asynchronous [`CryptoEngine`] job contract
//! - [`SoftwareEngine`], a tokio-backed engine over the RustCrypto stack

pub mod algorithm;
pub mod engine;
pub mod software;

pub use algorithm::{AuthAlgorithm, EncAlgorithm, AEAD_TAG_LEN};
pub use engine::{
    Aad, CipherOp, CompletedJob, CryptoEngine, CryptoJob, DigestOp, EngineCaps, JobCompleter,
    JobStatus, PendingJob, SessionId, SessionParams,
};
pub use software::SoftwareEngine;
