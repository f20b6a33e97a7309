//! Asynchronous crypto engine contract
//!
//! The ESP transform never runs a cipher itself. It describes the work in a
//! [`CryptoJob`] (payload bounds, IV, associated data, digest region) and
//! hands it to a [`CryptoEngine`]. `dispatch` returns at once with a
//! [`PendingJob`]; the job completes later on whatever thread the engine
//! chooses and the pending handle resolves to the [`CompletedJob`].

use crate::ipsec::{
    crypto::{AuthAlgorithm, EncAlgorithm},
    packet::Packet,
    Error, Result,
};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use zeroize::Zeroizing;

/// Opaque crypto session handle
pub type SessionId = u64;

/// Features an engine supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineCaps {
    /// Associated data may be passed outside the packet buffer
    pub separate_aad: bool,
    /// HMAC input may be extended with the ESN high-order bits
    pub esn: bool,
}

/// Parameters bound to a crypto session at open time
#[derive(Clone)]
pub struct SessionParams {
    /// Cipher
    pub enc: EncAlgorithm,
    /// Cipher key, salt excluded
    pub enc_key: Zeroizing<Vec<u8>>,
    /// Integrity algorithm
    pub auth: Option<AuthAlgorithm>,
    /// Integrity key (empty for AEAD companions)
    pub auth_key: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParams")
            .field("enc", &self.enc)
            .field("auth", &self.auth)
            .field("enc_key_len", &self.enc_key.len())
            .field("auth_key_len", &self.auth_key.len())
            .finish()
    }
}

/// Cipher direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherOp {
    /// Encrypt the payload region
    Encrypt,
    /// Decrypt the payload region
    Decrypt,
}

/// Digest operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestOp {
    /// No integrity
    None,
    /// Compute and store the ICV
    Compute,
    /// Verify the ICV before decrypting
    Verify,
}

/// Associated data for AEAD ciphers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aad {
    /// No associated data
    None,
    /// A region of the packet buffer
    Region {
        /// Offset in the buffer
        start: usize,
        /// Length in bytes
        len: usize,
    },
    /// Bytes carried outside the packet
    Detached(Vec<u8>),
}

/// Crypto job descriptor
#[derive(Debug)]
pub struct CryptoJob {
    /// Session the job runs under
    pub session: SessionId,
    /// Cipher direction
    pub cipher: CipherOp,
    /// Digest operation
    pub digest: DigestOp,
    /// Packet buffer, modified in place
    pub buf: Packet,
    /// Start of the cipher region
    pub payload_start: usize,
    /// Length of the cipher region
    pub payload_len: usize,
    /// Associated data (AEAD)
    pub aad: Aad,
    /// Full cipher IV (out of band, may differ from the wire bytes)
    pub iv: Vec<u8>,
    /// Start of the HMAC-covered region
    pub auth_start: usize,
    /// Start of the ICV
    pub digest_start: usize,
    /// ESN high-order bits appended to the HMAC input
    pub esn_hi: Option<[u8; 4]>,
}

/// Outcome of a crypto job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Completed successfully
    Done,
    /// Session was migrated; retry once under `session`
    Again {
        /// Replacement session
        session: SessionId,
    },
    /// Integrity check failed
    BadMessage,
    /// Any other failure
    Failed(String),
}

/// A job returned by the engine
#[derive(Debug)]
pub struct CompletedJob {
    /// The job, buffer transformed on success
    pub job: CryptoJob,
    /// Outcome
    pub status: JobStatus,
}

/// Handle to an in-flight job
///
/// Resolves exactly once. An engine that drops the job without completing
/// it resolves the handle to `Error::Internal`.
#[derive(Debug)]
pub struct PendingJob {
    rx: oneshot::Receiver<CompletedJob>,
}

impl PendingJob {
    /// Create a pending handle and the completer an engine resolves it with
    pub fn channel() -> (JobCompleter, PendingJob) {
        let (tx, rx) = oneshot::channel();
        (JobCompleter { tx }, PendingJob { rx })
    }

    /// Handle for a job that already completed
    pub fn ready(job: CryptoJob, status: JobStatus) -> Self {
        let (completer, pending) = Self::channel();
        completer.complete(job, status);
        pending
    }
}

impl Future for PendingJob {
    type Output = Result<CompletedJob>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| Error::Internal("crypto engine dropped the job".into())))
    }
}

/// Engine side of a [`PendingJob`]
#[derive(Debug)]
pub struct JobCompleter {
    tx: oneshot::Sender<CompletedJob>,
}

impl JobCompleter {
    /// Resolve the pending handle
    pub fn complete(self, job: CryptoJob, status: JobStatus) {
        // The receiver may be gone if the caller gave up on the packet
        let _ = self.tx.send(CompletedJob { job, status });
    }
}

/// Asynchronous crypto job runner
pub trait CryptoEngine: Send + Sync {
    /// Supported features
    fn capabilities(&self) -> EngineCaps;

    /// Open a session bound to algorithms and keys
    fn open_session(&self, params: SessionParams) -> Result<SessionId>;

    /// Release a session
    fn close_session(&self, session: SessionId);

    /// Queue a job without blocking
    ///
    /// Fails with `Error::NoBufferSpace` when the engine cannot accept
    /// more work; the job is dropped.
    fn dispatch(&self, job: CryptoJob) -> Result<PendingJob>;
}
