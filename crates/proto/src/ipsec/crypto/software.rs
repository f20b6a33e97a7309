//! Software crypto engine on the tokio blocking pool
//!
//! Runs ESP jobs with the RustCrypto primitives:
//!
//! - AES-GCM and ChaCha20-Poly1305 through `AeadInPlace` with detached tags
//! - AES-CBC (no padding, ESP pads itself) and AES-CTR with a 32-bit
//!   big-endian block counter
//! - HMAC-SHA1/SHA2 truncated ICVs, compared in constant time
//!
//! Each dispatched job holds one semaphore permit until it completes, so
//! at most `max_inflight` jobs run at once; beyond that `dispatch` fails
//! instead of queueing.

use crate::ipsec::{
    config::EngineConfig,
    crypto::{
        Aad, AuthAlgorithm, CipherOp, CryptoEngine, CryptoJob, DigestOp, EncAlgorithm,
        EngineCaps, JobStatus, PendingJob, SessionId, SessionParams, AEAD_TAG_LEN,
    },
    Error, Result,
};
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::generic_array::typenum::Unsigned;
use aes_gcm::aead::{consts::U12, AeadCore, AeadInPlace, KeyInit, Nonce, Tag};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use chacha20poly1305::ChaCha20Poly1305;
use cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::Semaphore;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Software crypto engine
pub struct SoftwareEngine {
    config: EngineConfig,
    sessions: RwLock<HashMap<SessionId, Arc<SessionParams>>>,
    retired: RwLock<HashMap<SessionId, Arc<SessionParams>>>,
    next_id: AtomicU64,
    permits: Arc<Semaphore>,
    dispatched: AtomicU64,
}

impl SoftwareEngine {
    /// Create engine
    pub fn new(config: EngineConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_inflight));
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            retired: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            permits,
            dispatched: AtomicU64::new(0),
        }
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Number of sessions retired by a migration and not yet closed
    pub fn retired_count(&self) -> usize {
        self.retired.read().len()
    }

    /// Jobs accepted since creation
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Free in-flight slots
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Retire a session as if the backing device had been reset
    ///
    /// Every job later dispatched under the old handle completes with
    /// [`JobStatus::Again`] carrying a fresh session with the same keys.
    pub fn force_migration(&self, session: SessionId) -> Result<()> {
        let params = self
            .sessions
            .write()
            .remove(&session)
            .ok_or_else(|| Error::InvalidState(format!("unknown crypto session {}", session)))?;
        self.retired.write().insert(session, params);
        Ok(())
    }

    fn insert_session(&self, params: Arc<SessionParams>) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions.write().insert(id, params);
        id
    }
}

impl Default for SoftwareEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl fmt::Debug for SoftwareEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareEngine")
            .field("config", &self.config)
            .field("sessions", &self.session_count())
            .field("available_permits", &self.available_permits())
            .finish()
    }
}

impl CryptoEngine for SoftwareEngine {
    fn capabilities(&self) -> EngineCaps {
        EngineCaps {
            separate_aad: self.config.separate_aad,
            esn: self.config.esn,
        }
    }

    fn open_session(&self, params: SessionParams) -> Result<SessionId> {
        validate_params(&params)?;
        Ok(self.insert_session(Arc::new(params)))
    }

    fn close_session(&self, session: SessionId) {
        self.sessions.write().remove(&session);
        self.retired.write().remove(&session);
    }

    fn dispatch(&self, job: CryptoJob) -> Result<PendingJob> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Internal("software crypto engine needs a tokio runtime".into()))?;

        let permit = self.permits.clone().try_acquire_owned().map_err(|_| {
            Error::NoBufferSpace(format!(
                "{} crypto jobs already in flight",
                self.config.max_inflight
            ))
        })?;
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        let (completer, pending) = PendingJob::channel();

        let live = self.sessions.read().get(&job.session).cloned();
        let params = match live {
            Some(params) => params,
            None => {
                let retired = self.retired.read().get(&job.session).cloned();
                let status = match retired {
                    Some(params) => JobStatus::Again {
                        session: self.insert_session(params),
                    },
                    None => JobStatus::Failed(format!("unknown crypto session {}", job.session)),
                };
                drop(permit);
                completer.complete(job, status);
                return Ok(pending);
            }
        };

        handle.spawn_blocking(move || {
            let _permit = permit;
            let mut job = job;
            let status = match execute(&params, &mut job) {
                Ok(()) => JobStatus::Done,
                Err(status) => status,
            };
            completer.complete(job, status);
        });

        Ok(pending)
    }
}

fn validate_params(params: &SessionParams) -> Result<()> {
    let key_len = params.enc_key.len();
    let key_ok = match params.enc {
        EncAlgorithm::Null => true,
        EncAlgorithm::AesCbc | EncAlgorithm::AesCtr | EncAlgorithm::AesGcm16 => {
            matches!(key_len, 16 | 24 | 32)
        }
        EncAlgorithm::ChaCha20Poly1305 => key_len == 32,
    };
    if !key_ok {
        return Err(Error::Config(format!(
            "{} does not accept a {}-byte key",
            params.enc, key_len
        )));
    }

    if let Some(auth) = params.auth {
        if !auth.is_aead_companion() && params.auth_key.len() != auth.key_len() {
            return Err(Error::Config(format!(
                "{} needs a {}-byte key, got {}",
                auth,
                auth.key_len(),
                params.auth_key.len()
            )));
        }
    }
    Ok(())
}

fn failed(msg: impl Into<String>) -> JobStatus {
    JobStatus::Failed(msg.into())
}

fn execute(params: &SessionParams, job: &mut CryptoJob) -> std::result::Result<(), JobStatus> {
    let len = job.buf.len();
    let payload_start = job.payload_start;
    let payload_end = payload_start
        .checked_add(job.payload_len)
        .filter(|&end| end <= len)
        .ok_or_else(|| failed("payload region out of bounds"))?;

    let digest_len = params.auth.map_or(0, AuthAlgorithm::digest_len);
    let digest_start = job.digest_start;
    if job.digest != DigestOp::None
        && (digest_start < payload_end || digest_start + digest_len > len)
    {
        return Err(failed("digest region out of bounds"));
    }

    let aad = match &job.aad {
        Aad::None => Vec::new(),
        Aad::Region { start, len } => job
            .buf
            .slice(*start, *len)
            .map_err(|e| failed(e.to_string()))?
            .to_vec(),
        Aad::Detached(bytes) => bytes.clone(),
    };

    let key = params.enc_key.as_slice();
    let iv = job.iv.as_slice();
    let bytes = job.buf.as_mut_slice();

    if params.enc.is_aead() {
        if job.digest == DigestOp::None {
            return Err(failed("AEAD job without a tag region"));
        }
        return match job.cipher {
            CipherOp::Encrypt => {
                let tag = aead_seal(params.enc, key, iv, &aad, &mut bytes[payload_start..payload_end])?;
                bytes[digest_start..digest_start + tag.len()].copy_from_slice(&tag);
                Ok(())
            }
            CipherOp::Decrypt => {
                let (head, tail) = bytes.split_at_mut(digest_start);
                aead_open(
                    params.enc,
                    key,
                    iv,
                    &aad,
                    &mut head[payload_start..payload_end],
                    &tail[..AEAD_TAG_LEN],
                )
            }
        };
    }

    match job.cipher {
        CipherOp::Encrypt => {
            apply_cipher(params.enc, key, iv, &mut bytes[payload_start..payload_end], CipherOp::Encrypt)?;
            if let (DigestOp::Compute, Some(auth)) = (job.digest, params.auth) {
                let icv = compute_icv(auth, &params.auth_key, &bytes[job.auth_start..digest_start], job.esn_hi)?;
                bytes[digest_start..digest_start + digest_len].copy_from_slice(&icv);
            }
        }
        CipherOp::Decrypt => {
            if let (DigestOp::Verify, Some(auth)) = (job.digest, params.auth) {
                let icv = compute_icv(auth, &params.auth_key, &bytes[job.auth_start..digest_start], job.esn_hi)?;
                let received = &bytes[digest_start..digest_start + digest_len];
                if !bool::from(icv.as_slice().ct_eq(received)) {
                    return Err(JobStatus::BadMessage);
                }
            }
            apply_cipher(params.enc, key, iv, &mut bytes[payload_start..payload_end], CipherOp::Decrypt)?;
        }
    }
    Ok(())
}

fn aead_seal(
    enc: EncAlgorithm,
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    data: &mut [u8],
) -> std::result::Result<Vec<u8>, JobStatus> {
    match (enc, key.len()) {
        (EncAlgorithm::AesGcm16, 16) => seal_with::<Aes128Gcm>(key, iv, aad, data),
        (EncAlgorithm::AesGcm16, 24) => seal_with::<Aes192Gcm>(key, iv, aad, data),
        (EncAlgorithm::AesGcm16, 32) => seal_with::<Aes256Gcm>(key, iv, aad, data),
        (EncAlgorithm::ChaCha20Poly1305, _) => seal_with::<ChaCha20Poly1305>(key, iv, aad, data),
        (enc, n) => Err(failed(format!("no AEAD {} for a {}-byte key", enc, n))),
    }
}

fn aead_open(
    enc: EncAlgorithm,
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    data: &mut [u8],
    tag: &[u8],
) -> std::result::Result<(), JobStatus> {
    match (enc, key.len()) {
        (EncAlgorithm::AesGcm16, 16) => open_with::<Aes128Gcm>(key, iv, aad, data, tag),
        (EncAlgorithm::AesGcm16, 24) => open_with::<Aes192Gcm>(key, iv, aad, data, tag),
        (EncAlgorithm::AesGcm16, 32) => open_with::<Aes256Gcm>(key, iv, aad, data, tag),
        (EncAlgorithm::ChaCha20Poly1305, _) => {
            open_with::<ChaCha20Poly1305>(key, iv, aad, data, tag)
        }
        (enc, n) => Err(failed(format!("no AEAD {} for a {}-byte key", enc, n))),
    }
}

fn seal_with<A: AeadInPlace + KeyInit>(
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    data: &mut [u8],
) -> std::result::Result<Vec<u8>, JobStatus> {
    if iv.len() != <A as AeadCore>::NonceSize::USIZE {
        return Err(failed(format!("AEAD nonce must be 12 bytes, got {}", iv.len())));
    }
    let cipher = A::new_from_slice(key).map_err(|_| failed("invalid AEAD key length"))?;
    cipher
        .encrypt_in_place_detached(Nonce::<A>::from_slice(iv), aad, data)
        .map(|tag| tag.to_vec())
        .map_err(|_| failed("AEAD encryption failed"))
}

fn open_with<A: AeadInPlace + KeyInit>(
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    data: &mut [u8],
    tag: &[u8],
) -> std::result::Result<(), JobStatus> {
    if iv.len() != <A as AeadCore>::NonceSize::USIZE {
        return Err(failed(format!("AEAD nonce must be 12 bytes, got {}", iv.len())));
    }
    if tag.len() != <A as AeadCore>::TagSize::USIZE {
        return Err(failed("AEAD tag length mismatch"));
    }
    let cipher = A::new_from_slice(key).map_err(|_| failed("invalid AEAD key length"))?;
    cipher
        .decrypt_in_place_detached(Nonce::<A>::from_slice(iv), aad, data, Tag::<A>::from_slice(tag))
        .map_err(|_| JobStatus::BadMessage)
}

macro_rules! cbc_apply {
    ($aes:ty, $key:expr, $iv:expr, $data:expr, $op:expr) => {
        match $op {
            CipherOp::Encrypt => {
                let len = $data.len();
                cbc::Encryptor::<$aes>::new_from_slices($key, $iv)
                    .map_err(|_| failed("invalid AES-CBC key or IV length"))?
                    .encrypt_padded_mut::<NoPadding>($data, len)
                    .map(|_| ())
                    .map_err(|_| failed("AES-CBC payload is not block aligned"))
            }
            CipherOp::Decrypt => cbc::Decryptor::<$aes>::new_from_slices($key, $iv)
                .map_err(|_| failed("invalid AES-CBC key or IV length"))?
                .decrypt_padded_mut::<NoPadding>($data)
                .map(|_| ())
                .map_err(|_| failed("AES-CBC payload is not block aligned")),
        }
    };
}

macro_rules! ctr_apply {
    ($aes:ty, $key:expr, $iv:expr, $data:expr) => {
        ctr::Ctr32BE::<$aes>::new_from_slices($key, $iv)
            .map_err(|_| failed("invalid AES-CTR key or IV length"))?
            .try_apply_keystream($data)
            .map_err(|_| failed("AES-CTR keystream exhausted"))
    };
}

fn apply_cipher(
    enc: EncAlgorithm,
    key: &[u8],
    iv: &[u8],
    data: &mut [u8],
    op: CipherOp,
) -> std::result::Result<(), JobStatus> {
    match (enc, key.len()) {
        (EncAlgorithm::Null, _) => Ok(()),
        (EncAlgorithm::AesCbc, 16) => cbc_apply!(Aes128, key, iv, data, op),
        (EncAlgorithm::AesCbc, 24) => cbc_apply!(Aes192, key, iv, data, op),
        (EncAlgorithm::AesCbc, 32) => cbc_apply!(Aes256, key, iv, data, op),
        // CTR is its own inverse
        (EncAlgorithm::AesCtr, 16) => ctr_apply!(Aes128, key, iv, data),
        (EncAlgorithm::AesCtr, 24) => ctr_apply!(Aes192, key, iv, data),
        (EncAlgorithm::AesCtr, 32) => ctr_apply!(Aes256, key, iv, data),
        (enc, n) => Err(failed(format!("no {} cipher for a {}-byte key", enc, n))),
    }
}

macro_rules! hmac_digest {
    ($hash:ty, $key:expr, $data:expr, $esn_hi:expr) => {{
        let mut mac = <Hmac<$hash> as Mac>::new_from_slice($key)
            .map_err(|_| failed("invalid HMAC key length"))?;
        mac.update($data);
        if let Some(hi) = $esn_hi {
            mac.update(&hi);
        }
        mac.finalize().into_bytes().to_vec()
    }};
}

fn compute_icv(
    auth: AuthAlgorithm,
    key: &[u8],
    data: &[u8],
    esn_hi: Option<[u8; 4]>,
) -> std::result::Result<Vec<u8>, JobStatus> {
    let mut icv = match auth {
        AuthAlgorithm::HmacSha1_96 => hmac_digest!(Sha1, key, data, esn_hi),
        AuthAlgorithm::HmacSha256_128 => hmac_digest!(Sha256, key, data, esn_hi),
        AuthAlgorithm::HmacSha384_192 => hmac_digest!(Sha384, key, data, esn_hi),
        AuthAlgorithm::HmacSha512_256 => hmac_digest!(Sha512, key, data, esn_hi),
        other => return Err(failed(format!("{} is not an HMAC", other))),
    };
    icv.truncate(auth.digest_len());
    Ok(icv)
}
