//! Security Association record consumed by the ESP transform
//!
//! The SA store outside this crate provisions keys and algorithms; the
//! transform resolves the derived parameters (IV length, AEAD integrity
//! companion, replay window, crypto session) once in `init_sa` and from
//! then on only touches the per-SA counters, which are atomics or behind
//! their own lock, so an `Arc<SecAssoc>` can be shared by every packet
//! worker.

use super::{
    crypto::{AuthAlgorithm, EncAlgorithm, SessionId},
    packet::AddressFamily,
    replay::{ReplayWindow, MAX_WINDOW_SIZE, MIN_WINDOW_SIZE},
    xform::Xform,
    Error, Result,
};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use zeroize::Zeroizing;

/// SPI values up to this one are reserved by IANA
pub const MAX_RESERVED_SPI: u32 = 255;

/// Lifecycle state of an SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SaState {
    /// Provisioned, transform not yet initialised
    Larval = 0,
    /// Usable for traffic
    Mature = 1,
    /// Soft lifetime expired, still usable
    Dying = 2,
    /// Torn down; every packet is dropped
    Dead = 3,
}

impl SaState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SaState::Larval,
            1 => SaState::Mature,
            2 => SaState::Dying,
            _ => SaState::Dead,
        }
    }
}

/// Padding content written on output and checked on input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PadPolicy {
    /// 1, 2, 3, ... (RFC 4303 default)
    #[default]
    Sequential,
    /// All zero
    Zero,
    /// Random bytes, never checked
    Random,
}

/// Per-SA option flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaFlags {
    /// RFC 1827 header: SPI only, no sequence number, no ICV
    pub old_header: bool,
    /// Extended (64-bit) sequence numbers
    pub esn: bool,
    /// 4-byte explicit IV (old header format only)
    pub iv4b: bool,
    /// Pad counter-mode payloads to the primitive's native block size
    pub native_block: bool,
    /// Restart the 32-bit output sequence at 1 instead of failing
    pub cyclic_seq: bool,
    /// Padding policy
    pub pad: PadPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayRequest {
    TransformDefault,
    Disabled,
    Size(u32),
}

/// Security Association
pub struct SecAssoc {
    spi: u32,
    family: AddressFamily,
    enc: EncAlgorithm,
    auth: Option<AuthAlgorithm>,
    enc_key: Zeroizing<Vec<u8>>,
    auth_key: Zeroizing<Vec<u8>>,
    flags: SaFlags,
    ivlen: usize,
    replay_request: ReplayRequest,
    replay: Option<RwLock<ReplayWindow>>,
    seq_out: AtomicU64,
    iv_counter: AtomicU64,
    session: AtomicU64,
    state: AtomicU8,
    xform: Option<Arc<dyn Xform>>,
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl SecAssoc {
    /// Create builder for an SA
    pub fn builder(spi: u32) -> SecAssocBuilder {
        SecAssocBuilder::new(spi)
    }

    /// Security Parameter Index
    pub fn spi(&self) -> u32 {
        self.spi
    }

    /// Address family of the protected traffic
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Encryption algorithm
    pub fn enc(&self) -> EncAlgorithm {
        self.enc
    }

    /// Integrity algorithm (AEAD companion once initialised)
    pub fn auth(&self) -> Option<AuthAlgorithm> {
        self.auth
    }

    /// Encryption key, salt included
    pub fn enc_key(&self) -> &[u8] {
        &self.enc_key
    }

    /// Integrity key
    pub fn auth_key(&self) -> &[u8] {
        &self.auth_key
    }

    /// Option flags
    pub fn flags(&self) -> SaFlags {
        self.flags
    }

    /// Resolved IV length
    pub fn ivlen(&self) -> usize {
        self.ivlen
    }

    /// Digest length of the integrity algorithm, 0 without one
    pub fn digest_len(&self) -> usize {
        self.auth.map_or(0, AuthAlgorithm::digest_len)
    }

    /// Implicit salt at the tail of the encryption key
    pub fn salt(&self) -> &[u8] {
        let salt_len = self.enc.salt_len().min(self.enc_key.len());
        &self.enc_key[self.enc_key.len() - salt_len..]
    }

    /// Encryption key without the salt
    pub fn cipher_key(&self) -> &[u8] {
        let salt_len = self.enc.salt_len().min(self.enc_key.len());
        &self.enc_key[..self.enc_key.len() - salt_len]
    }

    /// Replay window, absent when disabled
    pub fn replay(&self) -> Option<&RwLock<ReplayWindow>> {
        self.replay.as_ref()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SaState {
        SaState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move the SA to a new state
    pub fn set_state(&self, state: SaState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether the SA may carry traffic
    pub fn is_alive(&self) -> bool {
        matches!(self.state(), SaState::Mature | SaState::Dying)
    }

    /// Crypto session bound to this SA
    pub fn session_id(&self) -> SessionId {
        self.session.load(Ordering::Acquire)
    }

    /// Replace the crypto session if it is still `old`
    ///
    /// Returns `false` when another packet already rebound the session.
    pub fn update_session(&self, old: SessionId, new: SessionId) -> bool {
        self.session
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Transform attached to this SA
    pub fn xform(&self) -> Option<&Arc<dyn Xform>> {
        self.xform.as_ref()
    }

    /// Next output sequence number
    ///
    /// The 32-bit space is exhausted at `u32::MAX` unless the SA allows
    /// cycling; with ESN the full 64-bit space is used.
    pub fn next_seq(&self) -> Result<u64> {
        let esn = self.flags.esn;
        let cyclic = self.flags.cyclic_seq;

        self.seq_out
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                successor(cur, esn, cyclic)
            })
            .ok()
            .and_then(|prev| successor(prev, esn, cyclic))
            .ok_or(Error::SequenceOverflow(self.spi))
    }

    /// Last output sequence number handed out, 0 before the first packet
    pub fn last_seq(&self) -> u64 {
        self.seq_out.load(Ordering::Acquire)
    }

    /// Next explicit IV counter value for counter-style ciphers
    pub fn next_iv_counter(&self) -> u64 {
        self.iv_counter.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Account one processed packet
    pub fn record_packet(&self, bytes: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Packets processed on this SA
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Bytes processed on this SA
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Set the integrity algorithm (AEAD companion derivation)
    pub fn set_auth(&mut self, auth: Option<AuthAlgorithm>) {
        self.auth = auth;
    }

    /// Fix the IV length
    pub fn set_ivlen(&mut self, ivlen: usize) {
        self.ivlen = ivlen;
    }

    /// Bind the crypto session opened for this SA
    pub fn set_session(&mut self, session: SessionId) {
        *self.session.get_mut() = session;
    }

    /// Attach the transform that owns this SA
    pub fn attach_xform(&mut self, xform: Arc<dyn Xform>) {
        self.xform = Some(xform);
    }

    /// Create the replay window requested at build time
    ///
    /// Old-format SAs never get one.
    pub fn resolve_replay_window(&mut self, default_size: u32) -> Result<()> {
        let size = match self.replay_request {
            _ if self.flags.old_header => None,
            ReplayRequest::Disabled => None,
            ReplayRequest::Size(size) => Some(size),
            ReplayRequest::TransformDefault => Some(default_size),
        };

        if let Some(size) = size {
            if !(MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&size) {
                return Err(Error::Config(format!(
                    "replay window of {} packets, must be between {} and {}",
                    size, MIN_WINDOW_SIZE, MAX_WINDOW_SIZE
                )));
            }
        }

        self.replay = size.map(|size| RwLock::new(ReplayWindow::with_esn(size, self.flags.esn)));
        Ok(())
    }
}

fn successor(cur: u64, esn: bool, cyclic: bool) -> Option<u64> {
    if esn {
        cur.checked_add(1)
    } else if cur >= u32::MAX as u64 {
        cyclic.then_some(1)
    } else {
        Some(cur + 1)
    }
}

impl fmt::Debug for SecAssoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecAssoc")
            .field("spi", &format_args!("0x{:08x}", self.spi))
            .field("family", &self.family)
            .field("enc", &self.enc)
            .field("auth", &self.auth)
            .field("enc_key", &"[REDACTED]")
            .field("auth_key", &"[REDACTED]")
            .field("flags", &self.flags)
            .field("ivlen", &self.ivlen)
            .field("replay", &self.replay.as_ref().map(|w| w.read().window_size()))
            .field("state", &self.state())
            .field("session", &self.session_id())
            .field("xform", &self.xform.as_ref().map(|x| x.kind()))
            .finish()
    }
}

/// Builder for SecAssoc
#[derive(Debug)]
pub struct SecAssocBuilder {
    spi: u32,
    family: AddressFamily,
    enc: Option<EncAlgorithm>,
    enc_key: Option<Vec<u8>>,
    auth: Option<AuthAlgorithm>,
    auth_key: Option<Vec<u8>>,
    flags: SaFlags,
    replay: ReplayRequest,
}

impl SecAssocBuilder {
    /// Create new builder
    pub fn new(spi: u32) -> Self {
        Self {
            spi,
            family: AddressFamily::Inet,
            enc: None,
            enc_key: None,
            auth: None,
            auth_key: None,
            flags: SaFlags::default(),
            replay: ReplayRequest::TransformDefault,
        }
    }

    /// Set address family
    pub fn with_family(mut self, family: AddressFamily) -> Self {
        self.family = family;
        self
    }

    /// Set encryption algorithm and key (salt included for counter ciphers)
    pub fn with_cipher(mut self, enc: EncAlgorithm, key: impl Into<Vec<u8>>) -> Self {
        self.enc = Some(enc);
        self.enc_key = Some(key.into());
        self
    }

    /// Set encryption algorithm without key material
    pub fn with_cipher_only(mut self, enc: EncAlgorithm) -> Self {
        self.enc = Some(enc);
        self
    }

    /// Set integrity algorithm and key
    pub fn with_auth(mut self, auth: AuthAlgorithm, key: impl Into<Vec<u8>>) -> Self {
        self.auth = Some(auth);
        self.auth_key = Some(key.into());
        self
    }

    /// Set option flags
    pub fn with_flags(mut self, flags: SaFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Enable extended sequence numbers
    pub fn with_esn(mut self) -> Self {
        self.flags.esn = true;
        self
    }

    /// Set padding policy
    pub fn with_pad_policy(mut self, pad: PadPolicy) -> Self {
        self.flags.pad = pad;
        self
    }

    /// Use a replay window of `size` packets
    pub fn with_replay_window(mut self, size: u32) -> Self {
        self.replay = ReplayRequest::Size(size);
        self
    }

    /// Disable anti-replay protection
    pub fn without_replay(mut self) -> Self {
        self.replay = ReplayRequest::Disabled;
        self
    }

    /// Build the SA in larval state
    pub fn build(self) -> Result<SecAssoc> {
        let enc = self
            .enc
            .ok_or_else(|| Error::Config("no encryption algorithm".into()))?;

        if self.auth.is_some() && self.auth_key.is_none() {
            return Err(Error::Config("integrity algorithm without key".into()));
        }

        if let ReplayRequest::Size(size) = self.replay {
            if !(MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&size) {
                return Err(Error::Config(format!(
                    "replay window {} outside {}..={}",
                    size, MIN_WINDOW_SIZE, MAX_WINDOW_SIZE
                )));
            }
        }

        Ok(SecAssoc {
            spi: self.spi,
            family: self.family,
            enc,
            auth: self.auth,
            enc_key: Zeroizing::new(self.enc_key.unwrap_or_default()),
            auth_key: Zeroizing::new(self.auth_key.unwrap_or_default()),
            flags: self.flags,
            ivlen: enc.iv_len(),
            replay_request: self.replay,
            replay: None,
            seq_out: AtomicU64::new(0),
            iv_counter: AtomicU64::new(0),
            session: AtomicU64::new(0),
            state: AtomicU8::new(SaState::Larval as u8),
            xform: None,
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        })
    }
}
