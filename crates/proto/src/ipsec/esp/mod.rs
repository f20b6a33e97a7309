//! ESP (Encapsulating Security Payload) Protocol
//!
//! Implements RFC 4303 - IP Encapsulating Security Payload (ESP) as a
//! packet transform driven by an asynchronous crypto engine.
//!
//! # Overview
//!
//! ESP provides confidentiality, data origin authentication, connectionless
//! integrity and anti-replay protection for IP packets. Each direction is a
//! two-phase operation:
//!
//! ```text
//! begin_output:  size check → sequence → header → IV → padding → dispatch
//!                                                                  │
//! finish_output: (engine done) → retry once on migration → EncryptedPacket
//!
//! begin_input:   alignment → length → SPI → replay pre-check → dispatch
//!                                                                  │
//! finish_input:  (engine done) → replay commit → strip → trailer → DecryptedPacket
//! ```
//!
//! The `begin_*` calls never block. The returned pending handle owns the
//! per-packet context (SA reference, offsets, session snapshot, execution
//! domain) and releases it on every exit path of the matching `finish_*`.
//! [`Xform::input`] and [`Xform::output`] run the second phase on the tokio
//! runtime and report through an [`XformSink`].
//!
//! # AEAD Mode (AES-GCM, ChaCha20-Poly1305)
//!
//! - The 8-byte explicit IV follows the sequence number
//! - The tag takes the place of the ICV
//! - Associated data is `SPI | Seq`, or `SPI | Seq-high | Seq-low` with ESN
//!
//! # References
//!
//! - [RFC 4303](https://datatracker.ietf.org/doc/html/rfc4303) - ESP
//! - [RFC 4106](https://datatracker.ietf.org/doc/html/rfc4106) - AES-GCM in ESP
//! - [RFC 7634](https://datatracker.ietf.org/doc/html/rfc7634) - ChaCha20-Poly1305 in ESP

mod input;
mod job;
mod output;

pub use input::{parse_trailer, InputDisposition, PendingInput, Trailer};
pub use output::PendingOutput;

use super::{
    config::EspConfig,
    crypto::{CompletedJob, CryptoEngine, JobStatus, PendingJob, SessionId, SessionParams},
    layout::EspLayout,
    logging,
    metrics::{EspMetrics, InflightGuard},
    nonce::EXPLICIT_IV_LEN,
    sa::{SaState, SecAssoc},
    xform::{DomainTag, Xform, XformKind, XformRequest, XformSink},
    Error, Result,
};
use espx_platform::{EspxError, EspxResult, SecurityModule};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::Instrument;
use zeroize::Zeroizing;

/// ESP transform
#[derive(Clone)]
pub struct EspXform {
    engine: Arc<dyn CryptoEngine>,
    metrics: EspMetrics,
    config: EspConfig,
    enabled: Arc<AtomicBool>,
}

impl EspXform {
    /// Create transform over a crypto engine
    pub fn new(engine: Arc<dyn CryptoEngine>, config: EspConfig) -> Self {
        let enabled = Arc::new(AtomicBool::new(config.enabled));
        Self {
            engine,
            metrics: EspMetrics::new(),
            config,
            enabled,
        }
    }

    /// Report into an existing metrics instance
    pub fn with_metrics(mut self, metrics: EspMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Counters of this transform
    pub fn metrics(&self) -> &EspMetrics {
        &self.metrics
    }

    /// Crypto engine in use
    pub fn engine(&self) -> &Arc<dyn CryptoEngine> {
        &self.engine
    }

    /// Configuration
    pub fn config(&self) -> &EspConfig {
        &self.config
    }

    /// Turn ESP processing on or off at runtime
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Whether ESP processing is on
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn check_usable(&self, sa: &SecAssoc) -> Result<()> {
        if !self.is_enabled() {
            return Err(Error::Disabled);
        }
        if !sa.is_alive() {
            return Err(Error::InvalidState(format!(
                "SA 0x{:08x} is {:?}",
                sa.spi(),
                sa.state()
            )));
        }
        Ok(())
    }

    fn fail(&self, spi: u32, err: Error) -> Error {
        self.metrics.record_error(&err);
        logging::log_packet_dropped(spi, &err);
        err
    }

    /// Await the engine, rebinding and redispatching once on migration
    async fn complete_job(&self, ctx: &XformContext, pending: PendingJob) -> Result<CompletedJob> {
        let completed = pending.await?;
        let JobStatus::Again { session } = completed.status else {
            return Ok(completed);
        };

        self.rebind(&ctx.sa, ctx.session, session);
        if !ctx.sa.is_alive() {
            // Torn down around the rebind, the installed session is ours to close
            self.engine.close_session(ctx.sa.session_id());
            return Err(Error::InvalidState(format!(
                "SA 0x{:08x} went away during session rebind",
                ctx.sa.spi()
            )));
        }

        let mut job = completed.job;
        job.session = ctx.sa.session_id();
        let completed = self.engine.dispatch(job)?.await?;

        if let JobStatus::Again { session } = completed.status {
            self.engine.close_session(session);
            return Err(Error::CryptoError(
                "crypto session migrated again during retry".into(),
            ));
        }
        Ok(completed)
    }

    fn rebind(&self, sa: &SecAssoc, old: SessionId, new: SessionId) {
        let won = sa.update_session(old, new);
        if won {
            self.engine.close_session(old);
        } else {
            // Another packet already installed a replacement
            self.engine.close_session(new);
        }
        self.metrics.record_rebind();
        logging::log_session_rebind(sa.spi(), old, new, won);
    }

    fn init_sa_inner(&self, sa: &mut SecAssoc) -> Result<()> {
        let enc = sa.enc();
        let flags = sa.flags();

        if flags.old_header && (enc.is_aead() || sa.auth().is_some()) {
            return Err(Error::Config(
                "old ESP header carries neither sequence numbers nor an ICV".into(),
            ));
        }
        if flags.old_header && flags.esn {
            return Err(Error::Config("ESN needs the sequence number field".into()));
        }

        let key_len = sa.enc_key().len();
        if key_len == 0 && enc.min_key_len() > 0 {
            return Err(Error::Config(format!("no encoding key for {}", enc)));
        }

        let cipher_key_len = key_len.checked_sub(enc.salt_len()).ok_or_else(|| {
            Error::Config(format!("{}-byte key too short for {} salt", key_len, enc))
        })?;
        if !(enc.min_key_len()..=enc.max_key_len()).contains(&cipher_key_len) {
            return Err(Error::Config(format!(
                "invalid key length {} for {}, must be in [{}..{}]",
                cipher_key_len,
                enc,
                enc.min_key_len(),
                enc.max_key_len()
            )));
        }

        if flags.iv4b && !(flags.old_header && enc.iv_len() == 8 && !enc.is_counter_family()) {
            return Err(Error::Config(format!(
                "4-byte IV not supported with {}",
                enc
            )));
        }

        let ivlen = if enc.is_counter_family() {
            EXPLICIT_IV_LEN
        } else if flags.iv4b {
            4
        } else {
            enc.iv_len()
        };

        match (enc.aead_companion(cipher_key_len)?, sa.auth()) {
            (Some(companion), None) => sa.set_auth(Some(companion)),
            (Some(companion), Some(auth)) if auth != companion => {
                return Err(Error::Config(format!(
                    "{} does not match {} with a {}-byte key",
                    auth, enc, cipher_key_len
                )));
            }
            (None, Some(auth)) if auth.is_aead_companion() => {
                return Err(Error::Config(format!("{} needs an AEAD cipher", auth)));
            }
            (None, Some(auth)) if sa.auth_key().len() != auth.key_len() => {
                return Err(Error::Config(format!(
                    "invalid key length {} for {}",
                    sa.auth_key().len(),
                    auth
                )));
            }
            _ => {}
        }

        if flags.esn {
            let caps = self.engine.capabilities();
            if enc.is_aead() && !caps.separate_aad {
                return Err(Error::Config(
                    "crypto engine cannot carry detached AAD for ESN".into(),
                ));
            }
            if !enc.is_aead() && sa.auth().is_some() && !caps.esn {
                return Err(Error::Config("crypto engine lacks ESN support".into()));
            }
        }

        sa.set_ivlen(ivlen);
        sa.resolve_replay_window(self.config.default_replay_window)?;

        let auth = sa.auth();
        let params = SessionParams {
            enc,
            enc_key: Zeroizing::new(sa.cipher_key().to_vec()),
            auth,
            auth_key: Zeroizing::new(match auth {
                Some(a) if !a.is_aead_companion() => sa.auth_key().to_vec(),
                _ => Vec::new(),
            }),
        };
        let session = self.engine.open_session(params)?;
        sa.set_session(session);

        logging::log_sa_init(sa.spi(), enc.name(), auth.map(|a| a.name()), ivlen);
        Ok(())
    }
}

impl fmt::Debug for EspXform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EspXform")
            .field("config", &self.config)
            .field("enabled", &self.is_enabled())
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

impl SecurityModule for EspXform {
    fn id(&self) -> &'static str {
        "espx.xform.esp"
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &'static str {
        "IP Encapsulating Security Payload (RFC 4303)"
    }

    fn init(&mut self) -> EspxResult<()> {
        self.config.validate().map_err(EspxError::from)
    }

    fn shutdown(&mut self) -> EspxResult<()> {
        self.set_enabled(false);
        Ok(())
    }
}

impl Xform for EspXform {
    fn kind(&self) -> XformKind {
        XformKind::Esp
    }

    fn init_sa(&self, sa: &mut SecAssoc) -> Result<()> {
        self.init_sa_inner(sa).map_err(|e| {
            self.metrics.record_error(&e);
            logging::log_error("ESP init", &e.to_string());
            e
        })
    }

    fn zeroize_sa(&self, sa: &SecAssoc) -> Result<()> {
        sa.set_state(SaState::Dead);
        self.engine.close_session(sa.session_id());
        logging::log_sa_zeroize(sa.spi());
        Ok(())
    }

    fn input(&self, req: XformRequest, sink: Arc<dyn XformSink>) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            self.fail(req.sa.spi(), Error::Internal("ESP input needs a tokio runtime".into()))
        })?;

        let pending = self.begin_input(req)?;
        let spi = pending.spi();
        let span = logging::completion_span("decrypt", spi, pending.domain());
        let this = self.clone();

        handle.spawn(
            async move {
                match this.finish_input(pending).await {
                    Ok(InputDisposition::Deliver(packet)) => match packet.packet.family() {
                        super::packet::AddressFamily::Inet => sink.deliver_inet(packet).await,
                        super::packet::AddressFamily::Inet6 => sink.deliver_inet6(packet).await,
                    },
                    Ok(InputDisposition::Dummy) => {}
                    Err(err) => sink.dropped(spi, &err).await,
                }
            }
            .instrument(span),
        );
        Ok(())
    }

    fn output(&self, req: XformRequest, sink: Arc<dyn XformSink>) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            self.fail(req.sa.spi(), Error::Internal("ESP output needs a tokio runtime".into()))
        })?;

        let pending = self.begin_output(req)?;
        let spi = pending.spi();
        let span = logging::completion_span("encrypt", spi, pending.domain());
        let this = self.clone();

        handle.spawn(
            async move {
                match this.finish_output(pending).await {
                    Ok(packet) => sink.output_done(packet).await,
                    Err(err) => sink.dropped(spi, &err).await,
                }
            }
            .instrument(span),
        );
        Ok(())
    }
}

/// Per-packet state carried across the crypto engine
#[derive(Debug)]
struct XformContext {
    sa: Arc<SecAssoc>,
    layout: EspLayout,
    skip: usize,
    protoff: usize,
    seq: u64,
    session: SessionId,
    domain: DomainTag,
    _inflight: InflightGuard,
}

fn job_result(status: &JobStatus) -> Result<()> {
    match status {
        JobStatus::Done => Ok(()),
        JobStatus::BadMessage => Err(Error::AuthenticationFailed(
            "integrity check value mismatch".into(),
        )),
        JobStatus::Failed(msg) => Err(Error::CryptoError(msg.clone())),
        JobStatus::Again { session } => Err(Error::CryptoError(format!(
            "unexpected session migration to {}",
            session
        ))),
    }
}
