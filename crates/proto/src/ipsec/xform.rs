//! Transform registry and outer-pipeline continuation
//!
//! A transform (ESP, AH, IPComp) implements [`Xform`]. The registry maps
//! each [`XformKind`] to one transform, is built once at start-up and is
//! read-only afterwards; it can be installed process-wide with
//! [`XformRegistry::install`].
//!
//! `Xform::input` and `Xform::output` never block: they validate the
//! packet, dispatch the crypto job and return. The completion runs later
//! on the tokio runtime and resumes the outer pipeline through an
//! [`XformSink`].

use super::{
    packet::Packet,
    sa::{SaState, SecAssoc, MAX_RESERVED_SPI},
    Error, Result,
};
use async_trait::async_trait;
use espx_platform::SecurityModule;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

static GLOBAL_REGISTRY: OnceCell<XformRegistry> = OnceCell::new();

/// Transform type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XformKind {
    /// Encapsulating Security Payload
    Esp,
    /// Authentication Header
    Ah,
    /// IP Payload Compression
    IpComp,
}

impl fmt::Display for XformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XformKind::Esp => f.write_str("esp"),
            XformKind::Ah => f.write_str("ah"),
            XformKind::IpComp => f.write_str("ipcomp"),
        }
    }
}

/// Execution domain (routing instance) a packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DomainTag(pub u32);

/// Packet handed to a transform by the outer pipeline
#[derive(Debug)]
pub struct XformRequest {
    /// SA the packet is processed under
    pub sa: Arc<SecAssoc>,
    /// Whole packet, outer header included
    pub packet: Packet,
    /// Offset of the ESP header (end of the outer header on output)
    pub skip: usize,
    /// Offset of the outer header's next-protocol byte
    pub protoff: usize,
    /// Execution domain of the caller
    pub domain: DomainTag,
}

/// Decrypted packet returned to the outer pipeline
#[derive(Debug)]
pub struct DecryptedPacket {
    /// SA the packet was received on
    pub sa: Arc<SecAssoc>,
    /// Packet with the ESP header, IV, trailer and ICV removed
    pub packet: Packet,
    /// Offset where the inner payload starts
    pub skip: usize,
    /// Offset of the restored next-protocol byte
    pub protoff: usize,
    /// Inner protocol
    pub next_proto: u8,
    /// Accepted sequence number
    pub seq: u64,
    /// Execution domain the packet was received in
    pub domain: DomainTag,
}

/// Encrypted packet ready to be sent
#[derive(Debug)]
pub struct EncryptedPacket {
    /// SA the packet was protected with
    pub sa: Arc<SecAssoc>,
    /// Wire packet
    pub packet: Packet,
    /// Offset of the ESP header
    pub skip: usize,
    /// Sequence number assigned
    pub seq: u64,
    /// Execution domain the packet was sent from
    pub domain: DomainTag,
}

/// Outer-pipeline continuation
#[async_trait]
pub trait XformSink: Send + Sync {
    /// Resume IPv4 input processing
    async fn deliver_inet(&self, packet: DecryptedPacket);

    /// Resume IPv6 input processing
    async fn deliver_inet6(&self, packet: DecryptedPacket);

    /// Hand an encrypted packet to the send path
    async fn output_done(&self, packet: EncryptedPacket);

    /// Notification that a dispatched packet failed on completion
    ///
    /// Rejections before dispatch are returned by `input`/`output`
    /// instead. Dummy packets (next header 59) are valid traffic and
    /// are discarded without a notification.
    async fn dropped(&self, _spi: u32, _err: &Error) {}
}

/// A packet transform
pub trait Xform: SecurityModule {
    /// Transform type served
    fn kind(&self) -> XformKind;

    /// Resolve SA parameters and open its crypto session
    fn init_sa(&self, sa: &mut SecAssoc) -> Result<()>;

    /// Release the crypto session and retire the SA
    fn zeroize_sa(&self, sa: &SecAssoc) -> Result<()>;

    /// Start inbound processing
    ///
    /// A packet rejected before dispatch is returned as `Err` and never
    /// reaches `sink`; afterwards the outcome is delivered to `sink`.
    fn input(&self, req: XformRequest, sink: Arc<dyn XformSink>) -> Result<()>;

    /// Start outbound processing
    ///
    /// Same reporting split as [`Xform::input`].
    fn output(&self, req: XformRequest, sink: Arc<dyn XformSink>) -> Result<()>;
}

/// Mapping from transform type to transform
pub struct XformRegistry {
    xforms: HashMap<XformKind, Arc<dyn Xform>>,
}

impl XformRegistry {
    /// Create builder for a registry
    pub fn builder() -> XformRegistryBuilder {
        XformRegistryBuilder::default()
    }

    /// Transform registered for `kind`
    pub fn get(&self, kind: XformKind) -> Result<Arc<dyn Xform>> {
        self.xforms
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::NoXform(kind.to_string()))
    }

    /// Registered transform types
    pub fn kinds(&self) -> Vec<XformKind> {
        self.xforms.keys().copied().collect()
    }

    /// Initialise a larval SA with the transform for `kind`
    ///
    /// Rejects reserved SPIs, runs the transform's `init_sa`, attaches the
    /// transform and marks the SA mature.
    pub fn init_sa(&self, kind: XformKind, sa: &mut SecAssoc) -> Result<()> {
        if sa.spi() <= MAX_RESERVED_SPI {
            return Err(Error::InvalidSpi(sa.spi()));
        }
        if sa.state() != SaState::Larval {
            return Err(Error::InvalidState(format!(
                "SA 0x{:08x} is {:?}, expected Larval",
                sa.spi(),
                sa.state()
            )));
        }

        let xform = self.get(kind)?;
        xform.init_sa(sa)?;
        sa.attach_xform(xform);
        sa.set_state(SaState::Mature);
        Ok(())
    }

    /// Install as the process-wide registry
    ///
    /// Can only succeed once per process.
    pub fn install(self) -> Result<&'static XformRegistry> {
        GLOBAL_REGISTRY
            .set(self)
            .map_err(|_| Error::InvalidState("transform registry already installed".into()))?;
        GLOBAL_REGISTRY
            .get()
            .ok_or_else(|| Error::Internal("transform registry vanished".into()))
    }

    /// The process-wide registry, if installed
    pub fn global() -> Option<&'static XformRegistry> {
        GLOBAL_REGISTRY.get()
    }
}

impl fmt::Debug for XformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XformRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Builder for XformRegistry
#[derive(Default)]
pub struct XformRegistryBuilder {
    xforms: Vec<Box<dyn Xform>>,
}

impl XformRegistryBuilder {
    /// Register a transform under its own kind
    pub fn with_xform<X: Xform + 'static>(mut self, xform: X) -> Self {
        self.xforms.push(Box::new(xform));
        self
    }

    /// Initialise every module and build the registry
    pub fn build(self) -> Result<XformRegistry> {
        let mut xforms: HashMap<XformKind, Arc<dyn Xform>> = HashMap::new();

        for mut xform in self.xforms {
            let kind = xform.kind();
            if xforms.contains_key(&kind) {
                return Err(Error::Config(format!("transform {} registered twice", kind)));
            }
            xform
                .init()
                .map_err(|e| Error::Config(format!("{} init failed: {}", xform.id(), e)))?;
            xforms.insert(kind, Arc::from(xform));
        }

        Ok(XformRegistry { xforms })
    }
}
