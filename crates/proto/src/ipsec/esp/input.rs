//! ESP inbound processing

use super::{job, EspXform, XformContext};
use crate::ipsec::{
    crypto::{CipherOp, PendingJob},
    layout::{EspLayout, ESP_OLD_HDR_LEN, ESP_TRAILER_LEN},
    logging,
    packet::IPPROTO_NONE,
    sa::PadPolicy,
    xform::{DecryptedPacket, DomainTag, XformRequest},
    Error, Result,
};

/// ESP trailer fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    /// Number of padding bytes before the trailer
    pub pad_len: usize,
    /// Protocol of the protected payload
    pub next_proto: u8,
}

/// Parse and check the trailer at the end of a decrypted payload
///
/// `payload` runs from the start of the plaintext to the end of the
/// trailer (ICV already removed). Pad contents are checked against
/// `policy` through the last pad byte; a zero pad length skips the check.
pub fn parse_trailer(payload: &[u8], policy: PadPolicy) -> Result<Trailer> {
    let len = payload.len();
    if len < ESP_TRAILER_LEN {
        return Err(Error::InvalidPadding {
            pad_len: 0,
            available: 0,
        });
    }

    let pad_len = payload[len - 2] as usize;
    let next_proto = payload[len - 1];
    let available = len - ESP_TRAILER_LEN;

    if pad_len > available {
        return Err(Error::InvalidPadding { pad_len, available });
    }

    if pad_len > 0 {
        let last = payload[len - 3];
        let valid = match policy {
            PadPolicy::Sequential => last as usize == pad_len,
            PadPolicy::Zero => last == 0,
            PadPolicy::Random => true,
        };
        if !valid {
            return Err(Error::InvalidPadding { pad_len, available });
        }
    }

    Ok(Trailer {
        pad_len,
        next_proto,
    })
}

/// Inbound packet waiting for the crypto engine
#[derive(Debug)]
pub struct PendingInput {
    ctx: XformContext,
    job: PendingJob,
}

impl PendingInput {
    /// SPI of the packet
    pub fn spi(&self) -> u32 {
        self.ctx.sa.spi()
    }

    /// Sequence number, full 64 bits under ESN
    pub fn seq(&self) -> u64 {
        self.ctx.seq
    }

    /// Execution domain recorded at dispatch
    pub fn domain(&self) -> DomainTag {
        self.ctx.domain
    }
}

/// Result of inbound processing
#[derive(Debug)]
pub enum InputDisposition {
    /// Payload for the outer pipeline
    Deliver(DecryptedPacket),
    /// Dummy packet (next header 59), discarded
    Dummy,
}

impl EspXform {
    /// Validate an inbound packet and dispatch its decryption
    ///
    /// Does not block. The packet is consumed on failure.
    pub fn begin_input(&self, req: XformRequest) -> Result<PendingInput> {
        let spi = req.sa.spi();
        self.metrics.record_input();
        self.start_input(req).map_err(|e| self.fail(spi, e))
    }

    /// Complete a dispatched decryption
    pub async fn finish_input(&self, pending: PendingInput) -> Result<InputDisposition> {
        let spi = pending.spi();
        self.complete_input(pending)
            .await
            .map_err(|e| self.fail(spi, e))
    }

    fn start_input(&self, req: XformRequest) -> Result<PendingInput> {
        let XformRequest {
            sa,
            packet,
            skip,
            protoff,
            domain,
        } = req;

        self.check_usable(&sa)?;

        if skip % 4 != 0 || packet.len() % 4 != 0 {
            return Err(Error::Misaligned {
                offset: skip,
                len: packet.len(),
            });
        }
        if protoff >= skip {
            return Err(Error::Internal(format!(
                "next-protocol offset {} outside the {}-byte outer header",
                protoff, skip
            )));
        }

        let layout = EspLayout::for_sa(&sa);
        layout.payload_len(packet.len(), skip)?;

        let spi = packet.read_u32(skip)?;
        if spi != sa.spi() {
            return Err(Error::InvalidSpi(spi));
        }

        let seq = if layout.hdr_len == ESP_OLD_HDR_LEN {
            0
        } else {
            let wire = packet.read_u32(skip + ESP_OLD_HDR_LEN)?;
            match sa.replay() {
                Some(window) => {
                    let window = window.read();
                    window
                        .check(wire)
                        .ok_or_else(|| Error::ReplayDetected(window.infer_seq(wire)))?
                }
                None => wire as u64,
            }
        };

        let iv = job::input_iv(&sa, &layout, &packet, skip)?;
        let job = job::build_job(&sa, &layout, packet, CipherOp::Decrypt, skip, seq, iv);

        let ctx = XformContext {
            session: job.session,
            sa,
            layout,
            skip,
            protoff,
            seq,
            domain,
            _inflight: self.metrics.inflight_guard(),
        };
        let job = self.engine.dispatch(job)?;

        Ok(PendingInput { ctx, job })
    }

    async fn complete_input(&self, pending: PendingInput) -> Result<InputDisposition> {
        let PendingInput { ctx, job } = pending;
        let completed = self.complete_job(&ctx, job).await?;
        super::job_result(&completed.status)?;

        let sa = ctx.sa.clone();
        if !sa.is_alive() {
            return Err(Error::InvalidState(format!(
                "SA 0x{:08x} went away during decryption",
                sa.spi()
            )));
        }

        if let Some(window) = sa.replay() {
            if !window.write().update(ctx.seq) {
                return Err(Error::ReplayDetected(ctx.seq));
            }
        }

        let mut packet = completed.job.buf;
        packet.truncate(packet.len().saturating_sub(ctx.layout.digest_len));
        packet.remove(ctx.skip, ctx.layout.header_len())?;

        let trailer = parse_trailer(
            packet.slice(ctx.skip, packet.len() - ctx.skip)?,
            sa.flags().pad,
        )?;
        let payload_len = packet.len() - ctx.skip - ESP_TRAILER_LEN - trailer.pad_len;

        sa.record_packet(payload_len);
        self.metrics.record_decrypted(payload_len);

        if trailer.next_proto == IPPROTO_NONE {
            self.metrics.record_dummy();
            logging::log_dummy_discarded(sa.spi(), ctx.seq);
            return Ok(InputDisposition::Dummy);
        }

        packet.truncate(ctx.skip + payload_len);
        packet.write_u8(ctx.protoff, trailer.next_proto)?;

        logging::log_esp_packet("decrypt", sa.spi(), ctx.seq, payload_len);

        Ok(InputDisposition::Deliver(DecryptedPacket {
            sa,
            packet,
            skip: ctx.skip,
            protoff: ctx.protoff,
            next_proto: trailer.next_proto,
            seq: ctx.seq,
            domain: ctx.domain,
        }))
    }
}
