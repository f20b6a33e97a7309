//! ESP outbound processing

use super::{job, EspXform, XformContext};
use crate::ipsec::{
    crypto::{CipherOp, PendingJob},
    layout::{EspLayout, ESP_OLD_HDR_LEN, ESP_TRAILER_LEN},
    logging,
    packet::IPPROTO_ESP,
    sa::PadPolicy,
    xform::{DomainTag, EncryptedPacket, XformRequest},
    Error, Result,
};
use rand::RngCore;

/// Self-describing padding bytes for `policy`
pub(super) fn pad_bytes(len: usize, policy: PadPolicy) -> Vec<u8> {
    match policy {
        PadPolicy::Sequential => (1..=len).map(|i| i as u8).collect(),
        PadPolicy::Zero => vec![0u8; len],
        PadPolicy::Random => {
            let mut pad = vec![0u8; len];
            rand::thread_rng().fill_bytes(&mut pad);
            pad
        }
    }
}

/// Outbound packet waiting for the crypto engine
#[derive(Debug)]
pub struct PendingOutput {
    ctx: XformContext,
    job: PendingJob,
}

impl PendingOutput {
    /// SPI of the packet
    pub fn spi(&self) -> u32 {
        self.ctx.sa.spi()
    }

    /// Sequence number assigned
    pub fn seq(&self) -> u64 {
        self.ctx.seq
    }

    /// Execution domain recorded at dispatch
    pub fn domain(&self) -> DomainTag {
        self.ctx.domain
    }
}

impl EspXform {
    /// Encapsulate an outbound packet and dispatch its encryption
    ///
    /// `skip` is the length of the outer header; the ESP header is inserted
    /// there. Packets that would exceed the family maximum are rejected
    /// before a sequence number is consumed.
    pub fn begin_output(&self, req: XformRequest) -> Result<PendingOutput> {
        let spi = req.sa.spi();
        self.start_output(req).map_err(|e| self.fail(spi, e))
    }

    /// Complete a dispatched encryption
    pub async fn finish_output(&self, pending: PendingOutput) -> Result<EncryptedPacket> {
        let spi = pending.spi();
        self.complete_output(pending)
            .await
            .map_err(|e| self.fail(spi, e))
    }

    fn start_output(&self, req: XformRequest) -> Result<PendingOutput> {
        let XformRequest {
            sa,
            mut packet,
            skip,
            protoff,
            domain,
        } = req;

        self.check_usable(&sa)?;

        if skip > packet.len() {
            return Err(Error::BufferTooShort {
                required: skip,
                available: packet.len(),
            });
        }
        if protoff >= skip {
            return Err(Error::Internal(format!(
                "next-protocol offset {} outside the {}-byte outer header",
                protoff, skip
            )));
        }

        let layout = EspLayout::for_sa(&sa);
        let raw_len = packet.len() - skip;
        let padding = layout.output_padding(raw_len);

        let size = skip + layout.header_len() + raw_len + padding + layout.digest_len;
        let max = packet.family().max_packet_size();
        if size > max {
            return Err(Error::MessageTooLarge { size, max });
        }

        let old_header = layout.hdr_len == ESP_OLD_HDR_LEN;
        let seq = if old_header { 0 } else { sa.next_seq()? };
        let next_proto = packet.read_u8(protoff)?;

        packet.insert(skip, layout.header_len())?;
        packet.write_u32(skip, sa.spi())?;
        if !old_header {
            packet.write_u32(skip + ESP_OLD_HDR_LEN, seq as u32)?;
        }

        let (wire_iv, iv) = job::output_iv(&sa, &layout)?;
        packet.write_slice(skip + layout.hdr_len, &wire_iv)?;

        let pad_len = padding - ESP_TRAILER_LEN;
        packet.extend(&pad_bytes(pad_len, sa.flags().pad));
        packet.extend(&[pad_len as u8, next_proto]);
        let tail = packet.len();
        packet.insert(tail, layout.digest_len)?;

        packet.write_u8(protoff, IPPROTO_ESP)?;

        let job = job::build_job(&sa, &layout, packet, CipherOp::Encrypt, skip, seq, iv);

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

        Ok(PendingOutput { ctx, job })
    }

    async fn complete_output(&self, pending: PendingOutput) -> Result<EncryptedPacket> {
        let PendingOutput { ctx, job } = pending;
        let completed = self.complete_job(&ctx, job).await?;
        super::job_result(&completed.status)?;

        if !ctx.sa.is_alive() {
            return Err(Error::InvalidState(format!(
                "SA 0x{:08x} went away during encryption",
                ctx.sa.spi()
            )));
        }

        let packet = completed.job.buf;
        let bytes = packet.len() - ctx.skip;
        ctx.sa.record_packet(bytes);
        self.metrics.record_output(bytes);

        logging::log_esp_packet("encrypt", ctx.sa.spi(), ctx.seq, bytes);

        Ok(EncryptedPacket {
            sa: ctx.sa.clone(),
            packet,
            skip: ctx.skip,
            seq: ctx.seq,
            domain: ctx.domain,
        })
    }
}
