//! Crypto job construction shared by both directions

use crate::ipsec::{
    crypto::{Aad, CipherOp, CryptoJob, DigestOp},
    layout::{EspLayout, ESP_HDR_LEN},
    nonce::{counter_iv, explicit_iv, random_iv},
    packet::Packet,
    sa::SecAssoc,
    Result,
};

/// Build the job for a packet whose ESP header starts at `skip`
///
/// The buffer must already hold the ICV space at its tail.
pub(super) fn build_job(
    sa: &SecAssoc,
    layout: &EspLayout,
    buf: Packet,
    cipher: CipherOp,
    skip: usize,
    seq: u64,
    iv: Vec<u8>,
) -> CryptoJob {
    let enc = sa.enc();
    let esn = sa.flags().esn;
    let seq_hi = ((seq >> 32) as u32).to_be_bytes();

    let payload_start = skip + layout.header_len();
    let digest_start = buf.len().saturating_sub(layout.digest_len);
    let payload_len = digest_start.saturating_sub(payload_start);

    let digest = match (sa.auth(), cipher) {
        (None, _) => DigestOp::None,
        (Some(_), CipherOp::Encrypt) => DigestOp::Compute,
        (Some(_), CipherOp::Decrypt) => DigestOp::Verify,
    };

    let aad = if !enc.is_aead() {
        Aad::None
    } else if esn {
        // SPI | Seq-high | Seq-low
        let mut aad = Vec::with_capacity(12);
        aad.extend_from_slice(&sa.spi().to_be_bytes());
        aad.extend_from_slice(&seq_hi);
        aad.extend_from_slice(&(seq as u32).to_be_bytes());
        Aad::Detached(aad)
    } else {
        Aad::Region {
            start: skip,
            len: ESP_HDR_LEN,
        }
    };

    let esn_hi = (esn && !enc.is_aead() && sa.auth().is_some()).then_some(seq_hi);

    CryptoJob {
        session: sa.session_id(),
        cipher,
        digest,
        buf,
        payload_start,
        payload_len,
        aad,
        iv,
        auth_start: skip,
        digest_start,
        esn_hi,
    }
}

/// Cipher IV of an inbound packet
pub(super) fn input_iv(sa: &SecAssoc, layout: &EspLayout, buf: &Packet, skip: usize) -> Result<Vec<u8>> {
    let wire = buf.slice(skip + layout.hdr_len, layout.ivlen)?;
    if sa.enc().is_counter_family() {
        counter_iv(sa.enc(), sa.salt(), wire)
    } else {
        Ok(wire.to_vec())
    }
}

/// IV for an outbound packet: the wire bytes and the cipher IV
pub(super) fn output_iv(sa: &SecAssoc, layout: &EspLayout) -> Result<(Vec<u8>, Vec<u8>)> {
    if sa.enc().is_counter_family() {
        let explicit = explicit_iv(sa.next_iv_counter());
        let iv = counter_iv(sa.enc(), sa.salt(), &explicit)?;
        Ok((explicit.to_vec(), iv))
    } else {
        let iv = random_iv(layout.ivlen);
        Ok((iv.clone(), iv))
    }
}
