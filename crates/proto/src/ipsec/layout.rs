//! ESP packet layout arithmetic
//!
//! # ESP Packet Format (RFC 4303)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ ----
//! |               Security Parameters Index (SPI)                 | ^Auth
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |Cov-
//! |                      Sequence Number                          | |erage
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ | ----
//! |                    IV (ivlen bytes)                           | |  ^
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |  |
//! |                    Payload Data (variable)                    | |  |
//! ~                                                               ~ |  |
//! |                                                               | |Conf.
//! +               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |Cov-
//! |               |     Padding (0-255 bytes)                     | |erage
//! +-+-+-+-+-+-+-+-+               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |  |
//! |                               |  Pad Length   | Next Header   | v  v
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ ----
//! |         Integrity Check Value-ICV   (variable)                |
//! ~                                                               ~
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The old (RFC 1827) format drops the sequence number word.

use super::{sa::SecAssoc, Error, Result};

/// Old-format header: SPI only
pub const ESP_OLD_HDR_LEN: usize = 4;

/// Header: SPI + sequence number
pub const ESP_HDR_LEN: usize = 8;

/// Pad length + next header
pub const ESP_TRAILER_LEN: usize = 2;

/// Largest pad length encodable in the trailer
pub const MAX_PAD_LEN: usize = 255;

/// Minimum output alignment (RFC 4303 Section 2.4)
pub const MIN_OUTPUT_ALIGN: usize = 4;

/// Per-SA ESP layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EspLayout {
    /// Fixed header length, IV excluded
    pub hdr_len: usize,
    /// IV length
    pub ivlen: usize,
    /// ICV length (0 without integrity)
    pub digest_len: usize,
    /// Ciphertext alignment required on input
    pub block_size: usize,
    /// Padding alignment used on output
    pub out_block_size: usize,
}

impl EspLayout {
    /// Compute the layout of an initialised SA
    pub fn for_sa(sa: &SecAssoc) -> Self {
        let enc = sa.enc();
        let flags = sa.flags();

        let hdr_len = if flags.old_header {
            ESP_OLD_HDR_LEN
        } else {
            ESP_HDR_LEN
        };

        let cipher_block = if flags.native_block {
            enc.native_block_size()
        } else {
            enc.block_size()
        };

        Self {
            hdr_len,
            ivlen: sa.ivlen(),
            digest_len: sa.digest_len(),
            block_size: enc.block_size(),
            out_block_size: cipher_block.max(MIN_OUTPUT_ALIGN),
        }
    }

    /// Header plus IV
    pub fn header_len(&self) -> usize {
        self.hdr_len + self.ivlen
    }

    /// Ciphertext length of an inbound packet
    ///
    /// # Arguments
    ///
    /// * `total` - Packet length
    /// * `skip` - Offset of the ESP header
    pub fn payload_len(&self, total: usize, skip: usize) -> Result<usize> {
        let required = skip + self.header_len() + self.digest_len;
        if total < required {
            return Err(Error::BufferTooShort {
                required,
                available: total,
            });
        }

        let len = total - required;
        if len == 0 || len % self.block_size != 0 {
            return Err(Error::BadPayloadLength {
                len,
                block_size: self.block_size,
            });
        }
        Ok(len)
    }

    /// Padding for an outbound payload, trailer included
    pub fn output_padding(&self, raw_len: usize) -> usize {
        calculate_padding(raw_len, self.out_block_size) + ESP_TRAILER_LEN
    }

    /// Worst-case bytes ESP adds to a packet
    pub fn max_overhead(&self) -> usize {
        self.header_len() + (self.out_block_size - 1) + ESP_TRAILER_LEN + self.digest_len
    }
}

/// Calculate padding length for ESP payload
///
/// RFC 4303 Section 2.4: Padding aligns `payload || padding || pad_len ||
/// next_header` to the block size.
///
/// # Arguments
///
/// * `payload_len` - Length of the plaintext payload
/// * `block_size` - Cipher block size
///
/// # Returns
///
/// Number of padding bytes, the two trailer bytes excluded
pub fn calculate_padding(payload_len: usize, block_size: usize) -> usize {
    let total_with_trailer = payload_len + ESP_TRAILER_LEN;
    let remainder = total_with_trailer % block_size;
    if remainder == 0 {
        0
    } else {
        block_size - remainder
    }
}

/// Maximum bytes ESP adds to a packet on this SA
pub fn esp_hdrsiz(sa: &SecAssoc) -> usize {
    EspLayout::for_sa(sa).max_overhead()
}
