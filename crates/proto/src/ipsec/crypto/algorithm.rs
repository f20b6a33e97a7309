//! Cipher and integrity algorithm descriptors for ESP
//!
//! Each descriptor carries the parameters the transform needs to lay out a
//! packet (block sizes, IV and digest lengths, key ranges). The actual
//! primitives live behind the crypto engine.
//!
//! # References
//!
//! - [RFC 3602](https://datatracker.ietf.org/doc/html/rfc3602) - AES-CBC for ESP
//! - [RFC 3686](https://datatracker.ietf.org/doc/html/rfc3686) - AES-CTR for ESP
//! - [RFC 4106](https://datatracker.ietf.org/doc/html/rfc4106) - AES-GCM for ESP
//! - [RFC 7634](https://datatracker.ietf.org/doc/html/rfc7634) - ChaCha20-Poly1305 for ESP
//! - [RFC 4868](https://datatracker.ietf.org/doc/html/rfc4868) - HMAC-SHA-256/384/512

use crate::ipsec::{Error, Result};
use std::fmt;

/// AEAD tag length used by every supported AEAD cipher
pub const AEAD_TAG_LEN: usize = 16;

/// Encryption algorithm of an ESP Security Association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncAlgorithm {
    /// NULL encryption (RFC 2410), integrity only
    Null,
    /// AES in CBC mode with explicit random IV
    AesCbc,
    /// AES in counter mode
    AesCtr,
    /// AES-GCM with 16-byte ICV (AEAD)
    AesGcm16,
    /// ChaCha20-Poly1305 (AEAD)
    ChaCha20Poly1305,
}

impl EncAlgorithm {
    /// Algorithm name
    pub fn name(self) -> &'static str {
        match self {
            EncAlgorithm::Null => "null",
            EncAlgorithm::AesCbc => "aes-cbc",
            EncAlgorithm::AesCtr => "aes-ctr",
            EncAlgorithm::AesGcm16 => "aes-gcm-16",
            EncAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    /// Payload alignment required on input
    pub fn block_size(self) -> usize {
        match self {
            EncAlgorithm::Null => 4,
            EncAlgorithm::AesCbc => 16,
            EncAlgorithm::AesCtr | EncAlgorithm::AesGcm16 | EncAlgorithm::ChaCha20Poly1305 => 1,
        }
    }

    /// Block size of the underlying primitive
    pub fn native_block_size(self) -> usize {
        match self {
            EncAlgorithm::Null => 4,
            EncAlgorithm::AesCbc | EncAlgorithm::AesCtr | EncAlgorithm::AesGcm16 => 16,
            EncAlgorithm::ChaCha20Poly1305 => 64,
        }
    }

    /// Natural IV length in bytes
    pub fn iv_len(self) -> usize {
        match self {
            EncAlgorithm::Null => 0,
            EncAlgorithm::AesCbc => 16,
            EncAlgorithm::AesCtr | EncAlgorithm::AesGcm16 | EncAlgorithm::ChaCha20Poly1305 => 8,
        }
    }

    /// Minimum key length in bytes, salt excluded
    pub fn min_key_len(self) -> usize {
        match self {
            EncAlgorithm::Null => 0,
            EncAlgorithm::AesCbc | EncAlgorithm::AesCtr | EncAlgorithm::AesGcm16 => 16,
            EncAlgorithm::ChaCha20Poly1305 => 32,
        }
    }

    /// Maximum key length in bytes, salt excluded
    pub fn max_key_len(self) -> usize {
        match self {
            EncAlgorithm::Null => 256,
            _ => 32,
        }
    }

    /// Check if this is an AEAD cipher
    pub fn is_aead(self) -> bool {
        matches!(self, EncAlgorithm::AesGcm16 | EncAlgorithm::ChaCha20Poly1305)
    }

    /// Counter-style cipher: salt + 8-byte explicit IV
    pub fn is_counter_family(self) -> bool {
        matches!(
            self,
            EncAlgorithm::AesCtr | EncAlgorithm::AesGcm16 | EncAlgorithm::ChaCha20Poly1305
        )
    }

    /// Implicit salt carried at the tail of the key
    pub fn salt_len(self) -> usize {
        if self.is_counter_family() {
            4
        } else {
            0
        }
    }

    /// Whether the cipher IV ends with a 32-bit block counter
    pub fn uses_block_counter(self) -> bool {
        self == EncAlgorithm::AesCtr
    }

    /// Integrity algorithm implied by an AEAD cipher
    ///
    /// # Arguments
    ///
    /// * `key_len` - Cipher key length in bytes, salt excluded
    ///
    /// # Returns
    ///
    /// `None` for ciphers that are not AEAD.
    pub fn aead_companion(self, key_len: usize) -> Result<Option<AuthAlgorithm>> {
        match self {
            EncAlgorithm::AesGcm16 => match key_len {
                16 => Ok(Some(AuthAlgorithm::AesGmac128)),
                24 => Ok(Some(AuthAlgorithm::AesGmac192)),
                32 => Ok(Some(AuthAlgorithm::AesGmac256)),
                n => Err(Error::Config(format!(
                    "no GMAC variant for a {}-byte AES-GCM key",
                    n
                ))),
            },
            EncAlgorithm::ChaCha20Poly1305 => Ok(Some(AuthAlgorithm::Poly1305)),
            _ => Ok(None),
        }
    }
}

impl fmt::Display for EncAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Integrity algorithm of an ESP Security Association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum AuthAlgorithm {
    /// HMAC-SHA1 truncated to 96 bits (RFC 2404)
    HmacSha1_96,
    /// HMAC-SHA-256 truncated to 128 bits
    HmacSha256_128,
    /// HMAC-SHA-384 truncated to 192 bits
    HmacSha384_192,
    /// HMAC-SHA-512 truncated to 256 bits
    HmacSha512_256,
    /// GCM tag for 128-bit AES keys
    AesGmac128,
    /// GCM tag for 192-bit AES keys
    AesGmac192,
    /// GCM tag for 256-bit AES keys
    AesGmac256,
    /// Poly1305 tag of ChaCha20-Poly1305
    Poly1305,
}

impl AuthAlgorithm {
    /// Algorithm name
    pub fn name(self) -> &'static str {
        match self {
            AuthAlgorithm::HmacSha1_96 => "hmac-sha1-96",
            AuthAlgorithm::HmacSha256_128 => "hmac-sha2-256-128",
            AuthAlgorithm::HmacSha384_192 => "hmac-sha2-384-192",
            AuthAlgorithm::HmacSha512_256 => "hmac-sha2-512-256",
            AuthAlgorithm::AesGmac128 => "aes-gmac-128",
            AuthAlgorithm::AesGmac192 => "aes-gmac-192",
            AuthAlgorithm::AesGmac256 => "aes-gmac-256",
            AuthAlgorithm::Poly1305 => "poly1305",
        }
    }

    /// ICV length on the wire
    pub fn digest_len(self) -> usize {
        match self {
            AuthAlgorithm::HmacSha1_96 => 12,
            AuthAlgorithm::HmacSha256_128 => 16,
            AuthAlgorithm::HmacSha384_192 => 24,
            AuthAlgorithm::HmacSha512_256 => 32,
            AuthAlgorithm::AesGmac128
            | AuthAlgorithm::AesGmac192
            | AuthAlgorithm::AesGmac256
            | AuthAlgorithm::Poly1305 => AEAD_TAG_LEN,
        }
    }

    /// Required key length (0 for AEAD companions, keyed by the cipher)
    pub fn key_len(self) -> usize {
        match self {
            AuthAlgorithm::HmacSha1_96 => 20,
            AuthAlgorithm::HmacSha256_128 => 32,
            AuthAlgorithm::HmacSha384_192 => 48,
            AuthAlgorithm::HmacSha512_256 => 64,
            _ => 0,
        }
    }

    /// Whether this algorithm only exists as half of an AEAD cipher
    pub fn is_aead_companion(self) -> bool {
        matches!(
            self,
            AuthAlgorithm::AesGmac128
                | AuthAlgorithm::AesGmac192
                | AuthAlgorithm::AesGmac256
                | AuthAlgorithm::Poly1305
        )
    }
}

impl fmt::Display for AuthAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
