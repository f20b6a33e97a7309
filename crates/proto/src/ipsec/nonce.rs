//! Per-packet IV construction
//!
//! Explicit-IV ciphers (CBC) carry a fresh random IV in every packet.
//! Counter-style ciphers carry only an 8-byte explicit counter on the
//! wire; the IV handed to the cipher is rebuilt identically on both ends:
//!
//! ```text
//! GCM / ChaCha20-Poly1305 (RFC 4106, RFC 7634):
//!   salt (4) | explicit IV (8)                      = 12 bytes
//!
//! CTR (RFC 3686):
//!   salt (4) | explicit IV (8) | block counter (4)  = 16 bytes
//!                                 starts at 1, big-endian
//! ```

use super::{crypto::EncAlgorithm, Error, Result};
use rand::RngCore;

/// Implicit salt length
pub const SALT_LEN: usize = 4;

/// Explicit IV carried on the wire by counter-style ciphers
pub const EXPLICIT_IV_LEN: usize = 8;

/// Initial CTR block counter
pub const CTR_INITIAL_BLOCK: u32 = 1;

/// Encode the per-SA counter as the explicit IV
pub fn explicit_iv(counter: u64) -> [u8; EXPLICIT_IV_LEN] {
    counter.to_be_bytes()
}

/// Build the cipher IV of a counter-style cipher
///
/// # Arguments
///
/// * `enc` - Cipher of the SA
/// * `salt` - Implicit salt from the key tail
/// * `explicit` - Explicit IV as carried in the packet
pub fn counter_iv(enc: EncAlgorithm, salt: &[u8], explicit: &[u8]) -> Result<Vec<u8>> {
    if salt.len() != SALT_LEN || explicit.len() != EXPLICIT_IV_LEN {
        return Err(Error::Internal(format!(
            "counter IV needs {}-byte salt and {}-byte explicit IV, got {} and {}",
            SALT_LEN,
            EXPLICIT_IV_LEN,
            salt.len(),
            explicit.len()
        )));
    }

    let mut iv = Vec::with_capacity(SALT_LEN + EXPLICIT_IV_LEN + 4);
    iv.extend_from_slice(salt);
    iv.extend_from_slice(explicit);
    if enc.uses_block_counter() {
        iv.extend_from_slice(&CTR_INITIAL_BLOCK.to_be_bytes());
    }
    Ok(iv)
}

/// Fresh random IV for explicit-IV ciphers
pub fn random_iv(len: usize) -> Vec<u8> {
    let mut iv = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}
