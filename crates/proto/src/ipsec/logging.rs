//! Structured logging for ESP operations
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! SPIs are rendered as hex so they line up with `setkey`/`ip xfrm` output.
//!
//! # Log Levels
//!
//! - **DEBUG**: Per-packet processing, sequence numbers
//! - **INFO**: SA initialisation and teardown
//! - **WARN**: Replay rejects, session rebinds, dummy packets, drops
//! - **ERROR**: Authentication failures
//!
//! # Example
//!
//! ```no_run
//! use espx_proto::ipsec::logging;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter("espx_proto::ipsec=debug")
//!     .init();
//!
//! logging::log_esp_packet("encrypt", 0x1234_5678, 1, 1400);
//! ```

use super::{xform::DomainTag, Error};
use tracing::{debug, error, info, warn, Span};

fn spi_hex(spi: u32) -> String {
    hex::encode(spi.to_be_bytes())
}

/// Span the completion of one packet runs in
///
/// Carries the execution domain recorded when the packet was dispatched,
/// so everything logged after the crypto engine returns is attributed to
/// the right domain.
pub fn completion_span(operation: &'static str, spi: u32, domain: DomainTag) -> Span {
    tracing::debug_span!(
        "esp_completion",
        operation = operation,
        spi = %spi_hex(spi),
        domain = domain.0
    )
}

/// Log ESP packet processing
///
/// # Arguments
///
/// * `operation` - "encrypt" or "decrypt"
/// * `spi` - ESP Security Parameter Index
/// * `seq` - Sequence number (full 64 bits under ESN)
/// * `payload_len` - Payload length in bytes
pub fn log_esp_packet(operation: &str, spi: u32, seq: u64, payload_len: usize) {
    debug!(
        operation = operation,
        spi = %spi_hex(spi),
        seq_num = seq,
        payload_len = payload_len,
        "ESP packet processed"
    );
}

/// Log SA initialisation
pub fn log_sa_init(spi: u32, enc: &str, auth: Option<&str>, ivlen: usize) {
    info!(
        spi = %spi_hex(spi),
        enc = enc,
        auth = auth.unwrap_or("none"),
        ivlen = ivlen,
        "ESP SA initialised"
    );
}

/// Log SA teardown
pub fn log_sa_zeroize(spi: u32) {
    info!(spi = %spi_hex(spi), "ESP SA zeroized");
}

/// Log replay detection
///
/// # Arguments
///
/// * `spi` - SA SPI
/// * `seq` - Sequence number that triggered replay detection
pub fn log_replay_detected(spi: u32, seq: u64) {
    warn!(
        spi = %spi_hex(spi),
        seq_num = seq,
        "Replay attack detected - packet rejected"
    );
}

/// Log ICV mismatch
pub fn log_auth_failed(spi: u32, reason: &str) {
    error!(
        spi = %spi_hex(spi),
        reason = reason,
        "ESP authentication failed"
    );
}

/// Log crypto session rebind after migration
///
/// # Arguments
///
/// * `won` - Whether this packet installed the new session
pub fn log_session_rebind(spi: u32, old: u64, new: u64, won: bool) {
    warn!(
        spi = %spi_hex(spi),
        old_session = old,
        new_session = new,
        installed = won,
        "Crypto session migrated, retrying job"
    );
}

/// Log dummy packet discard
pub fn log_dummy_discarded(spi: u32, seq: u64) {
    warn!(
        spi = %spi_hex(spi),
        seq_num = seq,
        "Dummy ESP packet discarded"
    );
}

/// Log a dropped packet
pub fn log_packet_dropped(spi: u32, err: &Error) {
    match err {
        Error::ReplayDetected(seq) => log_replay_detected(spi, *seq),
        Error::AuthenticationFailed(reason) => log_auth_failed(spi, reason),
        _ => warn!(spi = %spi_hex(spi), error = %err, "ESP packet dropped"),
    }
}

/// Log generic error with context
///
/// # Arguments
///
/// * `context` - Context where error occurred (e.g., "ESP init")
/// * `error` - Error message
pub fn log_error(context: &str, error: &str) {
    error!(context = context, error = error, "ESP error occurred");
}
