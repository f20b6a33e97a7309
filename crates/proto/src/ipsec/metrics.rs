//! Metrics for ESP processing
//!
//! Provides counters for monitoring the ESP transform. All metrics use
//! atomic operations for thread-safe updates; a clone shares the same
//! counters.
//!
//! # Example
//!
//! ```
//! use espx_proto::ipsec::{metrics::EspMetrics, Error};
//!
//! let metrics = EspMetrics::new();
//!
//! metrics.record_output(1500);
//! metrics.record_error(&Error::ReplayDetected(7));
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.output, 1);
//! assert_eq!(snapshot.replay, 1);
//! ```

use super::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// ESP metrics for monitoring
#[derive(Debug, Clone)]
pub struct EspMetrics {
    /// Packets entering the input pipeline
    pub input: Arc<AtomicU64>,

    /// Packets leaving the output pipeline encrypted
    pub output: Arc<AtomicU64>,

    /// Bytes decrypted
    pub input_bytes: Arc<AtomicU64>,

    /// Bytes encrypted
    pub output_bytes: Arc<AtomicU64>,

    /// Header, alignment or length errors
    pub hdrops: Arc<AtomicU64>,

    /// Replay rejects
    pub replay: Arc<AtomicU64>,

    /// ICV mismatches
    pub auth_failures: Arc<AtomicU64>,

    /// Crypto engine failures
    pub crypto_failures: Arc<AtomicU64>,

    /// Lookups of unregistered transforms
    pub noxform: Arc<AtomicU64>,

    /// Packets dropped: disabled, dead SA, resource exhaustion
    pub pdrops: Arc<AtomicU64>,

    /// Packets that would exceed the family maximum
    pub toobig: Arc<AtomicU64>,

    /// Output sequence space exhausted
    pub wrap: Arc<AtomicU64>,

    /// Padding content mismatches
    pub badenc: Arc<AtomicU64>,

    /// Bad SPI or configuration
    pub invalid: Arc<AtomicU64>,

    /// Dummy packets (next header 59) discarded
    pub dummy: Arc<AtomicU64>,

    /// Crypto session rebinds after migration
    pub rebinds: Arc<AtomicU64>,

    /// Packets currently waiting for the crypto engine
    pub inflight: Arc<AtomicU64>,
}

impl EspMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self {
            input: Arc::new(AtomicU64::new(0)),
            output: Arc::new(AtomicU64::new(0)),
            input_bytes: Arc::new(AtomicU64::new(0)),
            output_bytes: Arc::new(AtomicU64::new(0)),
            hdrops: Arc::new(AtomicU64::new(0)),
            replay: Arc::new(AtomicU64::new(0)),
            auth_failures: Arc::new(AtomicU64::new(0)),
            crypto_failures: Arc::new(AtomicU64::new(0)),
            noxform: Arc::new(AtomicU64::new(0)),
            pdrops: Arc::new(AtomicU64::new(0)),
            toobig: Arc::new(AtomicU64::new(0)),
            wrap: Arc::new(AtomicU64::new(0)),
            badenc: Arc::new(AtomicU64::new(0)),
            invalid: Arc::new(AtomicU64::new(0)),
            dummy: Arc::new(AtomicU64::new(0)),
            rebinds: Arc::new(AtomicU64::new(0)),
            inflight: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record packet entering the input pipeline
    pub fn record_input(&self) {
        self.input.fetch_add(1, Ordering::Relaxed);
    }

    /// Record packet decrypted
    ///
    /// # Arguments
    ///
    /// * `bytes` - Number of bytes decrypted
    pub fn record_decrypted(&self, bytes: usize) {
        self.input_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record packet encrypted
    ///
    /// # Arguments
    ///
    /// * `bytes` - Number of bytes encrypted
    pub fn record_output(&self, bytes: usize) {
        self.output.fetch_add(1, Ordering::Relaxed);
        self.output_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record dummy packet discarded
    pub fn record_dummy(&self) {
        self.dummy.fetch_add(1, Ordering::Relaxed);
    }

    /// Record crypto session rebind
    pub fn record_rebind(&self) {
        self.rebinds.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed packet on the counter its error belongs to
    pub fn record_error(&self, err: &Error) {
        let counter = match err {
            Error::Misaligned { .. }
            | Error::BadPayloadLength { .. }
            | Error::BufferTooShort { .. } => &self.hdrops,
            Error::MessageTooLarge { .. } => &self.toobig,
            Error::ReplayDetected(_) => &self.replay,
            Error::SequenceOverflow(_) => &self.wrap,
            Error::AuthenticationFailed(_) => &self.auth_failures,
            Error::CryptoError(_) | Error::Internal(_) => &self.crypto_failures,
            Error::NoBufferSpace(_) | Error::Disabled | Error::InvalidState(_) => &self.pdrops,
            Error::InvalidPadding { .. } => &self.badenc,
            Error::NoXform(_) => &self.noxform,
            Error::Config(_) | Error::InvalidSpi(_) => &self.invalid,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inflight_guard(&self) -> InflightGuard {
        self.inflight.fetch_add(1, Ordering::Relaxed);
        InflightGuard {
            inflight: self.inflight.clone(),
        }
    }

    /// Get current metrics snapshot
    ///
    /// Values may be slightly inconsistent across metrics due to concurrent updates.
    pub fn snapshot(&self) -> EspMetricsSnapshot {
        EspMetricsSnapshot {
            input: self.input.load(Ordering::Relaxed),
            output: self.output.load(Ordering::Relaxed),
            input_bytes: self.input_bytes.load(Ordering::Relaxed),
            output_bytes: self.output_bytes.load(Ordering::Relaxed),
            hdrops: self.hdrops.load(Ordering::Relaxed),
            replay: self.replay.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            crypto_failures: self.crypto_failures.load(Ordering::Relaxed),
            noxform: self.noxform.load(Ordering::Relaxed),
            pdrops: self.pdrops.load(Ordering::Relaxed),
            toobig: self.toobig.load(Ordering::Relaxed),
            wrap: self.wrap.load(Ordering::Relaxed),
            badenc: self.badenc.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            dummy: self.dummy.load(Ordering::Relaxed),
            rebinds: self.rebinds.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
        }
    }
}

impl Default for EspMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts a packet as in flight until dropped
#[derive(Debug)]
pub(crate) struct InflightGuard {
    inflight: Arc<AtomicU64>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of all ESP metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EspMetricsSnapshot {
    /// Packets entering the input pipeline
    pub input: u64,
    /// Packets encrypted
    pub output: u64,
    /// Bytes decrypted
    pub input_bytes: u64,
    /// Bytes encrypted
    pub output_bytes: u64,
    /// Header, alignment or length errors
    pub hdrops: u64,
    /// Replay rejects
    pub replay: u64,
    /// ICV mismatches
    pub auth_failures: u64,
    /// Crypto engine failures
    pub crypto_failures: u64,
    /// Lookups of unregistered transforms
    pub noxform: u64,
    /// Packets dropped
    pub pdrops: u64,
    /// Packets too big
    pub toobig: u64,
    /// Sequence space exhausted
    pub wrap: u64,
    /// Padding content mismatches
    pub badenc: u64,
    /// Bad SPI or configuration
    pub invalid: u64,
    /// Dummy packets discarded
    pub dummy: u64,
    /// Crypto session rebinds
    pub rebinds: u64,
    /// Packets waiting for the crypto engine
    pub inflight: u64,
}
