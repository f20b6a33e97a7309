//! Anti-Replay Protection for IPsec ESP
//!
//! Implements RFC 4303 Section 3.4.3 - Anti-Replay mechanism, with the
//! extended sequence number inference of RFC 4303 Appendix A.2.
//!
//! # Overview
//!
//! The anti-replay window prevents attackers from capturing and replaying
//! valid ESP packets. Each inbound SA maintains a sliding window of recently
//! received sequence numbers using a bitmap.
//!
//! Checking is split in two phases. [`ReplayWindow::check`] is a read-only
//! pre-check done before the packet is handed to the crypto engine;
//! [`ReplayWindow::update`] commits the number once the integrity check
//! passed, and re-validates it because another packet may have advanced the
//! window in between.
//!
//! # Bitmap Layout
//!
//! ```text
//! The bitmap is a ring of 64-bit words (RFC 6479). Sequence number `s` owns
//! bit (s mod ring_bits). Advancing the window clears only the words that
//! newly enter it, never shifts the whole map.
//!
//!   word:   [   0   ][   1   ][   2   ]
//!   seq:     0..63   64..127  128..191   (then wraps to word 0 at 192)
//!
//! Example:
//! - highest_seq = 100
//! - window_size = 64
//! - Valid range: [37, 100]
//! ```
//!
//! # References
//!
//! - [RFC 4303 Section 3.4.3](https://datatracker.ietf.org/doc/html/rfc4303#section-3.4.3)
//! - [RFC 6479](https://datatracker.ietf.org/doc/html/rfc6479)

/// Default anti-replay window size (64 packets)
///
/// RFC 4303 recommends a minimum window size of 32.
/// Common implementations use 64 for better protection.
pub const DEFAULT_WINDOW_SIZE: u32 = 64;

/// Minimum allowed window size
pub const MIN_WINDOW_SIZE: u32 = 32;

/// Maximum window size
pub const MAX_WINDOW_SIZE: u32 = 2048;

const WORD_BITS: u64 = u64::BITS as u64;

/// Anti-Replay Window
///
/// Tracks received sequence numbers using a sliding window with bitmap.
/// Used by inbound SAs to detect and reject replay attacks.
///
/// # Example
///
/// ```rust
/// use espx_proto::ipsec::replay::ReplayWindow;
///
/// let mut window = ReplayWindow::new(64);
///
/// // Accept new packet
/// assert!(window.check_and_update(1));
///
/// // Reject duplicate
/// assert!(!window.check_and_update(1));
///
/// // Accept newer packet
/// assert!(window.check_and_update(2));
/// ```
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    /// Highest sequence number received so far (full 64 bits under ESN)
    highest_seq: u64,

    /// Ring of words, one bit per sequence number
    bitmap: Vec<u64>,

    /// Window size (number of packets to track)
    window_size: u32,

    /// Extended sequence numbers in use
    esn: bool,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl ReplayWindow {
    /// Create new anti-replay window for 32-bit sequence numbers
    ///
    /// # Panics
    ///
    /// Panics if window_size is outside valid range
    pub fn new(window_size: u32) -> Self {
        Self::with_esn(window_size, false)
    }

    /// Create new anti-replay window, optionally tracking extended
    /// (64-bit) sequence numbers
    ///
    /// # Panics
    ///
    /// Panics if window_size is outside valid range
    pub fn with_esn(window_size: u32, esn: bool) -> Self {
        assert!(
            (MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&window_size),
            "Window size must be between {} and {}",
            MIN_WINDOW_SIZE,
            MAX_WINDOW_SIZE
        );

        // One spare word so the oldest partially-valid word never aliases
        // the word being cleared for the newest numbers.
        let words = (window_size as usize + WORD_BITS as usize - 1) / WORD_BITS as usize + 1;

        ReplayWindow {
            highest_seq: 0,
            bitmap: vec![0; words],
            window_size,
            esn,
        }
    }

    /// Reconstruct the full sequence number from the 32 bits on the wire
    ///
    /// Without ESN this is the wire value. With ESN the high-order half is
    /// inferred from the window position (RFC 4303 Appendix A.2).
    pub fn infer_seq(&self, seq_lo: u32) -> u64 {
        if !self.esn {
            return seq_lo as u64;
        }

        let w = self.window_size as u64;
        let top_lo = self.highest_seq & 0xffff_ffff;
        let top_hi = self.highest_seq >> 32;
        let seq_lo = seq_lo as u64;

        let seq_hi = if top_lo >= w - 1 {
            // Window lies within one subspace
            if seq_lo >= top_lo - (w - 1) {
                top_hi
            } else {
                (top_hi + 1) & 0xffff_ffff
            }
        } else {
            // Window spans two subspaces
            let bottom = top_lo.wrapping_sub(w - 1) & 0xffff_ffff;
            if seq_lo >= bottom {
                top_hi.checked_sub(1).unwrap_or(top_hi)
            } else {
                top_hi
            }
        };

        (seq_hi << 32) | seq_lo
    }

    /// Pre-check a wire sequence number without touching the window
    ///
    /// Returns the full sequence number when the packet may proceed to
    /// integrity verification, `None` when it is a duplicate, too old, or 0.
    pub fn check(&self, seq_lo: u32) -> Option<u64> {
        let seq = self.infer_seq(seq_lo);
        self.is_acceptable(seq).then_some(seq)
    }

    /// Commit a verified sequence number
    ///
    /// Returns `false` if the number became unacceptable since the
    /// pre-check (another packet with the same number won the race, or
    /// the window moved past it).
    pub fn update(&mut self, seq: u64) -> bool {
        if !self.is_acceptable(seq) {
            return false;
        }

        if seq > self.highest_seq {
            self.advance(seq);
        }

        let (word, mask) = self.slot(seq);
        self.bitmap[word] |= mask;
        true
    }

    /// Check sequence number and update window if valid
    ///
    /// Single-phase variant of [`check`](Self::check) followed by
    /// [`update`](Self::update) for callers that verify nothing in between.
    pub fn check_and_update(&mut self, seq: u64) -> bool {
        self.update(seq)
    }

    /// Whether `seq` is recorded as received
    pub fn has_seen(&self, seq: u64) -> bool {
        if seq == 0 || seq > self.highest_seq || self.highest_seq - seq >= self.window_size as u64
        {
            return false;
        }
        let (word, mask) = self.slot(seq);
        self.bitmap[word] & mask != 0
    }

    /// Get highest sequence number received
    pub fn highest_seq(&self) -> u64 {
        self.highest_seq
    }

    /// Get window size
    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    /// Whether the window tracks extended sequence numbers
    pub fn is_esn(&self) -> bool {
        self.esn
    }

    /// Reset window to initial state
    pub fn reset(&mut self) {
        self.highest_seq = 0;
        self.bitmap.iter_mut().for_each(|w| *w = 0);
    }

    fn is_acceptable(&self, seq: u64) -> bool {
        // RFC 4303: sequence number 0 is never transmitted
        if seq == 0 {
            return false;
        }

        if seq > self.highest_seq {
            return true;
        }

        // Window of size N accepts [highest_seq - (N-1), highest_seq]
        let diff = self.highest_seq - seq;
        if diff >= self.window_size as u64 {
            return false;
        }

        let (word, mask) = self.slot(seq);
        self.bitmap[word] & mask == 0
    }

    fn advance(&mut self, seq: u64) {
        let words = self.bitmap.len() as u64;
        let current = self.highest_seq / WORD_BITS;
        let target = seq / WORD_BITS;
        let delta = target - current;

        if delta >= words {
            self.bitmap.iter_mut().for_each(|w| *w = 0);
        } else {
            for i in 1..=delta {
                self.bitmap[((current + i) % words) as usize] = 0;
            }
        }

        self.highest_seq = seq;
    }

    fn slot(&self, seq: u64) -> (usize, u64) {
        let ring_bits = self.bitmap.len() as u64 * WORD_BITS;
        let index = seq % ring_bits;
        ((index / WORD_BITS) as usize, 1u64 << (index % WORD_BITS))
    }
}
