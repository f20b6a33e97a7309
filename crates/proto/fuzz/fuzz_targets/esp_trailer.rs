//! Fuzz target for ESP trailer parsing.
//!
//! This fuzzer feeds arbitrary decrypted payloads to the trailer parser
//! under every padding policy to find:
//! - Panics on short or inconsistent trailers
//! - Pad lengths that escape the payload
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run esp_trailer -- -max_total_time=300
//! ```

#![no_main]
use espx_proto::ipsec::{esp::parse_trailer, PadPolicy};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for policy in [PadPolicy::Sequential, PadPolicy::Zero, PadPolicy::Random] {
        if let Ok(trailer) = parse_trailer(data, policy) {
            // Accepted trailers always leave a non-negative payload
            assert!(trailer.pad_len + 2 <= data.len());
            assert_eq!(trailer.next_proto, data[data.len() - 1]);
        }
    }
});
