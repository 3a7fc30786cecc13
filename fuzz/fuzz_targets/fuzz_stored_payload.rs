//! Fuzz target for decoding stored change payloads.
//!
//! The job table keeps each change as JSON. A corrupted row must decode to
//! an error, never a panic, and a decoded change must re-encode to itself.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replication_dispatcher::Change;

fuzz_target!(|data: &[u8]| {
    if let Ok(change) = serde_json::from_slice::<Change>(data) {
        let encoded = serde_json::to_vec(&change).unwrap();
        let decoded: Change = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, change);
    }
});
