//! Fuzz target for WAL record framing.
//!
//! Arbitrary bytes fed to the frame decoder must yield Complete, Incomplete
//! or Corrupt, never a panic, and a Complete frame must stay in bounds.

#![no_main]

use cluster_replication::wal::record::{decode_entry, decode_frame, Decoded};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut rest = data;
    while let Decoded::Complete { payload, consumed } = decode_frame(rest) {
        assert!(consumed <= rest.len());
        let _ = decode_entry(payload);
        rest = &rest[consumed..];
    }
});
