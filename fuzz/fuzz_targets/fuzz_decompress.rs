//! Fuzz target for payload decompression.
//!
//! `maybe_decompress` must never panic on arbitrary input, and
//! `decode_payload` must reject anything whose hash does not match.

#![no_main]

use cluster_replication::sink::redis::{decode_payload, maybe_decompress};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = maybe_decompress(data);
    let _ = decode_payload(data, "");
});
