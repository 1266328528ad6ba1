// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! WAL record framing.
//!
//! Each record is `len (u32 LE) | crc32 (u32 LE) | payload`. The checksum
//! covers the payload only. Decoding distinguishes three outcomes:
//!
//! - **Complete**: a whole, verified record is available.
//! - **Incomplete**: the buffer ends mid-record. For the active file this is
//!   a write in progress, for a closed file it is a torn tail from a crash.
//! - **Corrupt**: the checksum or length is impossible. Never skipped.

use super::WalEntry;
use crate::error::{ReplicationError, Result};

/// Size of the `len | crc` header.
pub const HEADER_LEN: usize = 8;

/// Upper bound for one payload. Anything larger is treated as corruption.
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Outcome of decoding the start of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    Complete {
        payload: &'a [u8],
        /// Total bytes consumed, header included.
        consumed: usize,
    },
    Incomplete,
    Corrupt(String),
}

/// Parse the header into `(payload_len, crc)`.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> (usize, u32) {
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    (len, crc)
}

/// Frame a payload.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Decode the first record of `buf`.
pub fn decode_frame(buf: &[u8]) -> Decoded<'_> {
    if buf.len() < HEADER_LEN {
        return Decoded::Incomplete;
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&buf[..HEADER_LEN]);
    let (len, crc) = parse_header(&header);

    if len > MAX_RECORD_LEN {
        return Decoded::Corrupt(format!("record length {} exceeds maximum", len));
    }
    let end = HEADER_LEN + len;
    if buf.len() < end {
        return Decoded::Incomplete;
    }

    let payload = &buf[HEADER_LEN..end];
    let actual = crc32fast::hash(payload);
    if actual != crc {
        return Decoded::Corrupt(format!(
            "checksum mismatch: stored {:08x}, computed {:08x}",
            crc, actual
        ));
    }

    Decoded::Complete {
        payload,
        consumed: end,
    }
}

/// Serialize and frame one entry.
pub fn encode_entry(entry: &WalEntry) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(entry)
        .map_err(|e| ReplicationError::Wal(format!("encode entry: {}", e)))?;
    Ok(encode_frame(&payload))
}

/// Deserialize a verified payload.
pub fn decode_entry(payload: &[u8]) -> Result<WalEntry> {
    serde_json::from_slice(payload).map_err(|e| ReplicationError::Wal(format!("decode entry: {}", e)))
}
