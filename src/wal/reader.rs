// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sequential WAL file reader.
//!
//! A reader starts at a byte offset and yields entries until it reaches the
//! end of readable data. "Readable" is bounded by an optional `limit`: for
//! the active file this is the committed length reported by the storage
//! engine, so a half-written record is never observed.
//!
//! A partial record at the physical end of the file (a torn write left by a
//! crash) ends the read cleanly and sets [`WalReader::truncated`]. A record
//! whose checksum does not match is a hard [`ReplicationError::Wal`] error:
//! skipping it would silently drop edits.

use super::record::{self, Decoded, HEADER_LEN, MAX_RECORD_LEN};
use super::WalEntry;
use crate::error::{ReplicationError, Result};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, BufReader};
use tracing::{trace, warn};

pub struct WalReader {
    file: BufReader<File>,
    path: PathBuf,
    offset: u64,
    limit: Option<u64>,
    truncated: bool,
}

impl WalReader {
    /// Open `path` positioned at `offset`.
    ///
    /// A missing file surfaces as [`ReplicationError::Io`] with kind
    /// `NotFound`; callers decide whether that is a loss window or a bug.
    pub async fn open(path: impl AsRef<Path>, offset: u64, limit: Option<u64>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        Ok(Self {
            file: BufReader::new(file),
            path,
            offset,
            limit,
            truncated: false,
        })
    }

    /// Byte offset just past the last entry returned.
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Whether the last read stopped at a torn record.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the next entry, or `None` at the end of readable data.
    pub async fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        if let Some(limit) = self.limit {
            if self.offset + HEADER_LEN as u64 > limit {
                return Ok(None);
            }
        }

        let mut header = [0u8; HEADER_LEN];
        let got = read_fully(&mut self.file, &mut header).await?;
        if got == 0 {
            return Ok(None);
        }
        if got < HEADER_LEN {
            return self.torn_tail(got).await;
        }

        let (len, _) = record::parse_header(&header);
        let mut frame = header.to_vec();
        // An oversized length is left to decode_frame to reject
        if len <= MAX_RECORD_LEN {
            if let Some(limit) = self.limit {
                if self.offset + (HEADER_LEN + len) as u64 > limit {
                    // Not yet committed; rewind so the next call sees the header again
                    self.file.seek(SeekFrom::Start(self.offset)).await?;
                    return Ok(None);
                }
            }
            frame.resize(HEADER_LEN + len, 0);
            let got = read_fully(&mut self.file, &mut frame[HEADER_LEN..]).await?;
            frame.truncate(HEADER_LEN + got);
        }

        match record::decode_frame(&frame) {
            Decoded::Complete { payload, consumed } => {
                let entry = record::decode_entry(payload).map_err(|e| self.corrupt(e.to_string()))?;
                self.offset += consumed as u64;
                trace!(path = %self.path.display(), offset = self.offset, seq = entry.sequence_id, "Read WAL entry");
                Ok(Some(entry))
            }
            Decoded::Incomplete => self.torn_tail(frame.len()).await,
            Decoded::Corrupt(detail) => Err(self.corrupt(detail)),
        }
    }

    async fn torn_tail(&mut self, partial_bytes: usize) -> Result<Option<WalEntry>> {
        warn!(
            path = %self.path.display(),
            offset = self.offset,
            partial_bytes,
            "Truncated WAL record at end of file"
        );
        self.truncated = true;
        self.file.seek(SeekFrom::Start(self.offset)).await?;
        Ok(None)
    }

    fn corrupt(&self, detail: String) -> ReplicationError {
        ReplicationError::Wal(format!(
            "{} at offset {}: {}",
            self.path.display(),
            self.offset,
            detail
        ))
    }
}

/// Fill `buf` as far as the stream allows, returning the bytes read.
async fn read_fully<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
