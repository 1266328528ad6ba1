// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Append-only WAL file writer.

use super::record::encode_entry;
use super::{WalEntry, WalFileRef};
use crate::error::Result;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// File name for a node's WAL file with sequence `seq`.
pub fn wal_file_name(node_id: &str, seq: u64) -> String {
    format!("{}.{:010}.wal", node_id, seq)
}

/// Writes framed entries to one WAL file. Each append is synced before it
/// returns, so the returned length is the committed length.
pub struct WalWriter {
    file: File,
    file_ref: WalFileRef,
    len: u64,
}

impl WalWriter {
    /// Create (or truncate) the WAL file for `node_id` / `seq` under `dir`.
    pub async fn create(dir: impl AsRef<Path>, node_id: &str, seq: u64) -> Result<Self> {
        let path: PathBuf = dir.as_ref().join(wal_file_name(node_id, seq));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        debug!(path = %path.display(), seq, "Created WAL file");

        Ok(Self {
            file,
            file_ref: WalFileRef::new(seq, path),
            len: 0,
        })
    }

    /// Append one entry and return the new committed length.
    pub async fn append(&mut self, entry: &WalEntry) -> Result<u64> {
        let frame = encode_entry(entry)?;
        self.file.write_all(&frame).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        self.len += frame.len() as u64;
        Ok(self.len)
    }

    pub fn file_ref(&self) -> &WalFileRef {
        &self.file_ref
    }

    /// Committed length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
