// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write-ahead-log data model and file access.
//!
//! Each source node appends mutations to an ordered sequence of WAL files.
//! Exactly one file per node is *active* (still being appended to); older
//! files are *closed* and immutable. Replication reads these files, it never
//! writes them. [`WalWriter`] exists for storage engines embedding this crate
//! (and for tests).
//!
//! # On-disk format
//!
//! ```text
//! ┌──────────┬──────────┬─────────────────────────┐
//! │ len: u32 │ crc: u32 │ payload (JSON WalEntry) │  repeated
//! └──────────┴──────────┴─────────────────────────┘
//! ```
//!
//! See [`record`] for framing details and corruption handling.

pub mod reader;
pub mod record;
pub mod writer;

pub use reader::WalReader;
pub use writer::WalWriter;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Per column-family replication scope.
///
/// Only cells in `Global` families ever leave the source cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationScope {
    /// Never replicated.
    #[default]
    Local,
    /// Replicated to every enabled peer.
    Global,
}

/// Kind of mutation a cell carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Put,
    /// Delete one column (row, family, qualifier).
    Delete,
    /// Delete every column of the row in this family.
    DeleteFamily,
}

/// One versioned cell mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub row: Vec<u8>,
    pub family: String,
    pub qualifier: Vec<u8>,
    pub timestamp: i64,
    pub kind: CellKind,
    #[serde(default)]
    pub value: Vec<u8>,
}

impl Cell {
    pub fn put(
        row: impl Into<Vec<u8>>,
        family: impl Into<String>,
        qualifier: impl Into<Vec<u8>>,
        timestamp: i64,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            timestamp,
            kind: CellKind::Put,
            value: value.into(),
        }
    }

    pub fn delete_family(row: impl Into<Vec<u8>>, family: impl Into<String>, timestamp: i64) -> Self {
        Self {
            row: row.into(),
            family: family.into(),
            qualifier: Vec::new(),
            timestamp,
            kind: CellKind::DeleteFamily,
            value: Vec::new(),
        }
    }

    /// Approximate in-memory footprint, used for batch size accounting.
    pub fn heap_size(&self) -> usize {
        // Fixed overhead for timestamp, kind and the three Vec headers
        const CELL_OVERHEAD: usize = 48;
        CELL_OVERHEAD + self.row.len() + self.family.len() + self.qualifier.len() + self.value.len()
    }
}

/// One WAL record: the cells of a single write to one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub table: String,
    /// Monotonic per-node write sequence.
    pub sequence_id: u64,
    /// Wall-clock time of the write, millis since epoch.
    pub write_time: i64,
    pub cells: Vec<Cell>,
}

impl WalEntry {
    pub fn heap_size(&self) -> usize {
        const ENTRY_OVERHEAD: usize = 64;
        ENTRY_OVERHEAD + self.table.len() + self.cells.iter().map(Cell::heap_size).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Identifies one WAL file of a node. Files order by `seq`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WalFileRef {
    pub seq: u64,
    pub path: PathBuf,
}

impl WalFileRef {
    pub fn new(seq: u64, path: impl Into<PathBuf>) -> Self {
        Self {
            seq,
            path: path.into(),
        }
    }
}

/// A read position: byte offset within a WAL file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogPosition {
    pub file_seq: u64,
    pub offset: u64,
}

impl std::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_seq, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_default_is_local() {
        assert_eq!(ReplicationScope::default(), ReplicationScope::Local);
        let json = serde_json::to_string(&ReplicationScope::Global).unwrap();
        assert_eq!(json, "\"global\"");
    }

    #[test]
    fn test_entry_heap_size_grows_with_value() {
        let small = WalEntry {
            table: "test".into(),
            sequence_id: 1,
            write_time: 0,
            cells: vec![Cell::put("row", "f", "q", 1, vec![0u8; 10])],
        };
        let mut large = small.clone();
        large.cells[0].value = vec![0u8; 1000];

        assert_eq!(large.heap_size() - small.heap_size(), 990);
    }

    #[test]
    fn test_file_ref_orders_by_seq() {
        let mut files = vec![
            WalFileRef::new(3, "/wal/c"),
            WalFileRef::new(1, "/wal/z"),
            WalFileRef::new(2, "/wal/a"),
        ];
        files.sort();
        let seqs: Vec<u64> = files.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_log_position_display() {
        let pos = LogPosition {
            file_seq: 4,
            offset: 128,
        };
        assert_eq!(pos.to_string(), "4:128");
    }
}
