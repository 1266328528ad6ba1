//! Batch assembly for shipping.
//!
//! Reads WAL entries from the current position until a byte budget or an
//! entry count is reached, dropping cells whose family is not globally
//! scoped along the way.
//!
//! # Design
//!
//! ```text
//! WalReader ──▶ next_entry() ──▶ filter_entry(schema) ──┬──▶ EditBatch.entries
//!                  │                                    │
//!                  │ counts toward nb_capacity          └──▶ (dropped: Local scope)
//!                  ▼
//!            heap_size counts toward size_capacity
//! ```
//!
//! Scope is looked up when the entry is read. Changing a family's scope later
//! does not revisit entries already read.
//!
//! The batch end position covers filtered-out entries too, so a batch with no
//! replicable edits still moves the queue forward once it is acknowledged
//! (or immediately, when there is nothing to ship).

use crate::error::Result;
use crate::storage::SchemaRef;
use crate::wal::{ReplicationScope, WalEntry, WalReader};
use tracing::{debug, warn};

/// Batch limits, from `SourceConfig`.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    /// Byte budget (sum of kept entries' heap sizes).
    pub size_capacity: usize,
    /// Maximum WAL entries read, kept or filtered.
    pub nb_capacity: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            size_capacity: 64 * 1024 * 1024,
            nb_capacity: 25_000,
        }
    }
}

/// Result of one read pass.
#[derive(Debug, Default)]
pub struct EditBatch {
    /// Replicable entries, WAL order.
    pub entries: Vec<WalEntry>,
    pub heap_size: usize,
    /// Entries read from the WAL, including filtered ones.
    pub entries_read: usize,
    pub start_offset: u64,
    pub end_offset: u64,
    /// Reached the end of readable data (vs. stopping at a limit).
    pub exhausted: bool,
    /// Stopped at a torn record.
    pub truncated: bool,
}

impl EditBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn filtered(&self) -> usize {
        self.entries_read - self.entries.len()
    }

    /// Whether reading moved past any bytes.
    pub fn made_progress(&self) -> bool {
        self.end_offset > self.start_offset
    }
}

/// Keep only the globally scoped cells of an entry.
///
/// Returns `None` if nothing in the entry is replicable.
pub fn filter_entry(mut entry: WalEntry, schema: &dyn SchemaRef) -> Option<WalEntry> {
    let table = entry.table.clone();
    entry
        .cells
        .retain(|cell| schema.family_scope(&table, &cell.family) == ReplicationScope::Global);
    if entry.cells.is_empty() {
        None
    } else {
        Some(entry)
    }
}

/// Read one batch from `reader`.
///
/// A corrupt record ends the batch early if entries were already read, so
/// that they still ship; the error surfaces on the next read from the same
/// position.
pub async fn read_batch(
    reader: &mut WalReader,
    schema: &dyn SchemaRef,
    limits: BatchLimits,
) -> Result<EditBatch> {
    let mut batch = EditBatch {
        start_offset: reader.position(),
        ..Default::default()
    };

    while batch.entries_read < limits.nb_capacity && batch.heap_size < limits.size_capacity {
        let entry = match reader.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                batch.exhausted = true;
                break;
            }
            Err(e) if batch.entries_read > 0 => {
                warn!(error = %e, offset = reader.position(), "Stopping batch before unreadable record");
                break;
            }
            Err(e) => return Err(e),
        };

        batch.entries_read += 1;
        if let Some(kept) = filter_entry(entry, schema) {
            batch.heap_size += kept.heap_size();
            batch.entries.push(kept);
        }
    }

    batch.end_offset = reader.position();
    batch.truncated = reader.truncated();

    if batch.entries_read > 0 {
        debug!(
            path = %reader.path().display(),
            read = batch.entries_read,
            kept = batch.entries.len(),
            heap_size = batch.heap_size,
            start = batch.start_offset,
            end = batch.end_offset,
            exhausted = batch.exhausted,
            "Read WAL batch"
        );
    }
    Ok(batch)
}
