// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shipping transport seam.
//!
//! A [`PeerConnector`] turns a registry entry into a [`PeerSink`]; the sink
//! delivers one batch of filtered edits to the peer's ingestion endpoint and
//! resolves only once the peer has acknowledged it. The worker advances its
//! queue after that acknowledgement and not before.
//!
//! Sinks must tolerate redelivery: a ship that failed after the peer applied
//! it is retried, and Put/Delete application is idempotent at the peer.

pub mod redis;

pub use self::redis::{RedisConnector, RedisPeerSink};

use crate::error::Result;
use crate::peer::PeerCluster;
use crate::storage::BoxFuture;
use crate::wal::WalEntry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One batch of edits from a single origin node, in WAL order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipBatch {
    /// Node whose WAL produced these edits.
    pub origin: String,
    pub peer_id: String,
    pub entries: Vec<WalEntry>,
}

impl ShipBatch {
    pub fn edit_count(&self) -> usize {
        self.entries.len()
    }

    pub fn cell_count(&self) -> usize {
        self.entries.iter().map(|e| e.cells.len()).sum()
    }
}

/// Delivers batches to one peer cluster.
pub trait PeerSink: Send + Sync + 'static {
    /// Ship a batch. `Ok` means the peer acknowledged it.
    fn replicate<'a>(&'a self, batch: &'a ShipBatch) -> BoxFuture<'a, ()>;
}

/// Builds sinks from registry entries. Connecting may be lazy: errors
/// surface from the first `replicate` rather than here.
pub trait PeerConnector: Send + Sync + 'static {
    fn connect(&self, peer: &PeerCluster) -> Result<Arc<dyn PeerSink>>;
}
