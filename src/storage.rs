// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage engine integration traits.
//!
//! The replication engine never writes user data on the source side. It
//! needs three things from the local storage engine:
//!
//! 1. Which WAL file is active and how much of it is committed
//! 2. Notification when a file rolls or the active file grows
//! 3. The replication scope of each (table, family)
//!
//! # Example
//!
//! ```rust,no_run
//! use cluster_replication::storage::{LogEvent, SchemaRef, StorageEngine};
//! use cluster_replication::wal::{ReplicationScope, WalFileRef};
//! use tokio::sync::broadcast;
//!
//! struct MyStore {
//!     events: broadcast::Sender<LogEvent>,
//! }
//!
//! impl StorageEngine for MyStore {
//!     fn active_log(&self) -> Option<(WalFileRef, u64)> {
//!         Some((WalFileRef::new(1, "/wal/rs-1.0000000001.wal"), 0))
//!     }
//!
//!     fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
//!         self.events.subscribe()
//!     }
//! }
//!
//! struct AllGlobal;
//!
//! impl SchemaRef for AllGlobal {
//!     fn family_scope(&self, _table: &str, _family: &str) -> ReplicationScope {
//!         ReplicationScope::Global
//!     }
//! }
//! ```

use crate::wal::{ReplicationScope, WalFileRef};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::broadcast;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = crate::error::Result<T>> + Send + 'a>>;

/// Change notifications from the local WAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// A new file became active. The previous active file is now closed.
    Rolled(WalFileRef),
    /// The active file's committed length grew.
    Appended { file_seq: u64, length: u64 },
}

/// What the replication engine needs from the local storage engine.
pub trait StorageEngine: Send + Sync + 'static {
    /// The active WAL file and its committed length, if the node has one.
    fn active_log(&self) -> Option<(WalFileRef, u64)>;

    /// Subscribe to roll / append notifications.
    ///
    /// Subscribers that lag may miss events. Workers fall back to polling,
    /// so a missed `Appended` only delays shipping.
    fn subscribe(&self) -> broadcast::Receiver<LogEvent>;
}

/// Schema lookup for replication scope.
pub trait SchemaRef: Send + Sync + 'static {
    /// Scope of a family. Unknown tables/families must answer `Local`.
    fn family_scope(&self, table: &str, family: &str) -> ReplicationScope;
}
