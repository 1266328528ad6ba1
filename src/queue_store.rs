// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication queue persistence.
//!
//! One queue per (owner, peer, origin): the ordered WAL files the owner still
//! has to ship to the peer, plus a read offset into the oldest file. Queues
//! survive process restarts and are the single source of truth for both
//! position and ownership.
//!
//! # Ownership
//!
//! Every mutation names the queue by its full key, owner included. Once a
//! queue has been transferred (or dropped) the old key no longer matches any
//! row and the mutation fails with [`ReplicationError::StaleOwnership`]. This
//! is what stops a zombie worker from moving the new owner's position.
//!
//! # Recovered queues
//!
//! A transferred queue keeps its `origin`, so a survivor can hold its own
//! queue and any number of recovered queues for the same peer side by side.
//!
//! ```text
//! (owner=rs-1, peer=2, origin=rs-1)   rs-1's own queue
//! (owner=rs-1, peer=2, origin=rs-3)   recovered from dead rs-3
//! ```
//!
//! A recovered queue handed back to its (restarted) origin is merged into
//! the origin's own queue instead.
//!
//! # Atomicity
//!
//! Each operation is one SQLite transaction touching a single queue. The
//! transaction body is replayed on SQLITE_BUSY, so it never has side effects
//! outside the database.

use crate::db::{execute_with_retry, now_millis};
use crate::error::{ReplicationError, Result};
use crate::membership::ClusterMembership;
use crate::metrics;
use crate::wal::{LogPosition, WalFileRef};
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Queue identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey {
    pub owner: String,
    pub peer_id: String,
    /// Node whose WAL this queue reads.
    pub origin: String,
}

impl QueueKey {
    pub fn new(
        owner: impl Into<String>,
        peer_id: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            peer_id: peer_id.into(),
            origin: origin.into(),
        }
    }

    /// A node's own queue for a peer.
    pub fn local(node_id: &str, peer_id: &str) -> Self {
        Self::new(node_id, peer_id, node_id)
    }

    /// Whether this queue was inherited from a dead node.
    pub fn is_recovered(&self) -> bool {
        self.owner != self.origin
    }

    pub fn with_owner(&self, owner: &str) -> Self {
        Self::new(owner, self.peer_id.clone(), self.origin.clone())
    }
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.peer_id, self.origin, self.owner)
    }
}

/// Snapshot of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationQueue {
    pub key: QueueKey,
    /// Oldest first.
    pub files: Vec<WalFileRef>,
    /// Offset within `files[0]`.
    pub read_offset: u64,
}

impl ReplicationQueue {
    pub fn head(&self) -> Option<&WalFileRef> {
        self.files.first()
    }

    pub fn position(&self) -> Option<LogPosition> {
        self.head().map(|f| LogPosition {
            file_seq: f.seq,
            offset: self.read_offset,
        })
    }

    /// Whether another file follows the head.
    pub fn has_next_file(&self) -> bool {
        self.files.len() > 1
    }
}

/// Queue lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Created(QueueKey),
    Transferred { from: QueueKey, to: QueueKey },
    Dropped(QueueKey),
}

/// Durable store of replication queues.
pub struct ReplicationQueueStore {
    pool: SqlitePool,
    events: broadcast::Sender<QueueEvent>,
}

fn stale(key: &QueueKey) -> ReplicationError {
    ReplicationError::StaleOwnership {
        queue: key.to_string(),
        caller: key.owner.clone(),
    }
}

impl ReplicationQueueStore {
    pub fn new(pool: SqlitePool) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { pool, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Create a queue, optionally seeded with a first file at an offset.
    ///
    /// Returns `false` (and changes nothing) if the queue already exists.
    pub async fn create_queue(&self, key: &QueueKey, seed: Option<(&WalFileRef, u64)>) -> Result<bool> {
        let pool = &self.pool;
        let now = now_millis();
        let created = execute_with_retry("queue_create", || async {
            let mut tx = pool.begin().await?;
            let offset = seed.map(|(_, offset)| offset).unwrap_or(0);
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO queues (owner, peer_id, origin, read_offset, updated_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&key.owner)
            .bind(&key.peer_id)
            .bind(&key.origin)
            .bind(offset as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected()
                > 0;

            if inserted {
                if let Some((file, _)) = seed {
                    sqlx::query(
                        "INSERT INTO queue_files (owner, peer_id, origin, file_seq, path) VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(&key.owner)
                    .bind(&key.peer_id)
                    .bind(&key.origin)
                    .bind(file.seq as i64)
                    .bind(file.path.to_string_lossy().to_string())
                    .execute(&mut *tx)
                    .await?;
                }
            }
            tx.commit().await?;
            Ok(inserted)
        })
        .await?;

        if created {
            info!(queue = %key, seed = ?seed.map(|(f, o)| (f.seq, o)), "Queue created");
            self.emit(QueueEvent::Created(key.clone()));
        }
        Ok(created)
    }

    /// Append a WAL file to the tail of a queue.
    ///
    /// Enqueueing the current tail again is a no-op. A file older than the
    /// tail is refused: files are consumed strictly in append order.
    pub async fn enqueue_file(&self, key: &QueueKey, file: &WalFileRef) -> Result<()> {
        let pool = &self.pool;
        let outcome = execute_with_retry("queue_enqueue", || async {
            let mut tx = pool.begin().await?;
            if !queue_exists(&mut tx, key).await? {
                return Ok(Err(stale(key)));
            }

            let (tail,): (Option<i64>,) = sqlx::query_as(
                "SELECT MAX(file_seq) FROM queue_files WHERE owner = ? AND peer_id = ? AND origin = ?",
            )
            .bind(&key.owner)
            .bind(&key.peer_id)
            .bind(&key.origin)
            .fetch_one(&mut *tx)
            .await?;

            match tail {
                Some(tail) if tail as u64 == file.seq => return Ok(Ok(false)),
                Some(tail) if tail as u64 > file.seq => {
                    return Ok(Err(ReplicationError::Internal(format!(
                        "file {} enqueued after tail {} on queue {}",
                        file.seq, tail, key
                    ))))
                }
                _ => {}
            }

            sqlx::query(
                "INSERT INTO queue_files (owner, peer_id, origin, file_seq, path) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&key.owner)
            .bind(&key.peer_id)
            .bind(&key.origin)
            .bind(file.seq as i64)
            .bind(file.path.to_string_lossy().to_string())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(Ok(true))
        })
        .await?;

        if outcome? {
            debug!(queue = %key, file_seq = file.seq, "WAL file enqueued");
        }
        Ok(())
    }

    /// Move the read offset forward within the head file.
    ///
    /// `from` is the offset the caller read from. If the stored offset no
    /// longer matches (a merge rewound the queue), nothing changes and the
    /// call fails with `Internal`, so the caller re-reads from the store.
    pub async fn advance(&self, key: &QueueKey, from: u64, position: LogPosition) -> Result<()> {
        let pool = &self.pool;
        let now = now_millis();
        let outcome = execute_with_retry("queue_advance", || async {
            let mut tx = pool.begin().await?;
            let Some(current) = read_offset(&mut tx, key).await? else {
                return Ok(Err(stale(key)));
            };

            let head = head_seq(&mut tx, key).await?;
            if head != Some(position.file_seq) {
                return Ok(Err(ReplicationError::Internal(format!(
                    "advance on queue {} targets file {} but head is {:?}",
                    key, position.file_seq, head
                ))));
            }
            if position.offset < current {
                return Ok(Err(ReplicationError::NonMonotonicOffset {
                    queue: key.to_string(),
                    current,
                    requested: position.offset,
                }));
            }
            if position.offset == current {
                return Ok(Ok(()));
            }
            if from != current {
                return Ok(Err(ReplicationError::Internal(format!(
                    "queue {} is at offset {}, not {}",
                    key, current, from
                ))));
            }

            sqlx::query(
                "UPDATE queues SET read_offset = ?, updated_at = ? WHERE owner = ? AND peer_id = ? AND origin = ?",
            )
            .bind(position.offset as i64)
            .bind(now)
            .bind(&key.owner)
            .bind(&key.peer_id)
            .bind(&key.origin)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(Ok(()))
        })
        .await?;

        if let Err(e) = &outcome {
            if e.is_stale_ownership() {
                metrics::record_stale_ownership(&key.peer_id);
            }
        }
        outcome
    }

    /// Drop the fully consumed head file and reset the offset to 0.
    pub async fn finish_file(&self, key: &QueueKey, file_seq: u64) -> Result<()> {
        let pool = &self.pool;
        let now = now_millis();
        let outcome = execute_with_retry("queue_finish_file", || async {
            let mut tx = pool.begin().await?;
            if !queue_exists(&mut tx, key).await? {
                return Ok(Err(stale(key)));
            }
            let head = head_seq(&mut tx, key).await?;
            if head != Some(file_seq) {
                return Ok(Err(ReplicationError::Internal(format!(
                    "finish on queue {} targets file {} but head is {:?}",
                    key, file_seq, head
                ))));
            }

            sqlx::query(
                "DELETE FROM queue_files WHERE owner = ? AND peer_id = ? AND origin = ? AND file_seq = ?",
            )
            .bind(&key.owner)
            .bind(&key.peer_id)
            .bind(&key.origin)
            .bind(file_seq as i64)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE queues SET read_offset = 0, updated_at = ? WHERE owner = ? AND peer_id = ? AND origin = ?",
            )
            .bind(now)
            .bind(&key.owner)
            .bind(&key.peer_id)
            .bind(&key.origin)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(Ok(()))
        })
        .await?;

        match &outcome {
            Ok(()) => debug!(queue = %key, file_seq, "WAL file fully replicated"),
            Err(e) if e.is_stale_ownership() => metrics::record_stale_ownership(&key.peer_id),
            Err(_) => {}
        }
        outcome
    }

    /// Hand a dead node's queue to `new_owner`.
    ///
    /// Refused with [`ReplicationError::SourceStillAlive`] while the
    /// membership service reports the current owner live. Liveness is read
    /// inside the transaction and again just before commit, so an owner
    /// that rejoins mid-transfer keeps its queue. The ownership change is a
    /// compare-and-set on the old key: if another coordinator won the race,
    /// this call fails with `StaleOwnership`.
    ///
    /// Handing a recovered queue back to its origin merges its files into
    /// the origin's local queue (created if absent). Any other node that
    /// already holds a queue for the same (peer, origin) is refused with
    /// `Internal`.
    pub async fn transfer_ownership(
        &self,
        key: &QueueKey,
        new_owner: &str,
        membership: &dyn ClusterMembership,
    ) -> Result<QueueKey> {
        let to = key.with_owner(new_owner);
        let pool = &self.pool;
        let now = now_millis();
        let outcome = execute_with_retry("queue_transfer", || async {
            let mut tx = pool.begin().await?;
            if membership.is_alive(&key.owner) {
                return Ok(Err(ReplicationError::SourceStillAlive(key.owner.clone())));
            }
            let Some(offset) = read_offset(&mut tx, key).await? else {
                return Ok(Err(ReplicationError::StaleOwnership {
                    queue: key.to_string(),
                    caller: new_owner.to_string(),
                }));
            };

            let merged = match read_offset(&mut tx, &to).await? {
                Some(_) if to.is_recovered() => {
                    return Ok(Err(ReplicationError::Internal(format!(
                        "{} already holds queue {}/{}",
                        new_owner, key.peer_id, key.origin
                    ))));
                }
                Some(local_offset) => {
                    merge_files(&mut tx, key, offset, &to, local_offset, now).await?;
                    true
                }
                None => {
                    sqlx::query(
                        "UPDATE queues SET owner = ?, updated_at = ? WHERE owner = ? AND peer_id = ? AND origin = ?",
                    )
                    .bind(new_owner)
                    .bind(now)
                    .bind(&key.owner)
                    .bind(&key.peer_id)
                    .bind(&key.origin)
                    .execute(&mut *tx)
                    .await?;
                    sqlx::query(
                        "UPDATE queue_files SET owner = ? WHERE owner = ? AND peer_id = ? AND origin = ?",
                    )
                    .bind(new_owner)
                    .bind(&key.owner)
                    .bind(&key.peer_id)
                    .bind(&key.origin)
                    .execute(&mut *tx)
                    .await?;
                    false
                }
            };

            if membership.is_alive(&key.owner) {
                // Dropping the transaction rolls it back
                return Ok(Err(ReplicationError::SourceStillAlive(key.owner.clone())));
            }
            tx.commit().await?;
            Ok(Ok(merged))
        })
        .await?;
        let merged = outcome?;

        if merged {
            info!(from = %key, to = %to, "Recovered queue merged back into its origin's queue");
        } else {
            info!(from = %key, to = %to, "Queue ownership transferred");
        }
        metrics::record_failover_transfer(&key.peer_id);
        self.emit(QueueEvent::Transferred {
            from: key.clone(),
            to: to.clone(),
        });
        Ok(to)
    }

    /// Delete a queue and its file list. Returns whether it existed.
    pub async fn drop_queue(&self, key: &QueueKey) -> Result<bool> {
        let pool = &self.pool;
        let dropped = execute_with_retry("queue_drop", || async {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM queue_files WHERE owner = ? AND peer_id = ? AND origin = ?")
                .bind(&key.owner)
                .bind(&key.peer_id)
                .bind(&key.origin)
                .execute(&mut *tx)
                .await?;
            let removed = sqlx::query("DELETE FROM queues WHERE owner = ? AND peer_id = ? AND origin = ?")
                .bind(&key.owner)
                .bind(&key.peer_id)
                .bind(&key.origin)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            tx.commit().await?;
            Ok(removed > 0)
        })
        .await?;

        if dropped {
            info!(queue = %key, "Queue dropped");
            self.emit(QueueEvent::Dropped(key.clone()));
        } else {
            warn!(queue = %key, "Drop of absent queue ignored");
        }
        Ok(dropped)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Snapshot a queue, or `None` if it does not exist (under this owner).
    pub async fn get(&self, key: &QueueKey) -> Result<Option<ReplicationQueue>> {
        let pool = &self.pool;
        let snapshot = execute_with_retry("queue_get", || async {
            let mut tx = pool.begin().await?;
            let Some(read_offset) = read_offset(&mut tx, key).await? else {
                return Ok(None);
            };
            let rows = queue_files(&mut tx, key).await?;
            tx.commit().await?;

            Ok(Some(ReplicationQueue {
                key: key.clone(),
                files: rows
                    .into_iter()
                    .map(|(seq, path)| WalFileRef::new(seq as u64, PathBuf::from(path)))
                    .collect(),
                read_offset,
            }))
        })
        .await?;
        Ok(snapshot)
    }

    /// Every queue key, sorted.
    pub async fn all_queues(&self) -> Result<Vec<QueueKey>> {
        let pool = &self.pool;
        let rows: Vec<(String, String, String)> = execute_with_retry("queue_list", || async {
            sqlx::query_as("SELECT owner, peer_id, origin FROM queues ORDER BY owner, peer_id, origin")
                .fetch_all(pool)
                .await
        })
        .await?;
        Ok(rows
            .into_iter()
            .map(|(owner, peer_id, origin)| QueueKey::new(owner, peer_id, origin))
            .collect())
    }

    pub async fn queues_owned_by(&self, owner: &str) -> Result<Vec<QueueKey>> {
        Ok(self
            .all_queues()
            .await?
            .into_iter()
            .filter(|k| k.owner == owner)
            .collect())
    }

    pub async fn queues_for_peer(&self, peer_id: &str) -> Result<Vec<QueueKey>> {
        Ok(self
            .all_queues()
            .await?
            .into_iter()
            .filter(|k| k.peer_id == peer_id)
            .collect())
    }

    /// Number of queues held by each owner.
    pub async fn queue_counts(&self) -> Result<HashMap<String, usize>> {
        let mut counts = HashMap::new();
        for key in self.all_queues().await? {
            *counts.entry(key.owner).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Flush the SQLite WAL (clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        crate::db::checkpoint(&self.pool).await
    }
}

async fn queue_exists(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    key: &QueueKey,
) -> std::result::Result<bool, sqlx::Error> {
    Ok(read_offset(tx, key).await?.is_some())
}

async fn read_offset(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    key: &QueueKey,
) -> std::result::Result<Option<u64>, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT read_offset FROM queues WHERE owner = ? AND peer_id = ? AND origin = ?",
    )
    .bind(&key.owner)
    .bind(&key.peer_id)
    .bind(&key.origin)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(|(offset,)| offset as u64))
}

async fn queue_files(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    key: &QueueKey,
) -> std::result::Result<Vec<(i64, String)>, sqlx::Error> {
    sqlx::query_as(
        "SELECT file_seq, path FROM queue_files WHERE owner = ? AND peer_id = ? AND origin = ? ORDER BY file_seq",
    )
    .bind(&key.owner)
    .bind(&key.peer_id)
    .bind(&key.origin)
    .fetch_all(&mut **tx)
    .await
}

/// Fold the queue `from` into `into` and delete `from`.
///
/// The file lists are unioned. The new head keeps the offset of whichever
/// queue held it, the lower of the two if both did.
async fn merge_files(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    from: &QueueKey,
    from_offset: u64,
    into: &QueueKey,
    into_offset: u64,
    now: i64,
) -> std::result::Result<(), sqlx::Error> {
    let from_files = queue_files(tx, from).await?;
    let into_files = queue_files(tx, into).await?;

    let from_head = from_files.first().map(|(seq, _)| *seq);
    let into_head = into_files.first().map(|(seq, _)| *seq);
    let offset = match (from_head, into_head) {
        (Some(a), Some(b)) if a == b => from_offset.min(into_offset),
        (Some(a), Some(b)) if a < b => from_offset,
        (Some(_), None) => from_offset,
        _ => into_offset,
    };

    for (seq, path) in &from_files {
        sqlx::query(
            "INSERT OR IGNORE INTO queue_files (owner, peer_id, origin, file_seq, path) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&into.owner)
        .bind(&into.peer_id)
        .bind(&into.origin)
        .bind(seq)
        .bind(path)
        .execute(&mut **tx)
        .await?;
    }
    sqlx::query(
        "UPDATE queues SET read_offset = ?, updated_at = ? WHERE owner = ? AND peer_id = ? AND origin = ?",
    )
    .bind(offset as i64)
    .bind(now)
    .bind(&into.owner)
    .bind(&into.peer_id)
    .bind(&into.origin)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM queue_files WHERE owner = ? AND peer_id = ? AND origin = ?")
        .bind(&from.owner)
        .bind(&from.peer_id)
        .bind(&from.origin)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM queues WHERE owner = ? AND peer_id = ? AND origin = ?")
        .bind(&from.owner)
        .bind(&from.peer_id)
        .bind(&from.origin)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn head_seq(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    key: &QueueKey,
) -> std::result::Result<Option<u64>, sqlx::Error> {
    let (head,): (Option<i64>,) = sqlx::query_as(
        "SELECT MIN(file_seq) FROM queue_files WHERE owner = ? AND peer_id = ? AND origin = ?",
    )
    .bind(&key.owner)
    .bind(&key.peer_id)
    .bind(&key.origin)
    .fetch_one(&mut **tx)
    .await?;
    Ok(head.map(|h| h as u64))
}
