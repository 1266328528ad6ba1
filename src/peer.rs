// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Peer registry.
//!
//! Durable table of peer clusters plus the global replicating switch, backed
//! by SQLite and cached in memory. Every mutation is persisted first and then
//! broadcast as a [`PeerEvent`] so that each node's engine can start, stop or
//! pause its workers.
//!
//! # Consistency
//!
//! SQLite is the source of truth. Several engines may each hold their own
//! registry over the same database; [`PeerRegistry::refresh()`] reloads the
//! table and emits events for whatever changed underneath the cache. Engines
//! call it on their poll interval, which bounds how long a remote change
//! takes to reach this node.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> cluster_replication::Result<()> {
//! use cluster_replication::config::StoreConfig;
//! use cluster_replication::db::open_pool;
//! use cluster_replication::peer::PeerRegistry;
//!
//! let pool = open_pool(&StoreConfig::in_memory()).await?;
//! let registry = PeerRegistry::new(pool).await?;
//!
//! registry.add_peer("2", "redis://peer-cluster:6379").await?;
//! registry.set_replicating(false).await?; // pause all shipping
//! registry.set_replicating(true).await?;  // resume where we left off
//! registry.remove_peer("2").await?;
//! # Ok(())
//! # }
//! ```

use crate::db::{execute_with_retry, now_millis};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use dashmap::DashMap;
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

/// A peer cluster receiving replicated edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCluster {
    pub id: String,
    /// Opaque connection descriptor, interpreted by the [`PeerConnector`](crate::sink::PeerConnector).
    pub connection: String,
    pub enabled: bool,
}

/// Registry change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Added(PeerCluster),
    /// Terminal: workers for this peer stop and discard their queues.
    Removed(String),
    /// Per-peer enable/disable.
    StateChanged { peer_id: String, enabled: bool },
    /// Global replicating switch flipped.
    Replicating(bool),
}

/// Durable peer table with change broadcast.
pub struct PeerRegistry {
    pool: SqlitePool,
    peers: DashMap<String, PeerCluster>,
    /// Per-peer enabled flag for worker gating
    enabled: DashMap<String, watch::Sender<bool>>,
    replicating: watch::Sender<bool>,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerRegistry {
    /// Load the registry from an opened replication database.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let (events, _) = broadcast::channel(256);
        let registry = Self {
            pool,
            peers: DashMap::new(),
            enabled: DashMap::new(),
            replicating: watch::channel(true).0,
            events,
        };

        let (rows, replicating) = registry.load().await?;
        for peer in rows.into_values() {
            registry.cache_insert(peer);
        }
        registry.replicating.send_replace(replicating);

        if !registry.peers.is_empty() {
            info!(count = registry.peers.len(), replicating, "Restored peers from previous run");
        }
        metrics::record_peer_count(registry.peers.len());
        metrics::record_replicating(replicating);

        Ok(registry)
    }

    async fn load(&self) -> Result<(HashMap<String, PeerCluster>, bool)> {
        let pool = &self.pool;
        let rows: Vec<(String, String, i64)> = execute_with_retry("peers_load", || async {
            sqlx::query_as("SELECT peer_id, connection, enabled FROM peers")
                .fetch_all(pool)
                .await
        })
        .await?;

        let (replicating,): (i64,) = execute_with_retry("replicating_load", || async {
            sqlx::query_as("SELECT replicating FROM replication_state WHERE id = 1")
                .fetch_one(pool)
                .await
        })
        .await?;

        let peers = rows
            .into_iter()
            .map(|(id, connection, enabled)| {
                (
                    id.clone(),
                    PeerCluster {
                        id,
                        connection,
                        enabled: enabled != 0,
                    },
                )
            })
            .collect();

        Ok((peers, replicating != 0))
    }

    fn cache_insert(&self, peer: PeerCluster) {
        match self.enabled.get(&peer.id) {
            Some(tx) => {
                tx.send_replace(peer.enabled);
            }
            None => {
                self.enabled
                    .insert(peer.id.clone(), watch::channel(peer.enabled).0);
            }
        }
        self.peers.insert(peer.id.clone(), peer);
    }

    fn cache_remove(&self, peer_id: &str) {
        self.peers.remove(peer_id);
        if let Some((_, tx)) = self.enabled.remove(peer_id) {
            // Wake gated workers so they notice the removal
            tx.send_replace(false);
        }
    }

    fn emit(&self, event: PeerEvent) {
        debug!(?event, "Peer registry event");
        let _ = self.events.send(event);
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Register a new, enabled peer.
    ///
    /// Fails with [`ReplicationError::DuplicatePeer`] if the id exists, with
    /// no side effects.
    pub async fn add_peer(&self, peer_id: &str, connection: &str) -> Result<PeerCluster> {
        let pool = &self.pool;
        let now = now_millis();
        let result = execute_with_retry("peer_add", || async {
            sqlx::query(
                "INSERT OR IGNORE INTO peers (peer_id, connection, enabled, created_at) VALUES (?, ?, 1, ?)",
            )
            .bind(peer_id)
            .bind(connection)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReplicationError::DuplicatePeer(peer_id.to_string()));
        }

        let peer = PeerCluster {
            id: peer_id.to_string(),
            connection: connection.to_string(),
            enabled: true,
        };
        self.cache_insert(peer.clone());
        info!(peer_id, "Peer added");
        metrics::record_peer_change("added");
        metrics::record_peer_count(self.peers.len());
        self.emit(PeerEvent::Added(peer.clone()));
        Ok(peer)
    }

    /// Remove a peer. Unshipped edits queued for it are dropped.
    ///
    /// Fails with [`ReplicationError::UnknownPeer`] if absent.
    pub async fn remove_peer(&self, peer_id: &str) -> Result<()> {
        let pool = &self.pool;
        let result = execute_with_retry("peer_remove", || async {
            sqlx::query("DELETE FROM peers WHERE peer_id = ?")
                .bind(peer_id)
                .execute(pool)
                .await
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReplicationError::UnknownPeer(peer_id.to_string()));
        }

        self.cache_remove(peer_id);
        info!(peer_id, "Peer removed");
        metrics::record_peer_change("removed");
        metrics::record_peer_count(self.peers.len());
        self.emit(PeerEvent::Removed(peer_id.to_string()));
        Ok(())
    }

    /// Enable or disable shipping to a single peer.
    pub async fn set_peer_enabled(&self, peer_id: &str, enabled: bool) -> Result<()> {
        let pool = &self.pool;
        let result = execute_with_retry("peer_set_enabled", || async {
            sqlx::query("UPDATE peers SET enabled = ? WHERE peer_id = ?")
                .bind(enabled as i64)
                .bind(peer_id)
                .execute(pool)
                .await
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReplicationError::UnknownPeer(peer_id.to_string()));
        }

        if let Some(mut peer) = self.peers.get_mut(peer_id) {
            peer.enabled = enabled;
        }
        if let Some(tx) = self.enabled.get(peer_id) {
            tx.send_replace(enabled);
        }
        info!(peer_id, enabled, "Peer state changed");
        metrics::record_peer_change(if enabled { "enabled" } else { "disabled" });
        self.emit(PeerEvent::StateChanged {
            peer_id: peer_id.to_string(),
            enabled,
        });
        Ok(())
    }

    /// Global pause/resume. Queues are untouched; only shipping stops.
    pub async fn set_replicating(&self, replicating: bool) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("replicating_set", || async {
            sqlx::query("UPDATE replication_state SET replicating = ? WHERE id = 1")
                .bind(replicating as i64)
                .execute(pool)
                .await
        })
        .await?;

        let changed = self.replicating.send_replace(replicating) != replicating;
        if changed {
            info!(replicating, "Replication switched");
            metrics::record_replicating(replicating);
            self.emit(PeerEvent::Replicating(replicating));
        }
        Ok(())
    }

    /// Reload from the database, emitting events for external changes.
    ///
    /// Returns the number of changes observed.
    pub async fn refresh(&self) -> Result<usize> {
        let (rows, replicating) = self.load().await?;
        let mut changes = 0;

        let cached: Vec<String> = self.peers.iter().map(|p| p.key().clone()).collect();
        for id in cached {
            if !rows.contains_key(&id) {
                self.cache_remove(&id);
                self.emit(PeerEvent::Removed(id));
                changes += 1;
            }
        }

        for (id, peer) in rows {
            let previous = self.peers.get(&id).map(|p| p.clone());
            match previous {
                None => {
                    self.cache_insert(peer.clone());
                    self.emit(PeerEvent::Added(peer));
                    changes += 1;
                }
                Some(old) if old.enabled != peer.enabled => {
                    let enabled = peer.enabled;
                    self.cache_insert(peer);
                    self.emit(PeerEvent::StateChanged {
                        peer_id: id,
                        enabled,
                    });
                    changes += 1;
                }
                Some(_) => {}
            }
        }

        if self.replicating.send_replace(replicating) != replicating {
            self.emit(PeerEvent::Replicating(replicating));
            changes += 1;
        }

        if changes > 0 {
            debug!(changes, "Peer registry refreshed");
            metrics::record_peer_count(self.peers.len());
        }
        Ok(changes)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_peer(&self, peer_id: &str) -> Option<PeerCluster> {
        self.peers.get(peer_id).map(|p| p.clone())
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// All peers, sorted by id.
    pub fn list_peers(&self) -> Vec<PeerCluster> {
        let mut peers: Vec<PeerCluster> = self.peers.iter().map(|p| p.clone()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn is_replicating(&self) -> bool {
        *self.replicating.borrow()
    }

    /// Watch the global replicating switch.
    pub fn replicating_receiver(&self) -> watch::Receiver<bool> {
        self.replicating.subscribe()
    }

    /// Watch one peer's enabled flag. Flips to `false` on removal.
    pub fn peer_enabled_receiver(&self, peer_id: &str) -> Option<watch::Receiver<bool>> {
        self.enabled.get(peer_id).map(|tx| tx.subscribe())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}
