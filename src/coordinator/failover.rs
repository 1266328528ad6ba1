// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failover: re-home a dead node's queues onto live nodes.
//!
//! Every engine runs a coordinator. On a `NodeDied` event each coordinator
//! walks the dead node's queues and hands each one to the least-loaded live
//! node. The transfer itself is a compare-and-set in the queue store, so
//! when several coordinators react to the same death exactly one transfer
//! per queue wins and the rest see `StaleOwnership`.
//!
//! ```text
//! NodeDied(rs-3) ──▶ claim_delay ──▶ queues_owned_by(rs-3)
//!                                         │
//!                     ┌───────────────────┼────────────────────┐
//!                     ▼                   ▼                    ▼
//!              peer removed?        no live target        transfer_ownership
//!              drop_queue           orphaned (stall)      (rank_targets order)
//! ```
//!
//! The new owner resumes from the stored offset. A node that already holds
//! a queue for the same (peer, origin) is passed over, and a refused
//! transfer falls through to the next candidate. A live origin is the last
//! resort and folds the queue into its own. Queues that could not be
//! placed stay orphaned until a node joins; `sweep_orphans` runs on start
//! and on every `NodeJoined`.
//!
//! There is no I/O fencing: a node that is declared dead but still running
//! may ship a batch the new owner ships again, and edits the dead node
//! wrote but had not yet committed to its WAL are lost.

use crate::config::FailoverConfig;
use crate::error::{ReplicationError, Result};
use crate::membership::{ClusterMembership, MembershipEvent};
use crate::metrics;
use crate::peer::PeerRegistry;
use crate::queue_store::{QueueKey, ReplicationQueueStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, info_span, warn, Instrument};

/// Outcome of one failover pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverReport {
    /// (old key, new key) pairs moved by this coordinator.
    pub transferred: Vec<(QueueKey, QueueKey)>,
    /// Queues left in place because no live node could take them.
    pub orphaned: Vec<QueueKey>,
    /// Queues of peers that no longer exist.
    pub dropped: Vec<QueueKey>,
}

impl FailoverReport {
    fn merge(&mut self, other: FailoverReport) {
        self.transferred.extend(other.transferred);
        self.orphaned.extend(other.orphaned);
        self.dropped.extend(other.dropped);
    }
}

/// Reacts to node deaths for one engine.
pub struct FailoverCoordinator {
    node_id: String,
    config: FailoverConfig,
    store: Arc<ReplicationQueueStore>,
    registry: Arc<PeerRegistry>,
    membership: Arc<dyn ClusterMembership>,
}

impl FailoverCoordinator {
    pub fn new(
        node_id: impl Into<String>,
        config: FailoverConfig,
        store: Arc<ReplicationQueueStore>,
        registry: Arc<PeerRegistry>,
        membership: Arc<dyn ClusterMembership>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            store,
            registry,
            membership,
        }
    }

    /// Process membership events until shutdown.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let span = info_span!("failover", node_id = %self.node_id);

        async move {
            if !self.config.enabled {
                info!("Failover disabled");
                return;
            }
            let mut events = self.membership.subscribe();
            info!("Failover coordinator started");

            if let Err(e) = self.sweep_orphans().await {
                warn!(error = %e, "Initial orphan sweep failed");
            }

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Ok(MembershipEvent::NodeDied(dead)) => {
                            if dead == self.node_id {
                                continue;
                            }
                            if !self.wait_claim_delay(&mut shutdown_rx).await {
                                break;
                            }
                            if let Err(e) = self.handle_node_death(&dead).await {
                                warn!(dead_node = %dead, error = %e, "Failover pass failed");
                            }
                        }
                        Ok(MembershipEvent::NodeJoined(node)) => {
                            debug!(node_id = %node, "Node joined, sweeping orphaned queues");
                            if let Err(e) = self.sweep_orphans().await {
                                warn!(error = %e, "Orphan sweep failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Missed membership events, sweeping all dead owners");
                            if let Err(e) = self.sweep_orphans().await {
                                warn!(error = %e, "Orphan sweep failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("Membership event stream closed");
                            break;
                        }
                    },
                }
            }

            info!("Failover coordinator stopped");
        }
        .instrument(span)
        .await
    }

    /// Returns `false` if shutdown was signalled during the delay.
    async fn wait_claim_delay(&self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let delay = self.config.claim_delay_duration();
        if delay.is_zero() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown_rx.wait_for(|stop| *stop) => false,
        }
    }

    /// Re-home every queue owned by `dead_node`.
    pub async fn handle_node_death(&self, dead_node: &str) -> Result<FailoverReport> {
        if self.membership.is_alive(dead_node) {
            return Err(ReplicationError::SourceStillAlive(dead_node.to_string()));
        }

        let started = Instant::now();
        let queues = self.store.queues_owned_by(dead_node).await?;
        if queues.is_empty() {
            debug!(dead_node, "Dead node held no queues");
            return Ok(FailoverReport::default());
        }

        info!(dead_node, queues = queues.len(), "Claiming queues of dead node");
        let report = self.reassign(queues).await?;
        metrics::record_failover_pass(
            report.transferred.len(),
            report.orphaned.len(),
            report.dropped.len(),
            started.elapsed(),
        );
        info!(
            dead_node,
            transferred = report.transferred.len(),
            orphaned = report.orphaned.len(),
            dropped = report.dropped.len(),
            "Failover pass complete"
        );
        Ok(report)
    }

    /// Re-home queues whose owner is not live (missed deaths, or deaths
    /// that happened while no node could take the queues).
    pub async fn sweep_orphans(&self) -> Result<FailoverReport> {
        let mut by_owner: HashMap<String, Vec<QueueKey>> = HashMap::new();
        for key in self.store.all_queues().await? {
            if !self.membership.is_alive(&key.owner) {
                by_owner.entry(key.owner.clone()).or_default().push(key);
            }
        }

        let mut report = FailoverReport::default();
        for (owner, queues) in by_owner {
            debug!(owner = %owner, queues = queues.len(), "Sweeping orphaned queues");
            report.merge(self.reassign(queues).await?);
        }
        if !report.transferred.is_empty() || !report.dropped.is_empty() {
            info!(
                transferred = report.transferred.len(),
                orphaned = report.orphaned.len(),
                dropped = report.dropped.len(),
                "Orphan sweep complete"
            );
        }
        Ok(report)
    }

    async fn reassign(&self, queues: Vec<QueueKey>) -> Result<FailoverReport> {
        let mut report = FailoverReport::default();
        let live = self.membership.live_nodes();
        let mut load = self.store.queue_counts().await?;
        let mut holders: HashMap<(String, String), HashSet<String>> = HashMap::new();
        for held in self.store.all_queues().await? {
            holders
                .entry((held.peer_id, held.origin))
                .or_default()
                .insert(held.owner);
        }

        for key in queues {
            if !self.registry.contains(&key.peer_id) {
                info!(queue = %key, "Dropping queue of removed peer");
                if self.store.drop_queue(&key).await? {
                    report.dropped.push(key);
                }
                continue;
            }

            let slot = (key.peer_id.clone(), key.origin.clone());
            let candidates = rank_targets(
                &live,
                &load,
                holders.get(&slot).unwrap_or(&HashSet::new()),
                &key,
            );

            let mut settled = false;
            for target in candidates {
                match self
                    .store
                    .transfer_ownership(&key, &target, self.membership.as_ref())
                    .await
                {
                    Ok(to) => {
                        if to.is_recovered() {
                            *load.entry(target.clone()).or_insert(0) += 1;
                        }
                        if let Some(n) = load.get_mut(&key.owner) {
                            *n = n.saturating_sub(1);
                        }
                        if let Some(owners) = holders.get_mut(&slot) {
                            owners.remove(&key.owner);
                            owners.insert(target);
                        }
                        report.transferred.push((key.clone(), to));
                        settled = true;
                    }
                    Err(ReplicationError::StaleOwnership { .. }) => {
                        // Another coordinator won this queue
                        debug!(queue = %key, "Queue already claimed");
                        settled = true;
                    }
                    Err(ReplicationError::SourceStillAlive(owner)) => {
                        info!(queue = %key, owner = %owner, "Owner came back, leaving queue");
                        settled = true;
                    }
                    Err(ReplicationError::Internal(msg)) => {
                        warn!(queue = %key, target = %target, reason = %msg, "Transfer refused, trying next node");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
                break;
            }

            if !settled {
                warn!(queue = %key, "No live node can take queue, replication stalls until one joins");
                report.orphaned.push(key);
            }
        }

        Ok(report)
    }
}

/// Live nodes that may take `key`, best first.
///
/// Nodes already holding a queue for the same (peer, origin) are skipped.
/// The rest are ordered by load, ties broken by node id. A live origin
/// comes last: taking the queue back merges it into the origin's own queue.
pub fn rank_targets(
    live: &[String],
    load: &HashMap<String, usize>,
    holders: &HashSet<String>,
    key: &QueueKey,
) -> Vec<String> {
    let mut ranked: Vec<&String> = live
        .iter()
        .filter(|node| **node != key.owner && **node != key.origin && !holders.contains(*node))
        .collect();
    ranked.sort_by(|a, b| {
        let la = load.get(*a).copied().unwrap_or(0);
        let lb = load.get(*b).copied().unwrap_or(0);
        la.cmp(&lb).then_with(|| a.cmp(b))
    });

    let mut ranked: Vec<String> = ranked.into_iter().cloned().collect();
    if key.origin != key.owner && live.contains(&key.origin) {
        ranked.push(key.origin.clone());
    }
    ranked
}
