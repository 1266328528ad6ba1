// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cluster membership (liveness) of source nodes.
//!
//! The coordination service tells us which nodes are live and when one dies.
//! [`InProcessMembership`] is a shared in-process implementation: every
//! engine of a test cluster holds the same instance, and `mark_dead` is the
//! fault-injection hook that simulates a crashed node.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Liveness change of a source node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    NodeJoined(String),
    NodeDied(String),
}

/// Liveness view provided by the coordination service.
pub trait ClusterMembership: Send + Sync + 'static {
    /// Ids of all live nodes, sorted.
    fn live_nodes(&self) -> Vec<String>;

    fn is_alive(&self, node_id: &str) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// Shared in-process membership table.
#[derive(Clone)]
pub struct InProcessMembership {
    live: Arc<DashMap<String, ()>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl Default for InProcessMembership {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessMembership {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            live: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Register a node as live and announce it.
    pub fn join(&self, node_id: &str) {
        if self.live.insert(node_id.to_string(), ()).is_none() {
            info!(node_id, "Node joined");
            let _ = self.events.send(MembershipEvent::NodeJoined(node_id.to_string()));
        }
    }

    /// Declare a node dead and announce it.
    pub fn mark_dead(&self, node_id: &str) {
        if self.live.remove(node_id).is_some() {
            info!(node_id, "Node declared dead");
            let _ = self.events.send(MembershipEvent::NodeDied(node_id.to_string()));
        }
    }
}

impl ClusterMembership for InProcessMembership {
    fn live_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.live.iter().map(|e| e.key().clone()).collect();
        nodes.sort();
        nodes
    }

    fn is_alive(&self, node_id: &str) -> bool {
        self.live.contains_key(node_id)
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}
