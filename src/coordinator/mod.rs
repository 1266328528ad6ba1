// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The main orchestrator that ties together:
//! - The peer registry via [`crate::peer::PeerRegistry`]
//! - Durable queues via [`crate::queue_store::ReplicationQueueStore`]
//! - One source worker per owned queue (see `source`)
//! - Dead-node queue claiming via [`FailoverCoordinator`]
//!
//! # Architecture
//!
//! ```text
//!  PeerEvent ──┐
//!  QueueEvent ─┼──→ event loop ──→ spawn / stop workers ──→ PeerSink
//!  LogEvent ───┤         │
//!  poll tick ──┘         └──→ enqueue rolled WAL files
//!
//!  MembershipEvent ──→ FailoverCoordinator ──→ transfer_ownership
//!                                                  │
//!                                   QueueEvent::Transferred ──→ event loop
//! ```
//!
//! The engine expects its node to be a live member of the cluster before
//! [`start()`](ReplicationEngine::start): the failover coordinator treats
//! queues of non-members as orphans.

mod source;
mod types;
pub mod failover;

pub use failover::{FailoverCoordinator, FailoverReport};
pub use types::{EngineState, HealthCheck, QueueHealth, SourceState};

use crate::batch::BatchLimits;
use crate::circuit_breaker::PeerCircuits;
use crate::config::{ReplicationConfig, StoreConfig};
use crate::db;
use crate::error::{ReplicationError, Result};
use crate::membership::ClusterMembership;
use crate::metrics;
use crate::peer::{PeerCluster, PeerEvent, PeerRegistry};
use crate::queue_store::{QueueEvent, QueueKey, ReplicationQueue, ReplicationQueueStore};
use crate::resilience::{Bulkhead, RateLimiter};
use crate::sink::{PeerConnector, PeerSink};
use crate::storage::{LogEvent, SchemaRef, StorageEngine};
use crate::wal::WalFileRef;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use source::{spawn_source, WorkerGates, WorkerHandle, WorkerShared};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How long a stopping worker may take to abandon its in-flight batch.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Collaborators the engine runs against.
///
/// Several engines (one per node) may share one registry and queue store;
/// that is how an in-process cluster is assembled for tests.
#[derive(Clone)]
pub struct ReplicationContext {
    pub registry: Arc<PeerRegistry>,
    pub store: Arc<ReplicationQueueStore>,
    pub storage: Arc<dyn StorageEngine>,
    pub schema: Arc<dyn SchemaRef>,
    pub membership: Arc<dyn ClusterMembership>,
    pub connector: Arc<dyn PeerConnector>,
}

impl ReplicationContext {
    /// Open the SQLite store and load the registry from it.
    pub async fn open(
        store_config: &StoreConfig,
        storage: Arc<dyn StorageEngine>,
        schema: Arc<dyn SchemaRef>,
        membership: Arc<dyn ClusterMembership>,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<Self> {
        let pool = db::open_pool(store_config).await?;
        let registry = Arc::new(PeerRegistry::new(pool.clone()).await?);
        Ok(Self {
            registry,
            store: Arc::new(ReplicationQueueStore::new(pool)),
            storage,
            schema,
            membership,
            connector,
        })
    }
}

/// Outcome of [`ReplicationEngine::decommission`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DecommissionReport {
    /// Fully shipped queues removed from the store.
    pub dropped: Vec<QueueKey>,
    /// Queues with a backlog, left for failover to claim.
    pub retained: Vec<QueueKey>,
}

/// The main replication engine.
///
/// Ships this node's WAL, and any WAL inherited from dead nodes, to every
/// registered peer cluster. One engine runs per source node.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let ctx = ReplicationContext::open(&config.store, storage, schema, membership, connector).await?;
/// let mut engine = ReplicationEngine::new(config, ctx);
/// engine.start().await?;
///
/// engine.add_peer("2", "redis://peer-2:6379").await?;
///
/// engine.shutdown().await;
/// ```
pub struct ReplicationEngine {
    config: ReplicationConfig,

    /// Shared with the event loop task.
    inner: Arc<EngineInner>,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Event loop and failover task handles
    task_handles: RwLock<Vec<JoinHandle<()>>>,
}

/// State reachable from background tasks.
struct EngineInner {
    node_id: String,
    ctx: ReplicationContext,
    shared: WorkerShared,
    circuits: PeerCircuits,
    workers: DashMap<QueueKey, WorkerHandle>,
    sinks: DashMap<String, Arc<dyn PeerSink>>,
    /// Bumped on every local log event; workers idle on it.
    wal_activity: watch::Sender<u64>,
    circuit_failure_threshold: u32,
    /// Serializes peer add / remove against the event loop's handling of
    /// the same peer's registry events.
    peer_admin: tokio::sync::Mutex<()>,
}

impl ReplicationEngine {
    /// Create a new replication engine.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to create queues and begin shipping.
    pub fn new(config: ReplicationConfig, ctx: ReplicationContext) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let source = config.settings.source.clone();

        // Shared across all peers of this node
        let rate_limiter: Option<Arc<RateLimiter>> = source.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for shipping"
            );
            Arc::new(RateLimiter::new(cfg))
        });

        let shared = WorkerShared {
            limits: BatchLimits {
                size_capacity: source.size_capacity,
                nb_capacity: source.nb_capacity,
            },
            slo: config.settings.slo.clone(),
            store: Arc::clone(&ctx.store),
            storage: Arc::clone(&ctx.storage),
            schema: Arc::clone(&ctx.schema),
            rate_limiter,
            bulkhead: Arc::new(Bulkhead::new(source.max_concurrent_ships)),
            config: source.clone(),
        };

        let inner = Arc::new(EngineInner {
            node_id: config.local_node_id.clone(),
            ctx,
            shared,
            circuits: PeerCircuits::new(source.circuit_config()),
            workers: DashMap::new(),
            sinks: DashMap::new(),
            wal_activity: watch::channel(0).0,
            circuit_failure_threshold: source.circuit_failure_threshold,
            peer_admin: tokio::sync::Mutex::new(()),
        });

        Self {
            config,
            inner,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            task_handles: RwLock::new(Vec::new()),
        }
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Get the node ID.
    pub fn node_id(&self) -> &str {
        &self.config.local_node_id
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.inner.ctx.registry
    }

    pub fn queue_store(&self) -> &Arc<ReplicationQueueStore> {
        &self.inner.ctx.store
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Admin surface
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a peer cluster. This node's queue for it exists on return;
    /// other nodes create theirs when the registry event reaches them.
    pub async fn add_peer(&self, peer_id: &str, connection: &str) -> Result<PeerCluster> {
        let _admin = self.inner.peer_admin.lock().await;
        let peer = self.inner.ctx.registry.add_peer(peer_id, connection).await?;
        if self.is_running() {
            self.inner.ensure_local_queue(&peer.id).await?;
        }
        Ok(peer)
    }

    /// Unregister a peer. This node's workers for it stop and its queues for
    /// it (local and recovered) are dropped before this returns.
    pub async fn remove_peer(&self, peer_id: &str) -> Result<()> {
        let _admin = self.inner.peer_admin.lock().await;
        self.inner.ctx.registry.remove_peer(peer_id).await?;
        if self.is_running() {
            self.inner.remove_peer_queues(peer_id).await;
        }
        Ok(())
    }

    /// Pause or resume shipping to one peer. Queues keep accumulating.
    pub async fn set_peer_enabled(&self, peer_id: &str, enabled: bool) -> Result<()> {
        self.inner.ctx.registry.set_peer_enabled(peer_id, enabled).await
    }

    /// Global replicating switch.
    pub async fn set_replicating(&self, replicating: bool) -> Result<()> {
        self.inner.ctx.registry.set_replicating(replicating).await
    }

    pub fn list_peers(&self) -> Vec<PeerCluster> {
        self.inner.ctx.registry.list_peers()
    }

    pub fn get_peer(&self, peer_id: &str) -> Option<PeerCluster> {
        self.inner.ctx.registry.get_peer(peer_id)
    }

    pub fn is_replicating(&self) -> bool {
        self.inner.ctx.registry.is_replicating()
    }

    /// State of the worker shipping `key`, if this engine runs one.
    pub fn worker_state(&self, key: &QueueKey) -> Option<SourceState> {
        self.inner.workers.get(key).map(|w| w.state())
    }

    /// Queues this engine currently runs workers for, sorted.
    pub fn worker_queues(&self) -> Vec<QueueKey> {
        let mut keys: Vec<QueueKey> = self
            .inner
            .workers
            .iter()
            .filter(|w| !w.value().is_finished())
            .map(|w| w.key().clone())
            .collect();
        keys.sort();
        keys
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Health
    // ─────────────────────────────────────────────────────────────────────────

    /// Get health status for monitoring endpoints.
    ///
    /// **Performance**: This method performs no store or network I/O. All data
    /// is collected from worker atomics and watch channels.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let health = engine.health_check();
    ///
    /// // For /ready endpoint
    /// if health.ready {
    ///     HttpResponse::Ok()
    /// } else {
    ///     HttpResponse::ServiceUnavailable()
    /// }
    /// ```
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let registry = &self.inner.ctx.registry;

        let mut queues: Vec<QueueHealth> = self
            .inner
            .workers
            .iter()
            .map(|w| {
                let stats = &w.value().stats;
                let position = stats.position();
                QueueHealth {
                    key: w.key().clone(),
                    state: w.value().state(),
                    files: stats.files(),
                    file_seq: position.file_seq,
                    offset: position.offset,
                    consecutive_failures: stats.consecutive_failures(),
                    edits_shipped: stats.edits_shipped(),
                    millis_since_ship: stats.millis_since_ship(),
                }
            })
            .collect();
        queues.sort_by(|a, b| a.key.cmp(&b.key));

        let ready = state == EngineState::Running;
        let threshold = self.inner.circuit_failure_threshold;
        let healthy = ready
            && queues
                .iter()
                .all(|q| q.state != SourceState::Stalled && q.consecutive_failures < threshold);

        HealthCheck {
            state,
            replicating: registry.is_replicating(),
            ready,
            healthy,
            peers_total: registry.list_peers().len(),
            peers_circuit_open: self.inner.circuits.open_peers(),
            queues,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the replication engine.
    ///
    /// 1. Creates this node's queue for every registered peer
    /// 2. Adopts queues this node already owns (restart, earlier failover)
    /// 3. Spawns the event loop
    /// 4. Spawns the failover coordinator
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            node_id = %self.config.local_node_id,
            peer_count = self.inner.ctx.registry.list_peers().len(),
            "Starting replication engine"
        );
        self.set_state(EngineState::Starting);

        // Subscribe before the initial sync so no event falls in between
        let peer_events = self.inner.ctx.registry.subscribe();
        let queue_events = self.inner.ctx.store.subscribe();
        let log_events = self.inner.ctx.storage.subscribe();

        if let Err(e) = self.inner.sync().await {
            error!(error = %e, "Failed to initialize replication queues");
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        let mut handles = self.task_handles.write().await;

        let inner = Arc::clone(&self.inner);
        let shutdown_rx = self.shutdown_rx.clone();
        let poll = self.config.settings.source.poll_interval_duration();
        let span = info_span!("replication_events", node_id = %self.config.local_node_id);
        handles.push(tokio::spawn(
            run_event_loop(inner, peer_events, queue_events, log_events, shutdown_rx, poll)
                .instrument(span),
        ));

        let failover = FailoverCoordinator::new(
            self.config.local_node_id.clone(),
            self.config.settings.failover.clone(),
            Arc::clone(&self.inner.ctx.store),
            Arc::clone(&self.inner.ctx.registry),
            Arc::clone(&self.inner.ctx.membership),
        );
        handles.push(tokio::spawn(failover.run(self.shutdown_rx.clone())));
        drop(handles);

        self.set_state(EngineState::Running);
        info!(
            workers = self.inner.workers.len(),
            "Replication engine running"
        );
        Ok(())
    }

    /// Shutdown the replication engine gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal the event loop and failover coordinator to stop
    /// 2. Stop every worker (an in-flight batch is abandoned, not acked)
    /// 3. Checkpoint the store
    ///
    /// Queues stay in the store; a new engine for this node resumes them.
    pub async fn shutdown(&mut self) {
        info!("Shutting down replication engine");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);
        self.stop_tasks().await;
        self.inner.stop_all_workers().await;

        if let Err(e) = self.inner.ctx.store.checkpoint().await {
            warn!(error = %e, "Store checkpoint failed during shutdown");
        }

        self.set_state(EngineState::Stopped);
        info!("Replication engine stopped");
    }

    /// Remove this node from replication for good.
    ///
    /// Stops like [`shutdown()`](Self::shutdown), then drops every owned
    /// queue with nothing left to ship. Queues with a backlog are kept so the
    /// failover of a live node can claim them once membership reports this
    /// node dead.
    pub async fn decommission(&mut self) -> Result<DecommissionReport> {
        info!("Decommissioning replication engine");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);
        self.stop_tasks().await;
        self.inner.stop_all_workers().await;

        let mut report = DecommissionReport::default();
        let store = &self.inner.ctx.store;
        for key in store.queues_owned_by(&self.inner.node_id).await? {
            let Some(queue) = store.get(&key).await? else {
                continue;
            };
            if self.inner.has_backlog(&queue).await {
                report.retained.push(key);
            } else if store.drop_queue(&key).await? {
                report.dropped.push(key);
            }
        }

        if let Err(e) = store.checkpoint().await {
            warn!(error = %e, "Store checkpoint failed during decommission");
        }
        self.set_state(EngineState::Stopped);
        info!(
            dropped = report.dropped.len(),
            retained = report.retained.len(),
            "Replication engine decommissioned"
        );
        Ok(report)
    }

    /// Abort every task without touching the store, as a crash would.
    ///
    /// Queue state is whatever the last acknowledged advance left behind.
    pub async fn halt(&mut self) {
        warn!(node_id = %self.config.local_node_id, "Halting replication engine");
        let handles: Vec<_> = std::mem::take(&mut *self.task_handles.write().await);
        for handle in handles {
            handle.abort();
        }
        let keys: Vec<QueueKey> = self.inner.workers.iter().map(|w| w.key().clone()).collect();
        for key in keys {
            if let Some((_, worker)) = self.inner.workers.remove(&key) {
                worker.abort();
            }
        }
        metrics::set_active_workers(0);
        self.set_state(EngineState::Stopped);
    }

    async fn stop_tasks(&self) {
        let handles: Vec<_> = {
            let mut guard = self.task_handles.write().await;
            std::mem::take(&mut *guard)
        };
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }
    }
}

impl EngineInner {
    /// Make the store and the worker set agree with the registry.
    async fn sync(&self) -> Result<()> {
        let _admin = self.peer_admin.lock().await;
        for peer in self.ctx.registry.list_peers() {
            let key = QueueKey::local(&self.node_id, &peer.id);
            if !self.has_live_worker(&key) {
                self.ensure_local_queue(&peer.id).await?;
            }
        }
        self.adopt_owned().await
    }

    fn has_live_worker(&self, key: &QueueKey) -> bool {
        self.workers
            .get(key)
            .map(|w| !w.is_finished())
            .unwrap_or(false)
    }

    /// Create this node's queue for a peer, seeded at the committed end of
    /// the active log, and start its worker.
    async fn ensure_local_queue(&self, peer_id: &str) -> Result<()> {
        let key = QueueKey::local(&self.node_id, peer_id);
        let seed = self.ctx.storage.active_log();
        let created = self
            .ctx
            .store
            .create_queue(&key, seed.as_ref().map(|(file, len)| (file, *len)))
            .await?;
        if created {
            info!(queue = %key, "Created replication queue");
        }
        self.spawn_worker(&key);
        Ok(())
    }

    /// Start workers for every queue this node owns.
    async fn adopt_owned(&self) -> Result<()> {
        for key in self.ctx.store.queues_owned_by(&self.node_id).await? {
            if self.ctx.registry.contains(&key.peer_id) {
                self.spawn_worker(&key);
            } else {
                info!(queue = %key, "Dropping queue of unregistered peer");
                self.ctx.store.drop_queue(&key).await?;
            }
        }
        Ok(())
    }

    /// Spawn a worker for `key` unless a live one exists. Returns whether a
    /// worker was spawned.
    fn spawn_worker(&self, key: &QueueKey) -> bool {
        let registry = &self.ctx.registry;
        let Some(peer) = registry.get_peer(&key.peer_id) else {
            return false;
        };
        let Some(peer_enabled) = registry.peer_enabled_receiver(&key.peer_id) else {
            return false;
        };

        let spawned = match self.workers.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                if !slot.get().is_finished() {
                    return false;
                }
                match self.spawn_handle(key, &peer, peer_enabled) {
                    Some(handle) => {
                        slot.insert(handle);
                        true
                    }
                    None => {
                        slot.remove();
                        false
                    }
                }
            }
            Entry::Vacant(slot) => match self.spawn_handle(key, &peer, peer_enabled) {
                Some(handle) => {
                    slot.insert(handle);
                    true
                }
                None => false,
            },
        };

        if spawned {
            info!(queue = %key, recovered = key.is_recovered(), "Source worker spawned");
            metrics::set_active_workers(self.workers.len());
        }
        spawned
    }

    fn spawn_handle(
        &self,
        key: &QueueKey,
        peer: &PeerCluster,
        peer_enabled: watch::Receiver<bool>,
    ) -> Option<WorkerHandle> {
        let sink = match self.sink_for(peer) {
            Ok(sink) => sink,
            Err(e) => {
                warn!(peer_id = %peer.id, error = %e, "Failed to connect to peer, will retry");
                return None;
            }
        };
        let gates = WorkerGates {
            replicating: self.ctx.registry.replicating_receiver(),
            peer_enabled,
            wal_activity: self.wal_activity.subscribe(),
        };
        Some(spawn_source(
            key.clone(),
            self.shared.clone(),
            sink,
            self.circuits.for_peer(&peer.id),
            gates,
        ))
    }

    fn sink_for(&self, peer: &PeerCluster) -> Result<Arc<dyn PeerSink>> {
        if let Some(sink) = self.sinks.get(&peer.id) {
            return Ok(Arc::clone(sink.value()));
        }
        let connected = self.ctx.connector.connect(peer);
        metrics::record_peer_connection(&peer.id, connected.is_ok());
        let sink = connected?;
        self.sinks.insert(peer.id.clone(), Arc::clone(&sink));
        Ok(sink)
    }

    async fn remove_peer_queues(&self, peer_id: &str) {
        let keys: Vec<QueueKey> = self
            .workers
            .iter()
            .filter(|w| w.key().peer_id == peer_id)
            .map(|w| w.key().clone())
            .collect();
        let stopping: Vec<WorkerHandle> = keys
            .iter()
            .filter_map(|key| self.workers.remove(key).map(|(_, w)| w))
            .collect();
        futures::future::join_all(stopping.into_iter().map(|w| w.stop(DRAIN_TIMEOUT))).await;
        self.circuits.remove(peer_id);
        self.sinks.remove(peer_id);
        metrics::set_active_workers(self.workers.len());

        // Another node may have re-added the peer while workers stopped
        if self.ctx.registry.contains(peer_id) {
            info!(peer_id, "Peer re-added during removal, keeping its queues");
            return;
        }
        match self.ctx.store.queues_owned_by(&self.node_id).await {
            Ok(owned) => {
                for key in owned.into_iter().filter(|k| k.peer_id == peer_id) {
                    if let Err(e) = self.ctx.store.drop_queue(&key).await {
                        warn!(queue = %key, error = %e, "Failed to drop queue of removed peer");
                    }
                }
            }
            Err(e) => warn!(peer_id, error = %e, "Failed to list queues of removed peer"),
        }
        info!(peer_id, "Stopped replicating to removed peer");
    }

    /// Append a rolled WAL file to every local queue this node owns.
    async fn enqueue_rolled(&self, file: &WalFileRef) {
        let owned = match self.ctx.store.queues_owned_by(&self.node_id).await {
            Ok(owned) => owned,
            Err(e) => {
                warn!(error = %e, "Failed to list queues for rolled log");
                return;
            }
        };
        for key in owned.into_iter().filter(|k| !k.is_recovered()) {
            match self.ctx.store.enqueue_file(&key, file).await {
                Ok(()) => {}
                Err(e) if e.is_stale_ownership() => {
                    debug!(queue = %key, "Queue vanished before enqueue");
                }
                Err(e) => {
                    debug!(queue = %key, file_seq = file.seq, error = %e, "Rolled log not enqueued");
                }
            }
        }
    }

    /// Catch up on rolls missed while the event channel lagged or the node
    /// was down.
    async fn reconcile_active_log(&self) {
        if let Some((active, _)) = self.ctx.storage.active_log() {
            self.enqueue_rolled(&active).await;
        }
    }

    fn reap_finished(&self) {
        self.workers.retain(|key, worker| {
            let keep = !worker.is_finished();
            if !keep {
                debug!(queue = %key, "Reaped finished worker");
            }
            keep
        });
    }

    async fn stop_all_workers(&self) {
        let keys: Vec<QueueKey> = self.workers.iter().map(|w| w.key().clone()).collect();
        let stopping: Vec<WorkerHandle> = keys
            .iter()
            .filter_map(|key| self.workers.remove(key).map(|(_, w)| w))
            .collect();
        if !stopping.is_empty() {
            info!(workers = stopping.len(), "Stopping source workers");
        }
        futures::future::join_all(stopping.into_iter().map(|w| w.stop(DRAIN_TIMEOUT))).await;
        metrics::set_active_workers(0);
    }

    /// Whether a queue still holds data nobody shipped.
    async fn has_backlog(&self, queue: &ReplicationQueue) -> bool {
        if queue.has_next_file() {
            return true;
        }
        let Some(head) = queue.head() else {
            return false;
        };
        let end = match self.ctx.storage.active_log() {
            Some((active, committed)) if active.seq == head.seq && !queue.key.is_recovered() => {
                committed
            }
            _ => match tokio::fs::metadata(&head.path).await {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            },
        };
        queue.read_offset < end
    }

    async fn on_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Added(peer) => {
                let _admin = self.peer_admin.lock().await;
                if !self.ctx.registry.contains(&peer.id) {
                    debug!(peer_id = %peer.id, "Peer already removed again");
                } else if let Err(e) = self.ensure_local_queue(&peer.id).await {
                    warn!(peer_id = %peer.id, error = %e, "Failed to create queue for new peer");
                }
            }
            PeerEvent::Removed(peer_id) => {
                let _admin = self.peer_admin.lock().await;
                if self.ctx.registry.contains(&peer_id) {
                    debug!(peer_id = %peer_id, "Peer re-added, keeping its queues");
                } else {
                    self.remove_peer_queues(&peer_id).await;
                }
            }
            PeerEvent::StateChanged { peer_id, enabled } => {
                debug!(peer_id = %peer_id, enabled, "Peer state changed");
            }
            PeerEvent::Replicating(on) => debug!(replicating = on, "Replicating switch changed"),
        }
    }

    async fn on_queue_event(&self, event: QueueEvent) {
        match event {
            QueueEvent::Transferred { from, to } if to.owner == self.node_id => {
                info!(from = %from, to = %to, "Adopting transferred queue");
                self.spawn_worker(&to);
            }
            QueueEvent::Created(key) if key.owner == self.node_id => {
                self.spawn_worker(&key);
            }
            QueueEvent::Dropped(key) if key.owner == self.node_id => {
                if let Some((_, worker)) = self.workers.remove(&key) {
                    worker.request_stop();
                    metrics::set_active_workers(self.workers.len());
                }
            }
            _ => {}
        }
    }

    async fn on_log_event(&self, event: LogEvent) {
        // Enqueue first so a woken worker sees the next file
        if let LogEvent::Rolled(file) = &event {
            debug!(file_seq = file.seq, "Log rolled");
            self.enqueue_rolled(file).await;
        }
        self.wal_activity.send_modify(|n| *n = n.wrapping_add(1));
    }

    async fn poll(&self) {
        if let Err(e) = self.ctx.registry.refresh().await {
            warn!(error = %e, "Registry refresh failed");
        }
        self.reap_finished();
        if let Err(e) = self.sync().await {
            warn!(error = %e, "Queue sync failed");
        }
        self.reconcile_active_log().await;
        metrics::set_active_workers(self.workers.len());
    }
}

async fn run_event_loop(
    inner: Arc<EngineInner>,
    mut peer_events: broadcast::Receiver<PeerEvent>,
    mut queue_events: broadcast::Receiver<QueueEvent>,
    mut log_events: broadcast::Receiver<LogEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    poll: Duration,
) {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    debug!("Event loop started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            event = peer_events.recv() => match event {
                Ok(event) => inner.on_peer_event(event).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Peer events lagged, resyncing");
                    if let Err(e) = inner.sync().await {
                        warn!(error = %e, "Queue sync failed");
                    }
                }
                Err(RecvError::Closed) => break,
            },
            event = queue_events.recv() => match event {
                Ok(event) => inner.on_queue_event(event).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Queue events lagged, adopting owned queues");
                    if let Err(e) = inner.adopt_owned().await {
                        warn!(error = %e, "Queue adoption failed");
                    }
                }
                Err(RecvError::Closed) => break,
            },
            event = log_events.recv() => match event {
                Ok(event) => inner.on_log_event(event).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Log events lagged, reconciling active log");
                    inner.reconcile_active_log().await;
                    inner.wal_activity.send_modify(|n| *n = n.wrapping_add(1));
                }
                Err(RecvError::Closed) => break,
            },
            _ = ticker.tick() => inner.poll().await,
        }
    }

    debug!("Event loop stopped");
}
