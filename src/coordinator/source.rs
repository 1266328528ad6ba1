// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source worker: tails one replication queue and ships it to one peer.
//!
//! Each (owner, peer, origin) queue has a dedicated worker task that:
//! 1. Loads the queue's head file and read offset from the queue store
//! 2. Reads a bounded batch of WAL entries, dropping non-global families
//! 3. Ships the batch through the peer's circuit breaker, with a timeout
//! 4. Advances the stored offset only after the peer acknowledged
//! 5. Drops the head file once it is closed and fully consumed
//!
//! The queue store is re-read at the top of every iteration, so the stored
//! offset is the only position a worker trusts. A failed ship is retried
//! with the same batch; the peer tolerates redelivery.
//!
//! # Active file
//!
//! A local queue whose head is the node's active WAL reads only up to the
//! committed length reported by the storage engine, and never finishes that
//! file. Recovered queues treat every file as closed: their origin is dead.
//!
//! # Cancellation
//!
//! Every wait (idle poll, backoff, rate limiter, bulkhead, the ship itself)
//! is raced against the stop signal, so stopping a worker abandons at most
//! one in-flight batch. An abandoned batch was never acknowledged and is
//! read again by whoever owns the queue next.

use super::types::SourceState;
use crate::batch::{read_batch, BatchLimits};
use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::config::{SloConfig, SourceConfig};
use crate::error::ReplicationError;
use crate::metrics;
use crate::queue_store::{QueueKey, ReplicationQueueStore};
use crate::resilience::{Bulkhead, RateLimiter};
use crate::sink::{PeerSink, ShipBatch};
use crate::storage::{SchemaRef, StorageEngine};
use crate::wal::{LogPosition, WalFileRef, WalReader};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Dependencies shared by every worker of one engine.
#[derive(Clone)]
pub(crate) struct WorkerShared {
    pub(crate) config: SourceConfig,
    pub(crate) slo: SloConfig,
    pub(crate) limits: BatchLimits,
    pub(crate) store: Arc<ReplicationQueueStore>,
    pub(crate) storage: Arc<dyn StorageEngine>,
    pub(crate) schema: Arc<dyn SchemaRef>,
    pub(crate) rate_limiter: Option<Arc<RateLimiter>>,
    pub(crate) bulkhead: Arc<Bulkhead>,
}

/// Signals a worker listens to besides its own stop flag.
pub(crate) struct WorkerGates {
    /// Global replicating switch.
    pub(crate) replicating: watch::Receiver<bool>,
    /// Per-peer enabled flag. Closed when the peer is removed.
    pub(crate) peer_enabled: watch::Receiver<bool>,
    /// Bumped on every local WAL append or roll.
    pub(crate) wal_activity: watch::Receiver<u64>,
}

/// Counters read by the health check.
#[derive(Debug, Default)]
pub(crate) struct SourceStats {
    consecutive_failures: AtomicU32,
    edits_shipped: AtomicU64,
    batches_shipped: AtomicU64,
    /// Epoch millis of the last acknowledged ship, 0 if none.
    last_ship_millis: AtomicI64,
    files: AtomicUsize,
    file_seq: AtomicU64,
    offset: AtomicU64,
}

impl SourceStats {
    fn on_shipped(&self, edits: usize) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.edits_shipped.fetch_add(edits as u64, Ordering::Relaxed);
        self.batches_shipped.fetch_add(1, Ordering::Relaxed);
        self.last_ship_millis
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Returns the new consecutive failure count.
    fn on_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn on_position(&self, position: LogPosition) {
        self.file_seq.store(position.file_seq, Ordering::Relaxed);
        self.offset.store(position.offset, Ordering::Relaxed);
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn edits_shipped(&self) -> u64 {
        self.edits_shipped.load(Ordering::Relaxed)
    }

    pub(crate) fn batches_shipped(&self) -> u64 {
        self.batches_shipped.load(Ordering::Relaxed)
    }

    pub(crate) fn files(&self) -> usize {
        self.files.load(Ordering::Relaxed)
    }

    pub(crate) fn position(&self) -> LogPosition {
        LogPosition {
            file_seq: self.file_seq.load(Ordering::Relaxed),
            offset: self.offset.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn millis_since_ship(&self) -> Option<u64> {
        match self.last_ship_millis.load(Ordering::Relaxed) {
            0 => None,
            last => Some((chrono::Utc::now().timestamp_millis() - last).max(0) as u64),
        }
    }
}

/// Engine-side handle to a running worker.
pub(crate) struct WorkerHandle {
    stop: watch::Sender<bool>,
    state: watch::Receiver<SourceState>,
    pub(crate) stats: Arc<SourceStats>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn state(&self) -> SourceState {
        *self.state.borrow()
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<SourceState> {
        self.state.clone()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub(crate) fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Stop and wait up to `drain_timeout` for the task to exit.
    pub(crate) async fn stop(self, drain_timeout: Duration) {
        self.request_stop();
        match tokio::time::timeout(drain_timeout, self.join).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Source worker panicked"),
            Err(_) => warn!("Source worker did not stop in time (in-flight batch abandoned)"),
        }
    }

    /// Kill the task without any cleanup (simulated crash).
    pub(crate) fn abort(self) {
        self.join.abort();
    }
}

/// Spawn a worker for `key`.
pub(crate) fn spawn_source(
    key: QueueKey,
    shared: WorkerShared,
    sink: Arc<dyn PeerSink>,
    circuit: Arc<CircuitBreaker>,
    gates: WorkerGates,
) -> WorkerHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let (state_tx, state_rx) = watch::channel(SourceState::Starting);
    let stats = Arc::new(SourceStats::default());

    let worker = SourceWorker {
        key,
        shared,
        sink,
        circuit,
        stats: Arc::clone(&stats),
        state_tx,
        stop_rx,
        replicating_rx: gates.replicating,
        enabled_rx: gates.peer_enabled,
        activity_rx: gates.wal_activity,
    };
    let join = tokio::spawn(worker.run());

    WorkerHandle {
        stop: stop_tx,
        state: state_rx,
        stats,
        join,
    }
}

/// What the run loop does after one step.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    /// Go again immediately.
    Continue,
    /// Caught up: wait for new data or the poll interval.
    Idle,
    /// Transient failure: wait `sleep_for_retries`.
    Retry,
    /// Unreadable WAL data.
    Stall,
    Stop,
}

enum Wake {
    Resume,
    Stop,
}

enum ShipOutcome {
    Acked,
    /// Shipping was disabled before an ack; the batch is read again later.
    Paused,
    Stopped,
}

struct SourceWorker {
    key: QueueKey,
    shared: WorkerShared,
    sink: Arc<dyn PeerSink>,
    circuit: Arc<CircuitBreaker>,
    stats: Arc<SourceStats>,
    state_tx: watch::Sender<SourceState>,
    stop_rx: watch::Receiver<bool>,
    replicating_rx: watch::Receiver<bool>,
    enabled_rx: watch::Receiver<bool>,
    activity_rx: watch::Receiver<u64>,
}

impl SourceWorker {
    async fn run(mut self) {
        let span = info_span!(
            "source",
            peer_id = %self.key.peer_id,
            origin = %self.key.origin,
            owner = %self.key.owner
        );

        async move {
            info!(recovered = self.key.is_recovered(), "Starting source worker");

            loop {
                if self.stop_requested() || self.peer_removed() {
                    break;
                }
                if !self.gate_open() {
                    match self.wait_while_gated().await {
                        Wake::Resume => continue,
                        Wake::Stop => break,
                    }
                }

                let wake = match self.step().await {
                    Step::Continue => Wake::Resume,
                    Step::Idle => self.idle(self.shared.config.poll_interval_duration()).await,
                    Step::Retry => self.pause(self.shared.config.sleep_for_retries_duration()).await,
                    Step::Stall => {
                        self.stall().await;
                        Wake::Stop
                    }
                    Step::Stop => Wake::Stop,
                };
                if let Wake::Stop = wake {
                    break;
                }
            }

            self.set_state(SourceState::Stopped);
            info!(
                batches = self.stats.batches_shipped(),
                edits = self.stats.edits_shipped(),
                "Source worker stopped"
            );
        }
        .instrument(span)
        .await
    }

    fn set_state(&self, state: SourceState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = %current, to = %state, "Source state");
                *current = state;
                true
            }
        });
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow() || self.stop_rx.has_changed().is_err()
    }

    /// The registry drops the enabled sender when the peer is removed.
    fn peer_removed(&self) -> bool {
        self.enabled_rx.has_changed().is_err()
    }

    fn gate_open(&self) -> bool {
        *self.replicating_rx.borrow() && *self.enabled_rx.borrow()
    }

    /// Length limit for the head file if it is still being written.
    fn active_length(&self, head: &WalFileRef) -> Option<u64> {
        if self.key.is_recovered() {
            return None;
        }
        match self.shared.storage.active_log() {
            Some((active, committed)) if active.seq == head.seq => Some(committed),
            _ => None,
        }
    }

    /// One read (and possibly ship) pass over the head file.
    async fn step(&mut self) -> Step {
        // Appends from here on wake the next idle wait
        self.activity_rx.borrow_and_update();
        self.set_state(SourceState::Reading);

        let peer_id = self.key.peer_id.clone();
        let queue = match self.shared.store.get(&self.key).await {
            Ok(Some(queue)) => queue,
            Ok(None) => {
                warn!("Queue no longer owned by this worker");
                metrics::record_stale_ownership(&peer_id);
                return Step::Stop;
            }
            Err(e) => {
                warn!(error = %e, "Failed to load queue");
                return Step::Retry;
            }
        };

        self.stats.files.store(queue.files.len(), Ordering::Relaxed);
        metrics::set_queue_files(&peer_id, &self.key.origin, queue.files.len());

        let Some(head) = queue.head().cloned() else {
            if self.key.is_recovered() {
                info!("Recovered queue fully replicated, dropping it");
                return match self.shared.store.drop_queue(&self.key).await {
                    Ok(_) => Step::Stop,
                    Err(e) => {
                        warn!(error = %e, "Failed to drop drained recovered queue");
                        Step::Retry
                    }
                };
            }
            return Step::Idle;
        };
        self.stats.on_position(LogPosition {
            file_seq: head.seq,
            offset: queue.read_offset,
        });

        let active_len = self.active_length(&head);
        let closed = active_len.is_none();
        let mut reader = match WalReader::open(&head.path, queue.read_offset, active_len).await {
            Ok(reader) => reader,
            Err(ReplicationError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound && closed => {
                warn!(
                    path = %head.path.display(),
                    file_seq = head.seq,
                    "WAL file missing, its unshipped edits are lost"
                );
                metrics::record_wal_loss(&peer_id, "missing_file");
                return self.finish(&head).await;
            }
            Err(e) => {
                warn!(error = %e, path = %head.path.display(), "Failed to open WAL file");
                return Step::Retry;
            }
        };

        let started = Instant::now();
        let batch = match read_batch(&mut reader, &*self.shared.schema, self.shared.limits).await {
            Ok(batch) => batch,
            Err(ReplicationError::Wal(detail)) => {
                error!(
                    path = %head.path.display(),
                    offset = reader.position(),
                    detail = %detail,
                    "Unreadable WAL record, replication for this queue stalled"
                );
                metrics::record_wal_loss(&peer_id, "corrupt_record");
                return Step::Stall;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read WAL batch");
                return Step::Retry;
            }
        };
        let read_latency = started.elapsed();
        metrics::record_read_latency(&peer_id, read_latency);
        if self.shared.slo.is_read_violation(read_latency) {
            metrics::record_slo_violation(&peer_id, "wal_read", read_latency.as_millis() as u64);
        }
        metrics::record_edits_read(&peer_id, batch.entries.len(), batch.filtered());

        let end = LogPosition {
            file_seq: head.seq,
            offset: batch.end_offset,
        };
        let finishable =
            batch.exhausted && closed && (queue.has_next_file() || self.key.is_recovered());

        if batch.truncated && finishable {
            warn!(
                path = %head.path.display(),
                offset = batch.end_offset,
                "Closed WAL file ends in a torn record, remainder is lost"
            );
            metrics::record_wal_loss(&peer_id, "torn_tail");
        }

        let progressed = batch.made_progress();
        if !batch.is_empty() {
            let ship = ShipBatch {
                origin: self.key.origin.clone(),
                peer_id: peer_id.clone(),
                entries: batch.entries,
            };
            match self.ship_until_acked(&ship).await {
                ShipOutcome::Acked => {}
                ShipOutcome::Paused => return Step::Continue,
                ShipOutcome::Stopped => return Step::Stop,
            }
        }

        if progressed {
            if let Err(step) = self.advance_to(batch.start_offset, end).await {
                return step;
            }
        }

        if finishable {
            return self.finish(&head).await;
        }
        if batch.exhausted {
            Step::Idle
        } else {
            Step::Continue
        }
    }

    async fn advance_to(&self, from: u64, position: LogPosition) -> Result<(), Step> {
        match self.shared.store.advance(&self.key, from, position).await {
            Ok(()) => {
                self.stats.on_position(position);
                metrics::set_log_position(
                    &self.key.peer_id,
                    &self.key.origin,
                    position.file_seq,
                    position.offset,
                );
                Ok(())
            }
            Err(e) if e.is_stale_ownership() => {
                warn!(position = %position, "Queue was taken over, stopping");
                Err(Step::Stop)
            }
            Err(e) => {
                // The batch is shipped again from the stored offset
                warn!(error = %e, position = %position, "Failed to persist queue position");
                Err(Step::Retry)
            }
        }
    }

    async fn finish(&self, head: &WalFileRef) -> Step {
        match self.shared.store.finish_file(&self.key, head.seq).await {
            Ok(()) => {
                debug!(file_seq = head.seq, "Moving to next WAL file");
                Step::Continue
            }
            Err(e) if e.is_stale_ownership() => {
                warn!("Queue was taken over, stopping");
                Step::Stop
            }
            Err(e) => {
                warn!(error = %e, file_seq = head.seq, "Failed to finish WAL file");
                Step::Retry
            }
        }
    }

    /// Ship until the peer acknowledges, backing off between attempts.
    async fn ship_until_acked(&mut self, batch: &ShipBatch) -> ShipOutcome {
        let ship_timeout = self.shared.config.ship_timeout_duration();
        let edits = batch.edit_count();

        loop {
            if self.stop_requested() || self.peer_removed() {
                return ShipOutcome::Stopped;
            }
            if !self.gate_open() {
                return ShipOutcome::Paused;
            }
            self.set_state(SourceState::Shipping);

            if let Some(limiter) = self.shared.rate_limiter.clone() {
                tokio::select! {
                    biased;
                    _ = self.stop_rx.changed() => continue,
                    _ = limiter.acquire_many(edits as u32) => {}
                }
            }

            let bulkhead = Arc::clone(&self.shared.bulkhead);
            let permit = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => continue,
                permit = bulkhead.acquire() => permit,
            };
            let Ok(_permit) = permit else {
                return ShipOutcome::Stopped;
            };

            let started = Instant::now();
            let sink = &self.sink;
            let circuit = &self.circuit;
            let result = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => {
                    info!(edits, "Stop requested, abandoning in-flight ship");
                    return ShipOutcome::Stopped;
                }
                result = circuit.call(|| async {
                    match tokio::time::timeout(ship_timeout, sink.replicate(batch)).await {
                        Ok(result) => result,
                        Err(_) => Err(ReplicationError::Timeout {
                            operation: format!("ship to peer {}", batch.peer_id),
                            after_ms: ship_timeout.as_millis() as u64,
                        }),
                    }
                }) => result,
            };
            let latency = started.elapsed();

            let failure = match result {
                Ok(()) => {
                    metrics::record_batch_shipped(&batch.peer_id, edits, latency);
                    if self.shared.slo.is_ship_violation(latency) {
                        metrics::record_slo_violation(&batch.peer_id, "ship", latency.as_millis() as u64);
                    }
                    self.stats.on_shipped(edits);
                    debug!(edits, latency_ms = latency.as_millis() as u64, "Batch acknowledged");
                    return ShipOutcome::Acked;
                }
                Err(CircuitError::Rejected) => ("circuit_open", "peer circuit open".to_string()),
                Err(CircuitError::Inner(e @ ReplicationError::Timeout { .. })) => ("timeout", e.to_string()),
                Err(CircuitError::Inner(e)) => ("transport", e.to_string()),
            };

            let (reason, message) = failure;
            metrics::record_ship_failure(&batch.peer_id, reason);
            let failures = self.stats.on_failure();
            let delay = self.shared.config.backoff_for_attempt(failures);
            warn!(
                reason,
                error = %message,
                consecutive_failures = failures,
                delay_ms = delay.as_millis() as u64,
                "Ship failed, backing off"
            );

            self.set_state(SourceState::Backoff);
            if let Wake::Stop = self.pause(delay).await {
                return ShipOutcome::Stopped;
            }
        }
    }

    /// Wait for new WAL data, a gate change, or the poll interval.
    async fn idle(&mut self, poll: Duration) -> Wake {
        tokio::select! {
            r = self.stop_rx.changed() => {
                if r.is_err() || *self.stop_rx.borrow() { Wake::Stop } else { Wake::Resume }
            }
            r = self.activity_rx.changed() => {
                if r.is_err() { Wake::Stop } else { Wake::Resume }
            }
            r = self.replicating_rx.changed() => {
                if r.is_err() { Wake::Stop } else { Wake::Resume }
            }
            r = self.enabled_rx.changed() => {
                if r.is_err() { Wake::Stop } else { Wake::Resume }
            }
            _ = tokio::time::sleep(poll) => Wake::Resume,
        }
    }

    /// Sleep that only a stop (or peer removal) cuts short.
    async fn pause(&mut self, delay: Duration) -> Wake {
        tokio::select! {
            r = self.stop_rx.changed() => {
                if r.is_err() || *self.stop_rx.borrow() { Wake::Stop } else { Wake::Resume }
            }
            r = self.enabled_rx.changed(), if !self.peer_removed() => {
                if r.is_err() { Wake::Stop } else { Wake::Resume }
            }
            _ = tokio::time::sleep(delay) => Wake::Resume,
        }
    }

    async fn wait_while_gated(&mut self) -> Wake {
        self.set_state(SourceState::Disabled);
        info!("Shipping disabled, queue position kept");

        loop {
            if self.stop_requested() || self.peer_removed() {
                return Wake::Stop;
            }
            if self.gate_open() {
                info!("Shipping enabled, resuming from stored position");
                return Wake::Resume;
            }
            tokio::select! {
                r = self.stop_rx.changed() => if r.is_err() { return Wake::Stop },
                r = self.replicating_rx.changed() => if r.is_err() { return Wake::Stop },
                r = self.enabled_rx.changed() => if r.is_err() { return Wake::Stop },
            }
        }
    }

    async fn stall(&mut self) {
        self.set_state(SourceState::Stalled);
        loop {
            if self.stop_requested() || self.peer_removed() {
                return;
            }
            tokio::select! {
                r = self.stop_rx.changed() => if r.is_err() { return },
                r = self.enabled_rx.changed() => if r.is_err() { return },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::db::open_pool;
    use crate::storage::{BoxFuture, LogEvent};
    use crate::wal::{Cell, ReplicationScope, WalEntry, WalWriter};
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    struct FixedStorage {
        active: Mutex<Option<(WalFileRef, u64)>>,
        events: broadcast::Sender<LogEvent>,
    }

    impl StorageEngine for FixedStorage {
        fn active_log(&self) -> Option<(WalFileRef, u64)> {
            self.active.lock().unwrap().clone()
        }

        fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
            self.events.subscribe()
        }
    }

    struct OnlyFamilyF;

    impl SchemaRef for OnlyFamilyF {
        fn family_scope(&self, _table: &str, family: &str) -> ReplicationScope {
            if family == "f" {
                ReplicationScope::Global
            } else {
                ReplicationScope::Local
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<ShipBatch>>,
        failures_left: AtomicU32,
    }

    impl RecordingSink {
        fn shipped_seqs(&self) -> Vec<u64> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flat_map(|b| b.entries.iter().map(|e| e.sequence_id))
                .collect()
        }
    }

    impl PeerSink for RecordingSink {
        fn replicate<'a>(&'a self, batch: &'a ShipBatch) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                if self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(ReplicationError::ship(&batch.peer_id, "injected failure"));
                }
                self.batches.lock().unwrap().push(batch.clone());
                Ok(())
            })
        }
    }

    fn entry(seq: u64, family: &str) -> WalEntry {
        WalEntry {
            table: "test".into(),
            sequence_id: seq,
            write_time: 0,
            cells: vec![Cell::put(format!("row{}", seq), family, "q", seq as i64, b"v".to_vec())],
        }
    }

    struct Harness {
        store: Arc<ReplicationQueueStore>,
        storage: Arc<FixedStorage>,
        sink: Arc<RecordingSink>,
        replicating: watch::Sender<bool>,
        enabled: watch::Sender<bool>,
        activity: watch::Sender<u64>,
    }

    impl Harness {
        async fn new() -> Self {
            let pool = open_pool(&StoreConfig::in_memory()).await.unwrap();
            Self {
                store: Arc::new(ReplicationQueueStore::new(pool)),
                storage: Arc::new(FixedStorage {
                    active: Mutex::new(None),
                    events: broadcast::channel(16).0,
                }),
                sink: Arc::new(RecordingSink::default()),
                replicating: watch::channel(true).0,
                enabled: watch::channel(true).0,
                activity: watch::channel(0).0,
            }
        }

        fn spawn(&self, key: QueueKey) -> WorkerHandle {
            let config = SourceConfig::for_testing();
            let shared = WorkerShared {
                limits: BatchLimits {
                    size_capacity: config.size_capacity,
                    nb_capacity: config.nb_capacity,
                },
                config,
                slo: SloConfig::default(),
                store: Arc::clone(&self.store),
                storage: self.storage.clone(),
                schema: Arc::new(OnlyFamilyF),
                rate_limiter: None,
                bulkhead: Arc::new(Bulkhead::new(4)),
            };
            spawn_source(
                key,
                shared,
                self.sink.clone(),
                Arc::new(CircuitBreaker::new("test", Default::default())),
                WorkerGates {
                    replicating: self.replicating.subscribe(),
                    peer_enabled: self.enabled.subscribe(),
                    wal_activity: self.activity.subscribe(),
                },
            )
        }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_ships_closed_files_in_order_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let h = Harness::new().await;
        let key = QueueKey::local("rs-1", "2");

        let mut w1 = WalWriter::create(dir.path(), "rs-1", 1).await.unwrap();
        w1.append(&entry(1, "f")).await.unwrap();
        w1.append(&entry(2, "norep")).await.unwrap();
        w1.append(&entry(3, "f")).await.unwrap();
        let mut w2 = WalWriter::create(dir.path(), "rs-1", 2).await.unwrap();
        let committed = w2.append(&entry(4, "f")).await.unwrap();
        *h.storage.active.lock().unwrap() = Some((w2.file_ref().clone(), committed));

        h.store.create_queue(&key, Some((w1.file_ref(), 0))).await.unwrap();
        h.store.enqueue_file(&key, w2.file_ref()).await.unwrap();

        let worker = h.spawn(key.clone());
        let sink = h.sink.clone();
        wait_for("all edits shipped", || sink.shipped_seqs() == vec![1, 3, 4]).await;

        // Closed file dropped, active file kept at its committed length
        let store = h.store.clone();
        let k = key.clone();
        let mut settled = false;
        for _ in 0..100 {
            let queue = store.get(&k).await.unwrap().unwrap();
            if queue.files.len() == 1 && queue.read_offset == committed {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(settled);
        worker.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_filtered_only_edits_advance_without_shipping() {
        let dir = tempfile::tempdir().unwrap();
        let h = Harness::new().await;
        let key = QueueKey::local("rs-1", "2");

        let mut w1 = WalWriter::create(dir.path(), "rs-1", 1).await.unwrap();
        w1.append(&entry(1, "norep")).await.unwrap();
        let committed = w1.append(&entry(2, "norep")).await.unwrap();
        *h.storage.active.lock().unwrap() = Some((w1.file_ref().clone(), committed));
        h.store.create_queue(&key, Some((w1.file_ref(), 0))).await.unwrap();

        let worker = h.spawn(key.clone());
        let mut advanced = false;
        for _ in 0..200 {
            if h.store.get(&key).await.unwrap().unwrap().read_offset == committed {
                advanced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(advanced);
        assert!(h.sink.batches.lock().unwrap().is_empty());
        worker.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_transient_failures_retry_same_batch() {
        let dir = tempfile::tempdir().unwrap();
        let h = Harness::new().await;
        h.sink.failures_left.store(3, Ordering::SeqCst);
        let key = QueueKey::new("rs-2", "2", "rs-1");

        let mut w1 = WalWriter::create(dir.path(), "rs-1", 1).await.unwrap();
        for seq in 1..=5 {
            w1.append(&entry(seq, "f")).await.unwrap();
        }
        h.store.create_queue(&key, Some((w1.file_ref(), 0))).await.unwrap();

        let worker = h.spawn(key.clone());
        let sink = h.sink.clone();
        wait_for("batch shipped after retries", || sink.shipped_seqs() == vec![1, 2, 3, 4, 5]).await;
        assert_eq!(worker.stats.consecutive_failures(), 0);

        // Recovered queue drops itself once drained
        let mut state = worker.state_receiver();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| s.is_terminal()))
            .await
            .unwrap()
            .unwrap();
        assert!(h.store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disabled_worker_keeps_position_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let h = Harness::new().await;
        h.replicating.send_replace(false);
        let key = QueueKey::local("rs-1", "2");

        let mut w1 = WalWriter::create(dir.path(), "rs-1", 1).await.unwrap();
        let committed = w1.append(&entry(1, "f")).await.unwrap();
        *h.storage.active.lock().unwrap() = Some((w1.file_ref().clone(), committed));
        h.store.create_queue(&key, Some((w1.file_ref(), 0))).await.unwrap();

        let worker = h.spawn(key.clone());
        let mut state = worker.state_receiver();
        tokio::time::timeout(Duration::from_secs(1), state.wait_for(|s| *s == SourceState::Disabled))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.sink.shipped_seqs().is_empty());
        assert_eq!(h.store.get(&key).await.unwrap().unwrap().read_offset, 0);

        h.replicating.send_replace(true);
        let sink = h.sink.clone();
        wait_for("edit shipped after enable", || sink.shipped_seqs() == vec![1]).await;
        worker.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stale_owner_stops() {
        let dir = tempfile::tempdir().unwrap();
        let h = Harness::new().await;
        let key = QueueKey::local("rs-1", "2");
        let w1 = WalWriter::create(dir.path(), "rs-1", 1).await.unwrap();
        h.store.create_queue(&key, Some((w1.file_ref(), 0))).await.unwrap();
        *h.storage.active.lock().unwrap() = Some((w1.file_ref().clone(), 0));

        let worker = h.spawn(key.clone());
        h.store.drop_queue(&key).await.unwrap();
        h.activity.send_modify(|n| *n += 1);

        let mut state = worker.state_receiver();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| s.is_terminal()))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_record_stalls_without_advancing() {
        let dir = tempfile::tempdir().unwrap();
        let h = Harness::new().await;
        let key = QueueKey::new("rs-2", "2", "rs-1");

        let mut w1 = WalWriter::create(dir.path(), "rs-1", 1).await.unwrap();
        w1.append(&entry(1, "f")).await.unwrap();
        let path = w1.file_ref().path.clone();
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        h.store.create_queue(&key, Some((w1.file_ref(), 0))).await.unwrap();

        let worker = h.spawn(key.clone());
        let mut state = worker.state_receiver();
        tokio::time::timeout(Duration::from_secs(1), state.wait_for(|s| *s == SourceState::Stalled))
            .await
            .unwrap()
            .unwrap();
        assert!(h.sink.shipped_seqs().is_empty());
        assert_eq!(h.store.get(&key).await.unwrap().unwrap().read_offset, 0);

        worker.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_missing_closed_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let h = Harness::new().await;
        let key = QueueKey::new("rs-2", "2", "rs-1");

        let gone = WalFileRef::new(1, dir.path().join("rs-1.0000000001.wal"));
        let mut w2 = WalWriter::create(dir.path(), "rs-1", 2).await.unwrap();
        w2.append(&entry(7, "f")).await.unwrap();
        h.store.create_queue(&key, Some((&gone, 0))).await.unwrap();
        h.store.enqueue_file(&key, w2.file_ref()).await.unwrap();

        let _worker = h.spawn(key);
        let sink = h.sink.clone();
        wait_for("edit from next file shipped", || sink.shipped_seqs() == vec![7]).await;
    }

    #[test]
    fn test_stats_millis_since_ship() {
        let stats = SourceStats::default();
        assert_eq!(stats.millis_since_ship(), None);
        stats.on_shipped(3);
        assert!(stats.millis_since_ship().is_some());
        assert_eq!(stats.edits_shipped(), 3);
        assert_eq!(stats.on_failure(), 1);
        assert_eq!(stats.on_failure(), 2);
        stats.on_shipped(1);
        assert_eq!(stats.consecutive_failures(), 0);
    }
}
