//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Peer registry changes and the replicating switch
//! - Source worker reads, shipping throughput and failures
//! - Queue size and log position per queue
//! - Failover transfers and stale ownership
//! - Circuit breaker rejections
//! - Verification job row counts
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use cluster_replication::metrics;
//! use std::time::Duration;
//!
//! // In a source worker after reading a batch
//! metrics::record_edits_read("2", 42, 3);
//!
//! // After the peer acknowledged it
//! metrics::record_batch_shipped("2", 39, Duration::from_millis(12));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Peer Registry Metrics
// =============================================================================

/// Number of registered peers.
pub fn record_peer_count(count: usize) {
    gauge!("replication_peers").set(count as f64);
}

/// Global replicating switch (1 = shipping, 0 = paused).
pub fn record_replicating(replicating: bool) {
    gauge!("replication_replicating").set(if replicating { 1.0 } else { 0.0 });
}

/// Record a registry mutation (added, removed, enabled, disabled).
pub fn record_peer_change(action: &str) {
    counter!("replication_peer_changes_total", "action" => action.to_string()).increment(1);
}

/// Record a transport connection attempt to a peer.
pub fn record_peer_connection(peer_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_peer_connections_total", "peer_id" => peer_id.to_string(), "status" => status).increment(1);
}

// =============================================================================
// Source Worker Metrics
// =============================================================================

/// Record WAL entries read for a peer, split into kept and filtered.
pub fn record_edits_read(peer_id: &str, kept: usize, filtered: usize) {
    let peer = peer_id.to_string();
    if kept > 0 {
        counter!("replication_edits_read_total", "peer_id" => peer.clone()).increment(kept as u64);
    }
    if filtered > 0 {
        counter!("replication_edits_filtered_total", "peer_id" => peer).increment(filtered as u64);
    }
}

/// Record WAL batch read latency.
pub fn record_read_latency(peer_id: &str, duration: Duration) {
    histogram!("replication_wal_read_duration_seconds", "peer_id" => peer_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record a batch acknowledged by the peer.
pub fn record_batch_shipped(peer_id: &str, edits: usize, duration: Duration) {
    let peer = peer_id.to_string();
    counter!("replication_batches_shipped_total", "peer_id" => peer.clone()).increment(1);
    counter!("replication_edits_shipped_total", "peer_id" => peer.clone()).increment(edits as u64);
    histogram!("replication_ship_duration_seconds", "peer_id" => peer.clone())
        .record(duration.as_secs_f64());
    histogram!("replication_batch_size", "peer_id" => peer).record(edits as f64);
}

/// Record a failed ship attempt (transport, timeout, circuit_open).
pub fn record_ship_failure(peer_id: &str, reason: &str) {
    counter!(
        "replication_ship_failures_total",
        "peer_id" => peer_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Files still queued for a (peer, origin) queue.
pub fn set_queue_files(peer_id: &str, origin: &str, files: usize) {
    gauge!(
        "replication_queue_files",
        "peer_id" => peer_id.to_string(),
        "origin" => origin.to_string()
    )
    .set(files as f64);
}

/// Acknowledged position of a queue.
pub fn set_log_position(peer_id: &str, origin: &str, file_seq: u64, offset: u64) {
    let peer = peer_id.to_string();
    let origin = origin.to_string();
    gauge!("replication_log_file_seq", "peer_id" => peer.clone(), "origin" => origin.clone())
        .set(file_seq as f64);
    gauge!("replication_log_offset", "peer_id" => peer, "origin" => origin).set(offset as f64);
}

/// Record WAL data that could not be shipped (missing file, torn tail of a
/// closed file, corrupt record).
pub fn record_wal_loss(peer_id: &str, reason: &str) {
    counter!(
        "replication_wal_unreadable_total",
        "peer_id" => peer_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Number of live source workers on this node.
pub fn set_active_workers(count: usize) {
    gauge!("replication_active_workers").set(count as f64);
}

// =============================================================================
// Queue Store / Failover Metrics
// =============================================================================

/// Record a SQLite busy retry.
pub fn record_store_retry(operation: &str) {
    counter!("replication_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a rejected mutation from a worker that lost its queue.
pub fn record_stale_ownership(peer_id: &str) {
    counter!("replication_stale_ownership_total", "peer_id" => peer_id.to_string()).increment(1);
}

/// Record one queue moved to a new owner.
pub fn record_failover_transfer(peer_id: &str) {
    counter!("replication_failover_transfers_total", "peer_id" => peer_id.to_string()).increment(1);
}

/// Record the outcome of one failover pass.
pub fn record_failover_pass(transferred: usize, orphaned: usize, dropped: usize, duration: Duration) {
    counter!("replication_failover_passes_total").increment(1);
    gauge!("replication_orphaned_queues").set(orphaned as f64);
    if dropped > 0 {
        counter!("replication_failover_dropped_total").increment(dropped as u64);
    }
    histogram!("replication_failover_duration_seconds").record(duration.as_secs_f64());
    histogram!("replication_failover_queues").record(transferred as f64);
}

// =============================================================================
// Engine Metrics
// =============================================================================

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Numeric for alerting
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replication_engine_state").set(value);
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!(
        "replication_circuit_rejections_total",
        "circuit" => circuit_name.to_string()
    )
    .increment(1);
}

// =============================================================================
// SLO Violation Metrics
// =============================================================================

/// Record an SLO violation (latency threshold exceeded).
///
/// Labels:
/// - `peer_id`: The peer whose queue violated the SLO
/// - `slo_type`: `wal_read` or `ship`
pub fn record_slo_violation(peer_id: &str, slo_type: &str, latency_ms: u64) {
    counter!(
        "replication_slo_violations_total",
        "peer_id" => peer_id.to_string(),
        "slo_type" => slo_type.to_string()
    )
    .increment(1);

    histogram!(
        "replication_slo_violation_latency_ms",
        "peer_id" => peer_id.to_string(),
        "slo_type" => slo_type.to_string()
    )
    .record(latency_ms as f64);
}

// =============================================================================
// Verification Metrics
// =============================================================================

/// Record a verification run's GOODROWS / BADROWS.
pub fn record_verify_rows(peer_id: &str, table: &str, good: u64, bad: u64) {
    let peer = peer_id.to_string();
    let table = table.to_string();
    counter!("replication_verify_good_rows_total", "peer_id" => peer.clone(), "table" => table.clone())
        .increment(good);
    counter!("replication_verify_bad_rows_total", "peer_id" => peer, "table" => table).increment(bad);
}
