//! Engine and worker state types.
//!
//! # Engine State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!                                   │
//!                                   │ (queues created / adopted)
//!                                   ↓
//!                               Running
//!                                   │
//!             shutdown() / decommission() / halt()
//!                                   ↓
//!                             ShuttingDown ──→ Stopped
//!
//! Starting ──(store unavailable)──→ Failed
//! ```
//!
//! # Source Worker States
//!
//! ```text
//! Starting ──→ Reading ──(batch)──→ Shipping ──(ack)──→ Reading
//!                 ↑                    │
//!                 │                 (failure)
//!                 │                    ↓
//!                 └───────────────── Backoff
//!
//! Disabled: replicating switch or peer disabled. Re-enters Reading at
//!           the unchanged queue position.
//! Stalled:  unreadable WAL record. Waits for stop.
//! Stopped:  terminal (peer removed, queue lost, node shutdown, recovered
//!           queue drained).
//! ```

use crate::queue_store::QueueKey;

/// State of the replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::ReplicationEngine::start) to begin replication.
    Created,

    /// Creating local queues and adopting queues this node already owns.
    Starting,

    /// Workers are shipping; the event loop and failover coordinator run.
    Running,

    /// Workers are being stopped.
    ShuttingDown,

    /// Stopped. Queue state is durable; a new engine resumes it.
    Stopped,

    /// Failed to start. Check logs for error details.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// State of one source worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Starting,
    Reading,
    Shipping,
    Backoff,
    Disabled,
    Stalled,
    Stopped,
}

impl SourceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SourceState::Stopped)
    }
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceState::Starting => "starting",
            SourceState::Reading => "reading",
            SourceState::Shipping => "shipping",
            SourceState::Backoff => "backoff",
            SourceState::Disabled => "disabled",
            SourceState::Stalled => "stalled",
            SourceState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Health of one queue's worker, from cached worker state.
#[derive(Debug, Clone)]
pub struct QueueHealth {
    pub key: QueueKey,
    pub state: SourceState,
    /// Files still queued, as of the worker's last read.
    pub files: usize,
    pub file_seq: u64,
    pub offset: u64,
    pub consecutive_failures: u32,
    pub edits_shipped: u64,
    /// `None` if nothing was shipped yet.
    pub millis_since_ship: Option<u64>,
}

/// Health snapshot for monitoring endpoints.
///
/// Built from in-memory state only; no store or network I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Global replicating switch.
    pub replicating: bool,
    /// Engine running.
    pub ready: bool,
    /// Ready, and no worker stalled or stuck in backoff past the circuit threshold.
    pub healthy: bool,
    pub peers_total: usize,
    /// Peers whose circuit is currently open.
    pub peers_circuit_open: Vec<String>,
    pub queues: Vec<QueueHealth>,
}
