// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors fall into three groups: administrative errors returned synchronously
//! to the caller of a registry operation, data-plane errors handled inside the
//! shipping workers, and local persistence errors that need operator attention.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Ship` | Yes | Peer unreachable, rejected batch, transport failure |
//! | `Timeout` | Yes | Ship attempt exceeded its deadline |
//! | `Redis` | Yes | Network errors talking to a peer's ingestion stream |
//! | `DuplicatePeer` | No | `add_peer` with an id that already exists |
//! | `UnknownPeer` | No | `remove_peer` / lookup of an absent id |
//! | `StaleOwnership` | No | Queue was transferred or dropped under the caller |
//! | `SourceStillAlive` | No | Transfer refused, the owner is still live |
//! | `QueueNotFound` | No | Queue key does not exist |
//! | `NonMonotonicOffset` | No | Attempt to move a read offset backwards |
//! | `Wal` | No | Corrupt write-ahead-log record |
//! | `Io` | No | Local filesystem error |
//! | `Store` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether a shipping
//! worker should back off and retry the same batch. `StaleOwnership` is the
//! one error that ends a worker for good: another node now owns the queue.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// A peer with this id is already registered.
    #[error("Peer already exists: {0}")]
    DuplicatePeer(String),

    /// No peer with this id is registered.
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// The caller no longer owns the queue it is trying to mutate.
    ///
    /// Raised after a completed failover (or a peer removal) so that a
    /// zombie worker cannot corrupt the new owner's position.
    #[error("Stale ownership of queue {queue}: caller {caller} is not the owner")]
    StaleOwnership { queue: String, caller: String },

    /// Ownership transfer refused because the coordination service still
    /// reports the current owner as live.
    #[error("Source node still alive: {0}")]
    SourceStillAlive(String),

    /// Queue key does not exist in the store.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Read offsets only move forward.
    #[error("Non-monotonic offset for queue {queue}: current {current}, requested {requested}")]
    NonMonotonicOffset {
        queue: String,
        current: u64,
        requested: u64,
    },

    /// Shipping a batch to a peer failed.
    ///
    /// Covers unreachable peers, transport errors and logical rejection.
    #[error("Ship to peer {peer_id} failed: {message}")]
    Ship { peer_id: String, message: String },

    /// An operation exceeded its deadline.
    #[error("Timeout after {after_ms}ms: {operation}")]
    Timeout { operation: String, after_ms: u64 },

    /// Redis connection or command error on the shipping transport.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// Write-ahead-log corruption (checksum mismatch, malformed payload).
    #[error("WAL error: {0}")]
    Wal(String),

    /// Local filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite error in the peer registry or queue store.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a ship error for a peer.
    pub fn ship(peer_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Ship {
            peer_id: peer_id.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Ship { .. } => true,
            Self::Timeout { .. } => true,
            Self::Redis { .. } => true, // Network errors are retryable
            Self::DuplicatePeer(_) => false,
            Self::UnknownPeer(_) => false,
            Self::StaleOwnership { .. } => false, // Worker must stop
            Self::SourceStillAlive(_) => false,
            Self::QueueNotFound(_) => false,
            Self::NonMonotonicOffset { .. } => false,
            Self::Wal(_) => false, // Data corruption
            Self::Io(_) => false,
            Self::Store(_) => false, // Local DB issues need attention
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error means the caller lost the queue it was working on.
    pub fn is_stale_ownership(&self) -> bool {
        matches!(self, Self::StaleOwnership { .. })
    }
}

impl From<redis::RedisError> for ReplicationError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}
