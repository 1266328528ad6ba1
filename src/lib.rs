//! # Cluster Replication
//!
//! Asynchronous replication of write-ahead-logged edits from a source
//! key-value cluster to any number of peer clusters.
//!
//! ## Architecture
//!
//! One [`ReplicationEngine`] runs on every source node. It ships that node's
//! WAL, and the WAL of dead nodes it inherited, to every registered peer:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                         replication engine (per node)                     │
//! │                                                                           │
//! │  ┌──────────────┐   events   ┌──────────────────────────────────────────┐ │
//! │  │ PeerRegistry │──────────► │ Source worker per (owner, peer, origin)  │ │
//! │  │ (SQLite)     │            │ WalReader → scope filter → PeerSink      │ │
//! │  └──────────────┘            └──────────────────────────────────────────┘ │
//! │         │                                   │ advance after ack            │
//! │         ▼                                   ▼                             │
//! │  ┌──────────────────────────────────────────────────────────┐             │
//! │  │ ReplicationQueueStore (SQLite): files + offset per queue  │◄──┐        │
//! │  └──────────────────────────────────────────────────────────┘   │        │
//! │                                         transfer_ownership       │        │
//! │                             ┌─────────────────────────────────┐  │        │
//! │  membership events ───────► │ FailoverCoordinator             │──┘        │
//! │                             └─────────────────────────────────┘           │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Guarantees
//!
//! - Edits of `Global` families reach every enabled peer, at least once.
//! - Per queue, edits arrive in WAL order. Nothing is ordered across origins.
//! - A queue's offset only moves after the peer acknowledged the batch.
//! - A dead node's queues move to a live node and resume from the stored
//!   offset. There is no I/O fencing: WAL a dead node never made durable, or
//!   whose files disappeared, is lost and logged.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cluster_replication::{ReplicationConfig, ReplicationContext, ReplicationEngine};
//!
//! let config = ReplicationConfig::for_testing("rs-1");
//! let ctx = ReplicationContext::open(&config.store, storage, schema, membership, connector).await?;
//!
//! let mut engine = ReplicationEngine::new(config, ctx);
//! engine.start().await?;
//! engine.add_peer("2", "redis://peer-2:6379").await?;
//!
//! // Engine runs until shutdown
//! engine.shutdown().await;
//! ```

pub mod batch;
pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod membership;
pub mod metrics;
pub mod peer;
pub mod queue_store;
pub mod resilience;
pub mod sink;
pub mod storage;
pub mod verify;
pub mod wal;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, PeerCircuits};
pub use config::{
    FailoverConfig, ReplicationConfig, ReplicationSettings, SinkConfig, SloConfig, SourceConfig,
    StoreConfig,
};
pub use coordinator::{
    DecommissionReport, EngineState, FailoverCoordinator, FailoverReport, HealthCheck, QueueHealth,
    ReplicationContext, ReplicationEngine, SourceState,
};
pub use error::{ReplicationError, Result};
pub use membership::{ClusterMembership, InProcessMembership, MembershipEvent};
pub use peer::{PeerCluster, PeerEvent, PeerRegistry};
pub use queue_store::{QueueEvent, QueueKey, ReplicationQueue, ReplicationQueueStore};
pub use sink::{PeerConnector, PeerSink, RedisConnector, ShipBatch};
pub use storage::{BoxFuture, LogEvent, SchemaRef, StorageEngine};
pub use verify::{Row, RowSource, VerifyArgs, VerifyReplication, VerifyReport};
pub use wal::{Cell, CellKind, LogPosition, ReplicationScope, WalEntry, WalFileRef, WalReader, WalWriter};
