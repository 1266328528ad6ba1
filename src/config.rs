// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication engine.
//!
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use cluster_replication::config::ReplicationConfig;
//!
//! let config = ReplicationConfig {
//!     local_node_id: "rs-1".into(),
//!     ..Default::default()
//! };
//! assert_eq!(config.settings.source.nb_capacity, 25_000);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── local_node_id: String          # This node's id in the source cluster
//! ├── settings: ReplicationSettings
//! │   ├── source: SourceConfig       # Shipping worker batching / backoff
//! │   ├── failover: FailoverConfig   # Dead-node queue claiming
//! │   ├── sink: SinkConfig           # Redis ingestion stream transport
//! │   └── slo: SloConfig             # Latency thresholds
//! └── store: StoreConfig             # SQLite registry + queue persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! local_node_id: "rs-1"
//!
//! settings:
//!   source:
//!     size_capacity: 1024
//!     sleep_for_retries: "100ms"
//!     ship_timeout: "30s"
//!   failover:
//!     claim_delay: "0s"
//!
//! store:
//!   sqlite_path: "/var/lib/replication/queues.db"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// The identity of the local node running this engine.
    /// Queues created by this engine are owned by (and originate from) this id.
    pub local_node_id: String,

    /// Tunables for workers, failover, transport and SLOs.
    #[serde(default)]
    pub settings: ReplicationSettings,

    /// Registry / queue persistence settings.
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            local_node_id: "local.dev.node.default".to_string(),
            settings: ReplicationSettings::default(),
            store: StoreConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config for testing: in-memory store, fast retries.
    pub fn for_testing(local_node_id: &str) -> Self {
        Self {
            local_node_id: local_node_id.to_string(),
            settings: ReplicationSettings {
                source: SourceConfig::for_testing(),
                ..Default::default()
            },
            store: StoreConfig::in_memory(),
        }
    }
}

/// General settings for the replication logic.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub slo: SloConfig,
}

/// Parse a humantime duration string, falling back (with a warning) on garbage.
fn parse_duration_or(value: &str, field: &str, fallback: Duration) -> Duration {
    match humantime::parse_duration(value) {
        Ok(d) => d,
        Err(e) => {
            warn!(field, value, error = %e, "Invalid duration, using default");
            fallback
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig: shipping worker settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for the per-(node, peer) shipping workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Byte budget for one shipped batch (sum of entry heap sizes).
    #[serde(default = "default_size_capacity")]
    pub size_capacity: usize,

    /// Maximum number of WAL entries read into one batch (filtered or not).
    #[serde(default = "default_nb_capacity")]
    pub nb_capacity: usize,

    /// Base sleep between retries as a duration string (e.g., "1s").
    /// Backoff = sleep_for_retries * min(attempt, max_retries_multiplier).
    #[serde(default = "default_sleep_for_retries")]
    pub sleep_for_retries: String,

    /// Ceiling for the linear backoff multiplier.
    #[serde(default = "default_max_retries_multiplier")]
    pub max_retries_multiplier: u32,

    /// Deadline for one ship attempt. A hanging peer degrades to a retry.
    #[serde(default = "default_ship_timeout")]
    pub ship_timeout: String,

    /// Bounded wait when there is nothing to read and no notification arrives.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Maximum ship calls in flight across all workers of one node.
    #[serde(default = "default_max_concurrent_ships")]
    pub max_concurrent_ships: usize,

    /// Consecutive ship failures before a peer's circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long an open peer circuit waits before probing again.
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting
    // ─────────────────────────────────────────────────────────────────────────

    /// Enable rate limiting of shipped edits (per node, shared by all peers).
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Maximum edits per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Maximum burst size for rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_size_capacity() -> usize {
    64 * 1024 * 1024
}

fn default_nb_capacity() -> usize {
    25_000
}

fn default_sleep_for_retries() -> String {
    "1s".to_string()
}

fn default_max_retries_multiplier() -> u32 {
    10
}

fn default_ship_timeout() -> String {
    "30s".to_string()
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

fn default_max_concurrent_ships() -> usize {
    32
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> String {
    "10s".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    10_000
}

fn default_rate_limit_burst() -> u32 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            size_capacity: default_size_capacity(),
            nb_capacity: default_nb_capacity(),
            sleep_for_retries: default_sleep_for_retries(),
            max_retries_multiplier: default_max_retries_multiplier(),
            ship_timeout: default_ship_timeout(),
            poll_interval: default_poll_interval(),
            max_concurrent_ships: default_max_concurrent_ships(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset_timeout: default_circuit_reset_timeout(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl SourceConfig {
    /// Small batches and tight timers, so tests exercise rolling and retries.
    pub fn for_testing() -> Self {
        Self {
            size_capacity: 1024,
            nb_capacity: 500,
            sleep_for_retries: "20ms".to_string(),
            max_retries_multiplier: 5,
            ship_timeout: "500ms".to_string(),
            poll_interval: "25ms".to_string(),
            max_concurrent_ships: 8,
            circuit_failure_threshold: 50,
            circuit_reset_timeout: "50ms".to_string(),
            ..Default::default()
        }
    }

    /// Parse `sleep_for_retries` to a Duration.
    pub fn sleep_for_retries_duration(&self) -> Duration {
        parse_duration_or(&self.sleep_for_retries, "sleep_for_retries", Duration::from_secs(1))
    }

    /// Parse `ship_timeout` to a Duration.
    pub fn ship_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.ship_timeout, "ship_timeout", Duration::from_secs(30))
    }

    /// Parse `poll_interval` to a Duration.
    pub fn poll_interval_duration(&self) -> Duration {
        parse_duration_or(&self.poll_interval, "poll_interval", Duration::from_secs(1))
    }

    /// Parse `circuit_reset_timeout` to a Duration.
    pub fn circuit_reset_timeout_duration(&self) -> Duration {
        parse_duration_or(
            &self.circuit_reset_timeout,
            "circuit_reset_timeout",
            Duration::from_secs(10),
        )
    }

    /// Capped linear backoff for the given number of consecutive failures.
    pub fn backoff_for_attempt(&self, consecutive_failures: u32) -> Duration {
        let multiplier = consecutive_failures.clamp(1, self.max_retries_multiplier.max(1));
        self.sleep_for_retries_duration() * multiplier
    }

    /// Create rate limit configuration from source settings.
    ///
    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(crate::resilience::RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }

    /// Circuit breaker settings for per-peer ship circuits.
    pub fn circuit_config(&self) -> crate::circuit_breaker::CircuitConfig {
        crate::circuit_breaker::CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            success_threshold: 1,
            recovery_timeout: self.circuit_reset_timeout_duration(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FailoverConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Dead-node queue claiming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Whether this node takes part in claiming dead nodes' queues.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay between a node-death event and the first claim attempt.
    #[serde(default = "default_claim_delay")]
    pub claim_delay: String,
}

fn default_claim_delay() -> String {
    "0s".to_string()
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            claim_delay: default_claim_delay(),
        }
    }
}

impl FailoverConfig {
    /// Parse `claim_delay` to a Duration.
    pub fn claim_delay_duration(&self) -> Duration {
        parse_duration_or(&self.claim_delay, "claim_delay", Duration::ZERO)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SinkConfig: Redis ingestion stream transport
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for the Redis stream shipping transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Key prefix used by the peer cluster's ingestion stream (e.g., "repl:").
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Payloads at or above this many bytes are zstd-compressed.
    #[serde(default = "default_compress_threshold")]
    pub compress_threshold: usize,

    /// Cap the ingestion stream length (approximate MAXLEN), 0 = unbounded.
    #[serde(default)]
    pub max_stream_len: usize,
}

fn default_compress_threshold() -> usize {
    4096
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            key_prefix: None,
            compress_threshold: default_compress_threshold(),
            max_stream_len: 0,
        }
    }
}

impl SinkConfig {
    /// Get the ingestion stream key on the peer.
    pub fn ingest_stream_key(&self) -> String {
        let prefix = self.key_prefix.as_deref().unwrap_or("");
        format!("{}replication:ingest", prefix)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SloConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Latency thresholds. Violations are logged and counted, never enforced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloConfig {
    /// Maximum acceptable WAL batch read latency (ms).
    #[serde(default = "default_max_read_latency_ms")]
    pub max_read_latency_ms: u64,

    /// Maximum acceptable ship latency (ms).
    #[serde(default = "default_max_ship_latency_ms")]
    pub max_ship_latency_ms: u64,
}

fn default_max_read_latency_ms() -> u64 {
    100
}

fn default_max_ship_latency_ms() -> u64 {
    500
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            max_read_latency_ms: 100,
            max_ship_latency_ms: 500,
        }
    }
}

impl SloConfig {
    /// Check if a WAL read latency violates SLO.
    pub fn is_read_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_read_latency_ms
    }

    /// Check if a ship latency violates SLO.
    pub fn is_ship_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_ship_latency_ms
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Persistence for the peer registry and replication queues.
///
/// Both stores share one SQLite database. All nodes of a source cluster must
/// point at the same store: it is the single source of truth for ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database.
    pub sqlite_path: String,

    /// Whether to use WAL journal mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_queues.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    /// Whether this config points at a private in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_config_defaults() {
        let config = SourceConfig::default();
        assert_eq!(config.size_capacity, 64 * 1024 * 1024);
        assert_eq!(config.nb_capacity, 25_000);
        assert_eq!(config.sleep_for_retries_duration(), Duration::from_secs(1));
        assert_eq!(config.max_retries_multiplier, 10);
        assert_eq!(config.ship_timeout_duration(), Duration::from_secs(30));
        assert!(!config.rate_limit_enabled);
    }

    #[test]
    fn test_backoff_is_linear_and_capped() {
        let config = SourceConfig {
            sleep_for_retries: "100ms".to_string(),
            max_retries_multiplier: 10,
            ..Default::default()
        };

        // Zero failures still sleeps one unit
        assert_eq!(config.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_millis(300));
        assert_eq!(config.backoff_for_attempt(10), Duration::from_secs(1));
        assert_eq!(config.backoff_for_attempt(1000), Duration::from_secs(1));
    }

    #[test]
    fn test_duration_parsing_various_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
            ("2min", Duration::from_secs(120)),
        ];

        for (input, expected) in test_cases {
            let config = SourceConfig {
                ship_timeout: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.ship_timeout_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_duration_invalid_fallback() {
        let config = SourceConfig {
            poll_interval: "invalid".to_string(),
            ..Default::default()
        };
        assert_eq!(config.poll_interval_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_rate_limit_config() {
        let mut config = SourceConfig::default();
        assert!(config.rate_limit_config().is_none());

        config.rate_limit_enabled = true;
        config.rate_limit_per_sec = 5000;
        config.rate_limit_burst = 500;

        let rate_config = config.rate_limit_config().unwrap();
        assert_eq!(rate_config.refill_rate, 5000);
        assert_eq!(rate_config.burst_size, 500);
    }

    #[test]
    fn test_circuit_config_from_source() {
        let config = SourceConfig::for_testing();
        let circuit = config.circuit_config();
        assert_eq!(circuit.failure_threshold, 50);
        assert_eq!(circuit.recovery_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_failover_config_default() {
        let config = FailoverConfig::default();
        assert!(config.enabled);
        assert_eq!(config.claim_delay_duration(), Duration::ZERO);
    }

    #[test]
    fn test_sink_stream_key() {
        let mut config = SinkConfig::default();
        assert_eq!(config.ingest_stream_key(), "replication:ingest");
        config.key_prefix = Some("repl:".to_string());
        assert_eq!(config.ingest_stream_key(), "repl:replication:ingest");
    }

    #[test]
    fn test_slo_violations() {
        let config = SloConfig::default();
        assert!(!config.is_read_violation(Duration::from_millis(100)));
        assert!(config.is_read_violation(Duration::from_millis(101)));
        assert!(!config.is_ship_violation(Duration::from_millis(500)));
        assert!(config.is_ship_violation(Duration::from_millis(501)));
    }

    #[test]
    fn test_store_config_in_memory() {
        let config = StoreConfig::in_memory();
        assert!(config.is_in_memory());
        assert!(!config.wal_mode);
        assert!(!StoreConfig::default().is_in_memory());
    }

    #[test]
    fn test_for_testing_config() {
        let config = ReplicationConfig::for_testing("rs-1");
        assert_eq!(config.local_node_id, "rs-1");
        assert!(config.store.is_in_memory());
        assert_eq!(config.settings.source.size_capacity, 1024);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = ReplicationConfig::for_testing("rs-roundtrip");
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ReplicationConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.local_node_id, "rs-roundtrip");
        assert_eq!(parsed.settings.source.sleep_for_retries, "20ms");
    }

    #[test]
    fn test_config_minimal_json_uses_defaults() {
        let parsed: ReplicationConfig =
            serde_json::from_str(r#"{"local_node_id": "rs-9"}"#).unwrap();
        assert_eq!(parsed.local_node_id, "rs-9");
        assert_eq!(parsed.settings.source.nb_capacity, 25_000);
        assert!(parsed.settings.failover.enabled);
        assert_eq!(parsed.store.sqlite_path, "replication_queues.db");
    }
}
