// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis stream shipping transport.
//!
//! Each batch becomes one entry on the peer cluster's ingestion stream
//! (`{prefix}replication:ingest`):
//!
//! ```text
//! XADD {prefix}replication:ingest [MAXLEN ~ n] *
//!     origin   <source node id>
//!     edits    <entry count>
//!     encoding json | zstd
//!     hash     <sha256 hex of the uncompressed JSON>
//!     payload  <JSON Vec<WalEntry>, zstd-compressed above the threshold>
//! ```
//!
//! A successful `XADD` reply is the acknowledgement. The peer's ingester
//! verifies `hash` after decompression, which catches bit flips and
//! compression bugs before anything is applied.
//!
//! Connections are **lazy**: established on the first ship, re-established
//! after any transport error.

use super::{PeerConnector, PeerSink, ShipBatch};
use crate::config::SinkConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::peer::PeerCluster;
use crate::resilience::RetryConfig;
use crate::storage::BoxFuture;
use crate::wal::WalEntry;
use redis::aio::ConnectionManager;
use redis::Client;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

const ZSTD_LEVEL: i32 = 3;

/// Builds [`RedisPeerSink`]s. The connection descriptor is a Redis URL.
pub struct RedisConnector {
    config: SinkConfig,
    retry: RetryConfig,
}

impl RedisConnector {
    pub fn new(config: SinkConfig, retry: RetryConfig) -> Self {
        Self { config, retry }
    }
}

impl PeerConnector for RedisConnector {
    fn connect(&self, peer: &PeerCluster) -> Result<Arc<dyn PeerSink>> {
        Ok(Arc::new(RedisPeerSink::new(peer, &self.config, self.retry.clone())?))
    }
}

/// Ships batches to one peer's ingestion stream.
pub struct RedisPeerSink {
    peer_id: String,
    client: Client,
    stream_key: String,
    compress_threshold: usize,
    max_stream_len: usize,
    retry: RetryConfig,
    /// ConnectionManager is Clone and multiplexed, so sharing is cheap.
    conn: RwLock<Option<ConnectionManager>>,
}

impl RedisPeerSink {
    pub fn new(peer: &PeerCluster, config: &SinkConfig, retry: RetryConfig) -> Result<Self> {
        let client = Client::open(peer.connection.as_str()).map_err(|e| {
            ReplicationError::Config(format!("Invalid Redis URL for peer {}: {}", peer.id, e))
        })?;

        Ok(Self {
            peer_id: peer.id.clone(),
            client,
            stream_key: config.ingest_stream_key(),
            compress_threshold: config.compress_threshold,
            max_stream_len: config.max_stream_len,
            retry,
            conn: RwLock::new(None),
        })
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Connect with retry, bounded by `retry.max_attempts`.
    async fn connect(&self) -> Result<ConnectionManager> {
        info!(peer_id = %self.peer_id, "Connecting to peer ingestion stream");
        let mut attempt = 0;

        loop {
            attempt += 1;
            let conn_result = timeout(
                self.retry.connection_timeout,
                self.client.get_connection_manager(),
            )
            .await;

            let message = match conn_result {
                Ok(Ok(conn)) => {
                    *self.conn.write().await = Some(conn.clone());
                    metrics::record_peer_connection(&self.peer_id, true);
                    if attempt > 1 {
                        info!(peer_id = %self.peer_id, attempt, "Connected to peer after retry");
                    }
                    return Ok(conn);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "connection timed out after {}ms",
                    self.retry.connection_timeout.as_millis()
                ),
            };

            if attempt >= self.retry.max_attempts {
                metrics::record_peer_connection(&self.peer_id, false);
                return Err(ReplicationError::ship(
                    &self.peer_id,
                    format!("connect failed after {} attempts: {}", attempt, message),
                ));
            }

            let delay = self.retry.delay_for_attempt(attempt);
            warn!(
                peer_id = %self.peer_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn ensure_connected(&self) -> Result<ConnectionManager> {
        if let Some(conn) = self.conn.read().await.clone() {
            return Ok(conn);
        }
        self.connect().await
    }

    async fn mark_disconnected(&self) {
        *self.conn.write().await = None;
        debug!(peer_id = %self.peer_id, "Connection marked as disconnected");
    }

    async fn xadd(&self, batch: &ShipBatch) -> Result<String> {
        let encoded = encode_payload(&batch.entries, self.compress_threshold)?;
        let mut conn = self.ensure_connected().await?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key);
        if self.max_stream_len > 0 {
            cmd.arg("MAXLEN").arg("~").arg(self.max_stream_len);
        }
        cmd.arg("*")
            .arg("origin")
            .arg(&batch.origin)
            .arg("edits")
            .arg(batch.entries.len())
            .arg("encoding")
            .arg(encoded.encoding)
            .arg("hash")
            .arg(&encoded.hash)
            .arg("payload")
            .arg(encoded.bytes.as_slice());

        let reply: redis::RedisResult<String> = cmd.query_async(&mut conn).await;
        match reply {
            Ok(id) => Ok(id),
            Err(e) => {
                self.mark_disconnected().await;
                Err(ReplicationError::redis("XADD", e))
            }
        }
    }
}

impl PeerSink for RedisPeerSink {
    fn replicate<'a>(&'a self, batch: &'a ShipBatch) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let id = self.xadd(batch).await?;
            debug!(
                peer_id = %self.peer_id,
                stream_id = %id,
                edits = batch.edit_count(),
                cells = batch.cell_count(),
                "Batch appended to ingestion stream"
            );
            Ok(())
        })
    }
}

// =============================================================================
// Payload codec
// =============================================================================

/// An encoded batch payload.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub encoding: &'static str,
    pub hash: String,
    pub bytes: Vec<u8>,
}

/// Serialize entries to JSON, compressing at or above `compress_threshold`.
pub fn encode_payload(entries: &[WalEntry], compress_threshold: usize) -> Result<EncodedPayload> {
    let json = serde_json::to_vec(entries)
        .map_err(|e| ReplicationError::Internal(format!("encode batch: {}", e)))?;
    let hash = compute_content_hash(&json);

    if json.len() >= compress_threshold {
        let bytes = zstd::encode_all(&json[..], ZSTD_LEVEL)?;
        Ok(EncodedPayload {
            encoding: "zstd",
            hash,
            bytes,
        })
    } else {
        Ok(EncodedPayload {
            encoding: "json",
            hash,
            bytes: json,
        })
    }
}

/// Decode a payload as the peer's ingester does, verifying the hash.
pub fn decode_payload(bytes: &[u8], expected_hash: &str) -> Result<Vec<WalEntry>> {
    let json = maybe_decompress(bytes)?;
    let actual = compute_content_hash(&json);
    if actual != expected_hash {
        return Err(ReplicationError::Wal(format!(
            "payload hash mismatch: expected {}, computed {}",
            expected_hash, actual
        )));
    }
    serde_json::from_slice(&json).map_err(|e| ReplicationError::Wal(format!("decode batch: {}", e)))
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| ReplicationError::Wal(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| ReplicationError::Wal(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// Compute SHA256 content hash as hex string.
pub fn compute_content_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}
