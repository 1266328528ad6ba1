// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up a Redis container standing in for a peer
//! cluster's ingestion endpoint.

use cluster_replication::sink::redis::decode_payload;
use cluster_replication::WalEntry;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// One decoded ingestion stream entry.
#[derive(Debug)]
pub struct IngestedBatch {
    pub stream_id: String,
    pub origin: String,
    pub encoding: String,
    pub entries: Vec<WalEntry>,
}

/// A Redis peer: reads back what the sink appended to its ingestion stream.
pub struct RedisPeer<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub redis_url: String,
}

impl<'a> RedisPeer<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let redis_url = redis_url(&container);
        Self {
            container,
            redis_url,
        }
    }

    async fn connection(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        client.get_multiplexed_async_connection().await
    }

    /// Get stream length.
    pub async fn stream_len(&self, stream_key: &str) -> redis::RedisResult<usize> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        conn.xlen(stream_key).await
    }

    /// Read and decode every batch on the ingestion stream, oldest first.
    pub async fn read_batches(&self, stream_key: &str) -> redis::RedisResult<Vec<IngestedBatch>> {
        use redis::streams::StreamRangeReply;
        use redis::AsyncCommands;

        let mut conn = self.connection().await?;
        let reply: StreamRangeReply = conn.xrange_all(stream_key).await?;

        let mut batches = Vec::new();
        for id in reply.ids {
            let field = |name: &str| -> Option<Vec<u8>> {
                id.map.get(name).and_then(|v| redis::from_redis_value(v).ok())
            };
            let text = |name: &str| field(name).map(|b| String::from_utf8_lossy(&b).to_string());

            let hash = text("hash").unwrap_or_default();
            let payload = field("payload").unwrap_or_default();
            let entries = decode_payload(&payload, &hash).map_err(|e| {
                redis::RedisError::from((redis::ErrorKind::TypeError, "bad payload", e.to_string()))
            })?;
            batches.push(IngestedBatch {
                stream_id: id.id.clone(),
                origin: text("origin").unwrap_or_default(),
                encoding: text("encoding").unwrap_or_default(),
                entries,
            });
        }
        Ok(batches)
    }
}
