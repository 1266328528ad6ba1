// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared SQLite plumbing for the peer registry and the queue store.
//!
//! Both stores live in one database so that every node of the source
//! cluster sees a single, linearizable view of peers and queue ownership.
//!
//! # SQLite Busy Handling
//!
//! Several engines (one per node) write to the same file. SQLite answers
//! contention with SQLITE_BUSY/SQLITE_LOCKED, which we absorb with:
//! - Automatic retry with exponential backoff
//! - A bounded number of attempts (5)
//! - A connection-level busy timeout so short waits never surface at all

use crate::config::StoreConfig;
use crate::error::{ReplicationError, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS peers (
        peer_id TEXT PRIMARY KEY,
        connection TEXT NOT NULL,
        enabled INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS replication_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        replicating INTEGER NOT NULL
    )
    "#,
    "INSERT OR IGNORE INTO replication_state (id, replicating) VALUES (1, 1)",
    r#"
    CREATE TABLE IF NOT EXISTS queues (
        owner TEXT NOT NULL,
        peer_id TEXT NOT NULL,
        origin TEXT NOT NULL,
        read_offset INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (owner, peer_id, origin)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_files (
        owner TEXT NOT NULL,
        peer_id TEXT NOT NULL,
        origin TEXT NOT NULL,
        file_seq INTEGER NOT NULL,
        path TEXT NOT NULL,
        PRIMARY KEY (owner, peer_id, origin, file_seq)
    )
    "#,
];

/// Check if an error is a retryable SQLite busy/locked error
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED.
///
/// The closure is re-invoked from scratch on each attempt, so a transaction
/// body passed here is replayed in full.
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Open (creating if needed) the replication database and apply the schema.
///
/// An in-memory config yields a single-connection pool that is never
/// recycled, since each new SQLite connection to `:memory:` would see an
/// empty database.
pub async fn open_pool(config: &StoreConfig) -> Result<SqlitePool> {
    let pool = if config.is_in_memory() {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        info!(path = %config.sqlite_path, "Opening replication store");
        let journal = if config.wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", config.sqlite_path))
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
                .journal_mode(journal)
                .synchronous(SqliteSynchronous::Normal)
                .busy_timeout(Duration::from_secs(5))
                .create_if_missing(true);
        SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?
    };

    for statement in SCHEMA {
        execute_with_retry("schema", || async {
            sqlx::query(statement).execute(&pool).await
        })
        .await?;
    }

    Ok(pool)
}

/// Force flush the SQLite WAL into the main database (for clean shutdown).
pub async fn checkpoint(pool: &SqlitePool) -> Result<()> {
    execute_with_retry("checkpoint", || async {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(pool)
            .await
    })
    .await?;

    debug!("SQLite WAL checkpoint complete");
    Ok(())
}

/// Milliseconds since the epoch, for `created_at`/`updated_at` columns.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
