// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Verification job: scan one table on both clusters and diff the rows.
//!
//! Every row of the local table counts once: `GOODROWS` if the peer holds an
//! identical row, `BADROWS` if the peer's row differs or is missing. Rows that
//! only exist on the peer are logged but not counted. Only `Global` families
//! take part, further narrowed by `--families` when given.
//!
//! Rows are compared by a SHA-256 digest over their (family, qualifier, value)
//! cells, in column order.
//!
//! The job succeeds whenever the scan completes. Callers inspect the
//! counters, not the result, to judge whether the clusters agree.
//!
//! # Example
//!
//! ```rust,ignore
//! let args = VerifyArgs::from_args(["--families=f", "2", "test"])?;
//! let report = VerifyReplication::new(args, schema).run(&registry, &local, &peer).await?;
//! assert_eq!(report.bad_rows, 0);
//! ```

use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::peer::PeerRegistry;
use crate::storage::{BoxFuture, SchemaRef};
use crate::wal::ReplicationScope;
use clap::Parser;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, Instrument};

/// Column identity within a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnKey {
    pub family: String,
    pub qualifier: Vec<u8>,
}

/// Latest version of one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellValue {
    pub timestamp: i64,
    pub value: Vec<u8>,
}

/// One row as returned by a table scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row {
    pub key: Vec<u8>,
    pub cells: BTreeMap<ColumnKey, CellValue>,
}

impl Row {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            cells: BTreeMap::new(),
        }
    }

    pub fn with_cell(
        mut self,
        family: impl Into<String>,
        qualifier: impl Into<Vec<u8>>,
        timestamp: i64,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        self.cells.insert(
            ColumnKey {
                family: family.into(),
                qualifier: qualifier.into(),
            },
            CellValue {
                timestamp,
                value: value.into(),
            },
        );
        self
    }
}

/// Read side of a cluster, as far as the verification job needs it.
pub trait RowSource: Send + Sync {
    /// Full scan of `table`, sorted by row key.
    fn scan<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Vec<Row>>;
}

/// Job arguments: `[--starttime=MS] [--stoptime=MS] [--families=a,b] <peer_id> <table>`.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(name = "verifyrep", about = "Compare a table with its copy on a peer cluster")]
pub struct VerifyArgs {
    /// Peer cluster to compare against
    pub peer_id: String,

    /// Table to scan
    pub table: String,

    /// Restrict to these families. Empty means every global family.
    #[arg(long, value_delimiter = ',')]
    pub families: Vec<String>,

    /// Inclusive lower bound on cell timestamps, in milliseconds
    #[arg(long = "starttime")]
    pub start_time: Option<i64>,

    /// Exclusive upper bound on cell timestamps, in milliseconds
    #[arg(long = "stoptime")]
    pub stop_time: Option<i64>,
}

impl VerifyArgs {
    pub fn new(peer_id: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            table: table.into(),
            families: Vec::new(),
            start_time: None,
            stop_time: None,
        }
    }

    /// Parse job arguments, program name excluded.
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let argv = std::iter::once(OsString::from("verifyrep")).chain(args.into_iter().map(Into::into));
        let mut parsed = Self::try_parse_from(argv)
            .map_err(|e| ReplicationError::Config(e.render().to_string().trim_end().to_string()))?;
        parsed.families.retain(|f| !f.is_empty());

        if let (Some(start), Some(stop)) = (parsed.start_time, parsed.stop_time) {
            if start >= stop {
                return Err(ReplicationError::Config(format!(
                    "starttime {} must be before stoptime {}",
                    start, stop
                )));
            }
        }
        Ok(parsed)
    }

    fn in_time_range(&self, timestamp: i64) -> bool {
        self.start_time.map_or(true, |start| timestamp >= start)
            && self.stop_time.map_or(true, |stop| timestamp < stop)
    }
}

/// Counters of one verification run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// GOODROWS
    pub good_rows: u64,
    /// BADROWS
    pub bad_rows: u64,
}

/// The verification job.
pub struct VerifyReplication {
    args: VerifyArgs,
    schema: Arc<dyn SchemaRef>,
}

impl VerifyReplication {
    pub fn new(args: VerifyArgs, schema: Arc<dyn SchemaRef>) -> Self {
        Self { args, schema }
    }

    pub fn args(&self) -> &VerifyArgs {
        &self.args
    }

    /// Run the job against the local cluster and the peer's cluster.
    ///
    /// Fails only if the peer is not registered or a scan fails.
    pub async fn run(
        &self,
        registry: &PeerRegistry,
        local: &dyn RowSource,
        peer: &dyn RowSource,
    ) -> Result<VerifyReport> {
        let span = info_span!("verify", peer_id = %self.args.peer_id, table = %self.args.table);

        async move {
            if !registry.contains(&self.args.peer_id) {
                return Err(ReplicationError::UnknownPeer(self.args.peer_id.clone()));
            }
            let started = Instant::now();

            let local_rows = local.scan(&self.args.table).await?;
            let peer_rows = peer.scan(&self.args.table).await?;
            let report = self.compare(local_rows, peer_rows);

            metrics::record_verify_rows(
                &self.args.peer_id,
                &self.args.table,
                report.good_rows,
                report.bad_rows,
            );
            info!(
                good_rows = report.good_rows,
                bad_rows = report.bad_rows,
                duration_ms = started.elapsed().as_millis() as u64,
                "Verification finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Merge-join two sorted scans.
    fn compare(&self, mut local: Vec<Row>, mut peer: Vec<Row>) -> VerifyReport {
        local.sort_by(|a, b| a.key.cmp(&b.key));
        peer.sort_by(|a, b| a.key.cmp(&b.key));

        let wanted = self.wanted_families(&local);
        let mut report = VerifyReport::default();
        let mut peer_iter = peer.into_iter().peekable();

        for row in local {
            let local_digest = match self.row_digest(&row, &wanted) {
                Some(digest) => digest,
                // Nothing replicable in this row
                None => continue,
            };

            let mut matched = None;
            while let Some(candidate) = peer_iter.peek() {
                match candidate.key.cmp(&row.key) {
                    Ordering::Less => {
                        if let Some(extra) = peer_iter.next() {
                            debug!(row = %String::from_utf8_lossy(&extra.key), "Row only on peer");
                        }
                    }
                    Ordering::Equal => {
                        matched = peer_iter.next();
                        break;
                    }
                    Ordering::Greater => break,
                }
            }

            let good = matched
                .and_then(|peer_row| self.row_digest(&peer_row, &wanted))
                .map_or(false, |peer_digest| peer_digest == local_digest);
            if good {
                report.good_rows += 1;
            } else {
                debug!(row = %String::from_utf8_lossy(&row.key), "Row differs or is missing on peer");
                report.bad_rows += 1;
            }
        }
        report
    }

    /// Global families seen in the local scan, narrowed by `--families`.
    fn wanted_families(&self, rows: &[Row]) -> HashSet<String> {
        rows.iter()
            .flat_map(|r| r.cells.keys().map(|c| c.family.as_str()))
            .filter(|family| {
                self.schema.family_scope(&self.args.table, family) == ReplicationScope::Global
            })
            .filter(|family| {
                self.args.families.is_empty() || self.args.families.iter().any(|f| f.as_str() == *family)
            })
            .map(str::to_string)
            .collect()
    }

    /// `None` if no cell of the row is in scope.
    fn row_digest(&self, row: &Row, wanted: &HashSet<String>) -> Option<[u8; 32]> {
        let mut hasher = Sha256::new();
        let mut any = false;
        for (column, cell) in &row.cells {
            if !wanted.contains(&column.family) || !self.args.in_time_range(cell.timestamp) {
                continue;
            }
            any = true;
            for part in [column.family.as_bytes(), column.qualifier.as_slice(), cell.value.as_slice()] {
                hasher.update((part.len() as u64).to_be_bytes());
                hasher.update(part);
            }
        }
        any.then(|| hasher.finalize().into())
    }
}
