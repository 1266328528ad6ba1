// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process source cluster + peer clusters.
//!
//! - [`ClusterTable`]: row data of one cluster (source or peer)
//! - [`MemoryStorage`]: one source node's storage engine, writing real WAL files
//! - [`MemoryPeer`]: a peer cluster's ingestion endpoint, with fault injection
//! - [`TestCluster`]: N engines sharing one registry, queue store and membership
//!
//! Killing a node is [`TestCluster::kill`]: the engine is halted without any
//! cleanup and membership declares the node dead. Its WAL files stay on disk.

use cluster_replication::config::StoreConfig;
use cluster_replication::db::open_pool;
use cluster_replication::verify::{CellValue, ColumnKey};
use cluster_replication::{
    BoxFuture, Cell, CellKind, InProcessMembership, LogEvent, PeerCluster, PeerConnector, PeerRegistry,
    PeerSink, QueueKey, ReplicationConfig, ReplicationContext, ReplicationEngine, ReplicationError,
    ReplicationQueueStore, ReplicationScope, Row, RowSource, SchemaRef, ShipBatch, SourceState, StorageEngine,
    WalEntry, WalFileRef, WalWriter,
};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Table used by every scenario.
pub const TABLE: &str = "test";
/// Global-scope family.
pub const FAMILY: &str = "f";
/// Local-scope family.
pub const NOREP: &str = "norep";

/// Upper bound for any eventual-consistency wait.
pub const WAIT: Duration = Duration::from_secs(20);

/// Poll `check` until it holds, panicking with `what` after [`WAIT`].
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// =============================================================================
// Cluster table
// =============================================================================

#[derive(Default)]
struct TableRow {
    cells: BTreeMap<ColumnKey, CellValue>,
    /// Family delete markers: family -> timestamp.
    deleted: BTreeMap<String, i64>,
}

#[derive(Default)]
struct Tables {
    tables: BTreeMap<String, BTreeMap<Vec<u8>, TableRow>>,
}

/// Row data of one cluster. Cheap to clone, clones share data.
#[derive(Clone, Default)]
pub struct ClusterTable {
    data: Arc<Mutex<Tables>>,
    clock: Arc<AtomicI64>,
}

impl ClusterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic cell timestamp, newer than any cell applied so far.
    pub fn next_timestamp(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Apply one WAL entry. Re-applying an entry is a no-op.
    pub fn apply(&self, entry: &WalEntry) {
        let mut data = self.data.lock().unwrap();
        let table = data.tables.entry(entry.table.clone()).or_default();
        for cell in &entry.cells {
            self.clock.fetch_max(cell.timestamp, Ordering::SeqCst);
            let row = table.entry(cell.row.clone()).or_default();
            apply_cell(row, cell);
        }
    }

    pub fn get(&self, table: &str, row: &str) -> Option<Row> {
        let data = self.data.lock().unwrap();
        let found = data.tables.get(table)?.get(row.as_bytes())?;
        if found.cells.is_empty() {
            return None;
        }
        Some(Row {
            key: row.as_bytes().to_vec(),
            cells: found.cells.clone(),
        })
    }

    /// Value of the `FAMILY` cell of `row`, if present.
    pub fn value(&self, row: &str) -> Option<Vec<u8>> {
        self.get(TABLE, row).and_then(|r| {
            r.cells
                .iter()
                .find(|(column, _)| column.family == FAMILY)
                .map(|(_, cell)| cell.value.clone())
        })
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        let data = self.data.lock().unwrap();
        data.tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, r)| !r.cells.is_empty())
                    .map(|(key, r)| Row {
                        key: key.clone(),
                        cells: r.cells.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows(table).len()
    }

    /// Write directly to this cluster, bypassing any WAL.
    pub fn put_direct(&self, table: &str, row: &[u8], family: &str, qualifier: &[u8], value: &[u8]) {
        let cell = Cell::put(row.to_vec(), family, qualifier.to_vec(), self.next_timestamp(), value.to_vec());
        self.apply(&WalEntry {
            table: table.to_string(),
            sequence_id: 0,
            write_time: 0,
            cells: vec![cell],
        });
    }

    pub fn delete_row_direct(&self, table: &str, row: &[u8]) {
        let mut data = self.data.lock().unwrap();
        if let Some(rows) = data.tables.get_mut(table) {
            rows.remove(row);
        }
    }
}

fn apply_cell(row: &mut TableRow, cell: &Cell) {
    match cell.kind {
        CellKind::Put => {
            if row.deleted.get(&cell.family).is_some_and(|ts| cell.timestamp <= *ts) {
                return;
            }
            let column = ColumnKey {
                family: cell.family.clone(),
                qualifier: cell.qualifier.clone(),
            };
            let newer = row
                .cells
                .get(&column)
                .map_or(true, |existing| cell.timestamp >= existing.timestamp);
            if newer {
                row.cells.insert(
                    column,
                    CellValue {
                        timestamp: cell.timestamp,
                        value: cell.value.clone(),
                    },
                );
            }
        }
        CellKind::Delete => {
            let column = ColumnKey {
                family: cell.family.clone(),
                qualifier: cell.qualifier.clone(),
            };
            if row.cells.get(&column).is_some_and(|c| c.timestamp <= cell.timestamp) {
                row.cells.remove(&column);
            }
        }
        CellKind::DeleteFamily => {
            let marker = row.deleted.entry(cell.family.clone()).or_insert(cell.timestamp);
            *marker = (*marker).max(cell.timestamp);
            row.cells
                .retain(|column, c| column.family != cell.family || c.timestamp > cell.timestamp);
        }
    }
}

impl RowSource for ClusterTable {
    fn scan<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Vec<Row>> {
        Box::pin(async move { Ok(self.rows(table)) })
    }
}

// =============================================================================
// Schema
// =============================================================================

/// Families listed here are `Global`, everything else is `Local`.
pub struct MemorySchema {
    global: Mutex<HashSet<String>>,
}

impl MemorySchema {
    pub fn new(global: &[&str]) -> Self {
        Self {
            global: Mutex::new(global.iter().map(|f| f.to_string()).collect()),
        }
    }

    pub fn set_scope(&self, family: &str, scope: ReplicationScope) {
        let mut global = self.global.lock().unwrap();
        match scope {
            ReplicationScope::Global => global.insert(family.to_string()),
            ReplicationScope::Local => global.remove(family),
        };
    }
}

impl SchemaRef for MemorySchema {
    fn family_scope(&self, _table: &str, family: &str) -> ReplicationScope {
        if self.global.lock().unwrap().contains(family) {
            ReplicationScope::Global
        } else {
            ReplicationScope::Local
        }
    }
}

// =============================================================================
// Source node storage
// =============================================================================

/// One source node's storage engine. Every write is appended (and synced)
/// to the node's active WAL file and applied to the source cluster table.
pub struct MemoryStorage {
    node_id: String,
    dir: PathBuf,
    writer: tokio::sync::Mutex<WalWriter>,
    active: Mutex<(WalFileRef, u64)>,
    events: broadcast::Sender<LogEvent>,
    sequence: AtomicU64,
    entries_in_file: AtomicUsize,
    /// Roll after this many entries, 0 = only on demand.
    roll_every: usize,
    table: ClusterTable,
}

impl MemoryStorage {
    pub async fn open(dir: PathBuf, node_id: &str, table: ClusterTable, roll_every: usize) -> Arc<Self> {
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let writer = WalWriter::create(&dir, node_id, 1).await.unwrap();
        let active = (writer.file_ref().clone(), 0);
        Arc::new(Self {
            node_id: node_id.to_string(),
            dir,
            writer: tokio::sync::Mutex::new(writer),
            active: Mutex::new(active),
            events: broadcast::channel(1024).0,
            sequence: AtomicU64::new(0),
            entries_in_file: AtomicUsize::new(0),
            roll_every,
            table,
        })
    }

    pub async fn write(&self, cells: Vec<Cell>) -> WalEntry {
        let mut writer = self.writer.lock().await;
        let entry = WalEntry {
            table: TABLE.to_string(),
            sequence_id: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            write_time: chrono::Utc::now().timestamp_millis(),
            cells,
        };
        let length = writer.append(&entry).await.unwrap();
        let file_seq = writer.file_ref().seq;
        *self.active.lock().unwrap() = (writer.file_ref().clone(), length);
        self.table.apply(&entry);
        let _ = self.events.send(LogEvent::Appended { file_seq, length });

        let written = self.entries_in_file.fetch_add(1, Ordering::SeqCst) + 1;
        if self.roll_every > 0 && written >= self.roll_every {
            self.roll_locked(&mut writer).await;
        }
        entry
    }

    /// `Put(row, family, qualifier=row, value=row)`.
    pub async fn put(&self, row: &str, family: &str) -> WalEntry {
        let cell = Cell::put(row, family, row, self.table.next_timestamp(), row);
        self.write(vec![cell]).await
    }

    pub async fn delete(&self, row: &str, family: &str) -> WalEntry {
        let cell = Cell::delete_family(row, family, self.table.next_timestamp());
        self.write(vec![cell]).await
    }

    pub async fn roll(&self) -> WalFileRef {
        let mut writer = self.writer.lock().await;
        self.roll_locked(&mut writer).await
    }

    async fn roll_locked(&self, writer: &mut WalWriter) -> WalFileRef {
        let next = writer.file_ref().seq + 1;
        *writer = WalWriter::create(&self.dir, &self.node_id, next).await.unwrap();
        let file = writer.file_ref().clone();
        *self.active.lock().unwrap() = (file.clone(), 0);
        self.entries_in_file.store(0, Ordering::SeqCst);
        let _ = self.events.send(LogEvent::Rolled(file.clone()));
        file
    }

    pub fn active_file(&self) -> WalFileRef {
        self.active.lock().unwrap().0.clone()
    }
}

impl StorageEngine for MemoryStorage {
    fn active_log(&self) -> Option<(WalFileRef, u64)> {
        Some(self.active.lock().unwrap().clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }
}

// =============================================================================
// Peer cluster
// =============================================================================

/// A peer cluster's ingestion endpoint.
pub struct MemoryPeer {
    pub id: String,
    pub table: ClusterTable,
    fail_next: AtomicU32,
    fail_all: AtomicBool,
    hang: AtomicBool,
    batches: AtomicU64,
    attempts: AtomicU64,
    /// (origin, sequence_id, kind of first cell) in application order.
    received: Mutex<Vec<(String, u64, CellKind)>>,
}

impl MemoryPeer {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            table: ClusterTable::new(),
            fail_next: AtomicU32::new(0),
            fail_all: AtomicBool::new(false),
            hang: AtomicBool::new(false),
            batches: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn connection(&self) -> String {
        format!("mem://{}", self.id)
    }

    /// Reject the next `n` ship attempts.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Accept connections but never answer.
    pub fn hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<(String, u64, CellKind)> {
        self.received.lock().unwrap().clone()
    }

    pub fn row_count(&self) -> usize {
        self.table.row_count(TABLE)
    }
}

impl PeerSink for MemoryPeer {
    fn replicate<'a>(&'a self, batch: &'a ShipBatch) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail_all.load(Ordering::SeqCst)
                || self
                    .fail_next
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(ReplicationError::ship(&self.id, "injected failure"));
            }

            let mut received = self.received.lock().unwrap();
            for entry in &batch.entries {
                self.table.apply(entry);
                if let Some(cell) = entry.cells.first() {
                    received.push((batch.origin.clone(), entry.sequence_id, cell.kind));
                }
            }
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Resolves `mem://<id>` connection strings to registered [`MemoryPeer`]s.
#[derive(Default)]
pub struct MemoryConnector {
    peers: DashMap<String, Arc<MemoryPeer>>,
}

impl MemoryConnector {
    pub fn register(&self, peer: Arc<MemoryPeer>) {
        self.peers.insert(peer.connection(), peer);
    }
}

impl PeerConnector for MemoryConnector {
    fn connect(&self, peer: &PeerCluster) -> cluster_replication::Result<Arc<dyn PeerSink>> {
        match self.peers.get(&peer.connection) {
            Some(found) => Ok(Arc::clone(found.value()) as Arc<dyn PeerSink>),
            None => Err(ReplicationError::Config(format!("unknown cluster {}", peer.connection))),
        }
    }
}

// =============================================================================
// Test cluster
// =============================================================================

pub struct TestNode {
    pub id: String,
    pub storage: Arc<MemoryStorage>,
    pub engine: ReplicationEngine,
    pub alive: bool,
}

/// Knobs for [`TestCluster::start`].
#[derive(Clone)]
pub struct ClusterOptions {
    pub nodes: usize,
    /// WAL roll interval in entries, 0 = never roll automatically.
    pub roll_every: usize,
    pub config: fn(&str) -> ReplicationConfig,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            nodes: 2,
            roll_every: 0,
            config: ReplicationConfig::for_testing,
        }
    }
}

pub struct TestCluster {
    pub dir: TempDir,
    pub registry: Arc<PeerRegistry>,
    pub store: Arc<ReplicationQueueStore>,
    pub membership: InProcessMembership,
    pub schema: Arc<MemorySchema>,
    pub connector: Arc<MemoryConnector>,
    /// Source cluster data, written through the nodes' WALs.
    pub source: ClusterTable,
    pub nodes: Vec<TestNode>,
    options: ClusterOptions,
}

impl TestCluster {
    pub async fn start(options: ClusterOptions) -> Self {
        let pool = open_pool(&StoreConfig::in_memory()).await.unwrap();
        let mut cluster = Self {
            dir: tempfile::tempdir().unwrap(),
            registry: Arc::new(PeerRegistry::new(pool.clone()).await.unwrap()),
            store: Arc::new(ReplicationQueueStore::new(pool)),
            membership: InProcessMembership::new(),
            schema: Arc::new(MemorySchema::new(&[FAMILY])),
            connector: Arc::new(MemoryConnector::default()),
            source: ClusterTable::new(),
            nodes: Vec::new(),
            options: options.clone(),
        };
        for i in 0..options.nodes {
            cluster.add_node(&format!("rs-{}", i + 1)).await;
        }
        cluster
    }

    pub async fn with_nodes(nodes: usize) -> Self {
        Self::start(ClusterOptions {
            nodes,
            ..Default::default()
        })
        .await
    }

    fn context(&self, storage: Arc<MemoryStorage>) -> ReplicationContext {
        ReplicationContext {
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            storage,
            schema: Arc::clone(&self.schema) as Arc<dyn SchemaRef>,
            membership: Arc::new(self.membership.clone()),
            connector: Arc::clone(&self.connector) as Arc<dyn PeerConnector>,
        }
    }

    /// Start a new node: storage, membership, engine. Returns its index.
    pub async fn add_node(&mut self, id: &str) -> usize {
        let storage =
            MemoryStorage::open(self.dir.path().join(id), id, self.source.clone(), self.options.roll_every).await;
        self.membership.join(id);
        let mut engine = ReplicationEngine::new((self.options.config)(id), self.context(Arc::clone(&storage)));
        engine.start().await.unwrap();
        self.nodes.push(TestNode {
            id: id.to_string(),
            storage,
            engine,
            alive: true,
        });
        self.nodes.len() - 1
    }

    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    /// Register a peer cluster and wait until every live node queues for it.
    pub async fn add_peer(&self, id: &str) -> Arc<MemoryPeer> {
        let peer = Arc::new(MemoryPeer::new(id));
        self.connector.register(Arc::clone(&peer));
        self.admin().add_peer(id, &peer.connection()).await.unwrap();
        self.wait_for_local_queues(id).await;
        peer
    }

    /// Remove a peer and wait until no queue for it is left.
    pub async fn remove_peer(&self, id: &str) {
        self.admin().remove_peer(id).await.unwrap();
        let deadline = tokio::time::Instant::now() + WAIT;
        while !self.store.queues_for_peer(id).await.unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "queues for {} not dropped", id);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Flip the global switch. Turning it off waits until every worker parked,
    /// so nothing written afterwards is read before it is turned back on.
    pub async fn set_replicating(&self, replicating: bool) {
        self.admin().set_replicating(replicating).await.unwrap();
        if replicating {
            return;
        }
        for node in self.nodes.iter().filter(|n| n.alive) {
            for key in node.engine.worker_queues() {
                wait_until("worker parked", || {
                    matches!(
                        node.engine.worker_state(&key),
                        None | Some(SourceState::Disabled | SourceState::Stalled | SourceState::Stopped)
                    )
                })
                .await;
            }
        }
    }

    /// First live engine.
    pub fn admin(&self) -> &ReplicationEngine {
        &self
            .nodes
            .iter()
            .find(|n| n.alive)
            .expect("no live node")
            .engine
    }

    async fn wait_for_local_queues(&self, peer_id: &str) {
        let deadline = tokio::time::Instant::now() + WAIT;
        for node in self.nodes.iter().filter(|n| n.alive) {
            let key = QueueKey::local(&node.id, peer_id);
            while node.engine.worker_state(&key).is_none() {
                assert!(tokio::time::Instant::now() < deadline, "no worker for {}", key);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    /// Put `rows` rows named `{prefix}{i}` in `FAMILY`, spread round-robin over
    /// live nodes.
    pub async fn load_rows(&self, prefix: &str, rows: usize) {
        let live: Vec<&TestNode> = self.nodes.iter().filter(|n| n.alive).collect();
        for i in 0..rows {
            live[i % live.len()]
                .storage
                .put(&format!("{}{:05}", prefix, i), FAMILY)
                .await;
        }
    }

    /// Simulate a crash of node `index`: halt its engine, then declare it dead.
    pub async fn kill(&mut self, index: usize) {
        let node = &mut self.nodes[index];
        node.engine.halt().await;
        node.alive = false;
        self.membership.mark_dead(&node.id);
    }

    /// Bring a killed node back on its old storage: rejoin, fresh engine.
    pub async fn revive(&mut self, index: usize) {
        let storage = Arc::clone(&self.nodes[index].storage);
        let id = self.nodes[index].id.clone();
        self.membership.join(&id);
        let mut engine = ReplicationEngine::new((self.options.config)(&id), self.context(storage));
        engine.start().await.unwrap();
        let node = &mut self.nodes[index];
        node.engine = engine;
        node.alive = true;
    }

    /// Gracefully stop node `index` and start a fresh engine for it.
    pub async fn restart(&mut self, index: usize) {
        self.nodes[index].engine.shutdown().await;
        let storage = Arc::clone(&self.nodes[index].storage);
        let id = self.nodes[index].id.clone();
        let mut engine = ReplicationEngine::new((self.options.config)(&id), self.context(storage));
        engine.start().await.unwrap();
        self.nodes[index].engine = engine;
    }

    /// Stop the engine of node `index` without declaring it dead.
    pub async fn stop_engine(&mut self, index: usize) {
        self.nodes[index].engine.shutdown().await;
    }

    pub async fn queues_with_origin(&self, origin: &str) -> Vec<QueueKey> {
        self.store
            .all_queues()
            .await
            .unwrap()
            .into_iter()
            .filter(|k| k.origin == origin)
            .collect()
    }

    /// Wait until no queue of `origin` is left in the store.
    pub async fn wait_origin_drained(&self, origin: &str) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let left = self.queues_with_origin(origin).await;
            if left.is_empty() {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "queues of {} still present: {:?}",
                origin,
                left
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn shutdown(mut self) {
        for node in self.nodes.iter_mut().filter(|n| n.alive) {
            node.engine.shutdown().await;
        }
    }
}
