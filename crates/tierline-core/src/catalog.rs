//! Metric catalog: interns metric keys into stable `i64` ids and keeps the
//! per-host agent presence aggregate.
//!
//! # Interning
//!
//! Keys live in a [`ShardedMap`] (key → id) and records in an [`IdMap`]
//! (id → record). A lookup takes only the key shard's read lock. On a miss
//! the key shard's write lock is taken, the lookup is repeated, and only then
//! is the next id allocated and the record installed. Racing callers for the
//! same key all leave with the winner's id. Unrelated keys in other shards
//! proceed concurrently.
//!
//! The record is inserted into the id map before the key is published, so
//! anyone who can see an id can also resolve it.
//!
//! # Persistence
//!
//! In realtime mode each new record is written to the [`CatalogStore`] before
//! its id is published; a store failure burns the allocated id and installs
//! nothing. Otherwise new records are queued and written by [`MetricCatalog::flush`].
//!
//! The realtime write runs while the key shard's write lock is held, so each
//! key is persisted exactly once. A slow store therefore stalls first-time
//! lookups for every other key hashed to that shard. Known keys on the read
//! path and the token fast path are unaffected.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::concurrent_map::{IdMap, ShardedMap};
use crate::error::CatalogError;
use crate::sharded_counter::ShardedCounter;
use crate::types::{MetricKey, MetricRecord, NO_TOKEN};

/// Number of recent calls averaged for [`CatalogStats::average_call_ns`].
pub const CALL_TIME_WINDOW: usize = 15;

// =============================================================================
// Service interface
// =============================================================================

/// Query and interning interface consumed by the dispatcher and by external
/// data services.
pub trait MetricCatalogService: Send + Sync {
    /// Resolve a metric to its id, interning the key on first sight.
    ///
    /// A `token` other than [`NO_TOKEN`] that names a known record for the
    /// same host and agent is returned as-is.
    fn get_id(
        &self,
        token: i64,
        host: &str,
        agent: &str,
        type_id: u8,
        namespace: &[String],
        name: &str,
    ) -> Result<i64, CatalogError>;

    /// Record an agent connect or disconnect. Returns the number of agents
    /// online for `host` afterwards.
    fn host_agent_state(
        &self,
        connected: bool,
        host: &str,
        ip: &str,
        agent: &str,
        agent_uri: &str,
    ) -> usize;

    /// Pure lookup by id.
    fn get_metric_id(&self, token: i64) -> Option<MetricRecord>;

    /// Host id to host name.
    fn list_hosts(&self, online_only: bool) -> BTreeMap<i32, String>;

    fn is_realtime(&self) -> bool;

    fn set_realtime(&self, realtime: bool);
}

// =============================================================================
// Store collaborator
// =============================================================================

/// Persistence for newly interned records.
pub trait CatalogStore: Send + Sync {
    fn persist(&self, records: &[MetricRecord]) -> Result<(), CatalogError>;
}

/// Store that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCatalogStore;

impl CatalogStore for NullCatalogStore {
    fn persist(&self, _records: &[MetricRecord]) -> Result<(), CatalogError> {
        Ok(())
    }
}

/// In-memory store. Can be told to fail, for exercising the error paths.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    records: Mutex<Vec<MetricRecord>>,
    failing: AtomicBool,
}

impl MemoryCatalogStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    #[must_use]
    pub fn records(&self) -> Vec<MetricRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl CatalogStore for MemoryCatalogStore {
    fn persist(&self, records: &[MetricRecord]) -> Result<(), CatalogError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CatalogError::Store("memory store set to fail".to_string()));
        }
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(records);
        Ok(())
    }
}

// =============================================================================
// Host bookkeeping
// =============================================================================

#[derive(Debug, Clone)]
struct AgentPresence {
    online: bool,
    uri: String,
}

#[derive(Debug, Clone)]
struct HostEntry {
    id: i32,
    name: String,
    ip: String,
    agents: HashMap<String, AgentPresence>,
}

impl HostEntry {
    fn online_count(&self) -> usize {
        self.agents.values().filter(|a| a.online).count()
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Lock-free ring of the most recent call durations.
#[derive(Debug)]
struct CallTimeWindow {
    slots: [AtomicU64; CALL_TIME_WINDOW],
    cursor: AtomicUsize,
}

impl CallTimeWindow {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
            cursor: AtomicUsize::new(0),
        }
    }

    fn record(&self, nanos: u64) {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % CALL_TIME_WINDOW;
        self.slots[idx].store(nanos, Ordering::Relaxed);
    }

    fn average(&self) -> u64 {
        let filled = self.cursor.load(Ordering::Relaxed).min(CALL_TIME_WINDOW);
        if filled == 0 {
            return 0;
        }
        let total: u64 = self.slots[..filled]
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .sum();
        total / filled as u64
    }
}

/// Point-in-time catalog counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStats {
    pub call_count: u64,
    pub assigned_ids: u64,
    /// Mean `get_id` time over the last [`CALL_TIME_WINDOW`] calls.
    pub average_call_ns: u64,
    pub record_count: usize,
    pub pending_flush: usize,
    pub host_count: usize,
    pub realtime: bool,
}

// =============================================================================
// MetricCatalog
// =============================================================================

/// In-process catalog implementation.
pub struct MetricCatalog {
    by_key: ShardedMap<MetricKey, i64>,
    records: IdMap<MetricRecord>,
    next_id: AtomicI64,
    realtime: AtomicBool,
    store: Arc<dyn CatalogStore>,
    pending: Mutex<Vec<MetricRecord>>,
    hosts: ShardedMap<String, HostEntry>,
    next_host_id: AtomicI32,
    clock: Arc<dyn Clock>,
    calls: ShardedCounter,
    assigned: ShardedCounter,
    call_times: CallTimeWindow,
}

impl std::fmt::Debug for MetricCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricCatalog")
            .field("records", &self.records.len())
            .field("realtime", &self.is_realtime())
            .finish()
    }
}

impl Default for MetricCatalog {
    fn default() -> Self {
        Self::new(
            Arc::new(NullCatalogStore),
            Arc::new(SystemClock),
            crate::concurrent_map::DEFAULT_SHARDS,
        )
    }
}

impl MetricCatalog {
    #[must_use]
    pub fn new(store: Arc<dyn CatalogStore>, clock: Arc<dyn Clock>, shards: usize) -> Self {
        Self {
            by_key: ShardedMap::with_shards(shards),
            records: IdMap::with_shards(shards),
            next_id: AtomicI64::new(0),
            realtime: AtomicBool::new(false),
            store,
            pending: Mutex::new(Vec::new()),
            hosts: ShardedMap::with_shards(shards),
            next_host_id: AtomicI32::new(1),
            clock,
            calls: ShardedCounter::new(),
            assigned: ShardedCounter::new(),
            call_times: CallTimeWindow::new(),
        }
    }

    fn validate(host: &str, agent: &str, name: &str) -> Result<(), CatalogError> {
        for (field, value) in [("host", host), ("agent", agent), ("name", name)] {
            if value.is_empty() {
                return Err(CatalogError::InvalidKey(format!("{field} is empty")));
            }
        }
        Ok(())
    }

    fn resolve(
        &self,
        realtime: bool,
        token: i64,
        host: &str,
        agent: &str,
        type_id: u8,
        namespace: &[String],
        name: &str,
    ) -> Result<i64, CatalogError> {
        Self::validate(host, agent, name)?;
        let now = self.clock.now_ms();

        if token != NO_TOKEN {
            let hit = self
                .records
                .write_with(token, |r| {
                    (r.key.host == host && r.key.agent == agent).then(|| {
                        r.last_seen = now;
                        r.id
                    })
                })
                .flatten();
            if let Some(id) = hit {
                return Ok(id);
            }
        }

        let key = MetricKey::new(host, agent, namespace.to_vec(), name, type_id);
        let (id, created) = self.by_key.try_get_or_insert_with(&key, || {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let record = MetricRecord {
                id,
                key: key.clone(),
                first_seen: now,
                last_seen: now,
            };
            if realtime {
                self.store.persist(std::slice::from_ref(&record))?;
            }
            self.records.insert(id, record.clone());
            if !realtime {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(record);
            }
            Ok::<_, CatalogError>(id)
        })?;

        if created {
            self.assigned.increment();
            debug!(metric_id = id, metric = %key, realtime, "assigned metric id");
        } else {
            self.records.write_with(id, |r| r.last_seen = now);
        }
        Ok(id)
    }

    /// Write queued records to the store. Returns how many were written.
    ///
    /// On failure the batch goes back to the front of the queue.
    pub fn flush(&self) -> Result<usize, CatalogError> {
        let batch = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        if batch.is_empty() {
            return Ok(0);
        }
        match self.store.persist(&batch) {
            Ok(()) => {
                debug!(records = batch.len(), "catalog flushed");
                Ok(batch.len())
            }
            Err(err) => {
                warn!(records = batch.len(), error = %err, "catalog flush failed, requeued");
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                let newer = std::mem::replace(&mut *pending, batch);
                pending.extend(newer);
                Err(err)
            }
        }
    }

    /// Number of interned records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stable id assigned to `host` on first sight.
    #[must_use]
    pub fn host_id(&self, host: &str) -> Option<i32> {
        self.hosts.read_with(&host.to_string(), |h| h.id)
    }

    /// Agents currently online for `host`.
    #[must_use]
    pub fn online_count(&self, host: &str) -> usize {
        self.hosts
            .read_with(&host.to_string(), HostEntry::online_count)
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_agent_online(&self, host: &str, agent: &str) -> bool {
        self.hosts
            .read_with(&host.to_string(), |h| {
                h.agents.get(agent).is_some_and(|a| a.online)
            })
            .unwrap_or(false)
    }

    /// Last URI an agent connected with.
    #[must_use]
    pub fn agent_uri(&self, host: &str, agent: &str) -> Option<String> {
        self.hosts
            .read_with(&host.to_string(), |h| h.agents.get(agent).map(|a| a.uri.clone()))
            .flatten()
    }

    /// Last remote address seen for `host`.
    #[must_use]
    pub fn host_ip(&self, host: &str) -> Option<String> {
        self.hosts.read_with(&host.to_string(), |h| h.ip.clone())
    }

    #[must_use]
    pub fn stats(&self) -> CatalogStats {
        CatalogStats {
            call_count: self.calls.get(),
            assigned_ids: self.assigned.get(),
            average_call_ns: self.call_times.average(),
            record_count: self.records.len(),
            pending_flush: self.pending_len(),
            host_count: self.hosts.len(),
            realtime: self.is_realtime(),
        }
    }
}

impl MetricCatalogService for MetricCatalog {
    fn get_id(
        &self,
        token: i64,
        host: &str,
        agent: &str,
        type_id: u8,
        namespace: &[String],
        name: &str,
    ) -> Result<i64, CatalogError> {
        let started = Instant::now();
        // The mode is sampled once; the whole call completes under it.
        let realtime = self.realtime.load(Ordering::SeqCst);
        self.calls.increment();
        let result = self.resolve(realtime, token, host, agent, type_id, namespace, name);
        self.call_times
            .record(started.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64);
        result
    }

    fn host_agent_state(
        &self,
        connected: bool,
        host: &str,
        ip: &str,
        agent: &str,
        agent_uri: &str,
    ) -> usize {
        let count = self.hosts.upsert_with(
            &host.to_string(),
            || HostEntry {
                id: self.next_host_id.fetch_add(1, Ordering::SeqCst),
                name: host.to_string(),
                ip: ip.to_string(),
                agents: HashMap::new(),
            },
            |entry| {
                if !ip.is_empty() {
                    entry.ip = ip.to_string();
                }
                let presence = entry
                    .agents
                    .entry(agent.to_string())
                    .or_insert_with(|| AgentPresence {
                        online: false,
                        uri: String::new(),
                    });
                presence.online = connected;
                if connected && !agent_uri.is_empty() {
                    presence.uri = agent_uri.to_string();
                }
                entry.online_count()
            },
        );
        debug!(host, agent, connected, online = count, "host agent state");
        count
    }

    fn get_metric_id(&self, token: i64) -> Option<MetricRecord> {
        self.records.get(token)
    }

    fn list_hosts(&self, online_only: bool) -> BTreeMap<i32, String> {
        self.hosts
            .values()
            .into_iter()
            .filter(|h| !online_only || h.online_count() > 0)
            .map(|h| (h.id, h.name))
            .collect()
    }

    fn is_realtime(&self) -> bool {
        self.realtime.load(Ordering::SeqCst)
    }

    fn set_realtime(&self, realtime: bool) {
        let previous = self.realtime.swap(realtime, Ordering::SeqCst);
        if previous != realtime {
            info!(realtime, "catalog mode changed");
        }
    }
}
