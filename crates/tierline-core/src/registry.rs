//! Virtual agent registry: connect, keep-alive and expiry per (host, agent).
//!
//! Each (host, agent) key owns a slot guarded by its own mutex. Every state
//! transition for that key (connect, replace, touch, expire, sweep) happens
//! under the slot lock, and the catalog's host aggregate is updated inside
//! the same critical section so the two never disagree about an agent.
//!
//! Lock order is always: key shard, then slot, then catalog host shard.
//! Nothing inside a slot lock reaches back into the key map.
//!
//! ```text
//! absent --identify--> CONNECTED --(ttl | expire | reconnect)--> EXPIRED
//! ```
//!
//! EXPIRED is terminal for a serial. Serials are never reused.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::background::{TaskHandle, spawn_periodic};
use crate::catalog::MetricCatalogService;
use crate::clock::Clock;
use crate::concurrent_map::{IdMap, ShardedMap};
use crate::error::RegistryError;
use crate::events::{AgentEvent, EventBus, ExpiryReason};
use crate::sharded_counter::ShardedCounter;
use crate::session::ChannelSession;
use crate::types::AgentKey;

/// Handle for the periodic expiry sweep.
pub type SweeperHandle = TaskHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Connected,
    Expired,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "CONNECTED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Server-side stand-in for one connected agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualAgent {
    pub serial: i64,
    pub host: String,
    pub agent_name: String,
    pub listening_uri: String,
    pub last_touch: i64,
    pub ttl_ms: i64,
    pub state: AgentState,
    /// Channel the agent last identified on. Relation only; the transport
    /// owns the channel.
    pub channel: Option<ChannelSession>,
}

impl VirtualAgent {
    fn overdue(&self, now: i64) -> bool {
        now.saturating_sub(self.last_touch) > self.ttl_ms
    }
}

/// Result of [`VirtualAgentRegistry::identify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identified {
    pub serial: i64,
    /// Serial of the CONNECTED entry this connection replaced, if any.
    pub replaced: Option<i64>,
    /// Agents online for the host after the connect.
    pub online_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub active: usize,
    pub total_connected: u64,
    pub expired_timeout: u64,
    pub expired_disconnect: u64,
    pub expired_replaced: u64,
    pub ttl_ms: i64,
}

#[derive(Debug, Default)]
struct KeySlot {
    agent: Option<VirtualAgent>,
}

type Slot = Arc<Mutex<KeySlot>>;

fn lock(slot: &Slot) -> MutexGuard<'_, KeySlot> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct VirtualAgentRegistry {
    slots: ShardedMap<AgentKey, Slot>,
    by_serial: IdMap<AgentKey>,
    next_serial: AtomicI64,
    ttl_ms: i64,
    catalog: Arc<dyn MetricCatalogService>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    connected: ShardedCounter,
    expired_timeout: AtomicU64,
    expired_disconnect: AtomicU64,
    expired_replaced: AtomicU64,
}

impl std::fmt::Debug for VirtualAgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualAgentRegistry")
            .field("active", &self.by_serial.len())
            .field("ttl_ms", &self.ttl_ms)
            .finish()
    }
}

impl VirtualAgentRegistry {
    #[must_use]
    pub fn new(
        catalog: Arc<dyn MetricCatalogService>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        ttl_ms: i64,
    ) -> Self {
        Self {
            slots: ShardedMap::new(),
            by_serial: IdMap::new(),
            next_serial: AtomicI64::new(1),
            ttl_ms,
            catalog,
            clock,
            events,
            connected: ShardedCounter::new(),
            expired_timeout: AtomicU64::new(0),
            expired_disconnect: AtomicU64::new(0),
            expired_replaced: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Connect `(host, agent)`, replacing any CONNECTED entry for the key.
    ///
    /// The old entry is expired (and its event published) before the new
    /// serial is created, all under the key's lock.
    pub fn identify(
        &self,
        host: &str,
        agent: &str,
        uri: &str,
        channel: Option<ChannelSession>,
    ) -> Result<Identified, RegistryError> {
        if host.is_empty() || agent.is_empty() {
            return Err(RegistryError::InvalidIdentity(format!(
                "host '{host}' and agent '{agent}' must both be non-empty"
            )));
        }
        let key = AgentKey::new(host, agent);
        let (slot, _) = self
            .slots
            .get_or_insert_with(&key, || Arc::new(Mutex::new(KeySlot::default())));
        let mut guard = lock(&slot);

        let replaced = guard
            .agent
            .take()
            .map(|old| self.retire(old, ExpiryReason::Replaced));

        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let now = self.clock.now_ms();
        let ip = channel
            .as_ref()
            .map(|c| c.remote.ip().to_string())
            .unwrap_or_default();
        let online_count = self.catalog.host_agent_state(true, host, &ip, agent, uri);

        let channel = channel.map(|mut c| {
            c.serial = Some(serial);
            c
        });
        let channel_id = channel.as_ref().map(|c| c.channel_id);
        guard.agent = Some(VirtualAgent {
            serial,
            host: host.to_string(),
            agent_name: agent.to_string(),
            listening_uri: uri.to_string(),
            last_touch: now,
            ttl_ms: self.ttl_ms,
            state: AgentState::Connected,
            channel,
        });
        self.by_serial.insert(serial, key);
        self.connected.increment();
        self.events.publish(AgentEvent::Connected {
            serial,
            host: host.to_string(),
            agent: agent.to_string(),
            uri: uri.to_string(),
            channel_id,
        });
        drop(guard);

        info!(host, agent, serial, replaced = ?replaced, online = online_count, "agent connected");
        Ok(Identified {
            serial,
            replaced,
            online_count,
        })
    }

    /// Run `f` on the CONNECTED agent with `serial` under its slot lock.
    fn with_active<R>(&self, serial: i64, f: impl FnOnce(&mut KeySlot) -> R) -> Option<R> {
        let key = self.by_serial.get(serial)?;
        let slot = self.slots.get(&key)?;
        let mut guard = lock(&slot);
        if guard.agent.as_ref().is_some_and(|a| a.serial == serial) {
            Some(f(&mut guard))
        } else {
            None
        }
    }

    /// Move a taken agent to EXPIRED: unindex it, update the catalog's host
    /// aggregate and publish the event. Caller holds the slot lock.
    fn retire(&self, mut agent: VirtualAgent, reason: ExpiryReason) -> i64 {
        agent.state = AgentState::Expired;
        self.by_serial.remove(agent.serial);
        let online_count =
            self.catalog
                .host_agent_state(false, &agent.host, "", &agent.agent_name, "");
        match reason {
            ExpiryReason::Timeout => &self.expired_timeout,
            ExpiryReason::Disconnect => &self.expired_disconnect,
            ExpiryReason::Replaced => &self.expired_replaced,
        }
        .fetch_add(1, Ordering::Relaxed);
        info!(
            host = %agent.host,
            agent = %agent.agent_name,
            serial = agent.serial,
            reason = %reason,
            online = online_count,
            "agent expired"
        );
        self.events.publish(AgentEvent::Expired {
            serial: agent.serial,
            host: agent.host,
            agent: agent.agent_name,
            reason,
            online_count,
        });
        agent.serial
    }

    /// Reset the keep-alive countdown. Returns `false` (no-op) when the serial
    /// is not CONNECTED.
    pub fn touch(&self, serial: i64) -> bool {
        let now = self.clock.now_ms();
        self.with_active(serial, |slot| {
            if let Some(agent) = slot.agent.as_mut() {
                agent.last_touch = now;
            }
        })
        .is_some()
    }

    /// Force EXPIRED regardless of TTL. Idempotent; returns whether this call
    /// performed the transition.
    pub fn expire(&self, serial: i64, reason: ExpiryReason) -> bool {
        self.with_active(serial, |slot| {
            slot.agent.take().map(|agent| self.retire(agent, reason))
        })
        .flatten()
        .is_some()
    }

    /// `ttl - (now - last_touch)`; negative when overdue for a sweep.
    /// `None` unless the serial is CONNECTED.
    #[must_use]
    pub fn time_to_expiry(&self, serial: i64) -> Option<i64> {
        let now = self.clock.now_ms();
        self.with_active(serial, |slot| {
            slot.agent
                .as_ref()
                .map(|a| a.ttl_ms.saturating_sub(now.saturating_sub(a.last_touch)))
        })
        .flatten()
    }

    /// State of a serial. Serials handed out earlier that are no longer
    /// active are `Expired`; serials never handed out are `None`.
    #[must_use]
    pub fn state(&self, serial: i64) -> Option<AgentState> {
        if self.with_active(serial, |_| ()).is_some() {
            Some(AgentState::Connected)
        } else if serial >= 1 && serial < self.next_serial.load(Ordering::SeqCst) {
            Some(AgentState::Expired)
        } else {
            None
        }
    }

    #[must_use]
    pub fn get(&self, serial: i64) -> Option<VirtualAgent> {
        self.with_active(serial, |slot| slot.agent.clone()).flatten()
    }

    /// Serial of the CONNECTED agent for `(host, agent)`.
    #[must_use]
    pub fn serial_for(&self, host: &str, agent: &str) -> Option<i64> {
        let slot = self.slots.get(&AgentKey::new(host, agent))?;
        let guard = lock(&slot);
        guard.agent.as_ref().map(|a| a.serial)
    }

    #[must_use]
    pub fn active_agents(&self) -> Vec<VirtualAgent> {
        let mut agents: Vec<VirtualAgent> = self
            .by_serial
            .ids()
            .into_iter()
            .filter_map(|serial| self.get(serial))
            .collect();
        agents.sort_by_key(|a| a.serial);
        agents
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.by_serial.len()
    }

    /// One expiry scan. Each candidate is re-checked under its slot lock, so
    /// a `touch` that lands mid-scan wins. Returns the expired serials.
    pub fn sweep(&self) -> Vec<i64> {
        let mut expired = Vec::new();
        for serial in self.by_serial.ids() {
            let now = self.clock.now_ms();
            let retired = self
                .with_active(serial, |slot| {
                    if slot.agent.as_ref().is_some_and(|a| a.overdue(now)) {
                        slot.agent
                            .take()
                            .map(|agent| self.retire(agent, ExpiryReason::Timeout))
                    } else {
                        None
                    }
                })
                .flatten();
            expired.extend(retired);
        }
        self.prune_idle_slots();
        if !expired.is_empty() {
            debug!(count = expired.len(), "sweep expired agents");
        }
        expired
    }

    /// Drop slots with no agent that nobody else holds. Holding the shard
    /// write lock while seeing a strong count of one means no caller can be
    /// between fetching the slot and locking it.
    fn prune_idle_slots(&self) {
        self.slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1
                || slot
                    .try_lock()
                    .map_or(true, |guard| guard.agent.is_some())
        });
    }

    /// Run [`Self::sweep`] every `interval` on a tokio task.
    #[must_use]
    pub fn spawn_sweeper(
        registry: Arc<Self>,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> SweeperHandle {
        spawn_periodic("registry-sweeper", interval, shutdown, move || {
            registry.sweep();
        })
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active: self.active_count(),
            total_connected: self.connected.get(),
            expired_timeout: self.expired_timeout.load(Ordering::Relaxed),
            expired_disconnect: self.expired_disconnect.load(Ordering::Relaxed),
            expired_replaced: self.expired_replaced.load(Ordering::Relaxed),
            ttl_ms: self.ttl_ms,
        }
    }
}
