//! Channel sessions: the transport-facing side of agent presence.
//!
//! The transport owns the actual connections. The core only sees
//! [`ChannelSession`] values (ids and addresses) and keeps a weak relation
//! between a channel and the serial of the agent that identified on it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::background::{TaskHandle, spawn_periodic};
use crate::catalog::MetricCatalog;
use crate::clock::Clock;
use crate::concurrent_map::{IdMap, ShardedMap};
use crate::events::{AgentEvent, AgentEventReceiver, EventError, ExpiryReason};
use crate::registry::{AgentState, VirtualAgentRegistry};

/// Transport-assigned channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSession {
    pub channel_id: ChannelId,
    pub remote: SocketAddr,
    /// Serial of the agent identified on this channel, once known.
    pub serial: Option<i64>,
    pub connected_at: i64,
}

impl ChannelSession {
    #[must_use]
    pub fn new(channel_id: ChannelId, remote: SocketAddr, connected_at: i64) -> Self {
        Self {
            channel_id,
            remote,
            serial: None,
            connected_at,
        }
    }
}

/// Callbacks from the transport about channel lifecycle.
pub trait ChannelSessionListener: Send + Sync {
    fn on_connected_channel(&self, session: &ChannelSession);

    /// Returns the agents still online on the channel's host.
    fn on_closed_channel(&self, session: &ChannelSession) -> usize;

    /// Called once the channel's agent has a serial. Returns the agents
    /// online on its host.
    fn on_identified_channel(&self, session: &ChannelSession) -> usize;
}

/// Tracks open channels and binds them to agent serials.
pub struct SessionManager {
    registry: Arc<VirtualAgentRegistry>,
    catalog: Arc<MetricCatalog>,
    clock: Arc<dyn Clock>,
    channels: ShardedMap<ChannelId, ChannelSession>,
    bindings: IdMap<ChannelId>,
    next_channel_id: AtomicU64,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("channels", &self.channels.len())
            .field("bound", &self.bindings.len())
            .finish()
    }
}

impl SessionManager {
    #[must_use]
    pub fn new(
        registry: Arc<VirtualAgentRegistry>,
        catalog: Arc<MetricCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            catalog,
            clock,
            channels: ShardedMap::new(),
            bindings: IdMap::new(),
            next_channel_id: AtomicU64::new(1),
        }
    }

    /// Allocate a channel id for `remote` and register it as connected.
    pub fn open_channel(&self, remote: SocketAddr) -> ChannelSession {
        let id = ChannelId(self.next_channel_id.fetch_add(1, Ordering::SeqCst));
        let session = ChannelSession::new(id, remote, self.clock.now_ms());
        self.on_connected_channel(&session);
        session
    }

    #[must_use]
    pub fn channel(&self, id: ChannelId) -> Option<ChannelSession> {
        self.channels.get(&id)
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Channel currently bound to `serial`.
    #[must_use]
    pub fn channel_for(&self, serial: i64) -> Option<ChannelId> {
        self.bindings.get(serial)
    }

    fn host_online(&self, serial: i64) -> usize {
        self.registry
            .get(serial)
            .map_or(0, |agent| self.catalog.online_count(&agent.host))
    }

    fn unbind(&self, serial: i64) -> bool {
        match self.bindings.remove(serial) {
            Some(channel) => {
                self.channels.write_with(&channel, |s| {
                    if s.serial == Some(serial) {
                        s.serial = None;
                    }
                });
                debug!(serial, channel_id = %channel, "channel unbound from expired agent");
                true
            }
            None => false,
        }
    }

    /// Drain pending registry events and unbind channels whose agent
    /// expired. On lag, falls back to checking every binding against the
    /// registry. Returns how many channels were unbound.
    pub fn reap_expired(&self, events: &mut AgentEventReceiver) -> usize {
        let mut unbound = 0;
        loop {
            match events.try_recv() {
                Ok(AgentEvent::Expired { serial, .. }) => {
                    if self.unbind(serial) {
                        unbound += 1;
                    }
                }
                Ok(AgentEvent::Connected { .. }) => {}
                Err(EventError::Lagged { count }) => {
                    warn!(skipped = count, "session reaper lagged, reconciling bindings");
                    for serial in self.bindings.ids() {
                        if self.registry.state(serial) != Some(AgentState::Connected)
                            && self.unbind(serial)
                        {
                            unbound += 1;
                        }
                    }
                }
                Err(EventError::Empty | EventError::Closed) => break,
            }
        }
        unbound
    }

    /// Run [`Self::reap_expired`] every `interval`.
    #[must_use]
    pub fn spawn_reaper(
        manager: Arc<Self>,
        mut events: AgentEventReceiver,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> TaskHandle {
        spawn_periodic("session-reaper", interval, shutdown, move || {
            manager.reap_expired(&mut events);
        })
    }
}

impl ChannelSessionListener for SessionManager {
    fn on_connected_channel(&self, session: &ChannelSession) {
        debug!(channel_id = %session.channel_id, remote = %session.remote, "channel connected");
        self.channels.insert(session.channel_id, session.clone());
    }

    fn on_closed_channel(&self, session: &ChannelSession) -> usize {
        let stored = self.channels.remove(&session.channel_id);
        let serial = stored.and_then(|s| s.serial).or(session.serial);
        let Some(serial) = serial else {
            debug!(channel_id = %session.channel_id, "unidentified channel closed");
            return 0;
        };
        if self.bindings.read_with(serial, |ch| *ch == session.channel_id) == Some(true) {
            self.bindings.remove(serial);
        }
        let host = self.registry.get(serial).map(|a| a.host);
        self.registry.expire(serial, ExpiryReason::Disconnect);
        let remaining = host.map_or(0, |h| self.catalog.online_count(&h));
        debug!(channel_id = %session.channel_id, serial, remaining, "channel closed");
        remaining
    }

    fn on_identified_channel(&self, session: &ChannelSession) -> usize {
        let Some(serial) = session.serial else {
            warn!(channel_id = %session.channel_id, "identified channel has no serial");
            return 0;
        };
        self.channels.insert(session.channel_id, session.clone());
        if let Some(previous) = self.bindings.insert(serial, session.channel_id) {
            if previous != session.channel_id {
                debug!(serial, channel_id = %previous, "serial rebound to a new channel");
            }
        }
        self.host_online(serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::EventBus;

    fn setup() -> (SessionManager, Arc<VirtualAgentRegistry>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let catalog = Arc::new(MetricCatalog::default());
        let registry = Arc::new(VirtualAgentRegistry::new(
            catalog.clone(),
            clock.clone(),
            EventBus::new(64),
            1_000,
        ));
        let manager = SessionManager::new(registry.clone(), catalog, clock.clone());
        (manager, registry, clock)
    }

    fn addr() -> SocketAddr {
        "10.1.2.3:4000".parse().unwrap()
    }

    fn identify(
        manager: &SessionManager,
        registry: &VirtualAgentRegistry,
        agent: &str,
    ) -> ChannelSession {
        let channel = manager.open_channel(addr());
        let serial = registry
            .identify("h1", agent, "", Some(channel.clone()))
            .unwrap()
            .serial;
        let bound = ChannelSession {
            serial: Some(serial),
            ..channel
        };
        manager.on_identified_channel(&bound);
        bound
    }

    #[test]
    fn identified_channels_report_host_counts() {
        let (manager, registry, _) = setup();
        let c1 = identify(&manager, &registry, "a1");
        assert_eq!(manager.channel_for(c1.serial.unwrap()), Some(c1.channel_id));
        let c2 = manager.open_channel(addr());
        let serial = registry
            .identify("h1", "a2", "", Some(c2.clone()))
            .unwrap()
            .serial;
        let count = manager.on_identified_channel(&ChannelSession {
            serial: Some(serial),
            ..c2
        });
        assert_eq!(count, 2);
        assert_eq!(manager.channel_count(), 2);
    }

    #[test]
    fn closing_channel_expires_agent() {
        let (manager, registry, _) = setup();
        let c1 = identify(&manager, &registry, "a1");
        let c2 = identify(&manager, &registry, "a2");
        let remaining = manager.on_closed_channel(&c1);
        assert_eq!(remaining, 1);
        assert_eq!(
            registry.state(c1.serial.unwrap()),
            Some(AgentState::Expired)
        );
        assert_eq!(manager.channel_for(c1.serial.unwrap()), None);
        assert_eq!(manager.on_closed_channel(&c2), 0);
    }

    #[test]
    fn closing_unidentified_channel_is_quiet() {
        let (manager, _, _) = setup();
        let channel = manager.open_channel(addr());
        assert_eq!(manager.on_closed_channel(&channel), 0);
        assert_eq!(manager.channel_count(), 0);
    }

    #[test]
    fn reaper_unbinds_timed_out_agents() {
        let (manager, registry, clock) = setup();
        let mut rx = registry.events().subscribe();
        let c1 = identify(&manager, &registry, "a1");
        clock.advance(5_000);
        registry.sweep();

        assert_eq!(manager.reap_expired(&mut rx), 1);
        assert_eq!(manager.channel(c1.channel_id).unwrap().serial, None);
        assert_eq!(manager.reap_expired(&mut rx), 0);
    }
}
