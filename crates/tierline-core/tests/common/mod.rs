//! Shared fixtures for tierline-core integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use tierline_core::catalog::{MemoryCatalogStore, MetricCatalog};
use tierline_core::clock::ManualClock;
use tierline_core::events::EventBus;
use tierline_core::registry::VirtualAgentRegistry;

/// 2023-11-14T22:13:20Z.
pub const T0: i64 = 1_700_000_000_000;

pub struct Fixture {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryCatalogStore>,
    pub catalog: Arc<MetricCatalog>,
    pub registry: Arc<VirtualAgentRegistry>,
}

impl Fixture {
    pub fn new(ttl_ms: i64) -> Self {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemoryCatalogStore::new());
        let catalog = Arc::new(MetricCatalog::new(
            Arc::clone(&store) as _,
            Arc::clone(&clock) as _,
            16,
        ));
        let registry = Arc::new(VirtualAgentRegistry::new(
            Arc::clone(&catalog) as _,
            Arc::clone(&clock) as _,
            EventBus::new(256),
            ttl_ms,
        ));
        Self {
            clock,
            store,
            catalog,
            registry,
        }
    }
}

pub fn ns(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| (*p).to_string()).collect()
}

pub fn remote() -> SocketAddr {
    "192.0.2.10:51000".parse().unwrap()
}
