//! Aggregated counters for the whole core, one snapshot per component.

use serde::{Deserialize, Serialize};

use crate::catalog::CatalogStats;
use crate::dispatcher::DispatcherStats;
use crate::pool::PoolStats;
use crate::registry::RegistryStats;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreStats {
    pub catalog: CatalogStats,
    pub registry: RegistryStats,
    pub dispatcher: DispatcherStats,
    pub pool: PoolStats,
}

impl CoreStats {
    /// One-line summary for logs and the CLI.
    #[must_use]
    pub fn summary_line(&self) -> String {
        format!(
            "metrics={} agents={} received={} completed={} dropped={} pool_rejected={}",
            self.catalog.record_count,
            self.registry.active,
            self.dispatcher.received,
            self.dispatcher.completed,
            self.dispatcher.dropped_total(),
            self.pool.rejected,
        )
    }
}
