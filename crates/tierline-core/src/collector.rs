//! Collectors: named sources of observations about the server itself.
//!
//! Configured collectors are resolved by name at startup (an unknown name is
//! fatal) and each runs on its own interval. Observations are interned
//! through the catalog under the server's own host and agent identity and
//! written to the sample sink like any agent metric.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::background::{TaskHandle, spawn_periodic};
use crate::catalog::{MetricCatalog, MetricCatalogService};
use crate::clock::Clock;
use crate::config::CollectorConfig;
use crate::dispatcher::{Dispatcher, SampleSink, TierSample};
use crate::error::ConfigError;
use crate::instrument::Instrumentation;
use crate::pool::WorkerPool;
use crate::registry::VirtualAgentRegistry;
use crate::tiers::TierModel;
use crate::types::{MetricType, NO_TOKEN};

/// Names accepted in `[[collectors]]`.
pub const BUILTIN_COLLECTORS: [&str; 5] =
    ["catalog", "registry", "dispatcher", "pool", "instrumentation"];

/// One measured value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub namespace: Vec<String>,
    pub name: String,
    pub metric_type: MetricType,
    pub value: i64,
}

impl Observation {
    #[must_use]
    pub fn new(
        namespace: Vec<String>,
        name: impl Into<String>,
        metric_type: MetricType,
        value: i64,
    ) -> Self {
        Self {
            namespace,
            name: name.into(),
            metric_type,
            value,
        }
    }

    fn gauge(group: &str, name: &str, value: impl TryInto<i64>) -> Self {
        Self::new(
            vec![group.to_string()],
            name,
            MetricType::LongGauge,
            value.try_into().unwrap_or(i64::MAX),
        )
    }

    fn counter(group: &str, name: &str, value: u64) -> Self {
        Self::new(
            vec![group.to_string()],
            name,
            MetricType::LongCounter,
            i64::try_from(value).unwrap_or(i64::MAX),
        )
    }
}

/// Context handed to every collection.
#[derive(Debug, Clone, Copy)]
pub struct CollectContext {
    pub now_ms: i64,
}

pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    fn collect(&self, ctx: &CollectContext) -> Vec<Observation>;
}

// =============================================================================
// Built-ins
// =============================================================================

struct CatalogCollector(Arc<MetricCatalog>);

impl Collector for CatalogCollector {
    fn name(&self) -> &str {
        "catalog"
    }

    fn collect(&self, _ctx: &CollectContext) -> Vec<Observation> {
        let s = self.0.stats();
        vec![
            Observation::counter("catalog", "call_count", s.call_count),
            Observation::counter("catalog", "assigned_ids", s.assigned_ids),
            Observation::gauge("catalog", "average_call_ns", s.average_call_ns),
            Observation::gauge("catalog", "record_count", s.record_count),
            Observation::gauge("catalog", "pending_flush", s.pending_flush),
            Observation::gauge("catalog", "host_count", s.host_count),
        ]
    }
}

struct RegistryCollector(Arc<VirtualAgentRegistry>);

impl Collector for RegistryCollector {
    fn name(&self) -> &str {
        "registry"
    }

    fn collect(&self, _ctx: &CollectContext) -> Vec<Observation> {
        let s = self.0.stats();
        vec![
            Observation::gauge("registry", "active", s.active),
            Observation::counter("registry", "total_connected", s.total_connected),
            Observation::counter("registry", "expired_timeout", s.expired_timeout),
            Observation::counter("registry", "expired_disconnect", s.expired_disconnect),
            Observation::counter("registry", "expired_replaced", s.expired_replaced),
        ]
    }
}

struct DispatcherCollector(Arc<Dispatcher>);

impl Collector for DispatcherCollector {
    fn name(&self) -> &str {
        "dispatcher"
    }

    fn collect(&self, _ctx: &CollectContext) -> Vec<Observation> {
        let s = self.0.stats();
        let mut out = vec![
            Observation::counter("dispatcher", "received", s.received),
            Observation::counter("dispatcher", "completed", s.completed),
            Observation::counter("dispatcher", "unknown_opcodes", s.unknown_opcodes),
        ];
        out.extend(s.dropped.iter().map(|(reason, n)| {
            Observation::new(
                vec!["dispatcher".to_string(), "dropped".to_string()],
                reason.to_string(),
                MetricType::LongCounter,
                i64::try_from(*n).unwrap_or(i64::MAX),
            )
        }));
        out
    }
}

struct PoolCollector(Arc<WorkerPool>);

impl Collector for PoolCollector {
    fn name(&self) -> &str {
        "pool"
    }

    fn collect(&self, _ctx: &CollectContext) -> Vec<Observation> {
        let s = self.0.stats();
        vec![
            Observation::gauge("pool", "active", s.active),
            Observation::gauge("pool", "queue_size", s.queue_size),
            Observation::counter("pool", "task_count", s.task_count),
            Observation::counter("pool", "completed", s.completed),
            Observation::counter("pool", "rejected", s.rejected),
        ]
    }
}

struct InstrumentationCollector(Arc<Instrumentation>);

impl Collector for InstrumentationCollector {
    fn name(&self) -> &str {
        "instrumentation"
    }

    fn collect(&self, _ctx: &CollectContext) -> Vec<Observation> {
        self.0.snapshot()
    }
}

/// Components the built-in collectors read from.
#[derive(Clone)]
pub struct CollectorSources {
    pub catalog: Arc<MetricCatalog>,
    pub registry: Arc<VirtualAgentRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub pool: Arc<WorkerPool>,
    pub instrumentation: Arc<Instrumentation>,
}

fn builtin(name: &str, sources: &CollectorSources) -> Option<Arc<dyn Collector>> {
    let collector: Arc<dyn Collector> = match name {
        "catalog" => Arc::new(CatalogCollector(Arc::clone(&sources.catalog))),
        "registry" => Arc::new(RegistryCollector(Arc::clone(&sources.registry))),
        "dispatcher" => Arc::new(DispatcherCollector(Arc::clone(&sources.dispatcher))),
        "pool" => Arc::new(PoolCollector(Arc::clone(&sources.pool))),
        "instrumentation" => Arc::new(InstrumentationCollector(Arc::clone(&sources.instrumentation))),
        _ => return None,
    };
    Some(collector)
}

// =============================================================================
// Running collectors
// =============================================================================

/// Files observations as samples under the server's own identity.
pub struct CollectorRunner {
    catalog: Arc<dyn MetricCatalogService>,
    sink: Arc<dyn SampleSink>,
    model: Arc<TierModel>,
    clock: Arc<dyn Clock>,
    host: String,
    agent: String,
}

impl CollectorRunner {
    #[must_use]
    pub fn new(
        catalog: Arc<dyn MetricCatalogService>,
        sink: Arc<dyn SampleSink>,
        model: Arc<TierModel>,
        clock: Arc<dyn Clock>,
        host: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            sink,
            model,
            clock,
            host: host.into(),
            agent: agent.into(),
        }
    }

    /// Collect once and file every numeric observation into tier 0.
    /// Returns how many samples were written.
    pub fn run_once(&self, collector: &dyn Collector) -> usize {
        let now = self.clock.now_ms();
        let observations = collector.collect(&CollectContext { now_ms: now });
        let Some(tier_address) = self.model.tier_address(now, 0) else {
            return 0;
        };
        let mut written = 0;
        for obs in observations {
            let metric_id = match self.catalog.get_id(
                NO_TOKEN,
                &self.host,
                &self.agent,
                obs.metric_type.id(),
                &obs.namespace,
                &obs.name,
            ) {
                Ok(id) => id,
                Err(err) => {
                    warn!(collector = collector.name(), metric = %obs.name, error = %err, "observation not cataloged");
                    continue;
                }
            };
            if !obs.metric_type.is_numeric() {
                continue;
            }
            let sample = TierSample {
                metric_id,
                timestamp: now,
                value: obs.value,
                tier_index: 0,
                tier_address,
            };
            match self.sink.write(&sample) {
                Ok(()) => written += 1,
                Err(err) => warn!(collector = collector.name(), metric_id, error = %err, "observation not filed"),
            }
        }
        debug!(collector = collector.name(), written, "collection complete");
        written
    }
}

/// Collectors resolved from configuration, each with its interval.
#[derive(Default)]
pub struct CollectorSet {
    entries: Vec<(Arc<dyn Collector>, Duration)>,
}

impl CollectorSet {
    /// Resolve configured names. Unknown names are configuration errors.
    pub fn from_config(
        configs: &[CollectorConfig],
        sources: &CollectorSources,
    ) -> Result<Self, ConfigError> {
        let mut entries = Vec::with_capacity(configs.len());
        for cfg in configs {
            let collector = builtin(&cfg.name, sources)
                .ok_or_else(|| ConfigError::UnknownCollector(cfg.name.clone()))?;
            entries.push((collector, Duration::from_millis(cfg.interval_ms)));
        }
        Ok(Self { entries })
    }

    /// Add a collector that is not one of the built-ins.
    pub fn push(&mut self, collector: Arc<dyn Collector>, interval: Duration) {
        self.entries.push((collector, interval));
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(c, _)| c.name().to_string()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every collector once, in order.
    pub fn run_all(&self, runner: &CollectorRunner) -> usize {
        self.entries.iter().map(|(c, _)| runner.run_once(c.as_ref())).sum()
    }

    /// One periodic task per collector.
    #[must_use]
    pub fn spawn(
        &self,
        runner: Arc<CollectorRunner>,
        shutdown: Arc<AtomicBool>,
    ) -> Vec<TaskHandle> {
        self.entries
            .iter()
            .map(|(collector, interval)| {
                let collector = Arc::clone(collector);
                let runner = Arc::clone(&runner);
                spawn_periodic(
                    format!("collector-{}", collector.name()),
                    *interval,
                    Arc::clone(&shutdown),
                    move || {
                        runner.run_once(collector.as_ref());
                    },
                )
            })
            .collect()
    }
}
