//! Process lifecycle: builds every component from a [`Config`], runs the
//! background tasks, and shuts them down in order.
//!
//! Nothing here is global. A process (or a test) owns one [`RouterCore`] and
//! hands frames to it from whatever transport it runs.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::Result;
use crate::background::{TaskHandle, spawn_periodic};
use crate::catalog::{CatalogStore, MetricCatalog, MetricCatalogService, NullCatalogStore};
use crate::clock::{Clock, SystemClock};
use crate::collector::{CollectorRunner, CollectorSet, CollectorSources};
use crate::config::Config;
use crate::dispatcher::{
    ConnectHandler, Dispatcher, KeepAliveHandler, LogSink, Outcome, SampleSink, SubmitHandler,
};
use crate::error::PoolError;
use crate::events::{AgentEventReceiver, DEFAULT_EVENT_CAPACITY, EventBus};
use crate::instrument::{CollectSet, Instrumentation};
use crate::pool::WorkerPool;
use crate::registry::VirtualAgentRegistry;
use crate::session::{ChannelSession, ChannelSessionListener, SessionManager};
use crate::stats::CoreStats;
use crate::tiers::TierModel;

/// Builder for [`RouterCore`]. Anything not injected gets the production
/// default: system clock, no-op catalog store, logging sample sink.
pub struct RouterCoreBuilder {
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn CatalogStore>>,
    sink: Option<Arc<dyn SampleSink>>,
}

impl RouterCoreBuilder {
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CatalogStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn SampleSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the configuration and construct every component.
    ///
    /// Must be called from within a tokio runtime (the worker pool spawns its
    /// workers here).
    pub fn build(self) -> Result<RouterCore> {
        let config = self.config;
        let model = Arc::new(config.validate()?);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self.store.unwrap_or_else(|| Arc::new(NullCatalogStore));
        let sink = self.sink.unwrap_or_else(|| Arc::new(LogSink));
        let limits = config.dispatcher.limits();

        let catalog = Arc::new(MetricCatalog::new(
            store,
            Arc::clone(&clock),
            config.catalog.shards,
        ));
        catalog.set_realtime(config.catalog.realtime);
        let catalog_service: Arc<dyn MetricCatalogService> = Arc::clone(&catalog) as _;

        let events = EventBus::new(DEFAULT_EVENT_CAPACITY);
        let expiry_events = events.subscribe();
        let registry = Arc::new(VirtualAgentRegistry::new(
            Arc::clone(&catalog_service),
            Arc::clone(&clock),
            events,
            config.registry.ttl_ms(),
        ));

        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&registry),
            Arc::clone(&catalog),
            Arc::clone(&clock),
        ));
        let listener: Arc<dyn ChannelSessionListener> = Arc::clone(&sessions) as _;

        let instrumentation = Arc::new(Instrumentation::new());
        let dispatcher = Dispatcher::builder()
            .instrumentation(Arc::clone(&instrumentation), CollectSet::ALL)
            .register(Arc::new(ConnectHandler::new(
                Arc::clone(&registry),
                Some(Arc::clone(&listener)),
                limits,
            )))?
            .register(Arc::new(KeepAliveHandler::new(Arc::clone(&registry), limits)))?
            .register(Arc::new(SubmitHandler::new(
                Arc::clone(&catalog_service),
                Arc::clone(&registry),
                Arc::clone(&model),
                Arc::clone(&sink),
                Arc::clone(&clock),
                Some(listener),
                limits,
            )))?
            .build();
        let dispatcher = Arc::new(dispatcher);

        let pool = Arc::new(WorkerPool::new(
            config.pool.workers,
            config.pool.queue_capacity,
        ));

        let collectors = CollectorSet::from_config(
            &config.collectors,
            &CollectorSources {
                catalog: Arc::clone(&catalog),
                registry: Arc::clone(&registry),
                dispatcher: Arc::clone(&dispatcher),
                pool: Arc::clone(&pool),
                instrumentation: Arc::clone(&instrumentation),
            },
        )?;
        let runner = Arc::new(CollectorRunner::new(
            catalog_service,
            sink,
            Arc::clone(&model),
            Arc::clone(&clock),
            config.server.host_name.clone(),
            config.server.agent_name.clone(),
        ));

        info!(
            tiers = %model,
            realtime = config.catalog.realtime,
            ttl_ms = config.registry.agent_ttl_ms,
            workers = config.pool.workers,
            collectors = ?collectors.names(),
            "router core built"
        );

        Ok(RouterCore {
            config,
            model,
            catalog,
            registry,
            sessions,
            dispatcher,
            pool,
            instrumentation,
            collectors,
            runner,
            expiry_events: Mutex::new(Some(expiry_events)),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            started_at: Instant::now(),
        })
    }
}

/// What [`RouterCore::shutdown`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownSummary {
    pub tasks_stopped: usize,
    pub requests_completed: u64,
    pub records_flushed: usize,
    pub flush_error: Option<String>,
    pub uptime_secs: u64,
}

/// Every component of one running server.
pub struct RouterCore {
    config: Config,
    model: Arc<TierModel>,
    catalog: Arc<MetricCatalog>,
    registry: Arc<VirtualAgentRegistry>,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<WorkerPool>,
    instrumentation: Arc<Instrumentation>,
    collectors: CollectorSet,
    runner: Arc<CollectorRunner>,
    expiry_events: Mutex<Option<AgentEventReceiver>>,
    shutdown_flag: Arc<AtomicBool>,
    tasks: Mutex<Vec<TaskHandle>>,
    started: AtomicBool,
    started_at: Instant,
}

impl std::fmt::Debug for RouterCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterCore")
            .field("tiers", &self.model.to_string())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

impl RouterCore {
    #[must_use]
    pub fn builder(config: Config) -> RouterCoreBuilder {
        RouterCoreBuilder {
            config,
            clock: None,
            store: None,
            sink: None,
        }
    }

    /// Spawn the sweeper, the catalog flusher, the session reaper and every
    /// configured collector. A second call does nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let sweep = Duration::from_millis(self.config.registry.sweep_interval_ms);
        let flush = Duration::from_millis(self.config.catalog.flush_interval_ms);
        let mut tasks = Vec::new();

        tasks.push(VirtualAgentRegistry::spawn_sweeper(
            Arc::clone(&self.registry),
            sweep,
            Arc::clone(&self.shutdown_flag),
        ));

        let catalog = Arc::clone(&self.catalog);
        tasks.push(spawn_periodic(
            "catalog-flusher",
            flush,
            Arc::clone(&self.shutdown_flag),
            move || {
                if let Err(err) = catalog.flush() {
                    warn!(error = %err, "catalog flush failed, records requeued");
                }
            },
        ));

        let events = self
            .expiry_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(events) = events {
            tasks.push(SessionManager::spawn_reaper(
                Arc::clone(&self.sessions),
                events,
                sweep,
                Arc::clone(&self.shutdown_flag),
            ));
        }

        tasks.extend(
            self.collectors
                .spawn(Arc::clone(&self.runner), Arc::clone(&self.shutdown_flag)),
        );

        info!(tasks = tasks.len(), "router core started");
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);
    }

    /// Hand one raw frame to the worker pool.
    pub fn submit_frame(
        &self,
        frame: Vec<u8>,
        remote: SocketAddr,
        channel: Option<ChannelSession>,
    ) -> std::result::Result<(), PoolError> {
        let dispatcher = Arc::clone(&self.dispatcher);
        self.pool.submit(move || {
            dispatcher.process_frame(&frame, remote, channel.as_ref());
        })
    }

    /// Route a frame on the calling thread.
    pub fn process_frame(
        &self,
        frame: &[u8],
        remote: SocketAddr,
        channel: Option<&ChannelSession>,
    ) -> Outcome {
        self.dispatcher.process_frame(frame, remote, channel)
    }

    /// Register a new transport channel.
    pub fn open_channel(&self, remote: SocketAddr) -> ChannelSession {
        self.sessions.open_channel(remote)
    }

    /// Transport channel closed. Expires its agent and returns how many agents
    /// remain online on that host.
    pub fn close_channel(&self, session: &ChannelSession) -> usize {
        self.sessions.on_closed_channel(session)
    }

    #[must_use]
    pub fn stats(&self) -> CoreStats {
        CoreStats {
            catalog: self.catalog.stats(),
            registry: self.registry.stats(),
            dispatcher: self.dispatcher.stats(),
            pool: self.pool.stats(),
        }
    }

    /// Stop background tasks, drain the pool, flush the catalog.
    pub async fn shutdown(&self) -> ShutdownSummary {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        let tasks_stopped = tasks.len();
        for task in tasks {
            task.stop().await;
        }

        self.pool.shutdown().await;

        let (records_flushed, flush_error) = match self.catalog.flush() {
            Ok(n) => (n, None),
            Err(err) => {
                warn!(error = %err, pending = self.catalog.pending_len(), "final catalog flush failed");
                (0, Some(err.to_string()))
            }
        };

        let summary = ShutdownSummary {
            tasks_stopped,
            requests_completed: self.pool.completed_count(),
            records_flushed,
            flush_error,
            uptime_secs: self.started_at.elapsed().as_secs(),
        };
        info!(
            tasks_stopped = summary.tasks_stopped,
            requests_completed = summary.requests_completed,
            records_flushed = summary.records_flushed,
            "router core shut down"
        );
        summary
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn tier_model(&self) -> &Arc<TierModel> {
        &self.model
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<MetricCatalog> {
        &self.catalog
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<VirtualAgentRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn instrumentation(&self) -> &Arc<Instrumentation> {
        &self.instrumentation
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalogStore;
    use crate::clock::ManualClock;
    use crate::config::CollectorConfig;
    use crate::dispatcher::MemorySink;
    use crate::protocol::{MetricSubmit, encode_connect, encode_submit};
    use crate::types::{MetricType, NO_TOKEN};

    const NOW: i64 = 1_700_000_000_000;

    fn remote() -> SocketAddr {
        "10.0.0.5:40000".parse().unwrap()
    }

    fn core(config: Config) -> (RouterCore, Arc<MemorySink>, Arc<MemoryCatalogStore>) {
        let sink = Arc::new(MemorySink::new());
        let store = Arc::new(MemoryCatalogStore::new());
        let core = RouterCore::builder(config)
            .with_clock(Arc::new(ManualClock::new(NOW)))
            .with_store(Arc::clone(&store) as _)
            .with_sink(Arc::clone(&sink) as _)
            .build()
            .unwrap();
        (core, sink, store)
    }

    #[tokio::test]
    async fn frames_flow_through_pool_to_sink() {
        let (core, sink, store) = core(Config::default());
        core.submit_frame(encode_connect("web-1", "jvm", "tcp://web-1:9000"), remote(), None)
            .unwrap();
        core.submit_frame(
            encode_submit(&MetricSubmit {
                token: NO_TOKEN,
                host: "web-1".into(),
                agent: "jvm".into(),
                metric_type: MetricType::LongGauge,
                namespace: vec!["heap".into()],
                name: "used".into(),
                timestamp_ms: NOW - 500,
                value: 1024,
            }),
            remote(),
            None,
        )
        .unwrap();

        let summary = core.shutdown().await;
        assert_eq!(summary.requests_completed, 2);
        assert_eq!(summary.records_flushed, 1);
        assert_eq!(store.records().len(), 1);

        let samples = sink.samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 1024);
        assert_eq!(samples[0].tier_index, 0);

        let stats = core.stats();
        assert_eq!(stats.dispatcher.received, 2);
        assert_eq!(stats.dispatcher.completed, 2);
        assert_eq!(stats.registry.active, 1);
        assert!(stats.pool.terminated);
    }

    #[tokio::test]
    async fn invalid_config_fails_build() {
        let mut config = Config::default();
        config.tiers.model = String::new();
        let err = RouterCore::builder(config).build().unwrap_err();
        assert!(err.is_config_fatal());

        let mut config = Config::default();
        config.collectors.push(CollectorConfig {
            name: "nope".to_string(),
            interval_ms: 100,
        });
        assert!(RouterCore::builder(config).build().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn start_spawns_tasks_and_shutdown_stops_them() {
        let mut config = Config::default();
        config.collectors.push(CollectorConfig {
            name: "pool".to_string(),
            interval_ms: 1000,
        });
        let (core, sink, _) = core(config);
        core.start();
        core.start();
        assert!(core.is_started());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!sink.is_empty(), "pool collector should have filed samples");

        let summary = core.shutdown().await;
        // sweeper, flusher, reaper, one collector
        assert_eq!(summary.tasks_stopped, 4);
        assert!(summary.flush_error.is_none());
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_rejected() {
        let (core, _, _) = core(Config::default());
        core.shutdown().await;
        let err = core
            .submit_frame(encode_connect("h", "a", ""), remote(), None)
            .unwrap_err();
        assert_eq!(err, PoolError::ShutDown);
    }

    #[tokio::test]
    async fn closing_a_channel_expires_its_agent() {
        let (core, _, _) = core(Config::default());
        let channel = core.open_channel(remote());
        let outcome = core.process_frame(
            &encode_connect("web-1", "jvm", "tcp://web-1:9000"),
            remote(),
            Some(&channel),
        );
        let Outcome::Connected { serial, .. } = outcome else {
            panic!("expected connect, got {outcome:?}");
        };
        let bound = core.sessions().channel(channel.channel_id).unwrap();
        assert_eq!(bound.serial, Some(serial));

        assert_eq!(core.close_channel(&bound), 0);
        assert_eq!(core.registry().active_count(), 0);
        core.shutdown().await;
    }
}
