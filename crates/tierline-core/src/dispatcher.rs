//! Protocol dispatcher: routes decoded agent requests to opcode handlers.
//!
//! Handlers claim opcodes when the dispatcher is built; a second claim on the
//! same opcode is a startup error. At request time nothing escapes
//! [`Dispatcher::process_agent_request`]: unknown opcodes and handler
//! failures are logged, counted and reported as [`Outcome::Dropped`], and the
//! channel stays open.
//!
//! A metric submission runs: decode, catalog id, registry touch (identifying
//! the agent on first sight), tier selection and addressing, sink write.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::catalog::MetricCatalogService;
use crate::clock::Clock;
use crate::error::{DispatchError, RegistryError, SinkError};
use crate::events::ExpiryReason;
use crate::instrument::{CollectSet, Instrumentation, TraceSpec};
use crate::protocol::{AgentRef, ConnectRequest, MetricSubmit, OpCode, ProtocolLimits, split_frame};
use crate::registry::{Identified, VirtualAgentRegistry};
use crate::session::{ChannelSession, ChannelSessionListener};
use crate::sharded_counter::ShardedCounter;
use crate::tiers::TierModel;

// =============================================================================
// Request / outcome
// =============================================================================

/// One decoded frame as delivered by the transport.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub op: OpCode,
    pub payload: &'a [u8],
    pub remote: SocketAddr,
    pub channel: Option<&'a ChannelSession>,
}

/// A sample addressed into a tier, ready for storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSample {
    pub metric_id: i64,
    pub timestamp: i64,
    pub value: i64,
    pub tier_index: usize,
    pub tier_address: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    UnknownOpCode,
    Malformed,
    CatalogFailure,
    RegistryFailure,
    SinkFailure,
    /// Older than the coarsest tier's retention.
    TooOld,
    /// Keep-alive or disconnect for an agent that is not connected.
    NotConnected,
}

impl DropReason {
    pub const ALL: [Self; 7] = [
        Self::UnknownOpCode,
        Self::Malformed,
        Self::CatalogFailure,
        Self::RegistryFailure,
        Self::SinkFailure,
        Self::TooOld,
        Self::NotConnected,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn from_error(err: &DispatchError) -> Self {
        match err {
            DispatchError::UnknownOpCode(_) | DispatchError::DuplicateOpCode { .. } => {
                Self::UnknownOpCode
            }
            DispatchError::Protocol(_) => Self::Malformed,
            DispatchError::Catalog(_) => Self::CatalogFailure,
            DispatchError::Registry(_) => Self::RegistryFailure,
            DispatchError::Sink(_) => Self::SinkFailure,
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownOpCode => write!(f, "unknown_opcode"),
            Self::Malformed => write!(f, "malformed"),
            Self::CatalogFailure => write!(f, "catalog_failure"),
            Self::RegistryFailure => write!(f, "registry_failure"),
            Self::SinkFailure => write!(f, "sink_failure"),
            Self::TooOld => write!(f, "too_old"),
            Self::NotConnected => write!(f, "not_connected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Connected {
        serial: i64,
        replaced: Option<i64>,
        online_count: usize,
    },
    Filed {
        sample: TierSample,
    },
    /// Non-numeric metric: interned, not filed.
    Cataloged {
        metric_id: i64,
    },
    Touched {
        serial: i64,
    },
    Disconnected {
        serial: i64,
    },
    Dropped {
        reason: DropReason,
    },
}

impl Outcome {
    #[must_use]
    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped { .. })
    }
}

// =============================================================================
// Collaborators
// =============================================================================

/// A handler for one or more opcodes.
pub trait AgentRequestHandler: Send + Sync {
    fn name(&self) -> &str;

    fn handled_op_codes(&self) -> Vec<OpCode>;

    fn process_agent_request(&self, ctx: &RequestContext<'_>) -> Result<Outcome, DispatchError>;
}

/// Storage collaborator for addressed samples.
pub trait SampleSink: Send + Sync {
    fn write(&self, sample: &TierSample) -> Result<(), SinkError>;
}

/// Sink that keeps every sample in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    samples: Mutex<Vec<TierSample>>,
    failing: AtomicBool,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    #[must_use]
    pub fn samples(&self) -> Vec<TierSample> {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SampleSink for MemorySink {
    fn write(&self, sample: &TierSample) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError("memory sink set to fail".to_string()));
        }
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sample.clone());
        Ok(())
    }
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl SampleSink for LogSink {
    fn write(&self, sample: &TierSample) -> Result<(), SinkError> {
        debug!(
            metric_id = sample.metric_id,
            tier = sample.tier_index,
            address = sample.tier_address,
            value = sample.value,
            "sample filed"
        );
        Ok(())
    }
}

// =============================================================================
// Built-in handlers
// =============================================================================

/// Identify on the request's channel and tell the session layer.
fn identify_on_channel(
    registry: &VirtualAgentRegistry,
    listener: Option<&Arc<dyn ChannelSessionListener>>,
    host: &str,
    agent: &str,
    uri: &str,
    channel: Option<&ChannelSession>,
) -> Result<Identified, RegistryError> {
    let identified = registry.identify(host, agent, uri, channel.cloned())?;
    if let (Some(listener), Some(channel)) = (listener, channel) {
        let bound = ChannelSession {
            serial: Some(identified.serial),
            ..channel.clone()
        };
        listener.on_identified_channel(&bound);
    }
    Ok(identified)
}

/// `CONNECT`: create (or replace) the virtual agent.
pub struct ConnectHandler {
    registry: Arc<VirtualAgentRegistry>,
    listener: Option<Arc<dyn ChannelSessionListener>>,
    limits: ProtocolLimits,
}

impl ConnectHandler {
    #[must_use]
    pub fn new(
        registry: Arc<VirtualAgentRegistry>,
        listener: Option<Arc<dyn ChannelSessionListener>>,
        limits: ProtocolLimits,
    ) -> Self {
        Self {
            registry,
            listener,
            limits,
        }
    }
}

impl AgentRequestHandler for ConnectHandler {
    fn name(&self) -> &str {
        "connect"
    }

    fn handled_op_codes(&self) -> Vec<OpCode> {
        vec![OpCode::CONNECT]
    }

    fn process_agent_request(&self, ctx: &RequestContext<'_>) -> Result<Outcome, DispatchError> {
        let req = ConnectRequest::decode(ctx.payload, self.limits)?;
        let identified = identify_on_channel(
            &self.registry,
            self.listener.as_ref(),
            &req.host,
            &req.agent,
            &req.uri,
            ctx.channel,
        )?;
        Ok(Outcome::Connected {
            serial: identified.serial,
            replaced: identified.replaced,
            online_count: identified.online_count,
        })
    }
}

/// `PING` and `DISCONNECT`.
pub struct KeepAliveHandler {
    registry: Arc<VirtualAgentRegistry>,
    limits: ProtocolLimits,
}

impl KeepAliveHandler {
    #[must_use]
    pub fn new(registry: Arc<VirtualAgentRegistry>, limits: ProtocolLimits) -> Self {
        Self { registry, limits }
    }
}

impl AgentRequestHandler for KeepAliveHandler {
    fn name(&self) -> &str {
        "keepalive"
    }

    fn handled_op_codes(&self) -> Vec<OpCode> {
        vec![OpCode::PING, OpCode::DISCONNECT]
    }

    fn process_agent_request(&self, ctx: &RequestContext<'_>) -> Result<Outcome, DispatchError> {
        let req = AgentRef::decode(ctx.payload, self.limits)?;
        let Some(serial) = self.registry.serial_for(&req.host, &req.agent) else {
            return Ok(Outcome::Dropped {
                reason: DropReason::NotConnected,
            });
        };
        let applied = if ctx.op == OpCode::DISCONNECT {
            self.registry.expire(serial, ExpiryReason::Disconnect)
        } else {
            self.registry.touch(serial)
        };
        if !applied {
            // Expired between lookup and action.
            return Ok(Outcome::Dropped {
                reason: DropReason::NotConnected,
            });
        }
        if ctx.op == OpCode::DISCONNECT {
            Ok(Outcome::Disconnected { serial })
        } else {
            Ok(Outcome::Touched { serial })
        }
    }
}

/// `METRIC_SUBMIT`: resolve, touch, address and file one sample.
pub struct SubmitHandler {
    catalog: Arc<dyn MetricCatalogService>,
    registry: Arc<VirtualAgentRegistry>,
    model: Arc<TierModel>,
    sink: Arc<dyn SampleSink>,
    clock: Arc<dyn Clock>,
    listener: Option<Arc<dyn ChannelSessionListener>>,
    limits: ProtocolLimits,
}

impl SubmitHandler {
    #[must_use]
    pub fn new(
        catalog: Arc<dyn MetricCatalogService>,
        registry: Arc<VirtualAgentRegistry>,
        model: Arc<TierModel>,
        sink: Arc<dyn SampleSink>,
        clock: Arc<dyn Clock>,
        listener: Option<Arc<dyn ChannelSessionListener>>,
        limits: ProtocolLimits,
    ) -> Self {
        Self {
            catalog,
            registry,
            model,
            sink,
            clock,
            listener,
            limits,
        }
    }
}

impl AgentRequestHandler for SubmitHandler {
    fn name(&self) -> &str {
        "submit"
    }

    fn handled_op_codes(&self) -> Vec<OpCode> {
        vec![OpCode::METRIC_SUBMIT]
    }

    fn process_agent_request(&self, ctx: &RequestContext<'_>) -> Result<Outcome, DispatchError> {
        let submit = MetricSubmit::decode(ctx.payload, self.limits)?;
        let metric_id = self.catalog.get_id(
            submit.token,
            &submit.host,
            &submit.agent,
            submit.metric_type.id(),
            &submit.namespace,
            &submit.name,
        )?;

        let touched = self
            .registry
            .serial_for(&submit.host, &submit.agent)
            .is_some_and(|serial| self.registry.touch(serial));
        if !touched {
            identify_on_channel(
                &self.registry,
                self.listener.as_ref(),
                &submit.host,
                &submit.agent,
                "",
                ctx.channel,
            )?;
        }

        if !submit.metric_type.is_numeric() {
            return Ok(Outcome::Cataloged { metric_id });
        }

        let now = self.clock.now_ms();
        let Some(age) = now.checked_sub(submit.timestamp_ms) else {
            let reason = if submit.timestamp_ms < now {
                DropReason::TooOld
            } else {
                DropReason::Malformed
            };
            debug!(metric_id, timestamp_ms = submit.timestamp_ms, ?reason, "sample timestamp out of range");
            return Ok(Outcome::Dropped { reason });
        };
        // A sample further ahead than the longest retention window cannot come
        // from a sane agent clock.
        if age < 0 && age.checked_neg().is_none_or(|ahead| ahead > self.model.max_retention_ms()) {
            debug!(metric_id, timestamp_ms = submit.timestamp_ms, "sample timestamp too far in the future");
            return Ok(Outcome::Dropped {
                reason: DropReason::Malformed,
            });
        }
        let Some(tier_index) = self.model.finest_tier_for_age(age) else {
            debug!(metric_id, age_ms = age, "sample older than every tier");
            return Ok(Outcome::Dropped {
                reason: DropReason::TooOld,
            });
        };
        let Some(tier_address) = self.model.tier_address(submit.timestamp_ms, tier_index) else {
            return Ok(Outcome::Dropped {
                reason: DropReason::Malformed,
            });
        };

        let sample = TierSample {
            metric_id,
            timestamp: submit.timestamp_ms,
            value: submit.value,
            tier_index,
            tier_address,
        };
        self.sink.write(&sample)?;
        trace!(metric_id, tier = tier_index, address = tier_address, "sample dispatched");
        Ok(Outcome::Filed { sample })
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub received: u64,
    pub completed: u64,
    pub unknown_opcodes: u64,
    pub dropped: BTreeMap<DropReason, u64>,
}

impl DispatcherStats {
    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.dropped.values().sum()
    }
}

struct Route {
    handler: Arc<dyn AgentRequestHandler>,
    trace: TraceSpec,
}

/// Collects handlers and rejects duplicate opcode claims.
pub struct DispatcherBuilder {
    routes: HashMap<OpCode, Route>,
    instrumentation: Arc<Instrumentation>,
    collect: CollectSet,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            instrumentation: Arc::new(Instrumentation::new()),
            collect: CollectSet::ALL,
        }
    }
}

impl DispatcherBuilder {
    #[must_use]
    pub fn instrumentation(mut self, instrumentation: Arc<Instrumentation>, collect: CollectSet) -> Self {
        self.instrumentation = instrumentation;
        self.collect = collect;
        self
    }

    /// Claim every opcode the handler advertises.
    pub fn register(mut self, handler: Arc<dyn AgentRequestHandler>) -> Result<Self, DispatchError> {
        for op in handler.handled_op_codes() {
            if let Some(existing) = self.routes.get(&op) {
                return Err(DispatchError::DuplicateOpCode {
                    opcode: op.0,
                    existing: existing.handler.name().to_string(),
                    duplicate: handler.name().to_string(),
                });
            }
            let label = op.name().map_or_else(|| format!("op_{:02x}", op.0), str::to_lowercase);
            let trace = TraceSpec::new(&["dispatcher", handler.name()], label, self.collect);
            self.routes.insert(
                op,
                Route {
                    handler: Arc::clone(&handler),
                    trace,
                },
            );
        }
        Ok(self)
    }

    #[must_use]
    pub fn build(self) -> Dispatcher {
        Dispatcher {
            routes: self.routes,
            instrumentation: self.instrumentation,
            received: ShardedCounter::new(),
            completed: ShardedCounter::new(),
            dropped: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

pub struct Dispatcher {
    routes: HashMap<OpCode, Route>,
    instrumentation: Arc<Instrumentation>,
    received: ShardedCounter,
    completed: ShardedCounter,
    dropped: [AtomicU64; DropReason::ALL.len()],
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("op_codes", &self.op_codes())
            .finish()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Registered opcodes, ascending.
    #[must_use]
    pub fn op_codes(&self) -> Vec<OpCode> {
        let mut ops: Vec<OpCode> = self.routes.keys().copied().collect();
        ops.sort();
        ops
    }

    fn drop_with(&self, reason: DropReason) -> Outcome {
        self.dropped[reason.index()].fetch_add(1, Ordering::Relaxed);
        Outcome::Dropped { reason }
    }

    /// Route one request. Never fails; problems become [`Outcome::Dropped`].
    pub fn process_agent_request(
        &self,
        op: OpCode,
        payload: &[u8],
        remote: SocketAddr,
        channel: Option<&ChannelSession>,
    ) -> Outcome {
        self.received.increment();
        let channel_id = channel.map(|c| c.channel_id.0);

        let Some(route) = self.routes.get(&op) else {
            warn!(opcode = %op, remote = %remote, channel_id, "unknown opcode, request dropped");
            return self.drop_with(DropReason::UnknownOpCode);
        };

        let ctx = RequestContext {
            op,
            payload,
            remote,
            channel,
        };
        let result = self
            .instrumentation
            .record(&route.trace, || route.handler.process_agent_request(&ctx));

        match result {
            Ok(Outcome::Dropped { reason }) => self.drop_with(reason),
            Ok(outcome) => {
                self.completed.increment();
                outcome
            }
            Err(err) => {
                warn!(
                    opcode = %op,
                    remote = %remote,
                    channel_id,
                    handler = route.handler.name(),
                    error = %err,
                    "request dropped"
                );
                self.drop_with(DropReason::from_error(&err))
            }
        }
    }

    /// Split the opcode byte off a raw frame and route it.
    pub fn process_frame(
        &self,
        frame: &[u8],
        remote: SocketAddr,
        channel: Option<&ChannelSession>,
    ) -> Outcome {
        match split_frame(frame) {
            Ok((op, payload)) => self.process_agent_request(op, payload, remote, channel),
            Err(err) => {
                self.received.increment();
                warn!(remote = %remote, error = %err, "malformed frame dropped");
                self.drop_with(DropReason::Malformed)
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        let dropped: BTreeMap<DropReason, u64> = DropReason::ALL
            .iter()
            .map(|r| (*r, self.dropped[r.index()].load(Ordering::Relaxed)))
            .filter(|(_, n)| *n > 0)
            .collect();
        DispatcherStats {
            received: self.received.get(),
            completed: self.completed.get(),
            unknown_opcodes: self.dropped[DropReason::UnknownOpCode.index()].load(Ordering::Relaxed),
            dropped,
        }
    }
}
