//! tierline-core: metric identity and agent presence for an APM collector
//!
//! Agents connect, keep themselves alive, and submit samples for named
//! metrics. The core turns every metric key into a stable numeric id, tracks
//! which agents are online, and files each sample into the finest retention
//! tier that still covers its age.
//!
//! # Architecture
//!
//! ```text
//! frame → Dispatcher → handler ─┬→ MetricCatalog (key → id, host presence)
//!           (worker pool)       ├→ VirtualAgentRegistry (serials, TTL, expiry events)
//!                               └→ TierModel → SampleSink
//! ```
//!
//! # Modules
//!
//! - `catalog`: metric key interning and per-host agent presence
//! - `registry`: virtual agents, keep-alive and expiry
//! - `tiers`: tier model parsing and tier addressing
//! - `protocol`: binary frame codec
//! - `dispatcher`: opcode routing and the built-in request handlers
//! - `session`: transport channel bookkeeping
//! - `events`: expiry and connect notifications
//! - `pool`: bounded worker pool for request processing
//! - `instrument`, `collector`: self-monitoring
//! - `runtime`: assembles everything from `config`
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod background;
pub mod catalog;
pub mod clock;
pub mod collector;
pub mod concurrent_map;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod instrument;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod sharded_counter;
pub mod stats;
pub mod tiers;
pub mod types;

pub use error::{Error, Result};
pub use runtime::RouterCore;
pub use tiers::TierModel;
