//! Shared identity types: metric keys, catalog records and agent keys.

use serde::{Deserialize, Serialize};

/// Token value meaning "no previously assigned id".
pub const NO_TOKEN: i64 = -1;

// =============================================================================
// Metric type
// =============================================================================

/// Kind of value an agent reports for a metric.
///
/// The numeric ids are part of the wire protocol and of the catalog key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    LongCounter,
    LongGauge,
    DeltaCounter,
    DeltaGauge,
    Increment,
    IntervalIncrement,
    String,
    Blob,
}

impl MetricType {
    /// Wire/catalog id of this type.
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::LongCounter => 0,
            Self::LongGauge => 1,
            Self::DeltaCounter => 2,
            Self::DeltaGauge => 3,
            Self::Increment => 4,
            Self::IntervalIncrement => 5,
            Self::String => 6,
            Self::Blob => 7,
        }
    }

    /// Resolve a wire id. Unknown ids yield `None`.
    #[must_use]
    pub fn from_id(id: u8) -> Option<Self> {
        Self::all().iter().copied().find(|t| t.id() == id)
    }

    /// Whether samples of this type carry an `i64` value that can be filed
    /// into a tier.
    #[must_use]
    pub fn is_numeric(self) -> bool {
        !matches!(self, Self::String | Self::Blob)
    }

    #[must_use]
    pub fn all() -> &'static [MetricType] {
        &[
            Self::LongCounter,
            Self::LongGauge,
            Self::DeltaCounter,
            Self::DeltaGauge,
            Self::Increment,
            Self::IntervalIncrement,
            Self::String,
            Self::Blob,
        ]
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LongCounter => write!(f, "long_counter"),
            Self::LongGauge => write!(f, "long_gauge"),
            Self::DeltaCounter => write!(f, "delta_counter"),
            Self::DeltaGauge => write!(f, "delta_gauge"),
            Self::Increment => write!(f, "increment"),
            Self::IntervalIncrement => write!(f, "interval_increment"),
            Self::String => write!(f, "string"),
            Self::Blob => write!(f, "blob"),
        }
    }
}

// =============================================================================
// Keys and records
// =============================================================================

/// Composite identity of a metric stream. Compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricKey {
    pub host: String,
    pub agent: String,
    pub namespace: Vec<String>,
    pub name: String,
    pub type_id: u8,
}

impl MetricKey {
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        agent: impl Into<String>,
        namespace: Vec<String>,
        name: impl Into<String>,
        type_id: u8,
    ) -> Self {
        Self {
            host: host.into(),
            agent: agent.into(),
            namespace,
            name: name.into(),
            type_id,
        }
    }

    /// Fully qualified name: `host/agent/ns1/ns2:name`.
    #[must_use]
    pub fn fqn(&self) -> String {
        let mut out = format!("{}/{}", self.host, self.agent);
        for segment in &self.namespace {
            out.push('/');
            out.push_str(segment);
        }
        out.push(':');
        out.push_str(&self.name);
        out
    }
}

impl std::fmt::Display for MetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fqn())
    }
}

/// A catalog entry. Owned by the catalog; handed out as clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub id: i64,
    pub key: MetricKey,
    /// Epoch ms of the interning call that created the record.
    pub first_seen: i64,
    /// Epoch ms of the most recent resolution.
    pub last_seen: i64,
}

/// Identity of an agent: the (host, agent name) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentKey {
    pub host: String,
    pub agent: String,
}

impl AgentKey {
    #[must_use]
    pub fn new(host: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            agent: agent.into(),
        }
    }
}

impl std::fmt::Display for AgentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.agent)
    }
}
