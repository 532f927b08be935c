//! Error types for tierline-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
    /// Optional reference for more details
    pub learn_more: Option<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
            learn_more: None,
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    #[must_use]
    pub fn learn_more(mut self, link: impl Into<String>) -> Self {
        self.learn_more = Some(link.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        if let Some(learn_more) = &self.learn_more {
            let _ = writeln!(output, "  Learn more: {learn_more}");
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tierline-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tier model error: {0}")]
    TierModel(#[from] TierModelError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error must stop the process from starting.
    ///
    /// Tier model errors, duplicate opcode claims and invalid configuration
    /// values are fatal. Everything else is request-local or a lifecycle
    /// transition.
    #[must_use]
    pub fn is_config_fatal(&self) -> bool {
        match self {
            Self::Config(_) | Self::TierModel(_) | Self::Toml(_) => true,
            Self::Dispatch(err) => err.is_config_fatal(),
            _ => false,
        }
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::TierModel(err) => Some(err.remediation()),
            Self::Dispatch(err) if err.is_config_fatal() => Some(
                Remediation::new("Two request handlers claim the same opcode. Register each opcode once.")
                    .alternative("Remove the custom handler or pick an unused opcode."),
            ),
            Self::Pool(PoolError::QueueFull) => Some(
                Remediation::new("The worker queue is saturated. Raise [pool] queue_capacity or workers.")
                    .command("Check config", "tl check"),
            ),
            Self::Toml(_) => Some(
                Remediation::new("Config parse failed. Fix the TOML syntax and retry.")
                    .command("Validate config", "tl check"),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the config and log directories exist and are writable."),
            ),
            _ => None,
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration loading and validation errors. All are startup-fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unknown collector: {0}")]
    UnknownCollector(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path or set TIERLINE_CONFIG."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .command("Validate config", "tl check")
                .alternative("TOML errors include the line and column of the bad value."),
            Self::ValidationError(_) => {
                Remediation::new("A config value is out of range. Adjust it and retry.")
                    .command("Validate config", "tl check")
                    .alternative("[registry] sweep_interval_ms must be at most half of agent_ttl_ms.")
            }
            Self::UnknownCollector(name) => Remediation::new(format!(
                "Collector '{name}' does not exist. Remove it from [[collectors]]."
            ))
            .alternative("Known collectors: catalog, registry, dispatcher, pool, instrumentation."),
        }
    }
}

// =============================================================================
// Tier model
// =============================================================================

/// Tier model parse and validation errors. Startup-fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TierModelError {
    #[error("Invalid tier model: {0}")]
    InvalidTierModel(String),

    #[error(
        "Invalid tier triplet pair at tier {index}: {next_ms}ms is not a strictly larger multiple of {previous_ms}ms"
    )]
    InvalidTierTripletPair {
        /// Index of the second tier of the offending pair.
        index: usize,
        previous_ms: i64,
        next_ms: i64,
    },
}

impl TierModelError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::InvalidTierModel(_) => Remediation::new(
                "Fix [tiers] model. Each tier is [name=]<duration>[:<count>], comma separated.",
            )
            .command("Try a model", "tl tiers \"raw=1s:3600, 15s:5760, 1m:10080\"")
            .alternative("Durations take ms, s, m, h or d units; a bare integer is milliseconds."),
            &Self::InvalidTierTripletPair {
                previous_ms,
                next_ms,
                ..
            } => {
                let step = previous_ms.max(1);
                let rounded = (next_ms / step).saturating_add(1).saturating_mul(step);
                Remediation::new(format!(
                    "Tier durations must increase and divide evenly: {next_ms}ms is not a multiple of {previous_ms}ms."
                ))
                .command("Inspect tiers", "tl tiers \"<model>\"")
                .alternative(format!(
                    "Round the coarser tier to a multiple of {previous_ms}ms, for example {rounded}ms."
                ))
            }
        }
    }
}

// =============================================================================
// Catalog / registry
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Invalid metric key: {0}")]
    InvalidKey(String),

    #[error("Catalog store failed: {0}")]
    Store(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid agent identity: {0}")]
    InvalidIdentity(String),
}

// =============================================================================
// Protocol / dispatch
// =============================================================================

/// Payload decode failures. Always request-local.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty frame")]
    EmptyFrame,

    #[error("Truncated payload: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Negative length prefix: {0}")]
    NegativeLength(i32),

    #[error("String of {len} bytes exceeds limit of {max}")]
    StringTooLong { len: usize, max: usize },

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("Unknown metric type id: {0}")]
    UnknownMetricType(u8),

    #[error("Namespace depth {depth} exceeds limit of {max}")]
    NamespaceTooDeep { depth: usize, max: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Opcode 0x{opcode:02x} claimed by both {existing} and {duplicate}")]
    DuplicateOpCode {
        opcode: u8,
        existing: String,
        duplicate: String,
    },

    #[error("Unknown opcode 0x{0:02x}")]
    UnknownOpCode(u8),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Failure reported by a sample sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Sample sink failed: {0}")]
pub struct SinkError(pub String);

impl DispatchError {
    #[must_use]
    pub fn is_config_fatal(&self) -> bool {
        matches!(self, Self::DuplicateOpCode { .. })
    }
}

// =============================================================================
// Worker pool
// =============================================================================

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker queue is full")]
    QueueFull,

    #[error("Worker pool is shut down")]
    ShutDown,
}
