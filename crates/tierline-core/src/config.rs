//! Configuration management for tierline
//!
//! Handles loading and validation of tierline.toml configuration files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::collector::BUILTIN_COLLECTORS;
use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::protocol::ProtocolLimits;
use crate::tiers::TierModel;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "TIERLINE_CONFIG";

/// File name looked up under the user config directory.
pub const CONFIG_FILE_NAME: &str = "tierline.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server identity
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LogConfig,

    /// Tier model
    #[serde(default)]
    pub tiers: TiersConfig,

    /// Metric catalog settings
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Agent registry settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Protocol limits
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Worker pool settings
    #[serde(default)]
    pub pool: PoolConfig,

    /// Internal collectors to run
    #[serde(default)]
    pub collectors: Vec<CollectorConfig>,
}

/// Identity the server files its own metrics under
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host_name")]
    pub host_name: String,

    #[serde(default = "default_agent_name")]
    pub agent_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host_name: default_host_name(),
            agent_name: default_agent_name(),
        }
    }
}

/// Local hostname, or `tierline` when it is not valid UTF-8 or empty.
fn default_host_name() -> String {
    gethostname::gethostname()
        .into_string()
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "tierline".to_string())
}

fn default_agent_name() -> String {
    "core".to_string()
}

/// Tier model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiersConfig {
    /// Tier model string, finest tier first
    #[serde(default = "default_tier_model")]
    pub model: String,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            model: default_tier_model(),
        }
    }
}

fn default_tier_model() -> String {
    "raw=1s:3600, 15s:5760, 1m:10080, 1h:8760".to_string()
}

/// Metric catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Persist each new record before its id is handed out
    #[serde(default)]
    pub realtime: bool,

    /// Batch flush period in milliseconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Lock shards for the key index
    #[serde(default = "default_shards")]
    pub shards: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            realtime: false,
            flush_interval_ms: default_flush_interval(),
            shards: default_shards(),
        }
    }
}

fn default_flush_interval() -> u64 {
    5000
}

fn default_shards() -> usize {
    crate::concurrent_map::DEFAULT_SHARDS
}

/// Agent registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Idle time after which an agent expires
    #[serde(default = "default_agent_ttl")]
    pub agent_ttl_ms: u64,

    /// Sweep period; at most half the TTL
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl RegistryConfig {
    /// TTL on the signed millisecond clock. `Config::validate` rejects values
    /// that do not fit, so the saturation only matters for unvalidated input.
    #[must_use]
    pub fn ttl_ms(&self) -> i64 {
        i64::try_from(self.agent_ttl_ms).unwrap_or(i64::MAX)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            agent_ttl_ms: default_agent_ttl(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

fn default_agent_ttl() -> u64 {
    15_000
}

fn default_sweep_interval() -> u64 {
    5000
}

/// Protocol decoding limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_max_string_len")]
    pub max_string_len: usize,

    #[serde(default = "default_max_namespace_depth")]
    pub max_namespace_depth: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_string_len: default_max_string_len(),
            max_namespace_depth: default_max_namespace_depth(),
        }
    }
}

impl DispatcherConfig {
    #[must_use]
    pub fn limits(&self) -> ProtocolLimits {
        ProtocolLimits {
            max_string_len: self.max_string_len,
            max_namespace_depth: self.max_namespace_depth,
        }
    }
}

fn default_max_string_len() -> usize {
    4096
}

fn default_max_namespace_depth() -> usize {
    32
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    4096
}

/// One `[[collectors]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub name: String,

    #[serde(default = "default_collector_interval")]
    pub interval_ms: u64,
}

fn default_collector_interval() -> u64 {
    15_000
}

impl Config {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(display));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(display, e.to_string()))?;
        Self::from_toml_str(&text)
    }

    /// Load from the resolved path, or defaults when no file is found.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match Self::resolve_path(explicit) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Where to read configuration from.
    ///
    /// An explicit path always wins, even if it does not exist, so the
    /// caller gets a not-found error instead of silent defaults. Then
    /// `$TIERLINE_CONFIG`, then `<config_dir>/tierline/tierline.toml` if it
    /// exists.
    #[must_use]
    pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR).filter(|v| !v.is_empty()) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir()
            .map(|dir| dir.join("tierline").join(CONFIG_FILE_NAME))
            .filter(|path| path.is_file())
    }

    /// Parsed tier model.
    pub fn tier_model(&self) -> crate::Result<TierModel> {
        Ok(TierModel::parse(&self.tiers.model)?)
    }

    /// Check every value that must hold before startup. Returns the parsed
    /// tier model so callers do not parse it twice.
    pub fn validate(&self) -> crate::Result<TierModel> {
        let model = self.tier_model()?;

        let registry = &self.registry;
        if registry.agent_ttl_ms == 0 {
            return Err(invalid("registry.agent_ttl_ms must be greater than 0"));
        }
        if i64::try_from(registry.agent_ttl_ms).is_err() {
            return Err(invalid(format!(
                "registry.agent_ttl_ms ({}) must be at most {}",
                registry.agent_ttl_ms,
                i64::MAX
            )));
        }
        if registry.sweep_interval_ms == 0 {
            return Err(invalid("registry.sweep_interval_ms must be greater than 0"));
        }
        if registry.sweep_interval_ms > registry.agent_ttl_ms / 2 {
            return Err(invalid(format!(
                "registry.sweep_interval_ms ({}) must be at most half of agent_ttl_ms ({})",
                registry.sweep_interval_ms, registry.agent_ttl_ms
            )));
        }
        if self.catalog.flush_interval_ms == 0 {
            return Err(invalid("catalog.flush_interval_ms must be greater than 0"));
        }
        if self.catalog.shards == 0 {
            return Err(invalid("catalog.shards must be at least 1"));
        }
        if self.pool.workers == 0 {
            return Err(invalid("pool.workers must be at least 1"));
        }
        if self.pool.queue_capacity == 0 {
            return Err(invalid("pool.queue_capacity must be at least 1"));
        }
        if self.dispatcher.max_string_len == 0 {
            return Err(invalid("dispatcher.max_string_len must be at least 1"));
        }
        if self.server.host_name.is_empty() || self.server.agent_name.is_empty() {
            return Err(invalid("server.host_name and server.agent_name must not be empty"));
        }
        for collector in &self.collectors {
            if !BUILTIN_COLLECTORS.contains(&collector.name.as_str()) {
                return Err(ConfigError::UnknownCollector(collector.name.clone()).into());
            }
            if collector.interval_ms == 0 {
                return Err(invalid(format!(
                    "collector '{}' interval_ms must be greater than 0",
                    collector.name
                )));
            }
        }
        self.logging
            .level
            .parse::<crate::logging::LogLevel>()
            .map_err(invalid)?;

        Ok(model)
    }
}

fn invalid(message: impl Into<String>) -> crate::Error {
    ConfigError::ValidationError(message.into()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, TierModelError};
    use crate::logging::LogFormat;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        let model = config.validate().unwrap();
        assert_eq!(model.len(), 4);
        assert_eq!(config.registry.agent_ttl_ms, 15_000);
        assert_eq!(config.pool.workers, 4);
        assert!(config.collectors.is_empty());
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert!(!config.server.host_name.is_empty());
        assert_eq!(config.tiers.model, default_tier_model());
        assert!(!config.catalog.realtime);
    }

    #[test]
    fn parses_full_document() {
        let text = r#"
            [server]
            host_name = "apm-1"

            [logging]
            level = "debug"
            format = "json"

            [tiers]
            model = "1s:60, 1m:60"

            [catalog]
            realtime = true

            [registry]
            agent_ttl_ms = 10000
            sweep_interval_ms = 2000

            [pool]
            workers = 2

            [[collectors]]
            name = "catalog"
            interval_ms = 1000

            [[collectors]]
            name = "pool"
        "#;
        let config = Config::from_toml_str(text).unwrap();
        assert_eq!(config.server.host_name, "apm-1");
        assert_eq!(config.server.agent_name, "core");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.catalog.realtime);
        assert_eq!(config.pool.queue_capacity, 4096);
        assert_eq!(config.collectors.len(), 2);
        assert_eq!(config.collectors[1].interval_ms, 15_000);
        let model = config.validate().unwrap();
        assert_eq!(model.len(), 2);
    }

    #[test]
    fn parse_error_is_reported() {
        let err = Config::from_toml_str("[pool\nworkers = 2").unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }

    #[test]
    fn sweep_longer_than_half_ttl_is_rejected() {
        let mut config = Config::default();
        config.registry.agent_ttl_ms = 10_000;
        config.registry.sweep_interval_ms = 6000;
        let err = config.validate().unwrap_err();
        assert!(err.is_config_fatal());
        assert!(err.to_string().contains("sweep_interval_ms"));

        config.registry.sweep_interval_ms = 5000;
        assert!(config.validate().is_ok());

        config.registry.sweep_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn ttl_beyond_signed_range_is_rejected() {
        let mut config = Config::default();
        config.registry.agent_ttl_ms = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.is_config_fatal());
        assert!(err.to_string().contains("agent_ttl_ms"));
        assert_eq!(config.registry.ttl_ms(), i64::MAX);

        config.registry.agent_ttl_ms = i64::MAX as u64;
        assert!(config.validate().is_ok());
        assert_eq!(config.registry.ttl_ms(), i64::MAX);
    }

    #[test]
    fn bad_tier_model_is_fatal() {
        let mut config = Config::default();
        config.tiers.model = "15s:10, 40s:10".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            Error::TierModel(TierModelError::InvalidTierTripletPair { .. })
        ));
        assert!(err.is_config_fatal());
    }

    #[test]
    fn unknown_collector_is_rejected() {
        let mut config = Config::default();
        config.collectors.push(CollectorConfig {
            name: "snmp".to_string(),
            interval_ms: 1000,
        });
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::UnknownCollector(_))));
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = Config::default();
        config.pool.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_log_level_rejected() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tierline.toml");
        std::fs::write(&path, "[registry]\nagent_ttl_ms = 4000\nsweep_interval_ms = 1000\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.registry.agent_ttl_ms, 4000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn explicit_path_wins() {
        let explicit = Path::new("/nonexistent/explicit.toml");
        assert_eq!(
            Config::resolve_path(Some(explicit)),
            Some(explicit.to_path_buf())
        );
    }

    #[test]
    fn dispatcher_limits() {
        let config = DispatcherConfig {
            max_string_len: 10,
            max_namespace_depth: 2,
        };
        assert_eq!(config.limits().max_string_len, 10);
        assert_eq!(config.limits().max_namespace_depth, 2);
    }
}
