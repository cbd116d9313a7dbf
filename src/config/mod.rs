//! Application configuration.
//!
//! Aggregates configuration from all modules into a single [`BridgeConfig`]
//! that can be loaded from YAML files or environment variables.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::{MessagingConfig, TransportRetryConfig};
use crate::topics::TopicConfig;
use crate::validation::ValidationLimits;
use crate::worker::RetryPolicy;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "langbridge.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "LANGBRIDGE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "LANGBRIDGE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "LANGBRIDGE_LOG";
/// Environment variable selecting the log format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "LANGBRIDGE_LOG_FORMAT";

/// Default time a caller waits for a response.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Default consumer group for worker runners.
pub const DEFAULT_WORKER_GROUP: &str = "langbridge-worker";
/// Default consumer group for response routers.
pub const DEFAULT_ROUTER_GROUP: &str = "langbridge-router";
/// Default time between readiness probes.
pub const DEFAULT_HEALTH_INTERVAL_MS: u64 = 10_000;
/// Default bound on one readiness probe.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;
/// Default metrics endpoint port.
pub const DEFAULT_METRICS_PORT: u16 = 9090;
/// Default service name stamped on published messages.
pub const DEFAULT_SERVICE_NAME: &str = "langbridge";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Caller-side request settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RequestsConfig {
    pub default_timeout_ms: u64,
}

impl Default for RequestsConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl RequestsConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Consumer group ids.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GroupsConfig {
    pub worker: String,
    pub router: String,
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            worker: DEFAULT_WORKER_GROUP.to_string(),
            router: DEFAULT_ROUTER_GROUP.to_string(),
        }
    }
}

/// Readiness probe settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_HEALTH_INTERVAL_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Metrics endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Port serving `/metrics`, `/health` and `/ready`.
    pub port: u16,
    /// Also publish completion metrics to the system metrics topic.
    pub publish_to_bus: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_METRICS_PORT,
            publish_to_bus: false,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub messaging: MessagingConfig,
    pub topics: TopicConfig,
    pub limits: ValidationLimits,
    /// Worker-side retry of failed processing attempts.
    pub retry: RetryPolicy,
    /// The bus transport's own publish retry.
    pub transport_retry: TransportRetryConfig,
    pub requests: RequestsConfig,
    pub groups: GroupsConfig,
    pub health: HealthConfig,
    pub metrics: MetricsConfig,
    pub service_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            messaging: MessagingConfig::default(),
            topics: TopicConfig::default(),
            limits: ValidationLimits::default(),
            retry: RetryPolicy::default(),
            transport_retry: TransportRetryConfig::default(),
            requests: RequestsConfig::default(),
            groups: GroupsConfig::default(),
            health: HealthConfig::default(),
            metrics: MetricsConfig::default(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `langbridge.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables like `LANGBRIDGE__RETRY__MAX_ATTEMPTS`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
