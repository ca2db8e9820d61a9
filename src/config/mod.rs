//! Application configuration.
//!
//! Aggregates pipeline configuration into a single Config struct that can
//! be loaded from YAML files or environment variables.

use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EVENTLINE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVENTLINE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "EVENTLINE_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service identity.
    pub service: ServiceConfig,
    /// Durable log / consumer group configuration.
    pub stream: StreamConfig,
    /// Dedup store configuration.
    pub dedup: DedupConfig,
    /// Metric sink configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `EVENTLINE_CONFIG` environment variable (if set)
    /// 4. Environment variables with `EVENTLINE` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new("config", FileFormat::Yaml).required(false))
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

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }
}

/// Service identity configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name used in events, metrics labels, and log lines.
    pub name: String,
    /// Explicit instance id; derived from the environment when absent.
    pub instance_id: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "eventline".to_string(),
            instance_id: None,
        }
    }
}

/// Durable log and consumer group configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Redis connection URL.
    pub url: String,
    /// Stream the pipeline publishes to and consumes from.
    pub stream: String,
    /// Consumer group name.
    pub group: String,
    /// Max entries fetched per poll.
    pub poll_count: usize,
    /// Bounded wait per poll, ms.
    pub poll_block_ms: u64,
    /// Delay after a failed poll, ms.
    pub poll_backoff_ms: u64,
    /// Liveness threshold: pending entries of another consumer idle beyond
    /// this are treated as orphaned and claimed. One tunable, traded
    /// between partition tolerance and recovery latency.
    pub claim_min_idle_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            stream: "events-stream".to_string(),
            group: "eventline-consumers".to_string(),
            poll_count: 10,
            poll_block_ms: 1000,
            poll_backoff_ms: 100,
            claim_min_idle_ms: 5000,
        }
    }
}

impl StreamConfig {
    pub fn poll_block(&self) -> Duration {
        Duration::from_millis(self.poll_block_ms)
    }

    pub fn poll_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_backoff_ms)
    }

    pub fn claim_min_idle(&self) -> Duration {
        Duration::from_millis(self.claim_min_idle_ms)
    }
}

/// Dedup store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// MongoDB connection URI.
    pub uri: String,
    /// Database holding the applied-event projection.
    pub database: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            database: "eventline".to_string(),
        }
    }
}

/// Metric sink configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to emit metrics at all.
    pub enabled: bool,
    /// Sink URL; falls back to the stream URL when absent.
    pub url: Option<String>,
    /// Series retention, ms.
    pub retention_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            retention_ms: 30 * 86_400_000,
        }
    }
}
