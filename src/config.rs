use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the recordoor agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Path to the resource definitions file. Default: "./resources.yaml".
    #[serde(default = "default_resources_file")]
    pub resources_file: PathBuf,

    /// Metrics store connection configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Identity service connection configuration.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Service activity filtering configuration.
    #[serde(default)]
    pub filter: FilterConfig,

    /// Resource attribute cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Sample ingest listener configuration.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Metrics store connection configuration.
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// Metrics store HTTP endpoint (e.g., "http://localhost:8041").
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Startup probe attempts before giving up. Default: 10.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Wait between startup probe attempts. Default: 10s.
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Archive policy for created metrics. Empty uses the store default.
    #[serde(default)]
    pub archive_policy: String,
}

/// Identity service connection configuration.
#[derive(Debug, Deserialize)]
pub struct IdentityConfig {
    /// Identity service HTTP endpoint (e.g., "http://localhost:5000").
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_identity_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Service activity filtering configuration.
#[derive(Debug, Deserialize)]
pub struct FilterConfig {
    /// Drop samples generated by the metrics service itself. Default: true.
    #[serde(default = "default_true")]
    pub service_activity: bool,

    /// Name of the service project owning store-internal resources.
    /// Default: "metrics".
    #[serde(default = "default_service_project")]
    pub service_project: String,
}

/// Resource attribute cache configuration.
#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    /// Enable the attribute digest cache. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum cached resources. Default: 10000.
    #[serde(default = "default_cache_capacity")]
    pub capacity: u64,

    /// Entry lifetime. Default: 1h.
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

/// Sample ingest listener configuration.
#[derive(Debug, Deserialize)]
pub struct IngestConfig {
    /// Listen address. Default: ":8042".
    #[serde(default = "default_ingest_addr")]
    pub addr: String,

    /// Concurrent batch reconciliations. Default: 4.
    #[serde(default = "default_ingest_workers")]
    pub workers: usize,

    /// Maximum samples per batch. Default: 10000.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_resources_file() -> PathBuf {
    PathBuf::from("./resources.yaml")
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_connect_retries() -> u32 {
    10
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_identity_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

fn default_service_project() -> String {
    "metrics".to_string()
}

fn default_cache_capacity() -> u64 {
    10000
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_ingest_addr() -> String {
    ":8042".to_string()
}

fn default_ingest_workers() -> usize {
    4
}

fn default_max_batch() -> usize {
    10000
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            resources_file: default_resources_file(),
            store: StoreConfig::default(),
            identity: IdentityConfig::default(),
            filter: FilterConfig::default(),
            cache: CacheConfig::default(),
            ingest: IngestConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_store_timeout(),
            connect_retries: default_connect_retries(),
            retry_interval: default_retry_interval(),
            archive_policy: String::new(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_identity_timeout(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            service_activity: true,
            service_project: default_service_project(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_cache_capacity(),
            ttl: default_cache_ttl(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            addr: default_ingest_addr(),
            workers: default_ingest_workers(),
            max_batch: default_max_batch(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.store.endpoint.is_empty() {
            bail!("store.endpoint is required");
        }

        if self.resources_file.as_os_str().is_empty() {
            bail!("resources_file is required");
        }

        if self.store.timeout.is_zero() {
            bail!("store.timeout must be positive");
        }

        if self.store.connect_retries == 0 {
            bail!("store.connect_retries must be positive");
        }

        if self.store.retry_interval.is_zero() {
            bail!("store.retry_interval must be positive");
        }

        // The identity service is only contacted when filtering is on.
        if self.filter.service_activity {
            if self.identity.endpoint.is_empty() {
                bail!("identity.endpoint is required when filter.service_activity=true");
            }

            if self.identity.timeout.is_zero() {
                bail!("identity.timeout must be positive");
            }

            if self.filter.service_project.is_empty() {
                bail!("filter.service_project is required when filter.service_activity=true");
            }
        }

        if self.cache.enabled {
            if self.cache.capacity == 0 {
                bail!("cache.capacity must be positive when enabled");
            }

            if self.cache.ttl.is_zero() {
                bail!("cache.ttl must be positive when enabled");
            }
        }

        if self.ingest.workers == 0 {
            bail!("ingest.workers must be positive");
        }

        if self.ingest.max_batch == 0 {
            bail!("ingest.max_batch must be positive");
        }

        Ok(())
    }
}
