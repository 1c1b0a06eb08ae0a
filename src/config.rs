use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the nodeprof agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Globally unique label attached to every published snapshot.
    #[serde(default)]
    pub node_id: String,

    /// Drain loop configuration.
    #[serde(default)]
    pub drain: DrainConfig,

    /// Terminal diagnostics configuration.
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Snapshot export sink configuration.
    #[serde(default)]
    pub sinks: SinksConfig,

    /// Kernel probe configuration.
    #[serde(default)]
    pub probes: ProbesConfig,
}

/// Drain loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DrainConfig {
    /// Width of one bucket. Must be whole seconds. Default: 10s.
    #[serde(default = "default_bucket_interval", with = "humantime_serde")]
    pub bucket_interval: Duration,

    /// Time between drain ticks. Default: 10s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Number of newest buckets that are never read. Default: 1.
    #[serde(default = "default_trailing_buckets")]
    pub trailing_buckets: usize,

    /// What to do with a bucket whose record cannot be decoded. Default: delete.
    #[serde(default)]
    pub malformed_policy: MalformedPolicy,

    /// Consecutive publish failures before the sink is reported degraded. Default: 3.
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
}

/// Handling of buckets whose record fails to decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// Drop the bucket so it cannot block later drains.
    #[default]
    Delete,
    /// Leave the bucket in the table. It is reported again on every tick
    /// while it is the selected bucket, and pruned as stale once a newer
    /// bucket drains.
    Retain,
}

/// Terminal diagnostics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiagnosticsConfig {
    /// Print a table row per drained bucket to stdout. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Snapshot export sink configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SinksConfig {
    /// HTTP push export configuration.
    #[serde(default)]
    pub http: HttpSinkConfig,
}

/// HTTP push export configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSinkConfig {
    /// Enable the HTTP exporter. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// HTTP endpoint snapshots are POSTed to.
    #[serde(default)]
    pub address: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression algorithm (none, gzip). Default: none.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Request timeout. Default: 5s.
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Kernel probe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbesConfig {
    /// Name of the BPF hash map holding the buckets. Default: "timestamped_profile".
    #[serde(default = "default_map_name")]
    pub map_name: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bucket_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_trailing_buckets() -> usize {
    1
}

fn default_degraded_after() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_map_name() -> String {
    "timestamped_profile".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            node_id: String::new(),
            drain: DrainConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            health: HealthConfig::default(),
            sinks: SinksConfig::default(),
            probes: ProbesConfig::default(),
        }
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            bucket_interval: default_bucket_interval(),
            poll_interval: default_poll_interval(),
            trailing_buckets: default_trailing_buckets(),
            malformed_policy: MalformedPolicy::default(),
            degraded_after: default_degraded_after(),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
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

impl Default for HttpSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            headers: HashMap::new(),
            compression: default_compression(),
            timeout: default_http_timeout(),
        }
    }
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            map_name: default_map_name(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("decoding YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            bail!("node_id is required");
        }

        let drain = &self.drain;
        if drain.bucket_interval.is_zero() {
            bail!("drain.bucket_interval must be positive");
        }
        if drain.bucket_interval.subsec_nanos() != 0 {
            bail!(
                "drain.bucket_interval must be a whole number of seconds, got {:?}",
                drain.bucket_interval
            );
        }
        if drain.poll_interval.is_zero() {
            bail!("drain.poll_interval must be positive");
        }
        if drain.trailing_buckets == 0 {
            bail!("drain.trailing_buckets must be at least 1");
        }
        if drain.degraded_after == 0 {
            bail!("drain.degraded_after must be at least 1");
        }

        if self.probes.map_name.is_empty() {
            bail!("probes.map_name must not be empty");
        }

        // Validate HTTP export config if enabled.
        let http = &self.sinks.http;
        if http.enabled {
            if http.address.is_empty() {
                bail!("sinks.http.address is required when enabled");
            }
            if http.timeout.is_zero() {
                bail!("sinks.http.timeout must be positive when enabled");
            }

            match http.compression.as_str() {
                "none" | "gzip" => {}
                other => bail!("invalid compression type: {other}"),
            }
        }

        Ok(())
    }
}
