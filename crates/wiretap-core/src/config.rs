//! Configuration system for Wiretap
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation of protocol ports, timeouts and publisher settings

use crate::filter::FilterRule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize TOML: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete sensor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WiretapConfig {
    pub sensor: SensorSettings,
    pub capture: CaptureSettings,
    pub flows: FlowSettings,
    pub protocols: ProtocolSettings,
    pub correlation: CorrelationSettings,
    pub filter: FilterSettings,
    pub publish: PublishSettings,
}

impl WiretapConfig {
    /// Render as TOML
    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Sensor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// Number of flow workers
    pub workers: usize,

    /// Interval between metric summaries in the log (0 disables)
    pub stats_interval_secs: u64,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            workers: 4,
            stats_interval_secs: 30,
        }
    }
}

/// Capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Interface to sniff on
    pub interface: Option<String>,

    /// Capture file to replay instead of a live interface
    pub file: Option<String>,

    /// Maximum bytes captured per frame
    pub snaplen: i32,

    /// Put the interface in promiscuous mode
    pub promiscuous: bool,

    /// Read timeout for the live capture loop in milliseconds
    pub read_timeout_ms: i32,

    /// Explicit BPF filter; overrides the generated one
    pub bpf_filter: Option<String>,

    /// Generate a BPF filter from the enabled protocol ports
    pub auto_bpf: bool,

    /// Capacity of the queue between capture and the flow workers
    pub queue_size: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interface: None,
            file: None,
            snaplen: 65535,
            promiscuous: true,
            read_timeout_ms: 500,
            bpf_filter: None,
            auto_bpf: true,
            queue_size: 10_000,
        }
    }
}

/// Flow table settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    /// Idle timeout for TCP flows in milliseconds
    pub tcp_idle_timeout_ms: u64,

    /// Idle timeout for UDP flows in milliseconds
    pub udp_idle_timeout_ms: u64,

    /// How far ahead of the next expected sequence number a segment may land
    pub reorder_window_bytes: u32,

    /// Maximum number of tracked flows across all workers
    pub max_flows: usize,

    /// Capacity of each worker's inbound queue
    pub worker_queue_size: usize,

    /// How often workers scan for idle flows and correlation timeouts
    pub expire_interval_ms: u64,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            tcp_idle_timeout_ms: 60_000,
            udp_idle_timeout_ms: 10_000,
            reorder_window_bytes: 256 * 1024,
            max_flows: 65_536,
            worker_queue_size: 4_096,
            expire_interval_ms: 1_000,
        }
    }
}

impl FlowSettings {
    pub fn tcp_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_idle_timeout_ms)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_idle_timeout_ms)
    }
}

/// Per-protocol enablement and ports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    pub http: HttpSettings,
    pub thrift: ThriftSettings,
    pub tls: PortSettings,
    pub dns: PortSettings,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            http: HttpSettings::default(),
            thrift: ThriftSettings::default(),
            tls: PortSettings {
                enabled: true,
                ports: vec![443, 993, 995, 5223, 8443, 8883, 9243],
            },
            dns: PortSettings {
                enabled: true,
                ports: vec![53],
            },
        }
    }
}

impl ProtocolSettings {
    /// Enabled protocols and their ports, keyed by protocol name
    pub fn enabled_ports(&self) -> Vec<(&'static str, &[u16])> {
        let mut out = Vec::new();
        if self.http.enabled {
            out.push(("http", self.http.ports.as_slice()));
        }
        if self.thrift.enabled {
            out.push(("thrift", self.thrift.ports.as_slice()));
        }
        if self.tls.enabled {
            out.push(("tls", self.tls.ports.as_slice()));
        }
        if self.dns.enabled {
            out.push(("dns", self.dns.ports.as_slice()));
        }
        out
    }
}

/// Generic protocol enablement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    pub enabled: bool,
    pub ports: Vec<u16>,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ports: Vec::new(),
        }
    }
}

/// HTTP decoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub enabled: bool,
    pub ports: Vec<u16>,

    /// Extra header names (case-insensitive) copied into the transaction
    pub capture_headers: Vec<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ports: vec![80, 8000, 8080, 5000, 8002],
            capture_headers: Vec::new(),
        }
    }
}

/// Thrift transport framing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThriftTransport {
    /// Detect framing from the first message of each direction
    #[default]
    Auto,
    Framed,
    Unframed,
}

/// Thrift decoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThriftSettings {
    pub enabled: bool,
    pub ports: Vec<u16>,
    pub transport: ThriftTransport,

    /// Largest message accepted before the direction is declared corrupt
    pub max_message_bytes: usize,
}

impl Default for ThriftSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ports: vec![9090],
            transport: ThriftTransport::Auto,
            max_message_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Correlation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationSettings {
    /// Requests unanswered for this long are emitted as no-reply
    pub transaction_timeout_ms: u64,

    /// Maximum outstanding requests per flow
    pub max_pending: usize,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            transaction_timeout_ms: 10_000,
            max_pending: 1_000,
        }
    }
}

impl CorrelationSettings {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }
}

/// Filter settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// Only these protocols are published (empty = all)
    pub include_protocols: Vec<String>,

    /// These protocols are never published
    pub drop_protocols: Vec<String>,

    /// Field predicates, first match wins
    pub rules: Vec<FilterRule>,
}

/// What to do when the outbound queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued transaction
    #[default]
    DropOldest,
    /// Make producers wait for space
    Block,
}

/// What to do with a batch after retries are exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    #[default]
    Drop,
    Spool,
}

/// Publisher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishSettings {
    /// Maximum transactions per batch
    pub batch_size: usize,

    /// Maximum time a partial batch waits before being sent
    pub flush_interval_ms: u64,

    /// Capacity of the outbound queue
    pub queue_capacity: usize,

    pub overflow: OverflowPolicy,

    /// Retries per batch after the first attempt
    pub max_retries: u32,

    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,

    pub on_failure: FailureAction,

    /// Time allowed for the final flush on shutdown
    pub shutdown_timeout_ms: u64,

    pub elasticsearch: ElasticsearchSettings,

    pub jsonl: JsonlSettings,

    pub spool: SpoolSettings,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval_ms: 1_000,
            queue_capacity: 10_000,
            overflow: OverflowPolicy::DropOldest,
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            on_failure: FailureAction::Drop,
            shutdown_timeout_ms: 5_000,
            elasticsearch: ElasticsearchSettings::default(),
            jsonl: JsonlSettings::default(),
            spool: SpoolSettings::default(),
        }
    }
}

/// Elasticsearch bulk sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticsearchSettings {
    pub enabled: bool,

    /// Base URL of the cluster
    pub url: String,

    /// Index (or data stream) to write to
    pub index: String,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Encoded API key (sent as `Authorization: ApiKey ...`)
    pub api_key: Option<String>,

    pub timeout_secs: u64,

    pub compression: bool,

    /// Custom headers
    pub headers: HashMap<String, String>,
}

impl Default for ElasticsearchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:9200".to_string(),
            index: "wiretap".to_string(),
            username: None,
            password: None,
            api_key: None,
            timeout_secs: 30,
            compression: true,
            headers: HashMap::new(),
        }
    }
}

/// JSONL file sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlSettings {
    pub enabled: bool,
    pub path: String,
    pub append: bool,
    pub flush_each: bool,
}

impl Default for JsonlSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/var/lib/wiretap/transactions.jsonl".to_string(),
            append: true,
            flush_each: false,
        }
    }
}

/// Local spool for batches that could not be delivered
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolSettings {
    /// SQLite database path
    pub path: String,

    /// Maximum transactions kept in the spool
    pub max_events: usize,
}

impl Default for SpoolSettings {
    fn default() -> Self {
        Self {
            path: "/var/lib/wiretap/spool.db".to_string(),
            max_events: 100_000,
        }
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. WIRETAP_CONFIG environment variable
    /// 3. ~/.config/wiretap/config.toml
    /// 4. /etc/wiretap/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<WiretapConfig> {
        let config_path = self.find_config_file()?;

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            Self::load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            WiretapConfig::default()
        };

        self.apply_env_overrides(&mut config);
        Self::validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use. A path named explicitly, by flag or by
    /// `WIRETAP_CONFIG`, must exist.
    fn find_config_file(&self) -> ConfigResult<Option<PathBuf>> {
        let explicit = self.cli_path.clone().or_else(|| {
            std::env::var("WIRETAP_CONFIG")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        });
        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(ConfigError::NotFound(path));
            }
            return Ok(Some(path));
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("wiretap").join("config.toml");
            if path.exists() {
                return Ok(Some(path));
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/wiretap/config.toml");
            if path.exists() {
                return Ok(Some(path));
            }
        }

        Ok(None)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> ConfigResult<WiretapConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: WiretapConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut WiretapConfig) {
        if let Ok(val) = std::env::var("WIRETAP_LOG_LEVEL") {
            config.sensor.log_level = val;
        }
        if let Ok(val) = std::env::var("WIRETAP_WORKERS") {
            if let Ok(workers) = val.parse() {
                config.sensor.workers = workers;
            }
        }

        if let Ok(val) = std::env::var("WIRETAP_INTERFACE") {
            config.capture.interface = Some(val);
        }
        if let Ok(val) = std::env::var("WIRETAP_BPF_FILTER") {
            config.capture.bpf_filter = Some(val);
        }

        if let Ok(val) = std::env::var("WIRETAP_ES_URL") {
            config.publish.elasticsearch.url = val;
            config.publish.elasticsearch.enabled = true;
            config.publish.jsonl.enabled = false;
        }
        if let Ok(val) = std::env::var("WIRETAP_ES_INDEX") {
            config.publish.elasticsearch.index = val;
        }
        if let Ok(val) = std::env::var("WIRETAP_ES_API_KEY") {
            config.publish.elasticsearch.api_key = Some(val);
        }

        if let Ok(val) = std::env::var("WIRETAP_JSONL_PATH") {
            config.publish.jsonl.path = val;
        }
        if let Ok(val) = std::env::var("WIRETAP_JSONL_ENABLED") {
            config.publish.jsonl.enabled = val.parse().unwrap_or(config.publish.jsonl.enabled);
        }
    }

    /// Validate configuration
    pub fn validate(config: &WiretapConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.sensor.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.sensor.log_level, valid_levels
            )));
        }

        if config.sensor.workers == 0 {
            return Err(ConfigError::ValidationError(
                "sensor.workers must be at least 1".to_string(),
            ));
        }

        if config.capture.interface.is_some() && config.capture.file.is_some() {
            return Err(ConfigError::ValidationError(
                "capture.interface and capture.file are mutually exclusive".to_string(),
            ));
        }

        if config.flows.tcp_idle_timeout_ms == 0 || config.flows.udp_idle_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Flow idle timeouts must be greater than 0".to_string(),
            ));
        }
        if config.flows.max_flows == 0 {
            return Err(ConfigError::ValidationError(
                "flows.max_flows must be greater than 0".to_string(),
            ));
        }

        // A port may only be claimed by one decoder
        let mut owners: HashMap<u16, &str> = HashMap::new();
        for (protocol, ports) in config.protocols.enabled_ports() {
            for port in ports {
                if let Some(previous) = owners.insert(*port, protocol) {
                    return Err(ConfigError::ValidationError(format!(
                        "Port {} is assigned to both {} and {}",
                        port, previous, protocol
                    )));
                }
            }
        }

        if config.correlation.transaction_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "correlation.transaction_timeout_ms must be greater than 0".to_string(),
            ));
        }

        let publish = &config.publish;
        if publish.batch_size == 0 || publish.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "publish.batch_size and publish.queue_capacity must be greater than 0"
                    .to_string(),
            ));
        }
        if publish.initial_backoff_ms > publish.max_backoff_ms {
            return Err(ConfigError::ValidationError(
                "publish.initial_backoff_ms cannot exceed publish.max_backoff_ms".to_string(),
            ));
        }
        if publish.elasticsearch.enabled && publish.jsonl.enabled {
            return Err(ConfigError::ValidationError(
                "Only one publish sink may be enabled (elasticsearch or jsonl)".to_string(),
            ));
        }
        if publish.elasticsearch.enabled && publish.elasticsearch.index.is_empty() {
            return Err(ConfigError::ValidationError(
                "publish.elasticsearch.index cannot be empty".to_string(),
            ));
        }

        for rule in &config.filter.rules {
            rule.validate().map_err(ConfigError::ValidationError)?;
        }

        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("wiretap").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }

        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            None
        }
    }
}
