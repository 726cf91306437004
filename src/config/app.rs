//! Application configuration structures.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::active::MetricSpec;

use super::connector::ConnectorsConfig;
use super::metrics::MetricsConfig;
use super::validation::{ConfigError, validate_address};

// =============================================================================
// Constants
// =============================================================================

/// Default result buffer capacity (items).
pub const DEFAULT_BUFFER_SIZE: usize = 100;

/// Default maximum time between sends while data is pending (5 seconds).
pub const DEFAULT_BUFFER_SEND: Duration = Duration::from_secs(5);

/// Default maximum number of items per send.
pub const DEFAULT_MAX_BATCH: usize = 250;

/// Default lines per second for log-like checks.
pub const DEFAULT_MAX_LINES_PER_SECOND: u32 = 20;

/// Lower bound for lines per second.
pub const MIN_LINES_PER_SECOND: u32 = 1;

/// Upper bound for lines per second.
pub const MAX_LINES_PER_SECOND: u32 = 1000;

/// Default timeout for a single fetch (3 seconds).
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Default grace period for shutdown (5 seconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default monitoring server address.
pub const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:10051";

/// Default server I/O timeout (3 seconds).
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(3);

/// Default first retry delay after a failed send (1 second).
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Default retry delay cap (60 seconds).
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

fn default_hostname() -> String {
    "argus-agent".to_string()
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_buffer_send() -> Duration {
    DEFAULT_BUFFER_SEND
}

fn default_max_batch() -> usize {
    DEFAULT_MAX_BATCH
}

fn default_max_lines() -> u32 {
    DEFAULT_MAX_LINES_PER_SECOND
}

fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

fn default_shutdown_timeout() -> Duration {
    DEFAULT_SHUTDOWN_TIMEOUT
}

fn default_server_addresses() -> Vec<String> {
    vec![DEFAULT_SERVER_ADDRESS.to_string()]
}

fn default_server_timeout() -> Duration {
    DEFAULT_SERVER_TIMEOUT
}

fn default_backoff_initial() -> Duration {
    DEFAULT_BACKOFF_INITIAL
}

fn default_backoff_max() -> Duration {
    DEFAULT_BACKOFF_MAX
}

// =============================================================================
// Agent Configuration
// =============================================================================

/// Where buffered items are forwarded.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ForwardMode {
    /// Send batches to the monitoring server.
    #[default]
    Server,
    /// Route items to connector endpoints via the worker pool.
    Connectors,
}

/// Agent-side collection and buffering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Host name reported with every item.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Result buffer capacity (default: 100).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Maximum time pending items wait before a send (default: 5s).
    #[serde(default = "default_buffer_send", with = "humantime_serde")]
    pub buffer_send: Duration,

    /// Buffer fill level that triggers an immediate send (default: half the buffer).
    #[serde(default)]
    pub send_threshold: Option<usize>,

    /// Maximum items drained per send (default: 250).
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Lines per second for log-like checks, 1..=1000 (default: 20).
    #[serde(default = "default_max_lines")]
    pub max_lines_per_second: u32,

    /// Source address for outbound connections.
    #[serde(default)]
    pub source_ip: Option<IpAddr>,

    /// Upper bound for one fetch (default: 3s).
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// Grace period for in-flight work on shutdown (default: 5s).
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Forwarding target for buffered items (default: server).
    #[serde(default)]
    pub forward: ForwardMode,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_send: DEFAULT_BUFFER_SEND,
            send_threshold: None,
            max_batch: DEFAULT_MAX_BATCH,
            max_lines_per_second: DEFAULT_MAX_LINES_PER_SECOND,
            source_ip: None,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            forward: ForwardMode::default(),
        }
    }
}

impl AgentConfig {
    /// Effective send threshold.
    pub fn effective_send_threshold(&self) -> usize {
        self.send_threshold
            .unwrap_or(self.buffer_size / 2)
            .clamp(1, self.buffer_size.max(1))
    }
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Monitoring server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server addresses (`host:port`), tried in order with failover.
    #[serde(default = "default_server_addresses")]
    pub addresses: Vec<String>,

    /// Connect/send/receive timeout (default: 3s).
    #[serde(default = "default_server_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// First retry delay after a failed send (default: 1s).
    #[serde(default = "default_backoff_initial", with = "humantime_serde")]
    pub backoff_initial: Duration,

    /// Retry delay cap (default: 60s).
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addresses: default_server_addresses(),
            timeout: DEFAULT_SERVER_TIMEOUT,
            backoff_initial: DEFAULT_BACKOFF_INITIAL,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Agent configuration.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Monitoring server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Connector forwarding configuration.
    #[serde(default)]
    pub connectors: ConnectorsConfig,

    /// Active checks.
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,

    /// Path to a directory with additional metric config files.
    #[serde(default)]
    pub metric_path: Option<String>,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration including the `metric_path` directory.
    ///
    /// If `metric_path` is specified, scans the directory for YAML files
    /// and appends their metric definitions.
    pub fn load_with_metric_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Self = serde_yaml::from_str(&content)?;

        if let Some(ref metric_dir) = config.metric_path {
            let additional = MetricsConfig::load_from_dir(metric_dir)?;
            config.metrics.extend(additional.metrics);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let agent = &self.agent;

        if agent.hostname.trim().is_empty() {
            return Err(ConfigError::invalid("agent hostname cannot be empty"));
        }

        if agent.buffer_size == 0 {
            return Err(ConfigError::invalid("agent buffer_size must be positive"));
        }

        if agent.max_batch == 0 {
            return Err(ConfigError::invalid("agent max_batch must be positive"));
        }

        if let Some(threshold) = agent.send_threshold
            && (threshold == 0 || threshold > agent.buffer_size)
        {
            return Err(ConfigError::invalid(format!(
                "agent send_threshold must be between 1 and buffer_size ({}), got {}",
                agent.buffer_size, threshold
            )));
        }

        if !(MIN_LINES_PER_SECOND..=MAX_LINES_PER_SECOND).contains(&agent.max_lines_per_second) {
            return Err(ConfigError::invalid(format!(
                "agent max_lines_per_second must be between {} and {}, got {}",
                MIN_LINES_PER_SECOND, MAX_LINES_PER_SECOND, agent.max_lines_per_second
            )));
        }

        if agent.buffer_send.is_zero() {
            return Err(ConfigError::invalid("agent buffer_send must be positive"));
        }

        if agent.fetch_timeout.is_zero() {
            return Err(ConfigError::invalid("agent fetch_timeout must be positive"));
        }

        if self.server.backoff_initial > self.server.backoff_max {
            return Err(ConfigError::invalid(
                "server backoff_initial cannot exceed backoff_max",
            ));
        }

        for address in &self.server.addresses {
            validate_address(address)
                .map_err(|e| ConfigError::invalid(format!("server address: {e}")))?;
        }

        match agent.forward {
            ForwardMode::Server if self.server.addresses.is_empty() => {
                return Err(ConfigError::invalid(
                    "forward mode 'server' requires at least one server address",
                ));
            }
            ForwardMode::Connectors if self.connectors.endpoints.is_empty() => {
                return Err(ConfigError::invalid(
                    "forward mode 'connectors' requires at least one connector endpoint",
                ));
            }
            _ => {}
        }

        self.connectors.validate()?;

        MetricsConfig::validate_specs(&self.metrics)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;

    fn valid_config() -> AppConfig {
        AppConfig {
            metrics: vec![MetricSpec::new("agent.ping", Duration::from_secs(30))],
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_agent_config_default() {
        let config = AgentConfig::default();
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.buffer_send, DEFAULT_BUFFER_SEND);
        assert_eq!(config.max_lines_per_second, DEFAULT_MAX_LINES_PER_SECOND);
        assert_eq!(config.forward, ForwardMode::Server);
        assert_eq!(config.effective_send_threshold(), 50);
    }

    #[test]
    fn test_effective_send_threshold_small_buffer() {
        let config = AgentConfig {
            buffer_size: 1,
            ..AgentConfig::default()
        };
        assert_eq!(config.effective_send_threshold(), 1);
    }

    #[test]
    fn test_config_validation_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_config_validation_max_lines_out_of_range() {
        for lines in [0, 1001] {
            let mut config = valid_config();
            config.agent.max_lines_per_second = lines;
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("max_lines_per_second"));
        }
    }

    #[test]
    fn test_config_validation_zero_buffer() {
        let mut config = valid_config();
        config.agent.buffer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_send_threshold_above_buffer() {
        let mut config = valid_config();
        config.agent.send_threshold = Some(config.agent.buffer_size + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_server_address() {
        let mut config = valid_config();
        config.server.addresses = vec!["no-port".to_string()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("server address"));
    }

    #[test]
    fn test_config_validation_connector_mode_requires_endpoints() {
        let mut config = valid_config();
        config.agent.forward = ForwardMode::Connectors;
        assert!(config.validate().is_err());

        config.connectors.endpoints = vec![EndpointConfig::new("archive", "127.0.0.1:9000")];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_fractional_refresh() {
        let mut config = valid_config();
        config.metrics = vec![MetricSpec::new("agent.ping", Duration::from_millis(500))];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        std::fs::write(
            &path,
            r#"
agent:
  hostname: web-01
  buffer_size: 10
  buffer_send: 2s
  max_lines_per_second: 100
server:
  addresses: ["10.0.0.1:10051", "10.0.0.2:10051"]
metrics:
  - key: agent.ping
    refresh: 10s
  - key: log[/var/log/syslog,error]
    refresh: 1s
    enabled: false
"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.agent.hostname, "web-01");
        assert_eq!(config.agent.buffer_size, 10);
        assert_eq!(config.agent.buffer_send, Duration::from_secs(2));
        assert_eq!(config.server.addresses.len(), 2);
        assert_eq!(config.metrics.len(), 2);
        assert!(!config.metrics[1].enabled);
    }

    #[test]
    fn test_duration_fields_use_humantime_syntax() {
        let config: AppConfig = serde_yaml::from_str(
            r#"
agent:
  buffer_send: 250ms
  shutdown_timeout: 1m30s
server:
  backoff_max: 1h
connectors:
  evaluate_interval: 2m
metrics:
  - key: agent.ping
    refresh: 1h30m
"#,
        )
        .unwrap();

        assert_eq!(config.agent.buffer_send, Duration::from_millis(250));
        assert_eq!(config.agent.shutdown_timeout, Duration::from_secs(90));
        assert_eq!(config.server.backoff_max, Duration::from_secs(3600));
        assert_eq!(config.connectors.evaluate_interval, Duration::from_secs(120));
        assert_eq!(config.metrics[0].refresh, Duration::from_secs(5400));

        assert!(serde_yaml::from_str::<AppConfig>("agent:\n  buffer_send: 30x\n").is_err());
        assert!(serde_yaml::from_str::<AppConfig>("agent:\n  buffer_send: 30\n").is_err());
    }

    #[test]
    fn test_load_with_metric_path() {
        let dir = tempfile::tempdir().unwrap();
        let include = dir.path().join("metrics.d");
        std::fs::create_dir(&include).unwrap();
        std::fs::write(
            include.join("extra.yaml"),
            "metrics:\n  - key: agent.version\n    refresh: 1m\n",
        )
        .unwrap();

        let path = dir.path().join("agent.yaml");
        std::fs::write(
            &path,
            format!(
                "metric_path: {}\nmetrics:\n  - key: agent.ping\n    refresh: 5s\n",
                include.display()
            ),
        )
        .unwrap();

        let config = AppConfig::load_with_metric_path(&path).unwrap();
        let keys: Vec<_> = config.metrics.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["agent.ping", "agent.version"]);
    }
}
