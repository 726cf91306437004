//! Connector forwarding configuration.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::validation::{ConfigError, validate_address};

/// Default number of connector workers.
pub const DEFAULT_WORKERS: usize = 1;

/// Default worker-count re-evaluation interval (5 seconds).
pub const DEFAULT_EVALUATE_INTERVAL: Duration = Duration::from_secs(5);

/// Default connect/send timeout for connector endpoints (5 seconds).
pub const DEFAULT_CONNECTOR_TIMEOUT: Duration = Duration::from_secs(5);

/// Default largest serialized item accepted by a connector (64 KiB).
pub const DEFAULT_MAX_ITEM_BYTES: usize = 64 * 1024;

/// Default per-endpoint queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Default items per connector send.
pub const DEFAULT_BATCH_SIZE: usize = 100;

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_evaluate_interval() -> Duration {
    DEFAULT_EVALUATE_INTERVAL
}

fn default_timeout() -> Duration {
    DEFAULT_CONNECTOR_TIMEOUT
}

fn default_backoff_initial() -> Duration {
    super::app::DEFAULT_BACKOFF_INITIAL
}

fn default_backoff_max() -> Duration {
    super::app::DEFAULT_BACKOFF_MAX
}

fn default_max_item_bytes() -> usize {
    DEFAULT_MAX_ITEM_BYTES
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_max_senders() -> usize {
    1
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// TLS material for connector connections.
///
/// Paths are handed to the transport unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// CA bundle (PEM) used to verify endpoints.
    pub ca: PathBuf,
    /// Client certificate chain (PEM).
    #[serde(default)]
    pub cert: Option<PathBuf>,
    /// Client private key (PEM).
    #[serde(default)]
    pub key: Option<PathBuf>,
    /// Name to verify instead of the endpoint host.
    #[serde(default)]
    pub server_name: Option<String>,
}

/// One connector destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Unique endpoint name.
    pub name: String,
    /// Destination address (`host:port`).
    pub address: String,
    /// Regex on item keys; items matching no endpoint are dropped.
    #[serde(default)]
    pub key_filter: Option<String>,
    /// Queue capacity for this endpoint (default: 1000).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Workers allowed to send to this endpoint at once (default: 1).
    #[serde(default = "default_max_senders")]
    pub max_senders: usize,
    /// Items per send (default: 100).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl EndpointConfig {
    /// Create an endpoint configuration with defaults.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            key_filter: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_senders: 1,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set the key filter.
    pub fn with_key_filter(mut self, filter: impl Into<String>) -> Self {
        self.key_filter = Some(filter.into());
        self
    }

    /// Set the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }
}

/// Connector worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorsConfig {
    /// Desired number of workers (default: 1).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How often the worker count is re-evaluated (default: 5s).
    #[serde(default = "default_evaluate_interval", with = "humantime_serde")]
    pub evaluate_interval: Duration,

    /// Connect and send timeout (default: 5s).
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// First reconnect delay (default: 1s).
    #[serde(default = "default_backoff_initial", with = "humantime_serde")]
    pub backoff_initial: Duration,

    /// Reconnect delay cap (default: 60s).
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,

    /// Largest serialized item; bigger items are dropped (default: 64 KiB).
    #[serde(default = "default_max_item_bytes")]
    pub max_item_bytes: usize,

    /// TLS material; plain TCP when absent.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Destinations.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for ConnectorsConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            evaluate_interval: DEFAULT_EVALUATE_INTERVAL,
            timeout: DEFAULT_CONNECTOR_TIMEOUT,
            backoff_initial: default_backoff_initial(),
            backoff_max: default_backoff_max(),
            max_item_bytes: DEFAULT_MAX_ITEM_BYTES,
            tls: None,
            endpoints: Vec::new(),
        }
    }
}

impl ConnectorsConfig {
    /// Validate connector settings and endpoints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.evaluate_interval.is_zero() {
            return Err(ConfigError::invalid(
                "connectors evaluate_interval must be positive",
            ));
        }

        if self.backoff_initial > self.backoff_max {
            return Err(ConfigError::invalid(
                "connectors backoff_initial cannot exceed backoff_max",
            ));
        }

        if self.max_item_bytes == 0 {
            return Err(ConfigError::invalid(
                "connectors max_item_bytes must be positive",
            ));
        }

        if let Some(tls) = &self.tls
            && tls.cert.is_some() != tls.key.is_some()
        {
            return Err(ConfigError::invalid(
                "connectors tls cert and key must be set together",
            ));
        }

        let mut seen_names = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.is_empty() {
                return Err(ConfigError::invalid("connector endpoint name cannot be empty"));
            }
            if !seen_names.insert(&endpoint.name) {
                return Err(ConfigError::invalid(format!(
                    "duplicate connector endpoint name: '{}'",
                    endpoint.name
                )));
            }
            validate_address(&endpoint.address).map_err(|e| {
                ConfigError::invalid(format!("connector endpoint '{}': {}", endpoint.name, e))
            })?;
            if endpoint.queue_capacity == 0 || endpoint.max_senders == 0 || endpoint.batch_size == 0
            {
                return Err(ConfigError::invalid(format!(
                    "connector endpoint '{}': queue_capacity, max_senders and batch_size must be positive",
                    endpoint.name
                )));
            }
            if let Some(filter) = &endpoint.key_filter {
                regex::Regex::new(filter).map_err(|e| {
                    ConfigError::invalid(format!(
                        "connector endpoint '{}': invalid key_filter: {}",
                        endpoint.name, e
                    ))
                })?;
            }
        }

        Ok(())
    }
}
