//! Configuration module for the Argus agent.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Agent settings (hostname, buffer, send thresholds, rate limits)
//! - Monitoring server addresses and retry policy
//! - Connector endpoints, TLS material and worker pool size
//! - Active check definitions and the metric include directory

mod app;
mod connector;
mod metrics;
mod validation;

pub use app::{AgentConfig, AppConfig, ForwardMode, ServerConfig};
pub use connector::{ConnectorsConfig, EndpointConfig, TlsConfig};
pub use metrics::MetricsConfig;
pub use validation::{ConfigError, expand_env_vars};
pub(crate) use validation::whole_seconds;

// Re-export constants
pub use app::{
    DEFAULT_BUFFER_SEND, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_LINES_PER_SECOND, MAX_LINES_PER_SECOND,
    MIN_LINES_PER_SECOND,
};
