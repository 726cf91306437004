//! Active metric definitions and scheduling state.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::active::MetricKey;
use crate::config::{ConfigError, expand_env_vars, whole_seconds};

/// Default refresh interval (60 seconds).
const DEFAULT_REFRESH: Duration = Duration::from_secs(60);

fn default_enabled() -> bool {
    true
}

fn default_refresh() -> Duration {
    DEFAULT_REFRESH
}

/// Whether a metric takes part in scheduling.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MetricStatus {
    /// Checked on every refresh.
    Enabled,
    /// Kept in the registry but never due.
    Disabled,
}

impl From<bool> for MetricStatus {
    fn from(enabled: bool) -> Self {
        if enabled { Self::Enabled } else { Self::Disabled }
    }
}

/// Configured active check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Check key as configured; may contain `${VAR}` macros.
    pub key: String,
    /// Refresh interval, whole seconds (default: 60s).
    #[serde(default = "default_refresh", with = "humantime_serde")]
    pub refresh: Duration,
    /// Enable this check (default: true).
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// A [`MetricSpec`] that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSpec {
    /// Key after macro expansion.
    pub key: MetricKey,
    /// Key as configured.
    pub key_orig: String,
    /// Refresh interval in seconds.
    pub refresh: u32,
    /// Initial status.
    pub status: MetricStatus,
}

impl MetricSpec {
    /// Create an enabled metric definition.
    pub fn new(key: impl Into<String>, refresh: Duration) -> Self {
        Self {
            key: key.into(),
            refresh,
            enabled: true,
        }
    }

    /// Set enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Expand macros, parse the key and check the refresh interval.
    pub fn validate(&self) -> Result<ValidatedSpec, ConfigError> {
        let expanded = expand_env_vars(&self.key);
        let key = MetricKey::parse(&expanded)
            .map_err(|e| ConfigError::invalid(format!("metric '{}': {}", self.key, e)))?;
        let refresh = whole_seconds(self.refresh, &format!("metric '{}' refresh", self.key))?;

        Ok(ValidatedSpec {
            key,
            key_orig: self.key.clone(),
            refresh,
            status: MetricStatus::from(self.enabled),
        })
    }
}

/// One monitored check with its scheduling state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMetric {
    /// Canonical key (macros expanded).
    pub key: MetricKey,
    /// Key as configured.
    pub key_orig: String,
    /// Refresh interval in seconds, at least 1.
    pub refresh: u32,
    /// Epoch second at which the metric is next due.
    pub next_check: i64,
    /// Scheduling status.
    pub status: MetricStatus,
    /// Consumed offset of a log-like source.
    pub last_log_size: u64,
}

impl ActiveMetric {
    /// Create a metric that is due at `now`.
    pub fn new(spec: ValidatedSpec, now: i64) -> Self {
        Self {
            key: spec.key,
            key_orig: spec.key_orig,
            refresh: spec.refresh,
            next_check: now,
            status: spec.status,
            last_log_size: 0,
        }
    }

    /// Whether the metric should run at `now`.
    pub fn is_due(&self, now: i64) -> bool {
        self.status == MetricStatus::Enabled && self.next_check <= now
    }
}
