//! Configuration validation utilities.

use std::time::Duration;

use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Expand environment variables in a string.
/// Supports ${VAR} and ${VAR:-default} syntax.
///
/// Metric keys are expanded with this before scheduling; the configured
/// form is kept as the metric's original key.
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

    let regex = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("failed to compile env var regex")
    });

    regex
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .into_owned()
}

/// Require a duration to be a whole, positive number of seconds.
pub(crate) fn whole_seconds(value: Duration, what: &str) -> Result<u32, ConfigError> {
    if value.subsec_nanos() != 0 {
        return Err(ConfigError::invalid(format!(
            "{what} must be a whole number of seconds, got {}",
            humantime::format_duration(value)
        )));
    }
    let secs = value.as_secs();
    if secs == 0 {
        return Err(ConfigError::invalid(format!("{what} must be at least 1s")));
    }
    u32::try_from(secs).map_err(|_| ConfigError::invalid(format!("{what} is too large")))
}

/// Validate a `host:port` address without resolving it.
pub(crate) fn validate_address(address: &str) -> Result<(), String> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| format!("'{address}' is missing a port"))?;
    if host.is_empty() || host == "[]" {
        return Err(format!("'{address}' is missing a host"));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("'{address}' has an invalid port")),
        Ok(_) => Ok(()),
    }
}
