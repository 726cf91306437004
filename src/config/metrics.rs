//! Active check configuration files.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::active::MetricSpec;

use super::validation::ConfigError;

/// A set of active check definitions, as found in `metric_path` files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Active checks.
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
}

impl MetricsConfig {
    /// Merge another MetricsConfig into this one.
    #[must_use]
    pub fn merge(mut self, other: MetricsConfig) -> Self {
        self.metrics.extend(other.metrics);
        self
    }

    /// Validate all metric definitions in this set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::validate_specs(&self.metrics)
    }

    /// Validate a list of metric definitions.
    ///
    /// Each key must parse after macro expansion, refresh must be a whole
    /// number of seconds, and expanded keys must be unique.
    pub fn validate_specs(specs: &[MetricSpec]) -> Result<(), ConfigError> {
        let mut seen_keys = HashSet::new();

        for spec in specs {
            let validated = spec.validate()?;
            if !seen_keys.insert(validated.key.to_string()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate metric key: '{}'",
                    validated.key
                )));
            }
        }

        Ok(())
    }

    /// Load metric definitions from all YAML files in a directory.
    ///
    /// Files are read in path order so the resulting registry order is stable.
    pub fn load_from_dir(dir_path: &str) -> Result<Self, ConfigError> {
        let dir = Path::new(dir_path);
        if !dir.exists() {
            return Err(ConfigError::invalid(format!(
                "metric_path '{}' does not exist",
                dir_path
            )));
        }
        if !dir.is_dir() {
            return Err(ConfigError::invalid(format!(
                "metric_path '{}' is not a directory",
                dir_path
            )));
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if ext == "yaml" || ext == "yml" {
                paths.push(path);
            }
        }
        paths.sort();

        let mut merged = Self::default();
        for path in paths {
            tracing::debug!("Loading metric config from: {}", path.display());
            let content = std::fs::read_to_string(&path)?;
            let file_config: Self = serde_yaml::from_str(&content).map_err(|e| {
                ConfigError::invalid(format!("failed to parse '{}': {}", path.display(), e))
            })?;

            merged = merged.merge(file_config);
        }

        Ok(merged)
    }
}
