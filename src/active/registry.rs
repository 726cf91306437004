//! Metric registry holding scheduling state for active checks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::active::{ActiveMetric, MetricKey, MetricSpec, ValidatedSpec};
use crate::config::ConfigError;

/// Registry shared between the scheduler loop and the reload path.
pub type SharedRegistry = Arc<RwLock<MetricRegistry>>;

/// Snapshot of a metric selected for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueMetric {
    /// Canonical key.
    pub key: MetricKey,
    /// Offset to resume from.
    pub last_log_size: u64,
    /// Refresh interval in seconds.
    pub refresh: u32,
}

/// Set of configured active metrics keyed by canonical key.
///
/// A reload replaces the whole set in one step. State (next check and log
/// offset) survives a reload for every key present in both the old and the
/// new set.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    metrics: Vec<ActiveMetric>,
    index: HashMap<String, usize>,
    generation: u64,
}

impl MetricRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the registry for sharing.
    pub fn shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    /// Replace the active set.
    ///
    /// The whole set is validated before anything changes; on error the
    /// previous set remains active.
    pub fn load(&mut self, specs: &[MetricSpec], now: i64) -> Result<(), ConfigError> {
        let validated = specs
            .iter()
            .map(MetricSpec::validate)
            .collect::<Result<Vec<ValidatedSpec>, _>>()?;

        let mut metrics = Vec::with_capacity(validated.len());
        let mut index = HashMap::with_capacity(validated.len());

        for spec in validated {
            let key = spec.key.as_str().to_string();
            if index.contains_key(&key) {
                return Err(ConfigError::invalid(format!("duplicate metric key: '{key}'")));
            }

            let metric = match self.get(&key) {
                Some(previous) => ActiveMetric {
                    key: spec.key,
                    key_orig: spec.key_orig,
                    refresh: spec.refresh,
                    next_check: previous.next_check,
                    status: spec.status,
                    last_log_size: previous.last_log_size,
                },
                None => ActiveMetric::new(spec, now),
            };

            index.insert(key, metrics.len());
            metrics.push(metric);
        }

        let removed = self
            .metrics
            .iter()
            .filter(|m| !index.contains_key(m.key.as_str()))
            .count();

        self.metrics = metrics;
        self.index = index;
        self.generation += 1;

        tracing::info!(
            generation = self.generation,
            metrics = self.metrics.len(),
            removed,
            "Metric registry loaded"
        );
        Ok(())
    }

    /// Enabled metrics due at `now`, earliest next check first.
    ///
    /// Metrics with the same next check keep registry order.
    pub fn list_due(&self, now: i64) -> Vec<DueMetric> {
        let mut due: Vec<&ActiveMetric> = self.metrics.iter().filter(|m| m.is_due(now)).collect();
        due.sort_by_key(|m| m.next_check);

        due.into_iter()
            .map(|m| DueMetric {
                key: m.key.clone(),
                last_log_size: m.last_log_size,
                refresh: m.refresh,
            })
            .collect()
    }

    /// Record an execution at `now`.
    ///
    /// Returns `false` when the key is no longer configured.
    pub fn mark_checked(&mut self, key: &str, now: i64, last_log_size: u64) -> bool {
        let Some(&pos) = self.index.get(key) else {
            tracing::debug!(key, "Metric removed before it was marked checked");
            return false;
        };

        let metric = &mut self.metrics[pos];
        metric.next_check = now + i64::from(metric.refresh);
        metric.last_log_size = last_log_size;
        true
    }

    /// Look up a metric by canonical key.
    pub fn get(&self, key: &str) -> Option<&ActiveMetric> {
        self.index.get(key).map(|&pos| &self.metrics[pos])
    }

    /// Metrics in registry order.
    pub fn metrics(&self) -> &[ActiveMetric] {
        &self.metrics
    }

    /// Number of configured metrics.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Whether no metric is configured.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Incremented on every successful load.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Smallest refresh interval among enabled metrics.
    pub fn min_refresh(&self) -> Option<u32> {
        self.metrics
            .iter()
            .filter(|m| m.status == crate::active::MetricStatus::Enabled)
            .map(|m| m.refresh)
            .min()
    }

    /// Earliest next check among enabled metrics.
    pub fn next_due(&self) -> Option<i64> {
        self.metrics
            .iter()
            .filter(|m| m.status == crate::active::MetricStatus::Enabled)
            .map(|m| m.next_check)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(key: &str, refresh: u64) -> MetricSpec {
        MetricSpec::new(key, Duration::from_secs(refresh))
    }

    #[test]
    fn test_load_initializes_next_check() {
        let mut registry = MetricRegistry::new();
        registry
            .load(&[spec("agent.ping", 5), spec("agent.version", 60)], 100)
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.generation(), 1);
        assert!(registry.metrics().iter().all(|m| m.next_check == 100));
    }

    #[test]
    fn test_list_due_orders_by_next_check() {
        let mut registry = MetricRegistry::new();
        registry
            .load(&[spec("a", 10), spec("b", 2), spec("c", 3)], 100)
            .unwrap();
        registry.mark_checked("a", 100, 0);
        registry.mark_checked("b", 99, 0);

        // a: 110, b: 101, c: 100
        let due: Vec<_> = registry
            .list_due(105)
            .into_iter()
            .map(|d| d.key.to_string())
            .collect();
        assert_eq!(due, vec!["c", "b"]);
    }

    #[test]
    fn test_list_due_keeps_registry_order_on_ties() {
        let mut registry = MetricRegistry::new();
        registry
            .load(&[spec("z", 1), spec("a", 1), spec("m", 1)], 50)
            .unwrap();

        let due: Vec<_> = registry
            .list_due(50)
            .into_iter()
            .map(|d| d.key.to_string())
            .collect();
        assert_eq!(due, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_list_due_skips_disabled() {
        let mut registry = MetricRegistry::new();
        registry
            .load(&[spec("a", 1), spec("b", 1).with_enabled(false)], 0)
            .unwrap();

        let due = registry.list_due(10);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key.as_str(), "a");
    }

    #[test]
    fn test_mark_checked_does_not_drift() {
        let mut registry = MetricRegistry::new();
        registry.load(&[spec("ping", 5)], 100).unwrap();

        let mut now = 100;
        for _ in 0..10 {
            assert_eq!(registry.list_due(now).len(), 1);
            registry.mark_checked("ping", now, 0);
            assert_eq!(registry.get("ping").unwrap().next_check, now + 5);
            now += 5;
        }
    }

    #[test]
    fn test_reload_preserves_state_by_key() {
        let mut registry = MetricRegistry::new();
        registry
            .load(&[spec("log[/var/log/a]", 1), spec("agent.ping", 30)], 100)
            .unwrap();
        registry.mark_checked("log[/var/log/a]", 100, 4096);
        registry.mark_checked("agent.ping", 100, 0);

        registry
            .load(&[spec("log[/var/log/a]", 2), spec("agent.version", 60)], 120)
            .unwrap();

        let log = registry.get("log[/var/log/a]").unwrap();
        assert_eq!(log.last_log_size, 4096);
        assert_eq!(log.next_check, 101);
        assert_eq!(log.refresh, 2);

        assert!(registry.get("agent.ping").is_none());
        assert_eq!(registry.get("agent.version").unwrap().next_check, 120);
        assert_eq!(registry.generation(), 2);
    }

    #[test]
    fn test_reload_matches_expanded_key() {
        // SAFETY: This test only touches a variable no other test reads.
        unsafe {
            std::env::set_var("ARGUS_TEST_REGISTRY_FILE", "/var/log/app.log");
        }

        let mut registry = MetricRegistry::new();
        registry.load(&[spec("log[/var/log/app.log]", 1)], 0).unwrap();
        registry.mark_checked("log[/var/log/app.log]", 0, 512);

        registry
            .load(&[spec("log[${ARGUS_TEST_REGISTRY_FILE}]", 1)], 10)
            .unwrap();
        let metric = registry.get("log[/var/log/app.log]").unwrap();
        assert_eq!(metric.last_log_size, 512);
        assert_eq!(metric.key_orig, "log[${ARGUS_TEST_REGISTRY_FILE}]");

        // SAFETY: Cleanup test variable.
        unsafe {
            std::env::remove_var("ARGUS_TEST_REGISTRY_FILE");
        }
    }

    #[test]
    fn test_invalid_reload_keeps_previous_set() {
        let mut registry = MetricRegistry::new();
        registry.load(&[spec("agent.ping", 5)], 0).unwrap();

        let result = registry.load(&[spec("agent.version", 5), spec("bad key", 5)], 10);
        assert!(result.is_err());
        assert!(registry.get("agent.ping").is_some());
        assert!(registry.get("agent.version").is_none());
        assert_eq!(registry.generation(), 1);

        let result = registry.load(&[spec("a", 5), spec("a", 10)], 10);
        assert!(result.unwrap_err().to_string().contains("duplicate"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_mark_checked_unknown_key() {
        let mut registry = MetricRegistry::new();
        assert!(!registry.mark_checked("missing", 0, 0));
    }

    #[test]
    fn test_result_from_before_reload_applies_to_kept_key() {
        let mut registry = MetricRegistry::new();
        registry
            .load(&[spec("log[/var/log/a]", 5), spec("agent.ping", 5)], 0)
            .unwrap();
        let due = registry.list_due(0);
        assert_eq!(due.len(), 2);

        // Reload lands while the fetches are running.
        registry.load(&[spec("log[/var/log/a]", 10)], 3).unwrap();

        assert!(registry.mark_checked(due[0].key.as_str(), 0, 2048));
        assert!(!registry.mark_checked(due[1].key.as_str(), 0, 0));

        let log = registry.get("log[/var/log/a]").unwrap();
        assert_eq!(log.last_log_size, 2048);
        assert_eq!(log.next_check, 10);
    }

    #[test]
    fn test_min_refresh_and_next_due() {
        let mut registry = MetricRegistry::new();
        assert_eq!(registry.min_refresh(), None);

        registry
            .load(&[spec("a", 30), spec("b", 7), spec("c", 1).with_enabled(false)], 0)
            .unwrap();
        registry.mark_checked("a", 0, 0);
        registry.mark_checked("b", 0, 0);

        assert_eq!(registry.min_refresh(), Some(7));
        assert_eq!(registry.next_due(), Some(7));
    }
}
