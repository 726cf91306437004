//! Fetch capability and the rate-limited fetcher wrapped around it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, timeout};

use crate::active::{DueMetric, KeyError, LineWindow, MetricKey};

/// Errors a metric source can report.
///
/// All of them mean "no value this tick"; the metric stays enabled and is
/// retried on its next refresh.
#[derive(Debug, Error)]
pub enum FetchError {
    /// No source knows this key.
    #[error("unsupported item key: {0}")]
    Unsupported(String),

    /// Source missing or unreadable.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Source exists but cannot be read.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Key or one of its parameters is malformed.
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    /// Source did not answer in time.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(e.to_string()),
            _ => Self::Unavailable(e.to_string()),
        }
    }
}

/// Input of one fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Canonical key.
    pub key: MetricKey,
    /// Offset already consumed from a log-like source.
    pub last_log_size: u64,
    /// Most lines the caller will accept; `None` for single-valued keys.
    pub max_lines: Option<usize>,
}

/// One value produced by a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedValue {
    /// Value as text.
    pub value: String,
    /// Timestamp taken by the source (epoch seconds), if any.
    pub timestamp: Option<i64>,
    /// Origin label, e.g. an event log source name.
    pub source: Option<String>,
    /// Severity ordinal reported by the source.
    pub severity: Option<u32>,
    /// Source-specific sequence number, 0 when not applicable.
    pub log_event_id: u64,
    /// Offset right after this line for log-like sources.
    pub last_log_size: Option<u64>,
}

impl FetchedValue {
    /// Create a plain value.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }

    /// Set the offset right after this line.
    pub fn with_last_log_size(mut self, offset: u64) -> Self {
        self.last_log_size = Some(offset);
        self
    }

    /// Set the source timestamp.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set the event source, severity and event id.
    pub fn with_event(mut self, source: impl Into<String>, severity: u32, event_id: u64) -> Self {
        self.source = Some(source.into());
        self.severity = Some(severity);
        self.log_event_id = event_id;
        self
    }
}

/// Everything a source produced for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutput {
    /// Values in source order.
    pub values: Vec<FetchedValue>,
    /// Offset the source read up to, including lines it filtered out.
    pub consumed_to: Option<u64>,
}

impl FetchOutput {
    /// Output that also reports the offset read up to.
    pub fn with_consumed_to(values: Vec<FetchedValue>, consumed_to: u64) -> Self {
        Self {
            values,
            consumed_to: Some(consumed_to),
        }
    }
}

impl From<Vec<FetchedValue>> for FetchOutput {
    fn from(values: Vec<FetchedValue>) -> Self {
        Self {
            values,
            consumed_to: None,
        }
    }
}

/// Capability that produces values for a metric key.
#[async_trait::async_trait]
pub trait MetricSource: Send + Sync + 'static {
    /// Produce the values currently available for `request.key`.
    ///
    /// Log-like sources return lines starting at `request.last_log_size`,
    /// each tagged with the offset following it. Returning more than
    /// `request.max_lines` lines is allowed; the excess is deferred.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchOutput, FetchError>;
}

/// Result of one rate-limited fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fetched {
    /// Values to append, in order.
    pub values: Vec<FetchedValue>,
    /// Offset to store for the metric.
    pub last_log_size: u64,
    /// Lines left for the next invocation because of the rate limit.
    pub deferred: usize,
}

/// Wraps a [`MetricSource`] with a per-metric lines-per-second limit.
pub struct RateLimitedFetcher {
    source: Arc<dyn MetricSource>,
    max_lines_per_second: u32,
    fetch_timeout: Duration,
    windows: HashMap<String, LineWindow>,
}

impl std::fmt::Debug for RateLimitedFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedFetcher")
            .field("max_lines_per_second", &self.max_lines_per_second)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("windows", &self.windows.len())
            .finish_non_exhaustive()
    }
}

impl RateLimitedFetcher {
    /// Create a fetcher with the configured default limit.
    pub fn new(source: Arc<dyn MetricSource>, max_lines_per_second: u32, fetch_timeout: Duration) -> Self {
        Self {
            source,
            max_lines_per_second,
            fetch_timeout,
            windows: HashMap::new(),
        }
    }

    /// Fetch one metric.
    ///
    /// Single-valued keys yield at most one value and never move the log
    /// offset. Log-like keys yield at most as many lines as the rolling
    /// one-second window still allows; the offset advances only past lines
    /// actually returned.
    pub async fn fetch(&mut self, metric: &DueMetric) -> Result<Fetched, FetchError> {
        let key = &metric.key;

        if !key.is_log_like() {
            let mut values = self.call(key, metric.last_log_size, None).await?.values;
            if values.len() > 1 {
                tracing::warn!(key = %key, count = values.len(), "Single-valued check returned several values, keeping the first");
                values.truncate(1);
            }
            return Ok(Fetched {
                values,
                last_log_size: metric.last_log_size,
                deferred: 0,
            });
        }

        let limit = key.max_lines()?.unwrap_or(self.max_lines_per_second);
        let allowance = self
            .windows
            .entry(key.as_str().to_string())
            .or_default()
            .allowance(limit, Instant::now());

        if allowance == 0 {
            tracing::trace!(key = %key, limit, "Line limit reached, deferring fetch");
            return Ok(Fetched {
                values: Vec::new(),
                last_log_size: metric.last_log_size,
                deferred: 0,
            });
        }

        let FetchOutput {
            mut values,
            consumed_to,
        } = self
            .call(key, metric.last_log_size, Some(allowance))
            .await?;

        let deferred = values.len().saturating_sub(allowance);
        if deferred > 0 {
            tracing::debug!(key = %key, limit, deferred, "Line limit reached, deferring remaining lines");
            values.truncate(allowance);
        }

        let mut offsets: Vec<u64> = values.iter().filter_map(|v| v.last_log_size).collect();
        // Past the last emitted line only when nothing was deferred.
        if deferred == 0
            && let Some(consumed_to) = consumed_to
        {
            offsets.push(consumed_to);
        }

        let mut last_log_size = metric.last_log_size;
        for (i, offset) in offsets.into_iter().enumerate() {
            if i == 0 && offset < last_log_size {
                tracing::info!(key = %key, previous = last_log_size, offset, "Log source rotated or truncated");
            }
            last_log_size = offset;
        }

        if let Some(window) = self.windows.get_mut(key.as_str()) {
            window.record(values.len(), Instant::now());
        }

        Ok(Fetched {
            values,
            last_log_size,
            deferred,
        })
    }

    /// Drop line windows of keys that are no longer configured.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.windows.retain(|key, _| keep(key));
    }

    async fn call(
        &self,
        key: &MetricKey,
        last_log_size: u64,
        max_lines: Option<usize>,
    ) -> Result<FetchOutput, FetchError> {
        let request = FetchRequest {
            key: key.clone(),
            last_log_size,
            max_lines,
        };

        timeout(self.fetch_timeout, self.source.fetch(&request))
            .await
            .map_err(|_| FetchError::Timeout(self.fetch_timeout))?
    }
}
